use agentguard_shared::FastMap;

use crate::types::{AgentId, AgentState, Priority, ResourceQuantity, ResourceTypeId};

/// A registered worker that holds and requests resources.
///
/// Constructed by the caller with id 0; the manager assigns the real id on
/// registration. Allocation maps are mutated only through the manager.
#[derive(Clone, Debug)]
pub struct Agent {
    id: AgentId,
    name: String,
    priority: Priority,
    state: AgentState,
    model_identifier: Option<String>,
    task_description: Option<String>,
    max_needs: FastMap<ResourceTypeId, ResourceQuantity>,
    allocation: FastMap<ResourceTypeId, ResourceQuantity>,
}

impl Agent {
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: 0,
            name: name.into(),
            priority,
            state: AgentState::Registered,
            model_identifier: None,
            task_description: None,
            max_needs: FastMap::default(),
            allocation: FastMap::default(),
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Declares the maximum number of units this agent may ever hold of a
    /// resource type. Static-mode requests are validated against it.
    pub fn declare_max_need(&mut self, resource_type: ResourceTypeId, max_qty: ResourceQuantity) {
        self.max_needs.insert(resource_type, max_qty);
    }

    pub fn max_needs(&self) -> &FastMap<ResourceTypeId, ResourceQuantity> {
        &self.max_needs
    }

    pub fn current_allocation(&self) -> &FastMap<ResourceTypeId, ResourceQuantity> {
        &self.allocation
    }

    pub fn allocation_of(&self, resource_type: ResourceTypeId) -> ResourceQuantity {
        self.allocation.get(&resource_type).copied().unwrap_or(0)
    }

    /// How much more this agent might still need of a resource type.
    pub fn remaining_need(&self, resource_type: ResourceTypeId) -> ResourceQuantity {
        let max = self.max_needs.get(&resource_type).copied().unwrap_or(0);
        max - self.allocation_of(resource_type)
    }

    pub fn set_model_identifier(&mut self, model_id: impl Into<String>) {
        self.model_identifier = Some(model_id.into());
    }

    pub fn model_identifier(&self) -> Option<&str> {
        self.model_identifier.as_deref()
    }

    pub fn set_task_description(&mut self, description: impl Into<String>) {
        self.task_description = Some(description.into());
    }

    pub fn task_description(&self) -> Option<&str> {
        self.task_description.as_deref()
    }

    pub(crate) fn set_id(&mut self, id: AgentId) {
        self.id = id;
    }

    pub(crate) fn set_state(&mut self, state: AgentState) {
        self.state = state;
    }

    pub(crate) fn allocate(&mut self, resource_type: ResourceTypeId, qty: ResourceQuantity) {
        *self.allocation.entry(resource_type).or_insert(0) += qty;
        if self.state == AgentState::Registered {
            self.state = AgentState::Active;
        }
    }

    pub(crate) fn deallocate(&mut self, resource_type: ResourceTypeId, qty: ResourceQuantity) {
        if let Some(held) = self.allocation.get_mut(&resource_type) {
            *held -= qty;
            if *held <= 0 {
                self.allocation.remove(&resource_type);
            }
        }
    }
}
