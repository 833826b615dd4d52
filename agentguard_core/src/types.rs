use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentguard_shared::StableMap;
use serde::{Deserialize, Serialize};

/// Identity of a registered agent. Assigned by the manager, starting at 1.
pub type AgentId = u64;

/// Identity of a registered resource type. Assigned by the manager when the
/// caller leaves it at 0, starting at 1.
pub type ResourceTypeId = u64;

/// Identity of a queued request. Assigned by the queue on enqueue, starting at 1.
pub type RequestId = u64;

/// Resource amounts in integer units.
///
/// Signed so that arithmetic on deltas stays well-defined; quantities at rest
/// are always non-negative.
pub type ResourceQuantity = i64;

/// Urgency attached to an agent and inherited by its requests.
///
/// Higher numeric values are more urgent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Self = Self(0);
    pub const NORMAL: Self = Self(50);
    pub const HIGH: Self = Self(100);
    pub const CRITICAL: Self = Self(200);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Terminal (or pending) state of one resource request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Granted,
    Denied,
    TimedOut,
    Cancelled,
}

/// Lifecycle state of a registered agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize)]
pub enum AgentState {
    Registered,
    Active,
    Waiting,
    Releasing,
    Deregistered,
}

/// Taxonomy tag for a resource type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString, Serialize, Deserialize)]
pub enum ResourceCategory {
    ApiRateLimit,
    TokenBudget,
    ToolSlot,
    MemoryPool,
    DatabaseConn,
    GpuCompute,
    FileHandle,
    NetworkSocket,
    Custom,
}

/// Source of an agent's max-need values during safety evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString, Serialize, Deserialize)]
pub enum DemandMode {
    /// Use explicitly declared max needs only.
    Static,
    /// Compute max needs from usage statistics only.
    Adaptive,
    /// Statistical estimate capped by the explicit declaration.
    Hybrid,
}

/// Completion callback for queued requests.
///
/// Invoked exactly once per request, always outside internal locks. The body
/// must not block indefinitely and must not re-enter the manager.
pub type RequestCallback = Arc<dyn Fn(RequestId, RequestStatus) + Send + Sync>;

/// One pending demand for a quantity of a single resource type.
#[derive(Clone)]
pub struct ResourceRequest {
    pub id: RequestId,
    pub agent_id: AgentId,
    pub resource_type: ResourceTypeId,
    pub quantity: ResourceQuantity,
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub callback: Option<RequestCallback>,
    pub submitted_at: Instant,
}

impl ResourceRequest {
    pub fn new(agent_id: AgentId, resource_type: ResourceTypeId, quantity: ResourceQuantity) -> Self {
        Self {
            id: 0,
            agent_id,
            resource_type,
            quantity,
            priority: Priority::NORMAL,
            timeout: None,
            callback: None,
            submitted_at: Instant::now(),
        }
    }

    /// Absolute deadline derived from submission time, if a timeout was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| self.submitted_at + t)
    }
}

impl fmt::Debug for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRequest")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("resource_type", &self.resource_type)
            .field("quantity", &self.quantity)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("has_callback", &self.callback.is_some())
            .field("submitted_at", &self.submitted_at)
            .finish()
    }
}

/// One agent's holdings and declared claims at snapshot time.
#[derive(Clone, Debug)]
pub struct AgentAllocationSnapshot {
    pub agent_id: AgentId,
    pub name: String,
    pub priority: Priority,
    pub state: AgentState,
    pub allocation: StableMap<ResourceTypeId, ResourceQuantity>,
    pub max_claim: StableMap<ResourceTypeId, ResourceQuantity>,
}

/// System-wide view handed to monitors and scheduling policies.
#[derive(Clone, Debug)]
pub struct SystemSnapshot {
    pub timestamp: Instant,
    pub total_resources: StableMap<ResourceTypeId, ResourceQuantity>,
    pub available_resources: StableMap<ResourceTypeId, ResourceQuantity>,
    pub agents: Vec<AgentAllocationSnapshot>,
    pub pending_requests: usize,
    pub is_safe: bool,
}

/// One active task hand-off between two agents.
#[derive(Clone, Debug)]
pub struct DelegationInfo {
    pub from: AgentId,
    pub to: AgentId,
    pub task_description: String,
    pub timestamp: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_constants_are_ordered() {
        assert!(Priority::LOW < Priority::NORMAL);
        assert!(Priority::NORMAL < Priority::HIGH);
        assert!(Priority::HIGH < Priority::CRITICAL);
        assert_eq!(Priority::default(), Priority::NORMAL);
    }

    #[test]
    fn request_deadline_requires_timeout() {
        let mut req = ResourceRequest::new(1, 1, 5);
        assert!(req.deadline().is_none());
        req.timeout = Some(Duration::from_secs(1));
        assert_eq!(req.deadline(), Some(req.submitted_at + Duration::from_secs(1)));
    }
}
