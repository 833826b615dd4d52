use crate::types::{AgentId, ResourceQuantity, ResourceTypeId};

/// Errors returned by manager construction, registration, and request
/// operations.
///
/// Asynchronous surfaces never carry these: a callback or future receives the
/// equivalent terminal status instead.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("agent not found: {agent_id}")]
    AgentNotFound { agent_id: AgentId },
    #[error("resource type not found: {resource_type}")]
    ResourceNotFound { resource_type: ResourceTypeId },
    #[error(
        "agent {agent_id} requested {requested} of resource {resource_type} but max claim is {max_claim}"
    )]
    MaxClaimExceeded {
        agent_id: AgentId,
        resource_type: ResourceTypeId,
        requested: ResourceQuantity,
        max_claim: ResourceQuantity,
    },
    #[error("requested {requested} of resource {resource_type} but total capacity is {total_capacity}")]
    ResourceCapacityExceeded {
        resource_type: ResourceTypeId,
        requested: ResourceQuantity,
        total_capacity: ResourceQuantity,
    },
    #[error("agent already registered: {agent_id}")]
    AgentAlreadyRegistered { agent_id: AgentId },
    #[error("request queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("resource capacity must be non-negative, got {capacity}")]
    InvalidCapacity { capacity: ResourceQuantity },
    #[error("other error: {0}")]
    Other(#[from] eyre::Report),
}
