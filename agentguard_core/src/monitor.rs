use std::time::Instant;

use crate::types::{AgentId, RequestId, ResourceQuantity, ResourceTypeId, SystemSnapshot};

/// Everything observable about the engine, as a closed set of event kinds.
///
/// Names carry the semantics; the emission order per request is the
/// observable contract (`Submitted` before the safety check before the
/// terminal status).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum EventKind {
    AgentRegistered,
    AgentDeregistered,
    ResourceRegistered,
    ResourceCapacityChanged,
    RequestSubmitted,
    RequestGranted,
    RequestDenied,
    RequestTimedOut,
    RequestCancelled,
    ResourcesReleased,
    SafetyCheckPerformed,
    UnsafeStateDetected,
    QueueSizeChanged,
    AgentProgressReported,
    AgentStalled,
    AgentStallResolved,
    AgentResourcesAutoReleased,
    DelegationReported,
    DelegationCompleted,
    DelegationCancelled,
    DelegationCycleDetected,
    DemandEstimateUpdated,
    ProbabilisticSafetyCheck,
    AdaptiveDemandModeChanged,
}

/// One typed event. Optional fields are absent, never zero-valued.
#[derive(Clone, Debug)]
pub struct MonitorEvent {
    pub kind: EventKind,
    pub timestamp: Instant,
    pub message: String,
    pub agent_id: Option<AgentId>,
    pub resource_type: Option<ResourceTypeId>,
    pub request_id: Option<RequestId>,
    pub quantity: Option<ResourceQuantity>,
    pub safety_result: Option<bool>,
    /// Delegation target (the "to" agent).
    pub target_agent_id: Option<AgentId>,
    /// Closed cycle path for delegation cycle events.
    pub cycle_path: Option<Vec<AgentId>>,
    /// Operation duration in microseconds (safety checks).
    pub duration_us: Option<f64>,
}

impl MonitorEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Instant::now(),
            message: message.into(),
            agent_id: None,
            resource_type: None,
            request_id: None,
            quantity: None,
            safety_result: None,
            target_agent_id: None,
            cycle_path: None,
            duration_us: None,
        }
    }
}

/// Sink for engine events and periodic snapshots.
///
/// Implementations live outside the engine (console loggers, metrics
/// aggregators, multiplexers); the engine only defines the contract. Sinks
/// are shared across threads and must outlive the manager's stop; both
/// methods are called outside every internal lock and must not re-enter the
/// manager.
pub trait Monitor: Send + Sync {
    fn on_event(&self, event: &MonitorEvent);
    fn on_snapshot(&self, snapshot: &SystemSnapshot);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_events_carry_no_optional_fields() {
        let event = MonitorEvent::new(EventKind::RequestGranted, "granted");
        assert_eq!(event.kind, EventKind::RequestGranted);
        assert_eq!(event.message, "granted");
        assert!(event.agent_id.is_none());
        assert!(event.resource_type.is_none());
        assert!(event.request_id.is_none());
        assert!(event.quantity.is_none());
        assert!(event.safety_result.is_none());
        assert!(event.target_agent_id.is_none());
        assert!(event.cycle_path.is_none());
        assert!(event.duration_us.is_none());
    }
}
