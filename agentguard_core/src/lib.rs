//! Deadlock-avoidance coordination for multi-agent systems.
//!
//! Many autonomous workers competing for limited shared resources (API
//! rate-limit slots, token budgets, tool slots, GPU slots) can deadlock or
//! starve each other. This crate keeps the global allocation state *safe*:
//! every grant is admitted only if some serialization still lets every
//! registered agent run to completion, per the Banker's Algorithm.
//!
//! The [`ResourceManager`] is the external API. It owns the resource and
//! agent tables, evaluates every request against the [`SafetyChecker`],
//! queues what cannot be granted yet, and drives a background scheduler
//! ordered by a pluggable [`SchedulingPolicy`]. Three subsystems harden it
//! for long-running, partially observable workers: stall detection with
//! auto-release ([`ProgressTracker`]), delegation cycle detection
//! ([`DelegationTracker`]), and statistical max-need estimation for agents
//! that cannot declare needs upfront ([`DemandEstimator`]).
//!
//! ```
//! use agentguard_core::{
//!     Agent, GuardConfig, Priority, RequestStatus, Resource, ResourceCategory, ResourceManager,
//! };
//!
//! let manager = ResourceManager::new(GuardConfig::default());
//! manager.start();
//!
//! let slots = Resource::new(0, "api-slots", ResourceCategory::ApiRateLimit, 10).unwrap();
//! let slots = manager.register_resource(slots);
//!
//! let mut worker = Agent::new("worker", Priority::NORMAL);
//! worker.declare_max_need(slots, 4);
//! let worker = manager.register_agent(worker);
//!
//! let status = manager.request_resources(worker, slots, 2, None).unwrap();
//! assert_eq!(status, RequestStatus::Granted);
//!
//! manager.release_resources(worker, slots, 2).unwrap();
//! manager.stop();
//! ```

pub use agentguard_shared::{FastMap, FastSet, StableMap, StableSet};

pub mod agent;
pub mod config;
pub mod delegation;
pub mod error;
pub mod estimator;
pub mod manager;
pub mod monitor;
pub mod policy;
pub mod progress;
pub mod queue;
pub mod resource;
pub mod safety;
pub mod types;

pub use agent::Agent;
pub use config::{AdaptiveConfig, DelegationConfig, DelegationCycleAction, GuardConfig, ProgressConfig};
pub use delegation::{DelegationResult, DelegationTracker};
pub use error::GuardError;
pub use estimator::{DemandEstimator, UsageStats};
pub use manager::ResourceManager;
pub use monitor::{EventKind, Monitor, MonitorEvent};
pub use policy::{
    DeadlinePolicy, FairnessPolicy, FifoPolicy, PriorityPolicy, SchedulingPolicy, ShortestNeedPolicy,
};
pub use progress::{ProgressRecord, ProgressTracker, StallAction};
pub use queue::RequestQueue;
pub use resource::Resource;
pub use safety::{
    ProbabilisticSafetyResult, SafetyCheckInput, SafetyCheckResult, SafetyChecker,
};
pub use types::{
    AgentAllocationSnapshot, AgentId, AgentState, DelegationInfo, DemandMode, Priority,
    RequestCallback, RequestId, RequestStatus, ResourceCategory, ResourceQuantity, ResourceRequest,
    ResourceTypeId, SystemSnapshot,
};
