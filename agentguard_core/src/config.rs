use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{DemandMode, ResourceQuantity};

/// What to do with the newest edge when reporting it closes a delegation cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString, Serialize, Deserialize)]
pub enum DelegationCycleAction {
    /// Emit the event but accept the delegation.
    NotifyOnly,
    /// Refuse to add the edge.
    RejectDelegation,
    /// Add the edge, then immediately remove it and emit a cancellation.
    CancelLatest,
}

/// Progress monitoring (stall detection) configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub enabled: bool,
    /// An agent whose last progress report is older than this is stalled.
    pub default_stall_threshold: Duration,
    /// Cadence of the background stall-detection loop.
    pub check_interval: Duration,
    /// Release every unit held by a stalled agent when it trips.
    pub auto_release_on_stall: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_stall_threshold: Duration::from_secs(120),
            check_interval: Duration::from_secs(5),
            auto_release_on_stall: false,
        }
    }
}

/// Delegation cycle detection configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    pub enabled: bool,
    pub cycle_action: DelegationCycleAction,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cycle_action: DelegationCycleAction::NotifyOnly,
        }
    }
}

/// Statistical demand estimation configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    /// Confidence level used when a request path does not pass one explicitly.
    pub default_confidence_level: f64,
    /// Number of recent observations kept per (agent, resource).
    pub history_window_size: usize,
    /// Multiplier applied to the single observation available at cold start.
    pub cold_start_headroom_factor: f64,
    /// Estimate returned before any observation exists.
    pub cold_start_default_demand: ResourceQuantity,
    /// Multiplier on the observed cumulative high-water mark used as a cap.
    pub adaptive_headroom_factor: f64,
    pub default_demand_mode: DemandMode,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_confidence_level: 0.95,
            history_window_size: 50,
            cold_start_headroom_factor: 2.0,
            cold_start_default_demand: 1,
            adaptive_headroom_factor: 1.5,
            default_demand_mode: DemandMode::Static,
        }
    }
}

/// Top-level manager configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Advisory cap on simultaneously registered agents.
    pub max_agents: usize,
    /// Advisory cap on registered resource types.
    pub max_resource_types: usize,
    /// Hard cap on queued requests; enqueue beyond it fails.
    pub max_queue_size: usize,
    /// Timeout applied to blocking requests that do not carry their own.
    pub default_request_timeout: Duration,
    /// Upper bound on one background-processor (and release-wait) iteration.
    pub processor_poll_interval: Duration,
    /// Cadence of periodic snapshot emission to the monitor.
    pub snapshot_interval: Duration,
    /// Expire queued requests whose timeout elapsed.
    pub enable_timeout_expiration: bool,
    /// Advisory: a request pending longer than this is considered starved.
    pub starvation_threshold: Duration,
    /// Accepted for compatibility; locking is unconditional in this
    /// implementation.
    pub thread_safe: bool,
    pub progress: ProgressConfig,
    pub delegation: DelegationConfig,
    pub adaptive: AdaptiveConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_agents: 1024,
            max_resource_types: 256,
            max_queue_size: 10_000,
            default_request_timeout: Duration::from_secs(30),
            processor_poll_interval: Duration::from_millis(10),
            snapshot_interval: Duration::from_secs(5),
            enable_timeout_expiration: true,
            starvation_threshold: Duration::from_secs(60),
            thread_safe: true,
            progress: ProgressConfig::default(),
            delegation: DelegationConfig::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}
