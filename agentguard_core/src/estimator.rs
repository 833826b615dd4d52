use agentguard_shared::FastMap;
use parking_lot::Mutex;

use crate::config::AdaptiveConfig;
use crate::types::{AgentId, DemandMode, ResourceQuantity, ResourceTypeId};

/// Rolling usage summary for one (agent, resource) pair.
#[derive(Clone, Debug, Default)]
pub struct UsageStats {
    /// Total observations recorded, including those that fell out of the
    /// rolling window.
    pub count: usize,
    pub sum: f64,
    pub sum_sq: f64,
    /// Largest single request observed. Monotonically non-decreasing.
    pub max_single_request: ResourceQuantity,
    /// High-water mark of concurrent holdings. Monotonically non-decreasing.
    pub max_cumulative: ResourceQuantity,
    /// Circular buffer of the most recent observations.
    pub window: Vec<ResourceQuantity>,
    pub window_head: usize,
    pub window_count: usize,
}

impl UsageStats {
    pub fn mean(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    /// Sample variance, clamped at 0 to absorb floating-point imprecision.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        let var = (self.sum_sq - (self.sum * self.sum) / n) / (n - 1.0);
        var.max(0.0)
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

#[derive(Debug, Default)]
struct EstimatorInner {
    stats: FastMap<AgentId, FastMap<ResourceTypeId, UsageStats>>,
    agent_modes: FastMap<AgentId, DemandMode>,
}

/// Per-(agent, resource) demand statistics and confidence-level max-need
/// estimation for agents that cannot declare needs upfront.
///
/// All queries return value copies; the internal lock is never held across
/// caller code.
#[derive(Debug)]
pub struct DemandEstimator {
    config: AdaptiveConfig,
    inner: Mutex<EstimatorInner>,
}

impl DemandEstimator {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(EstimatorInner::default()),
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Records one request observation.
    pub fn record_request(&self, agent: AgentId, resource: ResourceTypeId, quantity: ResourceQuantity) {
        let mut inner = self.inner.lock();
        let stats = inner
            .stats
            .entry(agent)
            .or_default()
            .entry(resource)
            .or_default();

        if stats.window.is_empty() {
            stats.window.resize(self.config.history_window_size, 0);
        }

        stats.count += 1;
        stats.sum += quantity as f64;
        stats.sum_sq += (quantity as f64) * (quantity as f64);
        stats.max_single_request = stats.max_single_request.max(quantity);

        if !stats.window.is_empty() {
            stats.window[stats.window_head] = quantity;
            stats.window_head = (stats.window_head + 1) % stats.window.len();
            stats.window_count = (stats.window_count + 1).min(stats.window.len());
        }
    }

    /// Records the agent's current total holdings of a resource, maintaining
    /// the concurrent high-water mark.
    pub fn record_allocation_level(
        &self,
        agent: AgentId,
        resource: ResourceTypeId,
        current_total_allocation: ResourceQuantity,
    ) {
        let mut inner = self.inner.lock();
        let stats = inner
            .stats
            .entry(agent)
            .or_default()
            .entry(resource)
            .or_default();
        stats.max_cumulative = stats.max_cumulative.max(current_total_allocation);
    }

    /// Drops all statistics and the demand mode for an agent.
    pub fn clear_agent(&self, agent: AgentId) {
        let mut inner = self.inner.lock();
        inner.stats.remove(&agent);
        inner.agent_modes.remove(&agent);
    }

    /// Estimated maximum need at the given confidence level.
    pub fn estimate_max_need(
        &self,
        agent: AgentId,
        resource: ResourceTypeId,
        confidence_level: f64,
    ) -> ResourceQuantity {
        let inner = self.inner.lock();
        match inner.stats.get(&agent).and_then(|m| m.get(&resource)) {
            Some(stats) => self.estimate_from(stats, confidence_level),
            None => self.config.cold_start_default_demand,
        }
    }

    /// The full estimated max-need map, used to build adaptive safety-check
    /// inputs.
    pub fn estimate_all_max_needs(
        &self,
        confidence_level: f64,
    ) -> FastMap<AgentId, FastMap<ResourceTypeId, ResourceQuantity>> {
        let inner = self.inner.lock();
        inner
            .stats
            .iter()
            .map(|(&agent, resources)| {
                let estimates = resources
                    .iter()
                    .map(|(&rt, stats)| (rt, self.estimate_from(stats, confidence_level)))
                    .collect();
                (agent, estimates)
            })
            .collect()
    }

    pub fn set_agent_demand_mode(&self, agent: AgentId, mode: DemandMode) {
        self.inner.lock().agent_modes.insert(agent, mode);
    }

    pub fn get_agent_demand_mode(&self, agent: AgentId) -> DemandMode {
        self.inner
            .lock()
            .agent_modes
            .get(&agent)
            .copied()
            .unwrap_or(self.config.default_demand_mode)
    }

    pub fn get_stats(&self, agent: AgentId, resource: ResourceTypeId) -> Option<UsageStats> {
        self.inner
            .lock()
            .stats
            .get(&agent)
            .and_then(|m| m.get(&resource))
            .cloned()
    }

    fn estimate_from(&self, stats: &UsageStats, confidence: f64) -> ResourceQuantity {
        if stats.count == 0 {
            return self.config.cold_start_default_demand;
        }

        if stats.count == 1 {
            let raw = stats.max_single_request as f64 * self.config.cold_start_headroom_factor;
            return (raw.ceil() as ResourceQuantity).max(1);
        }

        let k = confidence_to_k(confidence);
        let mut estimated = stats.mean() + k * stats.stddev();

        // Never estimate below the observed single-request maximum.
        estimated = estimated.max(stats.max_single_request as f64);

        // With cumulative data, cap at the concurrent high-water mark plus
        // headroom.
        if stats.max_cumulative > 0 {
            let cap = stats.max_cumulative as f64 * self.config.adaptive_headroom_factor;
            estimated = estimated.min(cap);
        }

        (estimated.ceil() as ResourceQuantity).max(1)
    }
}

/// Inverse standard-normal CDF via the Beasley-Springer-Moro rational
/// approximation.
///
/// Numerically adequate for confidences in [0.5, 0.9999]; inputs are clamped
/// to that range.
fn confidence_to_k(confidence: f64) -> f64 {
    if confidence <= 0.5 {
        return 0.0;
    }
    if confidence >= 0.9999 {
        return 3.719;
    }

    let t = (-2.0 * (1.0 - confidence).ln()).sqrt();
    let (c0, c1, c2) = (2.515517, 0.802853, 0.010328);
    let (d1, d2, d3) = (1.432788, 0.189269, 0.001308);
    t - (c0 + c1 * t + c2 * t * t) / (1.0 + d1 * t + d2 * t * t + d3 * t * t * t)
}
