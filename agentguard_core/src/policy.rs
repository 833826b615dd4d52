use agentguard_shared::FastMap;

use crate::types::{AgentId, ResourceQuantity, ResourceRequest, SystemSnapshot};

/// Pluggable ordering strategy for the background grant loop.
///
/// A policy only reorders the pending slice; the safety checker has the
/// final say on every candidate, and a vetoed candidate simply stays queued
/// for the next pass. Policies are swappable at runtime without invalidating
/// queued requests.
pub trait SchedulingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the pending requests in the order the grant loop should try
    /// them. All variants sort stably within their key.
    fn prioritize(
        &self,
        pending_requests: &[ResourceRequest],
        current_state: &SystemSnapshot,
    ) -> Vec<ResourceRequest>;
}

/// Earliest submission first.
#[derive(Clone, Copy, Debug, Default)]
pub struct FifoPolicy;

impl SchedulingPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn prioritize(
        &self,
        pending_requests: &[ResourceRequest],
        _current_state: &SystemSnapshot,
    ) -> Vec<ResourceRequest> {
        let mut result = pending_requests.to_vec();
        result.sort_by_key(|r| r.submitted_at);
        result
    }
}

/// Request priority descending, FIFO within a band.
#[derive(Clone, Copy, Debug, Default)]
pub struct PriorityPolicy;

impl SchedulingPolicy for PriorityPolicy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn prioritize(
        &self,
        pending_requests: &[ResourceRequest],
        _current_state: &SystemSnapshot,
    ) -> Vec<ResourceRequest> {
        let mut result = pending_requests.to_vec();
        result.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at.cmp(&b.submitted_at))
        });
        result
    }
}

/// Agents closest to completion first: ascending total remaining need across
/// all resources, taken from the snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShortestNeedPolicy;

impl SchedulingPolicy for ShortestNeedPolicy {
    fn name(&self) -> &'static str {
        "shortest-need"
    }

    fn prioritize(
        &self,
        pending_requests: &[ResourceRequest],
        current_state: &SystemSnapshot,
    ) -> Vec<ResourceRequest> {
        let mut total_remaining: FastMap<AgentId, ResourceQuantity> = FastMap::default();
        for snap in &current_state.agents {
            let total = snap
                .max_claim
                .iter()
                .map(|(rt, max)| max - snap.allocation.get(rt).copied().unwrap_or(0))
                .sum();
            total_remaining.insert(snap.agent_id, total);
        }

        let mut result = pending_requests.to_vec();
        result.sort_by(|a, b| {
            let a_need = total_remaining.get(&a.agent_id).copied().unwrap_or(0);
            let b_need = total_remaining.get(&b.agent_id).copied().unwrap_or(0);
            a_need
                .cmp(&b_need)
                .then(a.submitted_at.cmp(&b.submitted_at))
        });
        result
    }
}

/// Requests with a timeout first, most urgent deadline first; the rest trail
/// in FIFO order.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeadlinePolicy;

impl SchedulingPolicy for DeadlinePolicy {
    fn name(&self) -> &'static str {
        "deadline"
    }

    fn prioritize(
        &self,
        pending_requests: &[ResourceRequest],
        _current_state: &SystemSnapshot,
    ) -> Vec<ResourceRequest> {
        let mut result = pending_requests.to_vec();
        result.sort_by(|a, b| match (a.deadline(), b.deadline()) {
            (Some(a_deadline), Some(b_deadline)) => a_deadline.cmp(&b_deadline),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.submitted_at.cmp(&b.submitted_at),
        });
        result
    }
}

/// Strict FIFO, ignoring priority. Longest-waiting request first, so nothing
/// starves behind a stream of urgent arrivals.
#[derive(Clone, Copy, Debug, Default)]
pub struct FairnessPolicy;

impl SchedulingPolicy for FairnessPolicy {
    fn name(&self) -> &'static str {
        "fairness"
    }

    fn prioritize(
        &self,
        pending_requests: &[ResourceRequest],
        _current_state: &SystemSnapshot,
    ) -> Vec<ResourceRequest> {
        let mut result = pending_requests.to_vec();
        result.sort_by_key(|r| r.submitted_at);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::types::{AgentAllocationSnapshot, AgentState, Priority};

    fn snapshot() -> SystemSnapshot {
        SystemSnapshot {
            timestamp: Instant::now(),
            total_resources: Default::default(),
            available_resources: Default::default(),
            agents: Vec::new(),
            pending_requests: 0,
            is_safe: true,
        }
    }

    fn request_at(agent: AgentId, priority: Priority, submitted_at: Instant) -> ResourceRequest {
        let mut req = ResourceRequest::new(agent, 1, 1);
        req.priority = priority;
        req.submitted_at = submitted_at;
        req
    }

    fn staggered(priorities: &[Priority]) -> Vec<ResourceRequest> {
        let base = Instant::now();
        priorities
            .iter()
            .enumerate()
            .map(|(i, &p)| request_at(i as AgentId + 1, p, base + Duration::from_millis(i as u64)))
            .collect()
    }

    #[test]
    fn priority_policy_orders_descending_then_fifo() {
        let pending = staggered(&[
            Priority::LOW,
            Priority::NORMAL,
            Priority::HIGH,
            Priority::CRITICAL,
        ]);
        let ordered = PriorityPolicy.prioritize(&pending, &snapshot());
        let priorities: Vec<Priority> = ordered.iter().map(|r| r.priority).collect();
        assert_eq!(
            priorities,
            vec![
                Priority::CRITICAL,
                Priority::HIGH,
                Priority::NORMAL,
                Priority::LOW
            ]
        );
    }

    #[test]
    fn fifo_and_fairness_ignore_priority() {
        let pending = staggered(&[Priority::LOW, Priority::CRITICAL, Priority::NORMAL]);
        for policy in [&FifoPolicy as &dyn SchedulingPolicy, &FairnessPolicy] {
            let ordered = policy.prioritize(&pending, &snapshot());
            let agents: Vec<AgentId> = ordered.iter().map(|r| r.agent_id).collect();
            assert_eq!(agents, vec![1, 2, 3], "policy {}", policy.name());
        }
    }

    #[test]
    fn shortest_need_prefers_nearly_finished_agents() {
        let mut state = snapshot();
        for (agent_id, max, alloc) in [(1, 10, 2), (2, 10, 9)] {
            let mut snap = AgentAllocationSnapshot {
                agent_id,
                name: format!("agent-{agent_id}"),
                priority: Priority::NORMAL,
                state: AgentState::Active,
                allocation: Default::default(),
                max_claim: Default::default(),
            };
            snap.max_claim.insert(1, max);
            snap.allocation.insert(1, alloc);
            state.agents.push(snap);
        }

        let pending = staggered(&[Priority::NORMAL, Priority::NORMAL]);
        let ordered = ShortestNeedPolicy.prioritize(&pending, &state);
        // Agent 2 needs only 1 more unit, agent 1 needs 8.
        assert_eq!(ordered[0].agent_id, 2);
        assert_eq!(ordered[1].agent_id, 1);
    }

    #[test]
    fn deadline_policy_front_loads_requests_with_timeouts() {
        let base = Instant::now();
        let mut no_deadline = request_at(1, Priority::NORMAL, base);
        no_deadline.timeout = None;
        let mut late = request_at(2, Priority::NORMAL, base + Duration::from_millis(1));
        late.timeout = Some(Duration::from_secs(60));
        let mut soon = request_at(3, Priority::NORMAL, base + Duration::from_millis(2));
        soon.timeout = Some(Duration::from_secs(1));

        let ordered = DeadlinePolicy.prioritize(&[no_deadline, late, soon], &snapshot());
        let agents: Vec<AgentId> = ordered.iter().map(|r| r.agent_id).collect();
        assert_eq!(agents, vec![3, 2, 1]);
    }
}
