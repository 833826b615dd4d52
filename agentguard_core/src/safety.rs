use agentguard_shared::{FastSet, StableMap, StableSet};

use crate::types::{AgentId, RequestId, ResourceQuantity, ResourceRequest, ResourceTypeId};

/// Snapshot of allocation state fed into the safety check.
///
/// Built by the manager under a consistent lock; the checker itself never
/// touches live state.
#[derive(Clone, Debug, Default)]
pub struct SafetyCheckInput {
    /// Total units in the system per resource type.
    pub total: StableMap<ResourceTypeId, ResourceQuantity>,
    /// Currently unallocated units per resource type.
    pub available: StableMap<ResourceTypeId, ResourceQuantity>,
    /// Per-agent current allocation per resource type.
    pub allocation: StableMap<AgentId, StableMap<ResourceTypeId, ResourceQuantity>>,
    /// Per-agent maximum need per resource type.
    pub max_need: StableMap<AgentId, StableMap<ResourceTypeId, ResourceQuantity>>,
}

#[derive(Clone, Debug)]
pub struct SafetyCheckResult {
    pub is_safe: bool,
    /// A valid completion order when safe. One witness, not canonical.
    pub safe_sequence: Vec<AgentId>,
    /// Human-readable diagnostic; lists blocked agents when unsafe.
    pub reason: String,
}

/// Result of a safety check whose max-need inputs came from statistical
/// estimates rather than declarations.
#[derive(Clone, Debug)]
pub struct ProbabilisticSafetyResult {
    pub is_safe: bool,
    pub confidence_level: f64,
    /// The requested confidence on success, 0.0 on failure. No search across
    /// levels is performed.
    pub max_safe_confidence: f64,
    pub safe_sequence: Vec<AgentId>,
    pub reason: String,
    /// The max-need map the check actually ran against.
    pub estimated_max_needs: StableMap<AgentId, StableMap<ResourceTypeId, ResourceQuantity>>,
}

/// Banker's Algorithm over an allocation snapshot.
///
/// Pure decision function: no side effects, no locking, no recoverable
/// errors. The caller is responsible for supplying a coherent snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct SafetyChecker;

fn collect_resource_types(input: &SafetyCheckInput) -> Vec<ResourceTypeId> {
    let mut types: StableSet<ResourceTypeId> = input.total.keys().copied().collect();
    types.extend(input.available.keys().copied());
    types.into_iter().collect()
}

fn allocation_of(input: &SafetyCheckInput, agent: AgentId, rt: ResourceTypeId) -> ResourceQuantity {
    input
        .allocation
        .get(&agent)
        .and_then(|m| m.get(&rt))
        .copied()
        .unwrap_or(0)
}

fn remaining_need(input: &SafetyCheckInput, agent: AgentId, rt: ResourceTypeId) -> ResourceQuantity {
    let max = input
        .max_need
        .get(&agent)
        .and_then(|m| m.get(&rt))
        .copied()
        .unwrap_or(0);
    max - allocation_of(input, agent, rt)
}

fn can_finish(
    input: &SafetyCheckInput,
    agent: AgentId,
    work: &StableMap<ResourceTypeId, ResourceQuantity>,
    resource_types: &[ResourceTypeId],
) -> bool {
    resource_types.iter().all(|&rt| {
        remaining_need(input, agent, rt) <= work.get(&rt).copied().unwrap_or(0)
    })
}

impl SafetyChecker {
    /// Runs the Banker's Algorithm on `input`.
    ///
    /// Agents are scanned in ascending id order each round, so the witness
    /// sequence is deterministic for a given input.
    pub fn check_safety(&self, input: &SafetyCheckInput) -> SafetyCheckResult {
        let resource_types = collect_resource_types(input);

        let mut agents: StableSet<AgentId> = input.max_need.keys().copied().collect();
        agents.extend(input.allocation.keys().copied());
        let agents: Vec<AgentId> = agents.into_iter().collect();

        if agents.is_empty() {
            return SafetyCheckResult {
                is_safe: true,
                safe_sequence: Vec::new(),
                reason: "no agents in the system".to_string(),
            };
        }

        let mut work = input.available.clone();
        let mut finished: FastSet<AgentId> = FastSet::default();
        let mut safe_sequence = Vec::with_capacity(agents.len());

        for _round in 0..agents.len() {
            let mut found_one = false;

            for &aid in &agents {
                if finished.contains(&aid) {
                    continue;
                }
                if can_finish(input, aid, &work, &resource_types) {
                    // Simulate the agent running to completion and releasing
                    // everything it holds.
                    for &rt in &resource_types {
                        *work.entry(rt).or_insert(0) += allocation_of(input, aid, rt);
                    }
                    finished.insert(aid);
                    safe_sequence.push(aid);
                    found_one = true;
                }
            }

            if !found_one {
                if finished.len() == agents.len() {
                    break;
                }
                let blocked: Vec<String> = agents
                    .iter()
                    .filter(|aid| !finished.contains(aid))
                    .map(|aid| aid.to_string())
                    .collect();
                return SafetyCheckResult {
                    is_safe: false,
                    safe_sequence: Vec::new(),
                    reason: format!(
                        "unsafe state: agents [{}] cannot complete with available resources",
                        blocked.join(", ")
                    ),
                };
            }
        }

        SafetyCheckResult {
            is_safe: true,
            safe_sequence,
            reason: "safe state found".to_string(),
        }
    }

    /// "If we granted this request, would the resulting state be safe?"
    pub fn check_hypothetical(
        &self,
        current_state: &SafetyCheckInput,
        requesting_agent: AgentId,
        resource_type: ResourceTypeId,
        quantity: ResourceQuantity,
    ) -> SafetyCheckResult {
        let mut hypothetical = current_state.clone();
        *hypothetical.available.entry(resource_type).or_insert(0) -= quantity;
        *hypothetical
            .allocation
            .entry(requesting_agent)
            .or_default()
            .entry(resource_type)
            .or_insert(0) += quantity;
        self.check_safety(&hypothetical)
    }

    /// Safety of granting several requests at once.
    pub fn check_hypothetical_batch(
        &self,
        current_state: &SafetyCheckInput,
        requests: &[ResourceRequest],
    ) -> SafetyCheckResult {
        let mut hypothetical = current_state.clone();
        for req in requests {
            *hypothetical.available.entry(req.resource_type).or_insert(0) -= req.quantity;
            *hypothetical
                .allocation
                .entry(req.agent_id)
                .or_default()
                .entry(req.resource_type)
                .or_insert(0) += req.quantity;
        }
        self.check_safety(&hypothetical)
    }

    /// From a set of candidates, the subset whose individual grant would
    /// preserve safety and fits within current availability.
    ///
    /// Each candidate is evaluated independently; no transitive reservation.
    pub fn find_grantable_requests(
        &self,
        current_state: &SafetyCheckInput,
        candidates: &[ResourceRequest],
    ) -> Vec<RequestId> {
        let mut grantable = Vec::new();
        for req in candidates {
            let available = current_state
                .available
                .get(&req.resource_type)
                .copied()
                .unwrap_or(0);
            if available < req.quantity {
                continue;
            }
            let result =
                self.check_hypothetical(current_state, req.agent_id, req.resource_type, req.quantity);
            if result.is_safe {
                grantable.push(req.id);
            }
        }
        grantable
    }

    /// Agents ranked by how much of the remaining availability their
    /// outstanding needs would consume (biggest bottleneck first).
    pub fn identify_bottleneck_agents(&self, input: &SafetyCheckInput) -> Vec<AgentId> {
        let resource_types = collect_resource_types(input);

        let mut scores: Vec<(AgentId, f64)> = input
            .max_need
            .keys()
            .map(|&aid| {
                let mut total_need_ratio = 0.0;
                let mut resource_count = 0u32;
                for &rt in &resource_types {
                    let need = remaining_need(input, aid, rt);
                    let avail = input.available.get(&rt).copied().unwrap_or(0);
                    if avail > 0 {
                        total_need_ratio += need as f64 / avail as f64;
                        resource_count += 1;
                    } else if need > 0 {
                        // Needs units of a resource with nothing left.
                        total_need_ratio += 1000.0;
                        resource_count += 1;
                    }
                }
                let avg = if resource_count > 0 {
                    total_need_ratio / f64::from(resource_count)
                } else {
                    0.0
                };
                (aid, avg)
            })
            .collect();

        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores.into_iter().map(|(aid, _)| aid).collect()
    }

    /// Identical algorithm to [`check_safety`](Self::check_safety), run on an
    /// input whose max-need map was filled from demand estimates at the given
    /// confidence level.
    pub fn check_safety_probabilistic(
        &self,
        input: &SafetyCheckInput,
        confidence_level: f64,
    ) -> ProbabilisticSafetyResult {
        let binary = self.check_safety(input);
        ProbabilisticSafetyResult {
            is_safe: binary.is_safe,
            confidence_level,
            max_safe_confidence: if binary.is_safe { confidence_level } else { 0.0 },
            safe_sequence: binary.safe_sequence,
            reason: binary.reason,
            estimated_max_needs: input.max_need.clone(),
        }
    }

    /// Hypothetical grant under probabilistic max-need estimates.
    pub fn check_hypothetical_probabilistic(
        &self,
        current_state: &SafetyCheckInput,
        agent: AgentId,
        resource: ResourceTypeId,
        quantity: ResourceQuantity,
        confidence_level: f64,
    ) -> ProbabilisticSafetyResult {
        let mut hypothetical = current_state.clone();
        *hypothetical.available.entry(resource).or_insert(0) -= quantity;
        *hypothetical
            .allocation
            .entry(agent)
            .or_default()
            .entry(resource)
            .or_insert(0) += quantity;
        self.check_safety_probabilistic(&hypothetical, confidence_level)
    }
}
