use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use agentguard_shared::{FastMap, FastSet};
use parking_lot::Mutex;

use crate::config::{DelegationConfig, DelegationCycleAction};
use crate::monitor::{EventKind, Monitor, MonitorEvent};
use crate::types::{AgentId, DelegationInfo};

/// Outcome of reporting one delegation edge.
#[derive(Clone, Debug, Default)]
pub struct DelegationResult {
    pub accepted: bool,
    pub cycle_detected: bool,
    /// Closed cycle path `[from, ..., from]` when a cycle was found.
    pub cycle_path: Vec<AgentId>,
}

#[derive(Debug, Default)]
struct GraphInner {
    known_agents: FastSet<AgentId>,
    adjacency: FastMap<AgentId, FastSet<AgentId>>,
    edges: FastMap<(AgentId, AgentId), DelegationInfo>,
}

impl GraphInner {
    fn remove_edge(&mut self, from: AgentId, to: AgentId) -> bool {
        if let Some(targets) = self.adjacency.get_mut(&from) {
            targets.remove(&to);
            if targets.is_empty() {
                self.adjacency.remove(&from);
            }
        }
        self.edges.remove(&(from, to)).is_some()
    }
}

/// Directed graph of active delegations with cycle detection on insertion.
///
/// At most one edge per ordered pair; both endpoints must be registered.
pub struct DelegationTracker {
    config: DelegationConfig,
    inner: Mutex<GraphInner>,
    monitor: Mutex<Option<Arc<dyn Monitor>>>,
}

impl std::fmt::Debug for DelegationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DelegationTracker")
            .field("config", &self.config)
            .field("agents", &inner.known_agents.len())
            .field("edges", &inner.edges.len())
            .finish()
    }
}

impl DelegationTracker {
    pub fn new(config: DelegationConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(GraphInner::default()),
            monitor: Mutex::new(None),
        }
    }

    pub fn set_monitor(&self, monitor: Arc<dyn Monitor>) {
        *self.monitor.lock() = Some(monitor);
    }

    pub fn register_agent(&self, id: AgentId) {
        self.inner.lock().known_agents.insert(id);
    }

    /// Removes the agent and every incident edge. No per-edge events.
    pub fn deregister_agent(&self, id: AgentId) {
        let mut inner = self.inner.lock();
        inner.known_agents.remove(&id);

        if let Some(targets) = inner.adjacency.remove(&id) {
            for target in targets {
                inner.edges.remove(&(id, target));
            }
        }
        let sources: Vec<AgentId> = inner
            .adjacency
            .iter()
            .filter(|(_, targets)| targets.contains(&id))
            .map(|(&src, _)| src)
            .collect();
        for src in sources {
            inner.remove_edge(src, id);
        }
    }

    /// Inserts the edge, then checks whether it closed a cycle. On a cycle,
    /// the configured action decides the fate of the edge.
    ///
    /// Rejected outright (no events) when either endpoint is unregistered.
    pub fn report_delegation(
        &self,
        from: AgentId,
        to: AgentId,
        task_description: impl Into<String>,
    ) -> DelegationResult {
        let mut result = DelegationResult::default();
        let mut cancelled = false;

        {
            let mut inner = self.inner.lock();
            if !inner.known_agents.contains(&from) || !inner.known_agents.contains(&to) {
                return result;
            }

            inner.adjacency.entry(from).or_default().insert(to);
            inner.edges.insert(
                (from, to),
                DelegationInfo {
                    from,
                    to,
                    task_description: task_description.into(),
                    timestamp: Instant::now(),
                },
            );

            let cycle_path = detect_cycle_from(&inner, from, to);
            if cycle_path.is_empty() {
                result.accepted = true;
            } else {
                result.cycle_detected = true;
                result.cycle_path = cycle_path;
                match self.config.cycle_action {
                    DelegationCycleAction::NotifyOnly => {
                        result.accepted = true;
                    }
                    DelegationCycleAction::RejectDelegation => {
                        inner.remove_edge(from, to);
                    }
                    DelegationCycleAction::CancelLatest => {
                        inner.remove_edge(from, to);
                        cancelled = true;
                    }
                }
            }
        }

        if result.accepted {
            self.emit(MonitorEvent {
                agent_id: Some(from),
                target_agent_id: Some(to),
                ..MonitorEvent::new(
                    EventKind::DelegationReported,
                    format!("delegation reported: agent {from} -> agent {to}"),
                )
            });
        }
        if result.cycle_detected {
            self.emit(MonitorEvent {
                agent_id: Some(from),
                target_agent_id: Some(to),
                cycle_path: Some(result.cycle_path.clone()),
                ..MonitorEvent::new(
                    EventKind::DelegationCycleDetected,
                    format!("delegation cycle detected involving agent {from} -> agent {to}"),
                )
            });
        }
        if cancelled {
            self.emit(MonitorEvent {
                agent_id: Some(from),
                target_agent_id: Some(to),
                ..MonitorEvent::new(
                    EventKind::DelegationCancelled,
                    format!("delegation cancelled (cycle prevention): agent {from} -> agent {to}"),
                )
            });
        }

        result
    }

    /// Removes the edge as completed. Unknown edges are a silent no-op.
    pub fn complete_delegation(&self, from: AgentId, to: AgentId) {
        let removed = self.inner.lock().remove_edge(from, to);
        if removed {
            self.emit(MonitorEvent {
                agent_id: Some(from),
                target_agent_id: Some(to),
                ..MonitorEvent::new(
                    EventKind::DelegationCompleted,
                    format!("delegation completed: agent {from} -> agent {to}"),
                )
            });
        }
    }

    /// Removes the edge as cancelled. Unknown edges are a silent no-op.
    pub fn cancel_delegation(&self, from: AgentId, to: AgentId) {
        let removed = self.inner.lock().remove_edge(from, to);
        if removed {
            self.emit(MonitorEvent {
                agent_id: Some(from),
                target_agent_id: Some(to),
                ..MonitorEvent::new(
                    EventKind::DelegationCancelled,
                    format!("delegation cancelled: agent {from} -> agent {to}"),
                )
            });
        }
    }

    pub fn get_all_delegations(&self) -> Vec<DelegationInfo> {
        self.inner.lock().edges.values().cloned().collect()
    }

    pub fn get_delegations_from(&self, from: AgentId) -> Vec<DelegationInfo> {
        self.inner
            .lock()
            .edges
            .values()
            .filter(|info| info.from == from)
            .cloned()
            .collect()
    }

    pub fn get_delegations_to(&self, to: AgentId) -> Vec<DelegationInfo> {
        self.inner
            .lock()
            .edges
            .values()
            .filter(|info| info.to == to)
            .cloned()
            .collect()
    }

    /// Scans the whole graph for any cycle and returns it closed
    /// (`[v, ..., v]`).
    pub fn find_cycle(&self) -> Option<Vec<AgentId>> {
        let inner = self.inner.lock();
        detect_any_cycle(&inner)
    }

    fn emit(&self, event: MonitorEvent) {
        let monitor = self.monitor.lock().clone();
        if let Some(monitor) = monitor {
            monitor.on_event(&event);
        }
    }
}

/// After inserting `from -> to`, a cycle exists iff a path leads from `to`
/// back to `from`. BFS with parent reconstruction.
fn detect_cycle_from(inner: &GraphInner, from: AgentId, to: AgentId) -> Vec<AgentId> {
    if from == to {
        return vec![from, from];
    }

    let mut queue = VecDeque::new();
    let mut visited = FastSet::default();
    let mut parent: FastMap<AgentId, AgentId> = FastMap::default();

    queue.push_back(to);
    visited.insert(to);

    while let Some(current) = queue.pop_front() {
        let Some(neighbors) = inner.adjacency.get(&current) else {
            continue;
        };
        for &neighbor in neighbors {
            if neighbor == from {
                // Reconstruct [from, to, ..., current, from].
                let mut segment = vec![current];
                let mut node = current;
                while node != to {
                    node = parent[&node];
                    segment.push(node);
                }
                segment.reverse();

                let mut path = Vec::with_capacity(segment.len() + 2);
                path.push(from);
                path.extend(segment);
                path.push(from);
                return path;
            }
            if visited.insert(neighbor) {
                parent.insert(neighbor, current);
                queue.push_back(neighbor);
            }
        }
    }

    Vec::new()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

struct DfsFrame {
    node: AgentId,
    neighbors: Vec<AgentId>,
    next_index: usize,
}

/// Iterative DFS with three-color marking over the whole graph.
fn detect_any_cycle(inner: &GraphInner) -> Option<Vec<AgentId>> {
    let mut color: FastMap<AgentId, Color> = FastMap::default();
    for &agent in &inner.known_agents {
        color.insert(agent, Color::White);
    }
    for (&src, targets) in &inner.adjacency {
        color.entry(src).or_insert(Color::White);
        for &t in targets {
            color.entry(t).or_insert(Color::White);
        }
    }

    // Deterministic start order keeps the returned witness stable.
    let mut start_nodes: Vec<AgentId> = color.keys().copied().collect();
    start_nodes.sort_unstable();

    let sorted_neighbors = |node: AgentId| -> Vec<AgentId> {
        let mut neighbors: Vec<AgentId> = inner
            .adjacency
            .get(&node)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default();
        neighbors.sort_unstable();
        neighbors
    };

    for start in start_nodes {
        if color[&start] != Color::White {
            continue;
        }

        color.insert(start, Color::Gray);
        let mut stack = vec![DfsFrame {
            node: start,
            neighbors: sorted_neighbors(start),
            next_index: 0,
        }];

        while let Some(frame) = stack.last_mut() {
            if frame.next_index >= frame.neighbors.len() {
                color.insert(frame.node, Color::Black);
                stack.pop();
                continue;
            }

            let neighbor = frame.neighbors[frame.next_index];
            frame.next_index += 1;

            match color[&neighbor] {
                Color::Gray => {
                    // Back edge: the stack holds the path; close the cycle at
                    // the first occurrence of `neighbor`.
                    let path: Vec<AgentId> = stack.iter().map(|f| f.node).collect();
                    let start_index = path.iter().position(|&n| n == neighbor)?;
                    let mut cycle: Vec<AgentId> = path[start_index..].to_vec();
                    cycle.push(neighbor);
                    return Some(cycle);
                }
                Color::White => {
                    color.insert(neighbor, Color::Gray);
                    stack.push(DfsFrame {
                        node: neighbor,
                        neighbors: sorted_neighbors(neighbor),
                        next_index: 0,
                    });
                }
                Color::Black => {}
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as PlMutex;

    use super::*;

    struct EventLog(PlMutex<Vec<MonitorEvent>>);

    impl Monitor for EventLog {
        fn on_event(&self, event: &MonitorEvent) {
            self.0.lock().push(event.clone());
        }
        fn on_snapshot(&self, _snapshot: &crate::types::SystemSnapshot) {}
    }

    fn tracker(action: DelegationCycleAction) -> DelegationTracker {
        let t = DelegationTracker::new(DelegationConfig {
            enabled: true,
            cycle_action: action,
        });
        for id in 1..=3 {
            t.register_agent(id);
        }
        t
    }

    #[test]
    fn unregistered_endpoint_is_rejected_without_cycle_flag() {
        let t = tracker(DelegationCycleAction::NotifyOnly);
        let result = t.report_delegation(1, 99, "task");
        assert!(!result.accepted);
        assert!(!result.cycle_detected);
        assert!(t.get_all_delegations().is_empty());
    }

    #[test]
    fn self_delegation_is_a_two_element_cycle() {
        let t = tracker(DelegationCycleAction::NotifyOnly);
        let result = t.report_delegation(1, 1, "recurse");
        assert!(result.cycle_detected);
        assert_eq!(result.cycle_path, vec![1, 1]);
    }

    #[test]
    fn chain_without_cycle_is_accepted() {
        let t = tracker(DelegationCycleAction::RejectDelegation);
        assert!(t.report_delegation(1, 2, "a").accepted);
        assert!(t.report_delegation(2, 3, "b").accepted);
        assert!(t.find_cycle().is_none());
        assert_eq!(t.get_delegations_from(1).len(), 1);
        assert_eq!(t.get_delegations_to(3).len(), 1);
    }

    #[test]
    fn notify_only_keeps_the_closing_edge() {
        let t = tracker(DelegationCycleAction::NotifyOnly);
        t.report_delegation(1, 2, "a");
        t.report_delegation(2, 3, "b");
        let result = t.report_delegation(3, 1, "c");
        assert!(result.accepted);
        assert!(result.cycle_detected);
        assert_eq!(result.cycle_path, vec![3, 1, 2, 3]);
        assert_eq!(t.get_all_delegations().len(), 3);
        assert!(t.find_cycle().is_some());
    }

    #[test]
    fn reject_drops_the_closing_edge() {
        let t = tracker(DelegationCycleAction::RejectDelegation);
        t.report_delegation(1, 2, "a");
        t.report_delegation(2, 3, "b");
        let result = t.report_delegation(3, 1, "c");
        assert!(!result.accepted);
        assert!(result.cycle_detected);
        assert_eq!(t.get_all_delegations().len(), 2);
        assert!(t.find_cycle().is_none());
    }

    #[test]
    fn cancel_latest_drops_edge_and_emits_cancellation() {
        let t = tracker(DelegationCycleAction::CancelLatest);
        let log = Arc::new(EventLog(PlMutex::new(Vec::new())));
        t.set_monitor(log.clone());

        t.report_delegation(1, 2, "a");
        t.report_delegation(2, 3, "b");
        let result = t.report_delegation(3, 1, "c");
        assert!(!result.accepted);
        assert!(result.cycle_detected);
        assert_eq!(t.get_all_delegations().len(), 2);

        let kinds: Vec<EventKind> = log.0.lock().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::DelegationCycleDetected));
        assert!(kinds.contains(&EventKind::DelegationCancelled));
    }

    #[test]
    fn cycle_event_carries_the_path() {
        let t = tracker(DelegationCycleAction::NotifyOnly);
        let log = Arc::new(EventLog(PlMutex::new(Vec::new())));
        t.set_monitor(log.clone());
        t.report_delegation(1, 2, "a");
        t.report_delegation(2, 1, "b");

        let events = log.0.lock();
        let cycle_event = events
            .iter()
            .find(|e| e.kind == EventKind::DelegationCycleDetected)
            .unwrap();
        assert_eq!(cycle_event.cycle_path.as_deref(), Some(&[2, 1, 2][..]));
    }

    #[test]
    fn completing_unknown_edge_is_a_no_op() {
        let t = tracker(DelegationCycleAction::NotifyOnly);
        let log = Arc::new(EventLog(PlMutex::new(Vec::new())));
        t.set_monitor(log.clone());
        t.complete_delegation(1, 2);
        assert!(log.0.lock().is_empty());
    }

    #[test]
    fn completion_removes_only_that_edge() {
        let t = tracker(DelegationCycleAction::NotifyOnly);
        t.report_delegation(1, 2, "a");
        t.report_delegation(2, 3, "b");
        t.complete_delegation(1, 2);
        let remaining = t.get_all_delegations();
        assert_eq!(remaining.len(), 1);
        assert_eq!((remaining[0].from, remaining[0].to), (2, 3));
    }

    #[test]
    fn deregistration_removes_incident_edges() {
        let t = tracker(DelegationCycleAction::NotifyOnly);
        t.report_delegation(1, 2, "a");
        t.report_delegation(2, 3, "b");
        t.report_delegation(3, 1, "c");
        t.deregister_agent(2);
        let remaining = t.get_all_delegations();
        assert_eq!(remaining.len(), 1);
        assert_eq!((remaining[0].from, remaining[0].to), (3, 1));
        // 2 can no longer participate in delegations.
        assert!(!t.report_delegation(1, 2, "again").accepted);
    }
}
