use std::sync::Arc;
use std::time::Duration;

use agentguard_core::{
    Agent, DelegationConfig, DelegationCycleAction, EventKind, GuardConfig, Monitor, MonitorEvent,
    Priority, ResourceManager, SystemSnapshot,
};
use parking_lot::Mutex;

struct EventLog(Mutex<Vec<MonitorEvent>>);

impl Monitor for EventLog {
    fn on_event(&self, event: &MonitorEvent) {
        self.0.lock().push(event.clone());
    }
    fn on_snapshot(&self, _snapshot: &SystemSnapshot) {}
}

fn delegating_manager(action: DelegationCycleAction) -> (ResourceManager, Arc<EventLog>, Vec<u64>) {
    let manager = ResourceManager::new(GuardConfig {
        processor_poll_interval: Duration::from_millis(5),
        delegation: DelegationConfig {
            enabled: true,
            cycle_action: action,
        },
        ..GuardConfig::default()
    });
    let log = Arc::new(EventLog(Mutex::new(Vec::new())));
    manager.set_monitor(log.clone());

    let agents = (0..3)
        .map(|i| manager.register_agent(Agent::new(format!("agent-{i}"), Priority::NORMAL)))
        .collect();
    (manager, log, agents)
}

fn chain(manager: &ResourceManager, agents: &[u64]) {
    assert!(manager.report_delegation(agents[0], agents[1], "research").accepted);
    assert!(manager.report_delegation(agents[1], agents[2], "summarize").accepted);
}

#[test]
fn notify_only_keeps_edge_and_reports_cycle() {
    let (manager, log, agents) = delegating_manager(DelegationCycleAction::NotifyOnly);
    chain(&manager, &agents);

    let result = manager.report_delegation(agents[2], agents[0], "review");
    assert!(result.accepted);
    assert!(result.cycle_detected);
    assert_eq!(
        result.cycle_path,
        vec![agents[2], agents[0], agents[1], agents[2]]
    );
    assert_eq!(manager.get_all_delegations().len(), 3);
    assert!(manager.find_delegation_cycle().is_some());

    let kinds: Vec<EventKind> = log.0.lock().iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&EventKind::DelegationCycleDetected));
}

#[test]
fn reject_drops_edge_and_leaves_graph_acyclic() {
    let (manager, _log, agents) = delegating_manager(DelegationCycleAction::RejectDelegation);
    chain(&manager, &agents);

    let result = manager.report_delegation(agents[2], agents[0], "review");
    assert!(!result.accepted);
    assert!(result.cycle_detected);
    assert_eq!(manager.get_all_delegations().len(), 2);
    assert!(manager.find_delegation_cycle().is_none());
}

#[test]
fn cancel_latest_drops_edge_and_emits_cancellation() {
    let (manager, log, agents) = delegating_manager(DelegationCycleAction::CancelLatest);
    chain(&manager, &agents);

    let result = manager.report_delegation(agents[2], agents[0], "review");
    assert!(!result.accepted);
    assert!(result.cycle_detected);
    assert_eq!(manager.get_all_delegations().len(), 2);

    let events = log.0.lock();
    let cycle = events
        .iter()
        .find(|e| e.kind == EventKind::DelegationCycleDetected)
        .expect("cycle event");
    assert_eq!(
        cycle.cycle_path.as_deref(),
        Some(&[agents[2], agents[0], agents[1], agents[2]][..])
    );
    assert!(events.iter().any(|e| e.kind == EventKind::DelegationCancelled));
}

#[test]
fn completion_and_cancellation_remove_edges() {
    let (manager, log, agents) = delegating_manager(DelegationCycleAction::NotifyOnly);
    chain(&manager, &agents);

    manager.complete_delegation(agents[0], agents[1]);
    manager.cancel_delegation(agents[1], agents[2]);
    assert!(manager.get_all_delegations().is_empty());

    // Repeating either removal is a silent no-op.
    let before = log.0.lock().len();
    manager.complete_delegation(agents[0], agents[1]);
    manager.cancel_delegation(agents[1], agents[2]);
    assert_eq!(log.0.lock().len(), before);
}

#[test]
fn deregistration_tears_down_incident_edges() {
    let (manager, _log, agents) = delegating_manager(DelegationCycleAction::NotifyOnly);
    chain(&manager, &agents);

    manager.deregister_agent(agents[1]);
    let remaining = manager.get_all_delegations();
    assert!(remaining.is_empty());
    assert!(!manager.report_delegation(agents[0], agents[1], "gone").accepted);
}

#[test]
fn disabled_tracker_accepts_everything() {
    let manager = ResourceManager::new(GuardConfig::default());
    let a = manager.register_agent(Agent::new("a", Priority::NORMAL));
    let b = manager.register_agent(Agent::new("b", Priority::NORMAL));

    let result = manager.report_delegation(a, b, "task");
    assert!(result.accepted);
    assert!(!result.cycle_detected);
    assert!(manager.get_all_delegations().is_empty());
    assert!(manager.find_delegation_cycle().is_none());
}
