use std::sync::Arc;
use std::time::{Duration, Instant};

use agentguard_core::{
    Agent, EventKind, GuardConfig, Monitor, MonitorEvent, Priority, ProgressConfig, RequestStatus,
    Resource, ResourceCategory, ResourceManager, SystemSnapshot,
};
use parking_lot::Mutex;

struct EventLog(Mutex<Vec<MonitorEvent>>);

impl EventLog {
    fn kinds(&self) -> Vec<EventKind> {
        self.0.lock().iter().map(|e| e.kind).collect()
    }
}

impl Monitor for EventLog {
    fn on_event(&self, event: &MonitorEvent) {
        self.0.lock().push(event.clone());
    }
    fn on_snapshot(&self, _snapshot: &SystemSnapshot) {}
}

fn watched_manager(auto_release: bool) -> (ResourceManager, Arc<EventLog>) {
    let manager = ResourceManager::new(GuardConfig {
        processor_poll_interval: Duration::from_millis(5),
        progress: ProgressConfig {
            enabled: true,
            default_stall_threshold: Duration::from_millis(100),
            check_interval: Duration::from_millis(20),
            auto_release_on_stall: auto_release,
        },
        ..GuardConfig::default()
    });
    let log = Arc::new(EventLog(Mutex::new(Vec::new())));
    manager.set_monitor(log.clone());
    (manager, log)
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

#[test]
fn stalled_agent_is_auto_released() {
    let (manager, log) = watched_manager(true);
    let resource = Resource::new(0, "units", ResourceCategory::TokenBudget, 10).unwrap();
    let rt = manager.register_resource(resource);
    let mut agent = Agent::new("quiet", Priority::NORMAL);
    agent.declare_max_need(rt, 5);
    let agent = manager.register_agent(agent);

    manager.start();
    assert_eq!(
        manager.request_resources(agent, rt, 3, None).unwrap(),
        RequestStatus::Granted
    );
    assert_eq!(manager.get_resource(rt).unwrap().available(), 7);

    // Stop reporting progress; within a few check intervals the tracker
    // must flag the agent, run the stall action, and return the units.
    assert!(wait_until(Duration::from_secs(2), || {
        manager.get_resource(rt).unwrap().available() == 10
    }));
    assert!(manager.is_agent_stalled(agent));
    assert_eq!(manager.get_stalled_agents(), vec![agent]);
    manager.stop();

    let kinds = log.kinds();
    assert!(kinds.contains(&EventKind::AgentStalled));
    assert!(kinds.contains(&EventKind::AgentResourcesAutoReleased));
    let stalled_at = kinds.iter().position(|&k| k == EventKind::AgentStalled).unwrap();
    let released_at = kinds
        .iter()
        .position(|&k| k == EventKind::AgentResourcesAutoReleased)
        .unwrap();
    assert!(stalled_at < released_at);
}

#[test]
fn progress_reports_keep_the_agent_alive() {
    let (manager, _log) = watched_manager(true);
    let resource = Resource::new(0, "units", ResourceCategory::TokenBudget, 10).unwrap();
    let rt = manager.register_resource(resource);
    let mut agent = Agent::new("chatty", Priority::NORMAL);
    agent.declare_max_need(rt, 5);
    let agent = manager.register_agent(agent);

    manager.start();
    manager.request_resources(agent, rt, 3, None).unwrap();

    // Keep the heartbeat fresh for well past the stall threshold.
    for step in 0..10 {
        manager.report_progress(agent, "tokens", step as f64);
        std::thread::sleep(Duration::from_millis(30));
    }
    assert!(!manager.is_agent_stalled(agent));
    assert_eq!(manager.get_resource(rt).unwrap().available(), 7);
    manager.stop();
}

#[test]
fn stall_resolution_emits_once_per_recovery() {
    let (manager, log) = watched_manager(false);
    let agent = manager.register_agent(Agent::new("flaky", Priority::NORMAL));

    manager.start();
    assert!(wait_until(Duration::from_secs(2), || {
        manager.is_agent_stalled(agent)
    }));

    manager.report_progress(agent, "steps", 1.0);
    assert!(!manager.is_agent_stalled(agent));
    manager.report_progress(agent, "steps", 2.0);
    manager.stop();

    let resolved = log
        .kinds()
        .iter()
        .filter(|&&k| k == EventKind::AgentStallResolved)
        .count();
    assert_eq!(resolved, 1);
}

#[test]
fn per_agent_threshold_is_honored_by_the_manager() {
    let (manager, _log) = watched_manager(false);
    let patient = manager.register_agent(Agent::new("patient", Priority::NORMAL));
    let hasty = manager.register_agent(Agent::new("hasty", Priority::NORMAL));

    manager.set_agent_stall_threshold(patient, Duration::from_secs(3600));
    manager.set_agent_stall_threshold(hasty, Duration::from_millis(30));

    manager.start();
    assert!(wait_until(Duration::from_secs(2), || {
        manager.is_agent_stalled(hasty)
    }));
    assert!(!manager.is_agent_stalled(patient));
    manager.stop();
}

#[test]
fn progress_api_is_inert_when_disabled() {
    let manager = ResourceManager::new(GuardConfig::default());
    let agent = manager.register_agent(Agent::new("untracked", Priority::NORMAL));
    manager.report_progress(agent, "steps", 1.0);
    assert!(!manager.is_agent_stalled(agent));
    assert!(manager.get_stalled_agents().is_empty());
}
