use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use agentguard_shared::FastMap;
use parking_lot::{Condvar, Mutex};

use crate::config::ProgressConfig;
use crate::monitor::{EventKind, Monitor, MonitorEvent};
use crate::types::AgentId;

/// Action invoked for each agent that newly trips its stall threshold, when
/// auto-release is enabled. Runs outside the tracker's lock.
pub type StallAction = Arc<dyn Fn(AgentId) + Send + Sync>;

/// Per-agent heartbeat record.
#[derive(Clone, Debug)]
pub struct ProgressRecord {
    /// Latest reported value per metric name.
    pub metrics: FastMap<String, f64>,
    pub last_update: Instant,
    /// Per-agent override of the configured stall threshold.
    pub stall_threshold: Option<Duration>,
    pub is_stalled: bool,
}

impl ProgressRecord {
    fn new() -> Self {
        Self {
            metrics: FastMap::default(),
            last_update: Instant::now(),
            stall_threshold: None,
            is_stalled: false,
        }
    }
}

/// Heartbeat store with a background stall-detection loop.
///
/// Agents report named progress metrics; a checker thread flags any agent
/// whose last report is older than its threshold, emits events, and (when
/// configured) invokes the stall action.
pub struct ProgressTracker {
    config: ProgressConfig,
    records: Mutex<FastMap<AgentId, ProgressRecord>>,
    running: AtomicBool,
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
    checker: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<Arc<dyn Monitor>>>,
    stall_action: Mutex<Option<StallAction>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("config", &self.config)
            .field("tracked_agents", &self.records.lock().len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            records: Mutex::new(FastMap::default()),
            running: AtomicBool::new(false),
            sleep_lock: Mutex::new(()),
            sleep_cv: Condvar::new(),
            checker: Mutex::new(None),
            monitor: Mutex::new(None),
            stall_action: Mutex::new(None),
        }
    }

    pub fn register_agent(&self, id: AgentId) {
        self.records.lock().insert(id, ProgressRecord::new());
    }

    pub fn deregister_agent(&self, id: AgentId) {
        self.records.lock().remove(&id);
    }

    /// Overwrites the metric and refreshes the heartbeat.
    ///
    /// A report from a stalled agent clears the stalled flag and emits
    /// `AgentStallResolved` exactly once.
    pub fn report_progress(&self, id: AgentId, metric_name: &str, value: f64) {
        let was_stalled = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(&id) else {
                return;
            };
            record.metrics.insert(metric_name.to_string(), value);
            record.last_update = Instant::now();
            std::mem::replace(&mut record.is_stalled, false)
        };

        self.emit(MonitorEvent {
            agent_id: Some(id),
            ..MonitorEvent::new(
                EventKind::AgentProgressReported,
                format!("agent {id} reported progress: {metric_name} = {value}"),
            )
        });

        if was_stalled {
            self.emit(MonitorEvent {
                agent_id: Some(id),
                ..MonitorEvent::new(
                    EventKind::AgentStallResolved,
                    format!("agent {id} stall resolved after progress report"),
                )
            });
        }
    }

    pub fn set_agent_stall_threshold(&self, id: AgentId, threshold: Duration) {
        if let Some(record) = self.records.lock().get_mut(&id) {
            record.stall_threshold = Some(threshold);
        }
    }

    pub fn is_stalled(&self, id: AgentId) -> bool {
        self.records
            .lock()
            .get(&id)
            .map(|r| r.is_stalled)
            .unwrap_or(false)
    }

    pub fn get_stalled_agents(&self) -> Vec<AgentId> {
        self.records
            .lock()
            .iter()
            .filter(|(_, record)| record.is_stalled)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn get_progress(&self, id: AgentId) -> Option<ProgressRecord> {
        self.records.lock().get(&id).cloned()
    }

    /// Spawns the checker thread.
    pub fn start(
        self: &Arc<Self>,
        monitor: Option<Arc<dyn Monitor>>,
        stall_action: Option<StallAction>,
    ) {
        *self.monitor.lock() = monitor;
        *self.stall_action.lock() = stall_action;
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let tracker = Arc::clone(self);
        let handle = std::thread::spawn(move || tracker.check_loop());
        *self.checker.lock() = Some(handle);
    }

    /// Signals termination and joins the checker thread.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let _guard = self.sleep_lock.lock();
            self.sleep_cv.notify_all();
        }
        if let Some(handle) = self.checker.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn check_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            self.check_for_stalls();

            let mut guard = self.sleep_lock.lock();
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.sleep_cv.wait_for(&mut guard, self.config.check_interval);
        }
    }

    fn check_for_stalls(&self) {
        let newly_stalled: Vec<AgentId> = {
            let mut records = self.records.lock();
            let now = Instant::now();
            records
                .iter_mut()
                .filter_map(|(&id, record)| {
                    let threshold = record
                        .stall_threshold
                        .unwrap_or(self.config.default_stall_threshold);
                    if !record.is_stalled && now.duration_since(record.last_update) > threshold {
                        record.is_stalled = true;
                        Some(id)
                    } else {
                        None
                    }
                })
                .collect()
        };

        if newly_stalled.is_empty() {
            return;
        }

        let stall_action = self.stall_action.lock().clone();
        for id in newly_stalled {
            tracing::warn!(agent_id = id, "agent stalled, no progress reported");
            self.emit(MonitorEvent {
                agent_id: Some(id),
                ..MonitorEvent::new(
                    EventKind::AgentStalled,
                    format!("agent {id} has stalled (no progress reported)"),
                )
            });
            if self.config.auto_release_on_stall {
                if let Some(action) = &stall_action {
                    action(id);
                }
            }
        }
    }

    fn emit(&self, event: MonitorEvent) {
        let monitor = self.monitor.lock().clone();
        if let Some(monitor) = monitor {
            monitor.on_event(&event);
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex as PlMutex;

    use super::*;

    struct EventLog(PlMutex<Vec<EventKind>>);

    impl Monitor for EventLog {
        fn on_event(&self, event: &MonitorEvent) {
            self.0.lock().push(event.kind);
        }
        fn on_snapshot(&self, _snapshot: &crate::types::SystemSnapshot) {}
    }

    fn fast_config() -> ProgressConfig {
        ProgressConfig {
            enabled: true,
            default_stall_threshold: Duration::from_millis(50),
            check_interval: Duration::from_millis(10),
            auto_release_on_stall: true,
        }
    }

    #[test]
    fn unknown_agent_reports_are_ignored() {
        let tracker = ProgressTracker::new(fast_config());
        tracker.report_progress(99, "steps", 1.0);
        assert!(!tracker.is_stalled(99));
        assert!(tracker.get_progress(99).is_none());
    }

    #[test]
    fn progress_overwrites_metric_values() {
        let tracker = ProgressTracker::new(fast_config());
        tracker.register_agent(1);
        tracker.report_progress(1, "steps", 1.0);
        tracker.report_progress(1, "steps", 2.0);
        let record = tracker.get_progress(1).unwrap();
        assert_eq!(record.metrics.get("steps"), Some(&2.0));
    }

    #[test]
    fn stall_detection_fires_action_and_events() {
        let tracker = Arc::new(ProgressTracker::new(fast_config()));
        let log = Arc::new(EventLog(PlMutex::new(Vec::new())));
        let released = Arc::new(AtomicUsize::new(0));

        tracker.register_agent(1);
        let counter = Arc::clone(&released);
        tracker.start(
            Some(log.clone()),
            Some(Arc::new(move |_id| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        // Do not report progress; the agent must trip the 50ms threshold.
        let deadline = Instant::now() + Duration::from_secs(2);
        while !tracker.is_stalled(1) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        tracker.stop();

        assert!(tracker.is_stalled(1));
        assert_eq!(tracker.get_stalled_agents(), vec![1]);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(log.0.lock().contains(&EventKind::AgentStalled));
    }

    #[test]
    fn stall_resolves_exactly_once() {
        let tracker = Arc::new(ProgressTracker::new(fast_config()));
        let log = Arc::new(EventLog(PlMutex::new(Vec::new())));

        tracker.register_agent(1);
        tracker.start(Some(log.clone()), None);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !tracker.is_stalled(1) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(tracker.is_stalled(1));

        tracker.report_progress(1, "steps", 1.0);
        assert!(!tracker.is_stalled(1));
        tracker.report_progress(1, "steps", 2.0);
        tracker.stop();

        let resolved = log
            .0
            .lock()
            .iter()
            .filter(|&&kind| kind == EventKind::AgentStallResolved)
            .count();
        assert_eq!(resolved, 1);
    }

    #[test]
    fn per_agent_threshold_overrides_default() {
        let mut config = fast_config();
        config.default_stall_threshold = Duration::from_secs(3600);
        let tracker = Arc::new(ProgressTracker::new(config));
        tracker.register_agent(1);
        tracker.set_agent_stall_threshold(1, Duration::from_millis(30));
        tracker.start(None, None);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !tracker.is_stalled(1) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        tracker.stop();
        assert!(tracker.is_stalled(1));
    }

    #[test]
    fn stop_is_idempotent_and_joins() {
        let tracker = Arc::new(ProgressTracker::new(fast_config()));
        tracker.start(None, None);
        tracker.stop();
        tracker.stop();
        assert!(!tracker.is_running());
    }
}
