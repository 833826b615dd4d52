use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use agentguard_shared::{FastMap, StableMap};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::agent::Agent;
use crate::config::GuardConfig;
use crate::delegation::{DelegationResult, DelegationTracker};
use crate::error::GuardError;
use crate::estimator::DemandEstimator;
use crate::monitor::{EventKind, Monitor, MonitorEvent};
use crate::policy::{FifoPolicy, SchedulingPolicy};
use crate::progress::{ProgressTracker, StallAction};
use crate::queue::RequestQueue;
use crate::resource::Resource;
use crate::safety::{ProbabilisticSafetyResult, SafetyCheckInput, SafetyChecker};
use crate::types::{
    AgentAllocationSnapshot, AgentId, AgentState, DelegationInfo, DemandMode, Priority,
    RequestCallback, RequestId, RequestStatus, ResourceQuantity, ResourceRequest, ResourceTypeId,
    SystemSnapshot,
};

#[derive(Debug, Default)]
struct CoreState {
    resources: FastMap<ResourceTypeId, Resource>,
    agents: FastMap<AgentId, Agent>,
    next_agent_id: AgentId,
    next_resource_id: ResourceTypeId,
}

/// Condition signalled by every mutation that could unblock a waiter:
/// releases, deregistrations, capacity raises, new queue entries, shutdown.
#[derive(Default)]
struct ReleaseSignal {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl ReleaseSignal {
    fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Bounded wait; spurious wakeups are fine, callers re-check state.
    fn wait(&self, timeout: Duration) {
        let mut generation = self.generation.lock();
        self.cv.wait_for(&mut generation, timeout);
    }
}

struct ManagerShared {
    config: GuardConfig,
    state: RwLock<CoreState>,
    release: ReleaseSignal,
    queue: RequestQueue,
    policy: Mutex<Box<dyn SchedulingPolicy>>,
    monitor: RwLock<Option<Arc<dyn Monitor>>>,
    safety: SafetyChecker,
    estimator: DemandEstimator,
    progress: Option<Arc<ProgressTracker>>,
    delegation: Option<Arc<DelegationTracker>>,
    running: AtomicBool,
    processor: Mutex<Option<JoinHandle<()>>>,
}

/// Outcome of one grant attempt inside the critical section.
enum TryGrant {
    /// Committed; carries the agent's new total holdings of the resource.
    Granted(ResourceQuantity),
    /// Enough units are free but the grant would leave the state unsafe.
    Unsafe,
    /// Not enough free units right now.
    Insufficient,
    /// The agent or resource disappeared while we waited.
    Gone,
}

/// The coordination engine: owns all resources and agents, enforces the
/// Banker's safety check on every grant, and drives a background scheduler
/// for queued requests.
///
/// All state is owned by value inside the manager; queries return copies.
/// Callbacks, monitor emissions, and stall actions are always invoked
/// outside internal locks — their bodies must not re-enter the manager and
/// must not block indefinitely.
pub struct ResourceManager {
    shared: Arc<ManagerShared>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("ResourceManager")
            .field("resources", &state.resources.len())
            .field("agents", &state.agents.len())
            .field("pending_requests", &self.shared.queue.size())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ResourceManager {
    pub fn new(config: GuardConfig) -> Self {
        let progress = config
            .progress
            .enabled
            .then(|| Arc::new(ProgressTracker::new(config.progress.clone())));
        let delegation = config
            .delegation
            .enabled
            .then(|| Arc::new(DelegationTracker::new(config.delegation.clone())));
        let estimator = DemandEstimator::new(config.adaptive.clone());

        Self {
            shared: Arc::new(ManagerShared {
                queue: RequestQueue::new(config.max_queue_size),
                state: RwLock::new(CoreState {
                    resources: FastMap::default(),
                    agents: FastMap::default(),
                    next_agent_id: 1,
                    next_resource_id: 1,
                }),
                release: ReleaseSignal::default(),
                policy: Mutex::new(Box::new(FifoPolicy)),
                monitor: RwLock::new(None),
                safety: SafetyChecker,
                estimator,
                progress,
                delegation,
                running: AtomicBool::new(false),
                processor: Mutex::new(None),
                config,
            }),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.shared.config
    }

    // ==================== Resource lifecycle ====================

    /// Inserts a resource, assigning a fresh id when the caller left it at 0.
    /// An id that is already registered leaves the existing entry in place.
    /// Returns the id under which the resource is registered.
    pub fn register_resource(&self, mut resource: Resource) -> ResourceTypeId {
        let id = {
            let mut state = self.shared.state.write();
            let id = if resource.id() == 0 {
                let id = state.next_resource_id;
                state.next_resource_id += 1;
                id
            } else {
                state.next_resource_id = state.next_resource_id.max(resource.id() + 1);
                resource.id()
            };
            resource.set_id(id);
            state.resources.entry(id).or_insert(resource);
            id
        };
        self.shared.emit(MonitorEvent {
            resource_type: Some(id),
            ..MonitorEvent::new(EventKind::ResourceRegistered, "resource registered")
        });
        id
    }

    /// Removes a resource type. Refuses while any units are allocated.
    pub fn unregister_resource(&self, id: ResourceTypeId) -> bool {
        let mut state = self.shared.state.write();
        match state.resources.get(&id) {
            Some(resource) if resource.allocated() == 0 => {
                state.resources.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Adjusts capacity. Succeeds iff the new capacity covers what is
    /// currently allocated.
    pub fn adjust_resource_capacity(&self, id: ResourceTypeId, new_capacity: ResourceQuantity) -> bool {
        let adjusted = {
            let mut state = self.shared.state.write();
            match state.resources.get_mut(&id) {
                Some(resource) => resource.set_total_capacity(new_capacity),
                None => false,
            }
        };
        if adjusted {
            self.shared.emit(MonitorEvent {
                resource_type: Some(id),
                quantity: Some(new_capacity),
                ..MonitorEvent::new(EventKind::ResourceCapacityChanged, "capacity adjusted")
            });
            // A raise may unblock waiters.
            self.shared.release.notify();
        }
        adjusted
    }

    pub fn get_resource(&self, id: ResourceTypeId) -> Option<Resource> {
        self.shared.state.read().resources.get(&id).cloned()
    }

    pub fn get_all_resources(&self) -> Vec<Resource> {
        self.shared.state.read().resources.values().cloned().collect()
    }

    // ==================== Agent lifecycle ====================

    /// Registers an agent under a freshly assigned id and returns it.
    pub fn register_agent(&self, mut agent: Agent) -> AgentId {
        let (id, name) = {
            let mut state = self.shared.state.write();
            let id = state.next_agent_id;
            state.next_agent_id += 1;
            agent.set_id(id);
            agent.set_state(AgentState::Registered);
            let name = agent.name().to_string();
            state.agents.insert(id, agent);
            (id, name)
        };

        if let Some(progress) = &self.shared.progress {
            progress.register_agent(id);
        }
        if let Some(delegation) = &self.shared.delegation {
            delegation.register_agent(id);
        }

        self.shared.emit(MonitorEvent {
            agent_id: Some(id),
            ..MonitorEvent::new(EventKind::AgentRegistered, format!("agent registered: {name}"))
        });
        id
    }

    /// Deregisters an agent: releases every held unit, cancels its queued
    /// requests (callbacks fire with `Cancelled`), and drops its statistics.
    pub fn deregister_agent(&self, id: AgentId) -> bool {
        let name = {
            let mut state = self.shared.state.write();
            let state = &mut *state;
            let Some(agent) = state.agents.get(&id) else {
                return false;
            };
            let name = agent.name().to_string();
            for (rt, qty) in agent.current_allocation() {
                if let Some(resource) = state.resources.get_mut(rt) {
                    resource.deallocate(*qty);
                }
            }
            state.agents.remove(&id);
            name
        };

        if let Some(progress) = &self.shared.progress {
            progress.deregister_agent(id);
        }
        if let Some(delegation) = &self.shared.delegation {
            delegation.deregister_agent(id);
        }
        self.shared.estimator.clear_agent(id);

        let cancelled = self.shared.queue.cancel_all_for_agent(id);
        for request_id in cancelled {
            self.shared.emit(MonitorEvent {
                agent_id: Some(id),
                request_id: Some(request_id),
                ..MonitorEvent::new(EventKind::RequestCancelled, "request cancelled: agent deregistered")
            });
        }

        self.shared.emit(MonitorEvent {
            agent_id: Some(id),
            ..MonitorEvent::new(EventKind::AgentDeregistered, format!("agent deregistered: {name}"))
        });
        self.shared.release.notify();
        true
    }

    /// Raises or lowers a declared max claim. Refuses to drop it below the
    /// agent's current allocation of that resource.
    pub fn update_agent_max_claim(
        &self,
        id: AgentId,
        resource_type: ResourceTypeId,
        new_max: ResourceQuantity,
    ) -> bool {
        let mut state = self.shared.state.write();
        let Some(agent) = state.agents.get_mut(&id) else {
            return false;
        };
        if new_max < agent.allocation_of(resource_type) {
            return false;
        }
        agent.declare_max_need(resource_type, new_max);
        true
    }

    pub fn get_agent(&self, id: AgentId) -> Option<Agent> {
        self.shared.state.read().agents.get(&id).cloned()
    }

    pub fn get_all_agents(&self) -> Vec<Agent> {
        self.shared.state.read().agents.values().cloned().collect()
    }

    pub fn agent_count(&self) -> usize {
        self.shared.state.read().agents.len()
    }

    // ==================== Requests ====================

    /// Synchronous single-resource request.
    ///
    /// Tries once immediately, then waits on the release condition in
    /// bounded slices until granted or the deadline passes. A zero timeout
    /// degenerates to try-once. Returns `Denied` without waiting when the
    /// grant would be unsafe and no background processor is running.
    pub fn request_resources(
        &self,
        agent_id: AgentId,
        resource_type: ResourceTypeId,
        quantity: ResourceQuantity,
        timeout: Option<Duration>,
    ) -> Result<RequestStatus, GuardError> {
        self.shared
            .request_resources_sync(agent_id, resource_type, quantity, timeout)
    }

    /// Synchronous multi-resource request; the commit is all-or-nothing.
    pub fn request_resources_batch(
        &self,
        agent_id: AgentId,
        requests: &FastMap<ResourceTypeId, ResourceQuantity>,
        timeout: Option<Duration>,
    ) -> Result<RequestStatus, GuardError> {
        for (&rt, &qty) in requests {
            self.shared.validate_request(agent_id, rt, qty, true)?;
        }

        self.shared.emit(MonitorEvent {
            agent_id: Some(agent_id),
            ..MonitorEvent::new(EventKind::RequestSubmitted, "batch request submitted")
        });
        for (&rt, &qty) in requests {
            self.shared.estimator.record_request(agent_id, rt, qty);
        }

        let deadline = Instant::now() + timeout.unwrap_or(self.shared.config.default_request_timeout);
        loop {
            match self.shared.try_grant_batch(agent_id, requests) {
                TryGrant::Granted(_) => {
                    self.shared.emit(MonitorEvent {
                        agent_id: Some(agent_id),
                        ..MonitorEvent::new(EventKind::RequestGranted, "batch granted")
                    });
                    return Ok(RequestStatus::Granted);
                }
                TryGrant::Gone => {
                    self.shared.emit(MonitorEvent {
                        agent_id: Some(agent_id),
                        ..MonitorEvent::new(EventKind::RequestDenied, "batch denied: agent or resource gone")
                    });
                    return Ok(RequestStatus::Denied);
                }
                TryGrant::Unsafe => {
                    self.shared.emit(MonitorEvent {
                        agent_id: Some(agent_id),
                        ..MonitorEvent::new(EventKind::UnsafeStateDetected, "batch would create unsafe state")
                    });
                    if !self.is_running() {
                        self.shared.emit(MonitorEvent {
                            agent_id: Some(agent_id),
                            ..MonitorEvent::new(
                                EventKind::RequestDenied,
                                "batch unsafe and no processor running",
                            )
                        });
                        return Ok(RequestStatus::Denied);
                    }
                }
                TryGrant::Insufficient => {}
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            if remaining.is_zero() {
                break;
            }
            self.shared
                .release
                .wait(remaining.min(self.shared.config.processor_poll_interval));
        }

        self.shared.emit(MonitorEvent {
            agent_id: Some(agent_id),
            ..MonitorEvent::new(EventKind::RequestTimedOut, "batch request timed out")
        });
        Ok(RequestStatus::TimedOut)
    }

    /// Asynchronous single request: a worker thread runs the synchronous
    /// body and resolves the returned channel with the terminal status.
    ///
    /// Validation failures resolve to `Denied` rather than erroring.
    pub fn request_resources_async(
        &self,
        agent_id: AgentId,
        resource_type: ResourceTypeId,
        quantity: ResourceQuantity,
        timeout: Option<Duration>,
    ) -> tokio::sync::oneshot::Receiver<RequestStatus> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || {
            let status =
                match shared.request_resources_sync(agent_id, resource_type, quantity, timeout) {
                    Ok(status) => status,
                    Err(error) => {
                        tracing::warn!(%error, agent_id, resource_type, "async request rejected");
                        RequestStatus::Denied
                    }
                };
            let _ = tx.send(status);
        });
        rx
    }

    /// Enqueues a request resolved later by the background processor via the
    /// callback. The request inherits the agent's current priority at
    /// enqueue time.
    pub fn request_resources_callback(
        &self,
        agent_id: AgentId,
        resource_type: ResourceTypeId,
        quantity: ResourceQuantity,
        callback: RequestCallback,
        timeout: Option<Duration>,
    ) -> Result<RequestId, GuardError> {
        let priority = self
            .shared
            .state
            .read()
            .agents
            .get(&agent_id)
            .map(|a| a.priority())
            .unwrap_or(Priority::NORMAL);

        let mut request = ResourceRequest::new(agent_id, resource_type, quantity);
        request.priority = priority;
        request.timeout = timeout;
        request.callback = Some(callback);

        let id = self.shared.queue.enqueue(request)?;
        self.shared.emit(MonitorEvent {
            agent_id: Some(agent_id),
            resource_type: Some(resource_type),
            request_id: Some(id),
            quantity: Some(quantity),
            ..MonitorEvent::new(EventKind::RequestSubmitted, "request queued")
        });
        self.shared.emit_queue_size();
        // Give the processor a chance to pick it up before the next poll.
        self.shared.release.notify();
        Ok(id)
    }

    // ==================== Releases ====================

    /// Returns `quantity` units of a resource held by an agent.
    pub fn release_resources(
        &self,
        agent_id: AgentId,
        resource_type: ResourceTypeId,
        quantity: ResourceQuantity,
    ) -> Result<(), GuardError> {
        let level = {
            let mut state = self.shared.state.write();
            let state = &mut *state;
            if !state.resources.contains_key(&resource_type) {
                return Err(GuardError::ResourceNotFound { resource_type });
            }
            let Some(agent) = state.agents.get_mut(&agent_id) else {
                return Err(GuardError::AgentNotFound { agent_id });
            };
            agent.deallocate(resource_type, quantity);
            let level = agent.allocation_of(resource_type);
            if let Some(resource) = state.resources.get_mut(&resource_type) {
                resource.deallocate(quantity);
            }
            level
        };

        self.shared
            .estimator
            .record_allocation_level(agent_id, resource_type, level);
        self.shared.emit(MonitorEvent {
            agent_id: Some(agent_id),
            resource_type: Some(resource_type),
            quantity: Some(quantity),
            ..MonitorEvent::new(EventKind::ResourcesReleased, "resources released")
        });
        self.shared.release.notify();
        Ok(())
    }

    /// Returns everything the agent holds of one resource type. Unknown
    /// agents and untouched resources are a no-op.
    pub fn release_all_of_resource(&self, agent_id: AgentId, resource_type: ResourceTypeId) {
        let released = {
            let mut state = self.shared.state.write();
            let state = &mut *state;
            let Some(agent) = state.agents.get_mut(&agent_id) else {
                return;
            };
            let qty = agent.allocation_of(resource_type);
            if qty == 0 {
                return;
            }
            agent.deallocate(resource_type, qty);
            if let Some(resource) = state.resources.get_mut(&resource_type) {
                resource.deallocate(qty);
            }
            qty
        };

        self.shared
            .estimator
            .record_allocation_level(agent_id, resource_type, 0);
        self.shared.emit(MonitorEvent {
            agent_id: Some(agent_id),
            resource_type: Some(resource_type),
            quantity: Some(released),
            ..MonitorEvent::new(EventKind::ResourcesReleased, "all resources of type released")
        });
        self.shared.release.notify();
    }

    /// Returns everything the agent holds across all resource types
    /// atomically. Unknown agents are a no-op.
    pub fn release_all_resources(&self, agent_id: AgentId) {
        self.shared.release_all_resources(agent_id);
    }

    // ==================== Queries ====================

    pub fn is_safe(&self) -> bool {
        let state = self.shared.state.read();
        let input = build_safety_input(&state);
        self.shared.safety.check_safety(&input).is_safe
    }

    pub fn get_snapshot(&self) -> SystemSnapshot {
        self.shared.get_snapshot()
    }

    pub fn pending_request_count(&self) -> usize {
        self.shared.queue.size()
    }

    // ==================== Configuration ====================

    pub fn set_scheduling_policy(&self, policy: Box<dyn SchedulingPolicy>) {
        *self.shared.policy.lock() = policy;
    }

    pub fn set_monitor(&self, monitor: Arc<dyn Monitor>) {
        if let Some(delegation) = &self.shared.delegation {
            delegation.set_monitor(Arc::clone(&monitor));
        }
        *self.shared.monitor.write() = Some(monitor);
    }

    // ==================== Progress API ====================

    pub fn report_progress(&self, agent_id: AgentId, metric: &str, value: f64) {
        if let Some(progress) = &self.shared.progress {
            progress.report_progress(agent_id, metric, value);
        }
    }

    pub fn set_agent_stall_threshold(&self, agent_id: AgentId, threshold: Duration) {
        if let Some(progress) = &self.shared.progress {
            progress.set_agent_stall_threshold(agent_id, threshold);
        }
    }

    pub fn is_agent_stalled(&self, agent_id: AgentId) -> bool {
        self.shared
            .progress
            .as_ref()
            .map(|p| p.is_stalled(agent_id))
            .unwrap_or(false)
    }

    pub fn get_stalled_agents(&self) -> Vec<AgentId> {
        self.shared
            .progress
            .as_ref()
            .map(|p| p.get_stalled_agents())
            .unwrap_or_default()
    }

    // ==================== Delegation API ====================

    /// Records a delegation edge. When the tracker is disabled every
    /// delegation is trivially accepted.
    pub fn report_delegation(
        &self,
        from: AgentId,
        to: AgentId,
        task_description: &str,
    ) -> DelegationResult {
        match &self.shared.delegation {
            Some(delegation) => delegation.report_delegation(from, to, task_description),
            None => DelegationResult {
                accepted: true,
                cycle_detected: false,
                cycle_path: Vec::new(),
            },
        }
    }

    pub fn complete_delegation(&self, from: AgentId, to: AgentId) {
        if let Some(delegation) = &self.shared.delegation {
            delegation.complete_delegation(from, to);
        }
    }

    pub fn cancel_delegation(&self, from: AgentId, to: AgentId) {
        if let Some(delegation) = &self.shared.delegation {
            delegation.cancel_delegation(from, to);
        }
    }

    pub fn get_all_delegations(&self) -> Vec<DelegationInfo> {
        self.shared
            .delegation
            .as_ref()
            .map(|d| d.get_all_delegations())
            .unwrap_or_default()
    }

    pub fn find_delegation_cycle(&self) -> Option<Vec<AgentId>> {
        self.shared.delegation.as_ref().and_then(|d| d.find_cycle())
    }

    // ==================== Adaptive API ====================

    pub fn set_agent_demand_mode(&self, agent_id: AgentId, mode: DemandMode) {
        self.shared.estimator.set_agent_demand_mode(agent_id, mode);
        self.shared.emit(MonitorEvent {
            agent_id: Some(agent_id),
            ..MonitorEvent::new(
                EventKind::AdaptiveDemandModeChanged,
                format!("demand mode changed to {mode}"),
            )
        });
    }

    /// Whole-system probabilistic safety check at the given confidence, or
    /// the configured default.
    pub fn check_safety_probabilistic(&self, confidence: Option<f64>) -> ProbabilisticSafetyResult {
        let confidence =
            confidence.unwrap_or(self.shared.config.adaptive.default_confidence_level);
        let state = self.shared.state.read();
        let input = self.shared.build_adaptive_safety_input(&state, confidence);
        self.shared
            .safety
            .check_safety_probabilistic(&input, confidence)
    }

    /// Synchronous request evaluated against estimated max needs.
    ///
    /// Static-mode agents still get the declared max-claim precondition;
    /// Adaptive/Hybrid agents skip it.
    pub fn request_resources_adaptive(
        &self,
        agent_id: AgentId,
        resource_type: ResourceTypeId,
        quantity: ResourceQuantity,
        timeout: Option<Duration>,
    ) -> Result<RequestStatus, GuardError> {
        let enforce_max_claim =
            self.shared.estimator.get_agent_demand_mode(agent_id) == DemandMode::Static;
        self.shared
            .validate_request(agent_id, resource_type, quantity, enforce_max_claim)?;

        self.shared.emit(MonitorEvent {
            agent_id: Some(agent_id),
            resource_type: Some(resource_type),
            quantity: Some(quantity),
            ..MonitorEvent::new(EventKind::RequestSubmitted, "adaptive request submitted")
        });
        self.shared
            .estimator
            .record_request(agent_id, resource_type, quantity);

        Ok(self
            .shared
            .grant_loop(agent_id, resource_type, quantity, timeout, true))
    }

    // ==================== Lifecycle ====================

    /// Starts the background processor (and the stall checker when progress
    /// tracking is enabled). Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("resource manager starting");

        if let Some(progress) = &self.shared.progress {
            let stall_action: Option<StallAction> =
                if self.shared.config.progress.auto_release_on_stall {
                    let weak: Weak<ManagerShared> = Arc::downgrade(&self.shared);
                    Some(Arc::new(move |agent_id: AgentId| {
                        let Some(shared) = weak.upgrade() else {
                            return;
                        };
                        shared.release_all_resources(agent_id);
                        shared.emit(MonitorEvent {
                            agent_id: Some(agent_id),
                            ..MonitorEvent::new(
                                EventKind::AgentResourcesAutoReleased,
                                "stalled agent resources auto-released",
                            )
                        });
                    }))
                } else {
                    None
                };
            progress.start(self.shared.monitor.read().clone(), stall_action);
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || shared.process_queue_loop());
        *self.shared.processor.lock() = Some(handle);
    }

    /// Stops the background threads and joins them. Idempotent.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("resource manager stopping");

        if let Some(progress) = &self.shared.progress {
            progress.stop();
        }

        self.shared.release.notify();
        self.shared.queue.notify();

        if let Some(handle) = self.shared.processor.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The queue is shared so embedders can inspect or cancel pending
    /// requests directly.
    pub fn queue(&self) -> &RequestQueue {
        &self.shared.queue
    }

    /// The estimator backing the adaptive request surface.
    pub fn demand_estimator(&self) -> &DemandEstimator {
        &self.shared.estimator
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ManagerShared {
    fn emit(&self, event: MonitorEvent) {
        let monitor = self.monitor.read().clone();
        if let Some(monitor) = monitor {
            monitor.on_event(&event);
        }
    }

    fn emit_queue_size(&self) {
        let size = self.queue.size();
        self.emit(MonitorEvent::new(
            EventKind::QueueSizeChanged,
            format!("queue size now {size}"),
        ));
    }

    /// Pre-checks shared by the synchronous request paths.
    fn validate_request(
        &self,
        agent_id: AgentId,
        resource_type: ResourceTypeId,
        quantity: ResourceQuantity,
        enforce_max_claim: bool,
    ) -> Result<(), GuardError> {
        let state = self.state.read();
        let Some(agent) = state.agents.get(&agent_id) else {
            return Err(GuardError::AgentNotFound { agent_id });
        };
        let Some(resource) = state.resources.get(&resource_type) else {
            return Err(GuardError::ResourceNotFound { resource_type });
        };

        if enforce_max_claim {
            if let Some(&max_claim) = agent.max_needs().get(&resource_type) {
                let current = agent.allocation_of(resource_type);
                if current + quantity > max_claim {
                    return Err(GuardError::MaxClaimExceeded {
                        agent_id,
                        resource_type,
                        requested: quantity,
                        max_claim,
                    });
                }
            }
        }

        if quantity > resource.total_capacity() {
            return Err(GuardError::ResourceCapacityExceeded {
                resource_type,
                requested: quantity,
                total_capacity: resource.total_capacity(),
            });
        }
        Ok(())
    }

    /// Full synchronous single-request body; also backs the async surface.
    fn request_resources_sync(
        &self,
        agent_id: AgentId,
        resource_type: ResourceTypeId,
        quantity: ResourceQuantity,
        timeout: Option<Duration>,
    ) -> Result<RequestStatus, GuardError> {
        self.validate_request(agent_id, resource_type, quantity, true)?;

        self.emit(MonitorEvent {
            agent_id: Some(agent_id),
            resource_type: Some(resource_type),
            quantity: Some(quantity),
            ..MonitorEvent::new(EventKind::RequestSubmitted, "request submitted")
        });
        self.estimator.record_request(agent_id, resource_type, quantity);

        Ok(self.grant_loop(agent_id, resource_type, quantity, timeout, false))
    }

    /// Try-then-wait loop shared by the plain and adaptive synchronous
    /// paths. The try runs at least once.
    fn grant_loop(
        &self,
        agent_id: AgentId,
        resource_type: ResourceTypeId,
        quantity: ResourceQuantity,
        timeout: Option<Duration>,
        adaptive: bool,
    ) -> RequestStatus {
        let deadline = Instant::now() + timeout.unwrap_or(self.config.default_request_timeout);
        loop {
            let attempt = if adaptive {
                self.try_grant_adaptive(agent_id, resource_type, quantity)
            } else {
                self.try_grant_single(agent_id, resource_type, quantity, None)
            };

            match attempt {
                TryGrant::Granted(level) => {
                    self.estimator
                        .record_allocation_level(agent_id, resource_type, level);
                    self.emit(MonitorEvent {
                        agent_id: Some(agent_id),
                        resource_type: Some(resource_type),
                        quantity: Some(quantity),
                        ..MonitorEvent::new(EventKind::RequestGranted, "request granted")
                    });
                    return RequestStatus::Granted;
                }
                TryGrant::Gone => {
                    self.emit(MonitorEvent {
                        agent_id: Some(agent_id),
                        resource_type: Some(resource_type),
                        ..MonitorEvent::new(EventKind::RequestDenied, "agent or resource gone")
                    });
                    return RequestStatus::Denied;
                }
                TryGrant::Unsafe => {
                    self.emit(MonitorEvent {
                        agent_id: Some(agent_id),
                        resource_type: Some(resource_type),
                        ..MonitorEvent::new(EventKind::UnsafeStateDetected, "would create unsafe state")
                    });
                    // Without the processor nothing will ever change the
                    // state, so waiting is pointless.
                    if !self.running.load(Ordering::SeqCst) {
                        self.emit(MonitorEvent {
                            agent_id: Some(agent_id),
                            resource_type: Some(resource_type),
                            quantity: Some(quantity),
                            ..MonitorEvent::new(
                                EventKind::RequestDenied,
                                "unsafe state and no processor running",
                            )
                        });
                        return RequestStatus::Denied;
                    }
                }
                TryGrant::Insufficient => {}
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            if remaining.is_zero() {
                break;
            }
            self.release
                .wait(remaining.min(self.config.processor_poll_interval));
        }

        self.emit(MonitorEvent {
            agent_id: Some(agent_id),
            resource_type: Some(resource_type),
            quantity: Some(quantity),
            ..MonitorEvent::new(EventKind::RequestTimedOut, "request timed out")
        });
        RequestStatus::TimedOut
    }

    /// One grant attempt under the exclusive state lock. The safety-check
    /// event is emitted after the lock is dropped.
    fn try_grant_single(
        &self,
        agent_id: AgentId,
        resource_type: ResourceTypeId,
        quantity: ResourceQuantity,
        request_id: Option<RequestId>,
    ) -> TryGrant {
        let (outcome, safety_event) = {
            let mut state = self.state.write();
            if !state.resources.contains_key(&resource_type)
                || !state.agents.contains_key(&agent_id)
            {
                (TryGrant::Gone, None)
            } else if state.resources[&resource_type].available() < quantity {
                (TryGrant::Insufficient, None)
            } else {
                let input = build_safety_input(&state);
                let started = Instant::now();
                let result =
                    self.safety
                        .check_hypothetical(&input, agent_id, resource_type, quantity);
                let duration_us = started.elapsed().as_secs_f64() * 1_000_000.0;

                let event = MonitorEvent {
                    agent_id: Some(agent_id),
                    resource_type: Some(resource_type),
                    request_id,
                    quantity: Some(quantity),
                    safety_result: Some(result.is_safe),
                    duration_us: Some(duration_us),
                    ..MonitorEvent::new(EventKind::SafetyCheckPerformed, result.reason.clone())
                };

                if result.is_safe {
                    let level = commit_grant(&mut state, agent_id, resource_type, quantity);
                    (TryGrant::Granted(level), Some(event))
                } else {
                    (TryGrant::Unsafe, Some(event))
                }
            }
        };
        if let Some(event) = safety_event {
            self.emit(event);
        }
        outcome
    }

    /// One adaptive grant attempt; the safety input's max needs come from
    /// the estimator at the configured default confidence.
    fn try_grant_adaptive(
        &self,
        agent_id: AgentId,
        resource_type: ResourceTypeId,
        quantity: ResourceQuantity,
    ) -> TryGrant {
        let confidence = self.config.adaptive.default_confidence_level;
        let (outcome, safety_event) = {
            let mut state = self.state.write();
            if !state.resources.contains_key(&resource_type)
                || !state.agents.contains_key(&agent_id)
            {
                (TryGrant::Gone, None)
            } else if state.resources[&resource_type].available() < quantity {
                (TryGrant::Insufficient, None)
            } else {
                let input = self.build_adaptive_safety_input(&state, confidence);
                let started = Instant::now();
                let result = self.safety.check_hypothetical_probabilistic(
                    &input,
                    agent_id,
                    resource_type,
                    quantity,
                    confidence,
                );
                let duration_us = started.elapsed().as_secs_f64() * 1_000_000.0;

                let event = MonitorEvent {
                    agent_id: Some(agent_id),
                    resource_type: Some(resource_type),
                    quantity: Some(quantity),
                    safety_result: Some(result.is_safe),
                    duration_us: Some(duration_us),
                    ..MonitorEvent::new(EventKind::ProbabilisticSafetyCheck, result.reason.clone())
                };

                if result.is_safe {
                    let level = commit_grant(&mut state, agent_id, resource_type, quantity);
                    (TryGrant::Granted(level), Some(event))
                } else {
                    (TryGrant::Unsafe, Some(event))
                }
            }
        };
        if let Some(event) = safety_event {
            self.emit(event);
        }
        outcome
    }

    /// One all-or-nothing batch attempt.
    fn try_grant_batch(
        &self,
        agent_id: AgentId,
        requests: &FastMap<ResourceTypeId, ResourceQuantity>,
    ) -> TryGrant {
        let (outcome, levels, safety_event) = {
            let mut state = self.state.write();
            if !state.agents.contains_key(&agent_id)
                || requests.keys().any(|rt| !state.resources.contains_key(rt))
            {
                (TryGrant::Gone, Vec::new(), None)
            } else if requests
                .iter()
                .any(|(rt, &qty)| state.resources[rt].available() < qty)
            {
                (TryGrant::Insufficient, Vec::new(), None)
            } else {
                let input = build_safety_input(&state);
                let batch: Vec<ResourceRequest> = requests
                    .iter()
                    .map(|(&rt, &qty)| ResourceRequest::new(agent_id, rt, qty))
                    .collect();
                let started = Instant::now();
                let result = self.safety.check_hypothetical_batch(&input, &batch);
                let duration_us = started.elapsed().as_secs_f64() * 1_000_000.0;

                let event = MonitorEvent {
                    agent_id: Some(agent_id),
                    safety_result: Some(result.is_safe),
                    duration_us: Some(duration_us),
                    ..MonitorEvent::new(EventKind::SafetyCheckPerformed, result.reason.clone())
                };

                if result.is_safe {
                    let levels = requests
                        .iter()
                        .map(|(&rt, &qty)| (rt, commit_grant(&mut state, agent_id, rt, qty)))
                        .collect();
                    (TryGrant::Granted(0), levels, Some(event))
                } else {
                    (TryGrant::Unsafe, Vec::new(), Some(event))
                }
            }
        };
        if let Some(event) = safety_event {
            self.emit(event);
        }
        for (rt, level) in levels {
            self.estimator.record_allocation_level(agent_id, rt, level);
        }
        outcome
    }

    fn release_all_resources(&self, agent_id: AgentId) {
        let released = {
            let mut state = self.state.write();
            let state = &mut *state;
            let Some(agent) = state.agents.get_mut(&agent_id) else {
                return;
            };
            let held: Vec<(ResourceTypeId, ResourceQuantity)> = agent
                .current_allocation()
                .iter()
                .map(|(&rt, &qty)| (rt, qty))
                .collect();
            for &(rt, qty) in &held {
                agent.deallocate(rt, qty);
            }
            for &(rt, qty) in &held {
                if let Some(resource) = state.resources.get_mut(&rt) {
                    resource.deallocate(qty);
                }
            }
            held
        };

        for (rt, _) in &released {
            self.estimator.record_allocation_level(agent_id, *rt, 0);
        }
        self.emit(MonitorEvent {
            agent_id: Some(agent_id),
            ..MonitorEvent::new(EventKind::ResourcesReleased, "all resources released")
        });
        self.release.notify();
    }

    fn get_snapshot(&self) -> SystemSnapshot {
        let state = self.state.read();
        let mut snapshot = SystemSnapshot {
            timestamp: Instant::now(),
            total_resources: StableMap::new(),
            available_resources: StableMap::new(),
            agents: Vec::with_capacity(state.agents.len()),
            pending_requests: self.queue.size(),
            is_safe: true,
        };

        for (&id, resource) in &state.resources {
            snapshot.total_resources.insert(id, resource.total_capacity());
            snapshot.available_resources.insert(id, resource.available());
        }

        for (&id, agent) in &state.agents {
            snapshot.agents.push(AgentAllocationSnapshot {
                agent_id: id,
                name: agent.name().to_string(),
                priority: agent.priority(),
                state: agent.state(),
                allocation: agent.current_allocation().iter().map(|(&k, &v)| (k, v)).collect(),
                max_claim: agent.max_needs().iter().map(|(&k, &v)| (k, v)).collect(),
            });
        }
        snapshot.agents.sort_by_key(|a| a.agent_id);

        let input = build_safety_input(&state);
        snapshot.is_safe = self.safety.check_safety(&input).is_safe;
        snapshot
    }

    /// Max-need map per demand mode: declared (Static), estimated
    /// (Adaptive), or the elementwise minimum (Hybrid); always lifted to at
    /// least the current allocation so remaining needs stay non-negative.
    fn build_adaptive_safety_input(&self, state: &CoreState, confidence: f64) -> SafetyCheckInput {
        let mut input = SafetyCheckInput::default();
        for (&id, resource) in &state.resources {
            input.total.insert(id, resource.total_capacity());
            input.available.insert(id, resource.available());
        }

        let estimated = self.estimator.estimate_all_max_needs(confidence);

        for (&id, agent) in &state.agents {
            let allocation: StableMap<ResourceTypeId, ResourceQuantity> =
                agent.current_allocation().iter().map(|(&k, &v)| (k, v)).collect();

            let mut max_need: StableMap<ResourceTypeId, ResourceQuantity> =
                match self.estimator.get_agent_demand_mode(id) {
                    DemandMode::Static => {
                        agent.max_needs().iter().map(|(&k, &v)| (k, v)).collect()
                    }
                    DemandMode::Adaptive => estimated
                        .get(&id)
                        .map(|m| m.iter().map(|(&k, &v)| (k, v)).collect())
                        .unwrap_or_default(),
                    DemandMode::Hybrid => {
                        let mut max: StableMap<ResourceTypeId, ResourceQuantity> =
                            agent.max_needs().iter().map(|(&k, &v)| (k, v)).collect();
                        if let Some(estimates) = estimated.get(&id) {
                            for (&rt, &est) in estimates {
                                let capped = match agent.max_needs().get(&rt) {
                                    Some(&declared) => est.min(declared),
                                    None => est,
                                };
                                max.insert(rt, capped);
                            }
                        }
                        max
                    }
                };

            // The Banker's Algorithm requires remaining_need >= 0.
            for (&rt, &held) in &allocation {
                let entry = max_need.entry(rt).or_insert(0);
                if *entry < held {
                    *entry = held;
                }
            }

            input.allocation.insert(id, allocation);
            input.max_need.insert(id, max_need);
        }
        input
    }

    // ==================== Background processor ====================

    fn process_queue_loop(&self) {
        tracing::debug!("request processor started");
        let mut last_snapshot = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            self.try_grant_pending_requests();

            if self.config.enable_timeout_expiration {
                let expired = self.queue.expire_timed_out();
                for request_id in &expired {
                    self.emit(MonitorEvent {
                        request_id: Some(*request_id),
                        ..MonitorEvent::new(EventKind::RequestTimedOut, "queued request timed out")
                    });
                }
                if !expired.is_empty() {
                    self.emit_queue_size();
                }
            }

            if last_snapshot.elapsed() >= self.config.snapshot_interval {
                last_snapshot = Instant::now();
                let monitor = self.monitor.read().clone();
                if let Some(monitor) = monitor {
                    monitor.on_snapshot(&self.get_snapshot());
                }
            }

            self.release.wait(self.config.processor_poll_interval);
        }
        tracing::debug!("request processor stopped");
    }

    /// One pass over the queue in policy order. The policy's output is
    /// advisory: the safety check may veto any candidate, which then simply
    /// stays queued for the next pass.
    fn try_grant_pending_requests(&self) {
        let pending = self.queue.get_all_pending();
        if pending.is_empty() {
            return;
        }

        let snapshot = self.get_snapshot();
        let ordered = self.policy.lock().prioritize(&pending, &snapshot);

        for request in ordered {
            let gone = {
                let state = self.state.read();
                !state.resources.contains_key(&request.resource_type)
                    || !state.agents.contains_key(&request.agent_id)
            };
            if gone {
                if self.queue.cancel(request.id) {
                    self.emit(MonitorEvent {
                        agent_id: Some(request.agent_id),
                        request_id: Some(request.id),
                        ..MonitorEvent::new(
                            EventKind::RequestCancelled,
                            "request cancelled: agent or resource gone",
                        )
                    });
                    self.emit_queue_size();
                }
                continue;
            }

            let attempt = self.try_grant_single(
                request.agent_id,
                request.resource_type,
                request.quantity,
                Some(request.id),
            );
            let TryGrant::Granted(level) = attempt else {
                continue;
            };

            match self.queue.remove(request.id) {
                Some(removed) => {
                    self.estimator.record_allocation_level(
                        request.agent_id,
                        request.resource_type,
                        level,
                    );
                    if let Some(callback) = &removed.callback {
                        callback(removed.id, RequestStatus::Granted);
                    }
                    self.emit(MonitorEvent {
                        agent_id: Some(request.agent_id),
                        resource_type: Some(request.resource_type),
                        request_id: Some(request.id),
                        quantity: Some(request.quantity),
                        ..MonitorEvent::new(EventKind::RequestGranted, "queued request granted")
                    });
                    self.emit_queue_size();
                }
                None => {
                    // Cancelled between the grant and the removal; its
                    // callback already fired, so undo the commit.
                    {
                        let mut state = self.state.write();
                        let state = &mut *state;
                        if let Some(agent) = state.agents.get_mut(&request.agent_id) {
                            agent.deallocate(request.resource_type, request.quantity);
                        }
                        if let Some(resource) = state.resources.get_mut(&request.resource_type) {
                            resource.deallocate(request.quantity);
                        }
                    }
                    self.release.notify();
                }
            }
        }
    }
}

fn commit_grant(
    state: &mut CoreState,
    agent_id: AgentId,
    resource_type: ResourceTypeId,
    quantity: ResourceQuantity,
) -> ResourceQuantity {
    if let Some(resource) = state.resources.get_mut(&resource_type) {
        resource.allocate(quantity);
    }
    match state.agents.get_mut(&agent_id) {
        Some(agent) => {
            agent.allocate(resource_type, quantity);
            agent.allocation_of(resource_type)
        }
        None => 0,
    }
}

fn build_safety_input(state: &CoreState) -> SafetyCheckInput {
    let mut input = SafetyCheckInput::default();
    for (&id, resource) in &state.resources {
        input.total.insert(id, resource.total_capacity());
        input.available.insert(id, resource.available());
    }
    for (&id, agent) in &state.agents {
        input.allocation.insert(
            id,
            agent.current_allocation().iter().map(|(&k, &v)| (k, v)).collect(),
        );
        input.max_need.insert(
            id,
            agent.max_needs().iter().map(|(&k, &v)| (k, v)).collect(),
        );
    }
    input
}
