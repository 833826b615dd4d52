use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::GuardError;
use crate::types::{AgentId, RequestCallback, RequestId, RequestStatus, ResourceRequest, ResourceTypeId};

#[derive(Debug, Default)]
struct QueueInner {
    requests: Vec<ResourceRequest>,
    next_request_id: RequestId,
}

impl QueueInner {
    /// Higher priority first; FIFO by submission time within a band.
    fn sort(&mut self) {
        self.requests.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at.cmp(&b.submitted_at))
        });
    }
}

/// Bounded priority+FIFO buffer of pending requests.
///
/// Queue sizes are small relative to grant costs, so every mutation simply
/// re-sorts the backing vector. Callbacks fire after the internal lock is
/// dropped.
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
    max_queue_size: usize,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("len", &self.size())
            .field("max_queue_size", &self.max_queue_size)
            .finish()
    }
}

impl RequestQueue {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                requests: Vec::new(),
                next_request_id: 1,
            }),
            cv: Condvar::new(),
            max_queue_size,
        }
    }

    /// Assigns the request id and submission time, then inserts in order.
    pub fn enqueue(&self, mut request: ResourceRequest) -> Result<RequestId, GuardError> {
        let id = {
            let mut inner = self.inner.lock();
            if inner.requests.len() >= self.max_queue_size {
                return Err(GuardError::QueueFull {
                    capacity: self.max_queue_size,
                });
            }
            let id = inner.next_request_id;
            inner.next_request_id += 1;
            request.id = id;
            request.submitted_at = Instant::now();
            inner.requests.push(request);
            inner.sort();
            id
        };
        self.cv.notify_one();
        Ok(id)
    }

    /// Removes and returns the current head.
    pub fn dequeue(&self) -> Option<ResourceRequest> {
        let mut inner = self.inner.lock();
        if inner.requests.is_empty() {
            return None;
        }
        Some(inner.requests.remove(0))
    }

    pub fn peek(&self) -> Option<ResourceRequest> {
        self.inner.lock().requests.first().cloned()
    }

    /// Removes a request and fires its callback with `Cancelled`.
    ///
    /// Returns false when the id is unknown.
    pub fn cancel(&self, id: RequestId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.requests.iter().position(|r| r.id == id) {
                Some(index) => Some(inner.requests.remove(index)),
                None => None,
            }
        };
        match removed {
            Some(request) => {
                fire(&request.callback, request.id, RequestStatus::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Removes a request without firing its callback.
    ///
    /// Used by the grant path, which fires the callback itself with the
    /// terminal status; keeps every callback at exactly one invocation.
    pub(crate) fn remove(&self, id: RequestId) -> Option<ResourceRequest> {
        let mut inner = self.inner.lock();
        let index = inner.requests.iter().position(|r| r.id == id)?;
        Some(inner.requests.remove(index))
    }

    /// Cancels every request owned by an agent; fires each callback with
    /// `Cancelled`. Returns the removed request ids.
    pub fn cancel_all_for_agent(&self, agent_id: AgentId) -> Vec<RequestId> {
        let removed: Vec<ResourceRequest> = {
            let mut inner = self.inner.lock();
            let mut kept = Vec::with_capacity(inner.requests.len());
            let mut removed = Vec::new();
            for request in inner.requests.drain(..) {
                if request.agent_id == agent_id {
                    removed.push(request);
                } else {
                    kept.push(request);
                }
            }
            inner.requests = kept;
            removed
        };
        removed
            .into_iter()
            .map(|request| {
                fire(&request.callback, request.id, RequestStatus::Cancelled);
                request.id
            })
            .collect()
    }

    pub fn get_all_pending(&self) -> Vec<ResourceRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn get_pending_for_resource(&self, resource_type: ResourceTypeId) -> Vec<ResourceRequest> {
        self.inner
            .lock()
            .requests
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .cloned()
            .collect()
    }

    /// Removes every request whose deadline has passed and fires each
    /// callback with `TimedOut`. Returns the removed ids.
    pub fn expire_timed_out(&self) -> Vec<RequestId> {
        let now = Instant::now();
        let expired: Vec<ResourceRequest> = {
            let mut inner = self.inner.lock();
            let mut kept = Vec::with_capacity(inner.requests.len());
            let mut expired = Vec::new();
            for request in inner.requests.drain(..) {
                match request.deadline() {
                    Some(deadline) if deadline <= now => expired.push(request),
                    _ => kept.push(request),
                }
            }
            inner.requests = kept;
            expired
        };
        expired
            .into_iter()
            .map(|request| {
                fire(&request.callback, request.id, RequestStatus::TimedOut);
                request.id
            })
            .collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().requests.is_empty()
    }

    pub fn full(&self) -> bool {
        self.inner.lock().requests.len() >= self.max_queue_size
    }

    pub fn max_size(&self) -> usize {
        self.max_queue_size
    }

    /// Blocks until a request is available or the timeout elapses.
    pub fn wait_and_dequeue(&self, timeout: Duration) -> Option<ResourceRequest> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.requests.is_empty() {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            self.cv.wait_for(&mut inner, remaining);
        }
        Some(inner.requests.remove(0))
    }

    /// Wakes every waiter blocked in [`wait_and_dequeue`](Self::wait_and_dequeue).
    pub fn notify(&self) {
        self.cv.notify_all();
    }
}

fn fire(callback: &Option<RequestCallback>, id: RequestId, status: RequestStatus) {
    if let Some(cb) = callback {
        cb(id, status);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::types::Priority;

    fn request(agent: AgentId, priority: Priority) -> ResourceRequest {
        let mut req = ResourceRequest::new(agent, 1, 1);
        req.priority = priority;
        req
    }

    #[test]
    fn enqueue_assigns_monotonic_ids() {
        let queue = RequestQueue::new(8);
        let a = queue.enqueue(request(1, Priority::NORMAL)).unwrap();
        let b = queue.enqueue(request(2, Priority::NORMAL)).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn full_queue_rejects_enqueue() {
        let queue = RequestQueue::new(1);
        queue.enqueue(request(1, Priority::NORMAL)).unwrap();
        let result = queue.enqueue(request(2, Priority::NORMAL));
        assert!(matches!(result, Err(GuardError::QueueFull { capacity: 1 })));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn ordering_is_priority_then_fifo() {
        let queue = RequestQueue::new(8);
        queue.enqueue(request(1, Priority::LOW)).unwrap();
        queue.enqueue(request(2, Priority::HIGH)).unwrap();
        queue.enqueue(request(3, Priority::HIGH)).unwrap();
        queue.enqueue(request(4, Priority::CRITICAL)).unwrap();

        let order: Vec<AgentId> = std::iter::from_fn(|| queue.dequeue())
            .map(|r| r.agent_id)
            .collect();
        assert_eq!(order, vec![4, 2, 3, 1]);
    }

    #[test]
    fn cancel_fires_callback_once_outside_lock() {
        let queue = Arc::new(RequestQueue::new(8));
        let statuses = Arc::new(PlMutex::new(Vec::new()));

        let mut req = request(1, Priority::NORMAL);
        let sink = Arc::clone(&statuses);
        let queue_ref = Arc::clone(&queue);
        req.callback = Some(Arc::new(move |id, status| {
            // Re-entering the queue from the callback must not deadlock.
            let _ = queue_ref.size();
            sink.lock().push((id, status));
        }));
        let id = queue.enqueue(req).unwrap();

        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert_eq!(*statuses.lock(), vec![(id, RequestStatus::Cancelled)]);
    }

    #[test]
    fn cancel_all_for_agent_only_touches_that_agent() {
        let queue = RequestQueue::new(8);
        let fired = Arc::new(AtomicUsize::new(0));

        for agent in [1, 2, 1] {
            let mut req = request(agent, Priority::NORMAL);
            let counter = Arc::clone(&fired);
            req.callback = Some(Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            queue.enqueue(req).unwrap();
        }

        let removed = queue.cancel_all_for_agent(1);
        assert_eq!(removed.len(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.peek().unwrap().agent_id, 2);
    }

    #[test]
    fn expire_removes_only_deadline_holders() {
        let queue = RequestQueue::new(8);
        let mut expiring = request(1, Priority::NORMAL);
        expiring.timeout = Some(Duration::ZERO);
        queue.enqueue(expiring).unwrap();
        queue.enqueue(request(2, Priority::NORMAL)).unwrap();

        let expired = queue.expire_timed_out();
        assert_eq!(expired.len(), 1);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.peek().unwrap().agent_id, 2);
    }

    #[test]
    fn remove_does_not_fire_callback() {
        let queue = RequestQueue::new(8);
        let fired = Arc::new(AtomicUsize::new(0));
        let mut req = request(1, Priority::NORMAL);
        let counter = Arc::clone(&fired);
        req.callback = Some(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let id = queue.enqueue(req).unwrap();

        let removed = queue.remove(id).unwrap();
        assert_eq!(removed.id, id);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(queue.remove(id).is_none());
    }

    #[test]
    fn wait_and_dequeue_times_out_when_empty() {
        let queue = RequestQueue::new(8);
        let result = queue.wait_and_dequeue(Duration::from_millis(20));
        assert!(result.is_none());
    }

    #[test]
    fn wait_and_dequeue_picks_up_concurrent_enqueue() {
        let queue = Arc::new(RequestQueue::new(8));
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.enqueue(request(7, Priority::NORMAL)).unwrap();
            })
        };
        let received = queue.wait_and_dequeue(Duration::from_secs(2));
        producer.join().unwrap();
        assert_eq!(received.unwrap().agent_id, 7);
    }
}
