//! In-process queue broker.
//!
//! Backs the node host, the CLI harness, and the test suite. The broker
//! honors the same contract a hosted queue service would: deliveries stay
//! in flight until acked and reappear after the visibility timeout, and a
//! queue can be administratively blocked to simulate an unreachable peer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::{Delivery, DeliveryToken, QueueTransport, TransportError};

const DEFAULT_VISIBILITY: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Stored {
    id: u64,
    body: Vec<u8>,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<Stored>,
    in_flight: HashMap<u64, (Stored, Instant)>,
}

struct QueueState {
    inner: Mutex<QueueInner>,
    notify: Notify,
    blocked: AtomicBool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            blocked: AtomicBool::new(false),
        }
    }
}

/// Shared in-memory broker with one named queue per node.
///
/// Queues are created on first use. Cloning the broker handle is cheap; all
/// clones observe the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    queues: Arc<DashMap<String, Arc<QueueState>>>,
    next_id: Arc<AtomicU64>,
    visibility: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_visibility(DEFAULT_VISIBILITY)
    }

    /// Broker whose unacked deliveries reappear after `visibility`.
    pub fn with_visibility(visibility: Duration) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            visibility,
        }
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::new()))
            .clone()
    }

    /// Simulate an unreachable node: enqueues to `name` fail with a
    /// transient error until [`unblock`](Self::unblock) is called.
    pub fn block(&self, name: &str) {
        self.queue(name).blocked.store(true, Ordering::SeqCst);
        debug!(queue = name, "queue blocked");
    }

    pub fn unblock(&self, name: &str) {
        self.queue(name).blocked.store(false, Ordering::SeqCst);
        debug!(queue = name, "queue unblocked");
    }

    /// Ready (not in-flight) message count, for harness assertions.
    pub fn depth(&self, name: &str) -> usize {
        self.queue(name).inner.lock().ready.len()
    }

    /// Move in-flight deliveries whose visibility expired back to ready.
    fn reclaim(inner: &mut QueueInner, now: Instant, queue: &str) {
        let expired: Vec<u64> = inner
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if !expired.is_empty() {
            warn!(queue, count = expired.len(), "redelivering unacked messages");
        }
        for id in expired {
            if let Some((stored, _)) = inner.in_flight.remove(&id) {
                inner.ready.push_back(stored);
            }
        }
    }

    /// Earliest instant at which an in-flight delivery becomes ready again.
    fn next_expiry(inner: &QueueInner) -> Option<Instant> {
        inner.in_flight.values().map(|(_, deadline)| *deadline).min()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl QueueTransport for InMemoryBroker {
    async fn enqueue(&self, queue: &str, body: Vec<u8>) -> Result<(), TransportError> {
        let state = self.queue(queue);
        if state.blocked.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(format!(
                "queue {queue} is unreachable"
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.inner.lock().ready.push_back(Stored { id, body });
        state.notify.notify_one();
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let state = self.queue(queue);
        let deadline = Instant::now() + wait;

        loop {
            let notified = state.notify.notified();
            let next_expiry;
            {
                let mut inner = state.inner.lock();
                let now = Instant::now();
                Self::reclaim(&mut inner, now, queue);

                if !inner.ready.is_empty() {
                    let mut batch = Vec::with_capacity(max.min(inner.ready.len()));
                    while batch.len() < max {
                        let Some(stored) = inner.ready.pop_front() else {
                            break;
                        };
                        let token = DeliveryToken {
                            queue: queue.to_string(),
                            id: stored.id,
                        };
                        batch.push(Delivery {
                            token,
                            body: stored.body.clone(),
                        });
                        inner
                            .in_flight
                            .insert(stored.id, (stored, now + self.visibility));
                    }
                    return Ok(batch);
                }
                next_expiry = Self::next_expiry(&inner);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = match next_expiry {
                Some(expiry) => deadline.min(expiry),
                None => deadline,
            };
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, token: &DeliveryToken) -> Result<(), TransportError> {
        if let Some(state) = self.queues.get(&token.queue) {
            state.inner.lock().in_flight.remove(&token.id);
        }
        Ok(())
    }
}
