//! In-memory transport for tests and single-process runs.
//!
//! Messages live in a FIFO. Subscribing spawns a feeder task that
//! leases messages as flow-control credit allows. Every disposition is
//! recorded in an append-only log so callers can check what happened to
//! each message, and in what order relative to `close`.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    Delivery, Feed, FlowControl, Message, Settle, Subscription, Transport, TransportError,
};

/// Something that happened to the transport, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Leased { id: String, attempt: u32 },
    Acknowledged { id: String },
    Rejected { id: String, reason: String },
    Closed,
}

#[derive(Debug, Clone)]
struct Pending {
    id: String,
    payload: Vec<u8>,
    attempt: u32,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Pending>,
    next_id: u64,
    leased: usize,
    peak_leased: usize,
    events: Vec<TransportEvent>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    available: Notify,
    shutdown: CancellationToken,
    redeliver_rejected: bool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Thread-safe in-memory queue. Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put rejected messages back on the queue, as a real broker would.
    pub fn with_redelivery() -> Self {
        Self {
            inner: Arc::new(Inner {
                redeliver_rejected: true,
                ..Inner::default()
            }),
        }
    }

    /// Enqueue a raw payload. Returns the generated message id.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> String {
        let id = {
            let mut state = self.inner.lock();
            state.next_id += 1;
            let id = format!("msg-{}", state.next_id);
            state.queue.push_back(Pending {
                id: id.clone(),
                payload: payload.into(),
                attempt: 1,
            });
            id
        };
        self.inner.available.notify_one();
        id
    }

    /// Enqueue a JSON payload.
    pub fn publish_json(&self, value: &serde_json::Value) -> String {
        self.publish(value.to_string())
    }

    /// Ids acknowledged so far, in settlement order.
    pub fn acknowledged(&self) -> Vec<String> {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Acknowledged { id } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// `(id, reason)` for every rejection so far, in settlement order.
    pub fn rejected(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Rejected { id, reason } => Some((id.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.inner.lock().events.clone()
    }

    /// Messages waiting to be leased.
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Messages leased and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().leased
    }

    /// Highest number of simultaneously unsettled messages observed.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.lock().peak_leased
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Wait until a message is queued, then lease it.
    async fn lease(&self) -> Pending {
        loop {
            if let Some(pending) = self.take_front() {
                return pending;
            }
            self.inner.available.notified().await;
        }
    }

    fn take_front(&self) -> Option<Pending> {
        let mut state = self.inner.lock();
        let pending = state.queue.pop_front()?;
        state.leased += 1;
        state.peak_leased = state.peak_leased.max(state.leased);
        state.events.push(TransportEvent::Leased {
            id: pending.id.clone(),
            attempt: pending.attempt,
        });
        Some(pending)
    }

    async fn run_feeder(self, feed: Feed, flow: FlowControl) {
        loop {
            let credit = tokio::select! {
                _ = feed.cancel.cancelled() => break,
                credit = flow.acquire() => match credit {
                    Ok(credit) => credit,
                    Err(_) => break,
                },
            };
            let slot = tokio::select! {
                _ = feed.cancel.cancelled() => break,
                slot = feed.deliveries.reserve() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };
            let pending = tokio::select! {
                _ = feed.cancel.cancelled() => break,
                pending = self.lease() => pending,
            };

            let message = Message::new(pending.id.clone(), pending.payload.clone())
                .with_attempt(pending.attempt);
            let settle = MemorySettle {
                inner: Arc::clone(&self.inner),
                pending,
            };
            slot.send(Ok(Delivery::new(message, Box::new(settle), credit)));
        }
        debug!("in-memory feeder stopped");
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn subscribe(&self, max_in_flight: usize) -> Result<Subscription, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let (feed, subscription) = Subscription::channel(self.inner.shutdown.child_token());
        let flow = FlowControl::new(max_in_flight);
        tokio::spawn(self.clone().run_feeder(feed, flow));
        Ok(subscription)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.shutdown.cancel();
        let mut state = self.inner.lock();
        if !state.closed {
            state.closed = true;
            state.events.push(TransportEvent::Closed);
        }
        Ok(())
    }
}

struct MemorySettle {
    inner: Arc<Inner>,
    pending: Pending,
}

#[async_trait]
impl Settle for MemorySettle {
    async fn acknowledge(self: Box<Self>) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        state.leased -= 1;
        state.events.push(TransportEvent::Acknowledged {
            id: self.pending.id.clone(),
        });
        Ok(())
    }

    async fn reject(self: Box<Self>, reason: &str) -> Result<(), TransportError> {
        let redeliver = {
            let mut state = self.inner.lock();
            state.leased -= 1;
            state.events.push(TransportEvent::Rejected {
                id: self.pending.id.clone(),
                reason: reason.to_string(),
            });
            if self.inner.redeliver_rejected && !state.closed {
                let mut again = self.pending.clone();
                again.attempt += 1;
                state.queue.push_back(again);
                true
            } else {
                false
            }
        };
        if redeliver {
            self.inner.available.notify_one();
        }
        Ok(())
    }
}
