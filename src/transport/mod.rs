//! The delivery interface the worker consumes.
//!
//! A [`Transport`] leases messages from a durable queue and hands them
//! over as [`Delivery`] values on a [`Subscription`]. Every delivery
//! carries a [`Ticket`] that must be settled exactly once, by
//! acknowledging or rejecting it. Settling consumes the ticket, so a
//! second disposition does not type-check.
//!
//! Flow control is credit based: a transport takes one [`Credit`] from
//! its [`FlowControl`] before leasing a message and the credit is
//! returned when the ticket settles. No more than `max_in_flight`
//! deliveries are ever unresolved.

pub mod memory;
pub mod pgmq;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

pub use memory::InMemoryTransport;
pub use pgmq::{PgmqOptions, PgmqTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("transport is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// A queue the worker can subscribe to.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start intake. The transport never has more than `max_in_flight`
    /// deliveries unresolved on the returned subscription.
    async fn subscribe(&self, max_in_flight: usize) -> Result<Subscription, TransportError>;

    /// Release connections and stop any background intake.
    async fn close(&self) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Message / Delivery
// ---------------------------------------------------------------------------

/// The readable part of a delivery.
#[derive(Debug, Clone)]
pub struct Message {
    id: String,
    payload: Vec<u8>,
    attempt: u32,
    enqueued_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            attempt: 1,
            enqueued_at: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = Some(at);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// How many times this message has been delivered, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.enqueued_at
    }
}

/// Transport-side settlement of one leased message.
#[async_trait]
pub trait Settle: Send + 'static {
    async fn acknowledge(self: Box<Self>) -> Result<(), TransportError>;
    async fn reject(self: Box<Self>, reason: &str) -> Result<(), TransportError>;
}

/// Obligation to settle a delivery. Holds the delivery's flow-control
/// credit until it is settled.
pub struct Ticket {
    settle: Box<dyn Settle>,
    _credit: Credit,
}

impl Ticket {
    pub async fn acknowledge(self) -> Result<(), TransportError> {
        self.settle.acknowledge().await
    }

    pub async fn reject(self, reason: &str) -> Result<(), TransportError> {
        self.settle.reject(reason).await
    }
}

/// One message under lease, pending acknowledge or reject.
pub struct Delivery {
    message: Message,
    ticket: Ticket,
}

impl Delivery {
    pub fn new(message: Message, settle: Box<dyn Settle>, credit: Credit) -> Self {
        Self {
            message,
            ticket: Ticket {
                settle,
                _credit: credit,
            },
        }
    }

    pub fn id(&self) -> &str {
        self.message.id()
    }

    pub fn payload(&self) -> &[u8] {
        self.message.payload()
    }

    pub fn attempt(&self) -> u32 {
        self.message.attempt()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_parts(self) -> (Message, Ticket) {
        (self.message, self.ticket)
    }

    pub async fn acknowledge(self) -> Result<(), TransportError> {
        self.ticket.acknowledge().await
    }

    pub async fn reject(self, reason: &str) -> Result<(), TransportError> {
        self.ticket.reject(reason).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Flow control
// ---------------------------------------------------------------------------

/// Credit pool bounding unresolved deliveries.
#[derive(Debug, Clone)]
pub struct FlowControl {
    permits: Arc<Semaphore>,
    limit: usize,
}

/// One unit of flow-control credit. Returned to the pool on drop.
#[derive(Debug)]
pub struct Credit {
    _permit: OwnedSemaphorePermit,
}

impl FlowControl {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a free credit.
    pub async fn acquire(&self) -> Result<Credit, TransportError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(Credit { _permit: permit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Deliveries currently holding credit.
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Stream of deliveries from one `subscribe` call.
pub struct Subscription {
    deliveries: mpsc::Receiver<Result<Delivery, TransportError>>,
    cancel: CancellationToken,
}

/// Producer half used by transports to feed a [`Subscription`].
pub struct Feed {
    pub deliveries: mpsc::Sender<Result<Delivery, TransportError>>,
    pub cancel: CancellationToken,
}

impl Subscription {
    /// Create a linked feed/subscription pair.
    ///
    /// The channel holds a single delivery so a transport only leases a
    /// message once a consumer is ready for it.
    pub fn channel(cancel: CancellationToken) -> (Feed, Subscription) {
        let (tx, rx) = mpsc::channel(1);
        (
            Feed {
                deliveries: tx,
                cancel: cancel.clone(),
            },
            Subscription {
                deliveries: rx,
                cancel,
            },
        )
    }

    /// Next delivery, or `None` once the transport stops feeding.
    pub async fn next(&mut self) -> Option<Result<Delivery, TransportError>> {
        self.deliveries.recv().await
    }

    /// Stop intake and wait for the transport to stop feeding.
    ///
    /// Returns deliveries that were leased but not yet taken; the caller
    /// still owes each of them a disposition.
    pub async fn cancel(&mut self) -> Vec<Delivery> {
        self.cancel.cancel();
        let mut leftover = Vec::new();
        while let Some(item) = self.deliveries.recv().await {
            if let Ok(delivery) = item {
                leftover.push(delivery);
            }
        }
        leftover
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
