//! pgmq-backed transport via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read_with_poll,
//! pgmq.archive, pgmq.set_vt. A read leases the message for the visibility
//! timeout. Acknowledge archives it (kept for audit); reject makes it
//! visible again immediately so another read redelivers it.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    Delivery, Feed, FlowControl, Message, Settle, Subscription, Transport, TransportError,
};
use crate::telemetry::metrics;

/// Lease and polling parameters.
#[derive(Debug, Clone)]
pub struct PgmqOptions {
    /// Seconds a read message stays invisible to other readers.
    pub visibility_timeout_secs: i32,
    /// Longest a single read waits server-side for a message.
    pub max_poll_secs: i32,
    /// How often pgmq re-checks the queue during a polling read.
    pub poll_interval: Duration,
}

impl Default for PgmqOptions {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 30,
            max_poll_secs: 5,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

/// Transport over a single pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqTransport {
    pool: PgPool,
    queue: String,
    options: PgmqOptions,
    shutdown: CancellationToken,
}

impl PgmqTransport {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(
        url: &str,
        queue: impl Into<String>,
        options: PgmqOptions,
    ) -> Result<Self, TransportError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool, queue, options))
    }

    pub fn from_pool(pool: PgPool, queue: impl Into<String>, options: PgmqOptions) -> Self {
        Self {
            pool,
            queue: queue.into(),
            options,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Simple health check: `SELECT 1`.
    pub async fn health_check(&self) -> Result<(), TransportError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create the queue (idempotent).
    pub async fn create_queue(&self) -> Result<(), TransportError> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(&self.queue)
            .execute(&self.pool)
            .await?;
        record_operation(&self.queue, "create");
        Ok(())
    }

    /// Send a message to the queue. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    pub async fn send(
        &self,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64, TransportError> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(&self.queue)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        record_operation(&self.queue, "send");
        Ok(row.0)
    }

    /// Read at most one message, waiting up to `max_poll_secs` for one to
    /// arrive. Returns None if the queue stayed empty.
    pub async fn read(&self) -> Result<Option<PgmqMessage>, TransportError> {
        let poll_ms = i32::try_from(self.options.poll_interval.as_millis()).unwrap_or(i32::MAX);
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read_with_poll($1, $2, 1, $3, $4)",
        )
        .bind(&self.queue)
        .bind(self.options.visibility_timeout_secs)
        .bind(self.options.max_poll_secs)
        .bind(poll_ms)
        .fetch_optional(&self.pool)
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });
        record_operation(
            &self.queue,
            if msg.is_some() { "read" } else { "read_empty" },
        );
        Ok(msg)
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
            // Abandoning a read mid-flight is safe: anything it leased
            // comes back when the visibility timeout expires.
            let read = tokio::select! {
                _ = feed.cancel.cancelled() => break,
                read = self.read() => read,
            };

            match read {
                Ok(Some(msg)) => {
                    let payload = match serde_json::to_vec(&msg.message) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            slot.send(Err(TransportError::Other(format!(
                                "cannot re-encode message {}: {e}",
                                msg.msg_id
                            ))));
                            break;
                        }
                    };
                    let message = Message::new(msg.msg_id.to_string(), payload)
                        .with_attempt(u32::try_from(msg.read_ct).unwrap_or(1).max(1))
                        .with_enqueued_at(msg.enqueued_at);
                    let settle = PgmqSettle {
                        pool: self.pool.clone(),
                        queue: self.queue.clone(),
                        msg_id: msg.msg_id,
                    };
                    slot.send(Ok(Delivery::new(message, Box::new(settle), credit)));
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "pgmq read failed");
                    slot.send(Err(e));
                    break;
                }
            }
        }
        debug!(queue = %self.queue, "pgmq feeder stopped");
    }
}

#[async_trait]
impl Transport for PgmqTransport {
    async fn subscribe(&self, max_in_flight: usize) -> Result<Subscription, TransportError> {
        if self.pool.is_closed() {
            return Err(TransportError::Closed);
        }
        self.health_check().await?;
        let (feed, subscription) = Subscription::channel(self.shutdown.child_token());
        let flow = FlowControl::new(max_in_flight);
        tokio::spawn(self.clone().run_feeder(feed, flow));
        Ok(subscription)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        self.pool.close().await;
        Ok(())
    }
}

struct PgmqSettle {
    pool: PgPool,
    queue: String,
    msg_id: i64,
}

#[async_trait]
impl Settle for PgmqSettle {
    async fn acknowledge(self: Box<Self>) -> Result<(), TransportError> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(&self.queue)
            .bind(self.msg_id)
            .execute(&self.pool)
            .await?;
        record_operation(&self.queue, "archive");
        Ok(())
    }

    async fn reject(self: Box<Self>, reason: &str) -> Result<(), TransportError> {
        debug!(msg_id = self.msg_id, reason, "returning message to queue");
        sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, 0)")
            .bind(&self.queue)
            .bind(self.msg_id)
            .execute(&self.pool)
            .await?;
        record_operation(&self.queue, "set_vt");
        Ok(())
    }
}

fn record_operation(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}
