//! Ingestion loop: pull deliveries, process each on its own task, settle.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, error, info, warn};

use super::pipeline::{Outcome, Pipeline, ProcessError};
use crate::telemetry::delivery::{record_command_kind, record_disposition, start_delivery_span};
use crate::telemetry::metrics;
use crate::transport::{Delivery, Subscription, TransportError};

/// Why the loop stopped taking deliveries.
#[derive(Debug)]
pub enum LoopExit {
    /// Shutdown was requested.
    Cancelled,
    /// The transport closed its delivery stream.
    TransportEnded,
    /// The transport failed and cannot continue.
    TransportFailed(TransportError),
}

/// Dispositions issued so far.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub(crate) acknowledged: AtomicU64,
    pub(crate) rejected: AtomicU64,
}

/// Runs deliveries through the pipeline with at most `max_messages`
/// being processed at once.
///
/// A delivery's failure is logged and turned into a reject; it never
/// stops the loop. Only cancellation or the transport ends it.
pub struct IngestionLoop {
    pipeline: Arc<Pipeline>,
    workers: Arc<Semaphore>,
    max_messages: usize,
    in_flight: JoinSet<()>,
    tally: Arc<Tally>,
}

impl IngestionLoop {
    pub fn new(pipeline: Arc<Pipeline>, max_messages: usize) -> Self {
        Self {
            pipeline,
            workers: Arc::new(Semaphore::new(max_messages)),
            max_messages,
            in_flight: JoinSet::new(),
            tally: Arc::new(Tally::default()),
        }
    }

    /// Deliveries currently being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn acknowledged(&self) -> u64 {
        self.tally.acknowledged.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.tally.rejected.load(Ordering::Relaxed)
    }

    /// Take deliveries from `subscription` until `cancel` fires or the
    /// transport stops. In-flight work keeps running after this returns;
    /// call [`drain_until`](Self::drain_until) to wait for it.
    pub async fn run(
        &mut self,
        subscription: &mut Subscription,
        cancel: &CancellationToken,
    ) -> LoopExit {
        info!(max_messages = self.max_messages, "ingestion loop started");

        let exit = loop {
            let worker = tokio::select! {
                biased;
                _ = cancel.cancelled() => break LoopExit::Cancelled,
                worker = Arc::clone(&self.workers).acquire_owned() => match worker {
                    Ok(worker) => worker,
                    Err(_) => break LoopExit::Cancelled,
                },
            };
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break LoopExit::Cancelled,
                next = subscription.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let pipeline = Arc::clone(&self.pipeline);
                    let tally = Arc::clone(&self.tally);
                    self.in_flight.spawn(async move {
                        process_delivery(pipeline, delivery, tally).await;
                        drop(worker);
                    });
                }
                Some(Err(e)) => {
                    error!(error = %e, "transport failed, stopping intake");
                    break LoopExit::TransportFailed(e);
                }
                None => {
                    warn!("transport stopped delivering");
                    break LoopExit::TransportEnded;
                }
            }

            self.reap();
        };

        info!(?exit, in_flight = self.in_flight.len(), "ingestion loop stopped");
        exit
    }

    /// Reject a delivery that was leased but never processed.
    pub fn reject_unprocessed(
        &self,
        delivery: Delivery,
    ) -> impl Future<Output = ()> + Send + 'static {
        let tally = Arc::clone(&self.tally);
        async move {
            let id = delivery.id().to_string();
            match delivery.reject("worker is shutting down").await {
                Ok(()) => debug!(delivery.id = %id, "returned unprocessed delivery"),
                Err(e) => warn!(
                    delivery.id = %id,
                    error = %e,
                    "reject failed; lease expiry will redeliver"
                ),
            }
            tally.rejected.fetch_add(1, Ordering::Relaxed);
            record_settled("rejected");
        }
    }

    /// Wait for in-flight deliveries to settle, until `deadline`.
    ///
    /// Returns how many were still running at the deadline; those are
    /// aborted, handlers included, and left for the queue to redeliver
    /// once their lease expires.
    pub async fn drain_until(&mut self, deadline: tokio::time::Instant) -> usize {
        let pending = self.in_flight.len();
        if pending > 0 {
            info!(pending, "draining in-flight deliveries");
        }

        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = self.in_flight.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "delivery task failed");
                }
            }
        })
        .await;

        if drained.is_ok() {
            return 0;
        }
        let abandoned = self.in_flight.len();
        warn!(abandoned, "drain timeout elapsed, abandoning in-flight deliveries");
        self.in_flight.abort_all();
        while self.in_flight.join_next().await.is_some() {}
        abandoned
    }

    fn reap(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "delivery task failed");
            }
        }
    }
}

/// Run one delivery through the pipeline and settle it exactly once.
async fn process_delivery(pipeline: Arc<Pipeline>, delivery: Delivery, tally: Arc<Tally>) {
    let (message, ticket) = delivery.into_parts();
    let message = Arc::new(message);
    let span = start_delivery_span(message.id(), message.attempt());

    async move {
        let started = Instant::now();

        // Run on a separate task so a panicking handler still leaves us
        // holding the ticket. The handle aborts that task if this one is
        // aborted at the drain deadline.
        let outcome = {
            let pipeline = Arc::clone(&pipeline);
            let message = Arc::clone(&message);
            AbortOnDropHandle::new(tokio::spawn(
                async move { pipeline.process(&message).await }.in_current_span(),
            ))
            .await
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(ProcessError::Panicked(e.to_string())),
        };

        metrics::processing_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new(
                "result",
                if matches!(outcome, Outcome::Processed(_)) { "processed" } else { "failed" },
            )],
        );

        match outcome {
            Outcome::Processed(kind) => {
                record_command_kind(&tracing::Span::current(), kind);
                match ticket.acknowledge().await {
                    Ok(()) => debug!(delivery.id = message.id(), "acknowledged"),
                    Err(e) => warn!(
                        delivery.id = message.id(),
                        command.kind = %kind,
                        error = %e,
                        "acknowledge failed; message may be redelivered"
                    ),
                }
                tally.acknowledged.fetch_add(1, Ordering::Relaxed);
                record_disposition(&tracing::Span::current(), "acknowledged");
                record_settled("acknowledged");
            }
            Outcome::Failed(err) => {
                let kind = err.kind().map(|k| k.tag()).unwrap_or("-");
                error!(
                    delivery.id = message.id(),
                    delivery.attempt = message.attempt(),
                    command.kind = kind,
                    error.class = err.class(),
                    error = %err,
                    "delivery failed"
                );
                metrics::command_failures().add(1, &[KeyValue::new("class", err.class())]);
                if let Err(e) = ticket.reject(&err.to_string()).await {
                    warn!(
                        delivery.id = message.id(),
                        error = %e,
                        "reject failed; lease expiry will redeliver"
                    );
                }
                tally.rejected.fetch_add(1, Ordering::Relaxed);
                record_disposition(&tracing::Span::current(), "rejected");
                record_settled("rejected");
            }
        }
    }
    .instrument(span)
    .await
}

fn record_settled(disposition: &'static str) {
    metrics::deliveries_settled().add(1, &[KeyValue::new("disposition", disposition)]);
}
