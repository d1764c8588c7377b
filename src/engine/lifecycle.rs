//! Worker lifecycle: `Idle -> Running -> Draining -> Stopped`.
//!
//! [`Worker::run`] consumes the worker, so a stopped worker cannot be
//! started again; build a new one for a new run.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ingest::{IngestionLoop, LoopExit};
use super::pipeline::Pipeline;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Where the worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Runtime knobs for a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on concurrently unresolved deliveries.
    pub max_messages: usize,
    /// How long shutdown waits for in-flight deliveries.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_messages: 100,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for WorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_messages: config.max_messages,
            drain_timeout: config.drain_timeout,
        }
    }
}

/// Requests a graceful stop. Cheap to clone; safe to call repeatedly.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub acknowledged: u64,
    pub rejected: u64,
    /// Deliveries still unsettled when the drain timeout elapsed.
    pub abandoned: usize,
}

impl RunReport {
    /// Deliveries that reached a disposition during the run.
    pub fn settled(&self) -> u64 {
        self.acknowledged + self.rejected
    }
}

/// Owns the transport and pipeline for one run of the worker.
pub struct Worker<T: Transport> {
    transport: T,
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    phase: watch::Sender<Phase>,
}

impl<T: Transport> Worker<T> {
    pub fn new(transport: T, pipeline: Pipeline, config: WorkerConfig) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            transport,
            pipeline: Arc::new(pipeline),
            config,
            shutdown: CancellationToken::new(),
            phase,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Observe phase changes, including after `run` has taken the worker.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Run until shutdown is requested or the transport fails, then drain
    /// and close the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if subscribing fails or the transport fails while
    /// running. In the latter case in-flight work is still drained first.
    pub async fn run(self) -> Result<RunReport> {
        if self.config.max_messages == 0 {
            return Err(Error::Config("max_messages must be positive".to_string()));
        }

        self.enter(Phase::Running);
        let mut subscription = match self.transport.subscribe(self.config.max_messages).await {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(close_err) = self.transport.close().await {
                    warn!(error = %close_err, "transport close failed");
                }
                self.enter(Phase::Stopped);
                return Err(e.into());
            }
        };

        let mut ingest = IngestionLoop::new(Arc::clone(&self.pipeline), self.config.max_messages);
        let exit = ingest.run(&mut subscription, &self.shutdown).await;

        self.enter(Phase::Draining);
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;

        match tokio::time::timeout_at(deadline, subscription.cancel()).await {
            Ok(leftover) => {
                for delivery in leftover {
                    ingest.reject_unprocessed(delivery).await;
                }
            }
            Err(_) => warn!("transport did not stop intake before the drain deadline"),
        }
        let abandoned = ingest.drain_until(deadline).await;

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "transport close failed");
        }
        self.enter(Phase::Stopped);

        let report = RunReport {
            acknowledged: ingest.acknowledged(),
            rejected: ingest.rejected(),
            abandoned,
        };
        info!(
            acknowledged = report.acknowledged,
            rejected = report.rejected,
            abandoned = report.abandoned,
            "worker stopped"
        );

        match exit {
            LoopExit::TransportFailed(e) => Err(e.into()),
            LoopExit::Cancelled | LoopExit::TransportEnded => Ok(report),
        }
    }

    fn enter(&self, phase: Phase) {
        let from = self.phase.send_replace(phase);
        info!(%from, to = %phase, "worker phase");
    }
}
