//! Handlers shipped with the worker.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use super::{Handler, HandlerRegistry, HandlerRegistryBuilder};
use crate::command::{CreateIncident, Echo, Ping};
use crate::telemetry::metrics;

/// Records a new incident.
#[derive(Debug, Default)]
pub struct CreateIncidentHandler;

#[async_trait]
impl Handler<CreateIncident> for CreateIncidentHandler {
    async fn handle(&self, command: &CreateIncident) -> anyhow::Result<()> {
        info!(description = command.description(), "incident created");
        metrics::incidents_created().add(1, &[]);
        Ok(())
    }
}

/// Answers liveness probes.
#[derive(Debug, Default)]
pub struct PingHandler;

#[async_trait]
impl Handler<Ping> for PingHandler {
    async fn handle(&self, _command: &Ping) -> anyhow::Result<()> {
        info!("pong");
        Ok(())
    }
}

/// Logs the payload it is given and counts how many it has seen.
#[derive(Debug, Default)]
pub struct EchoHandler {
    echoed: AtomicU64,
}

impl EchoHandler {
    /// Number of echo commands handled so far.
    pub fn echoed(&self) -> u64 {
        self.echoed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Handler<Echo> for EchoHandler {
    async fn handle(&self, command: &Echo) -> anyhow::Result<()> {
        let seen = self.echoed.fetch_add(1, Ordering::Relaxed) + 1;
        info!(payload = %command.payload(), seen, "echo");
        Ok(())
    }
}

/// Bind every built-in handler to its command.
pub fn register_builtin(builder: HandlerRegistryBuilder) -> HandlerRegistryBuilder {
    builder
        .register::<CreateIncident, _>(CreateIncidentHandler)
        .register::<Ping, _>(PingHandler)
        .register::<Echo, _>(EchoHandler::default())
}

/// Registry containing only the built-in handlers.
pub fn default_registry() -> HandlerRegistry {
    register_builtin(HandlerRegistry::builder()).build()
}
