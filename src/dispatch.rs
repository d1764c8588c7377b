//! Command dispatch: resolve a kind's handlers and run them in order.

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::command::{Command, CommandKind};
use crate::handler::HandlerRegistry;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handlers registered for command {0}")]
    UnregisteredCommand(CommandKind),

    /// The first handler error, passed through untouched.
    #[error(transparent)]
    Handler(anyhow::Error),
}

impl DispatchError {
    /// Short label for metrics and log fields.
    pub fn class(&self) -> &'static str {
        match self {
            Self::UnregisteredCommand(_) => "unregistered",
            Self::Handler(_) => "handler",
        }
    }
}

/// Routes commands to the handlers registered for their kind.
///
/// Handlers run one after another in registration order. The first
/// failure stops the chain: later handlers are skipped and the error is
/// returned as-is, so a multi-handler command behaves as one pipeline
/// rather than an independent fan-out.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    registry: Arc<HandlerRegistry>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, command: &Command) -> Result<(), DispatchError> {
        let kind = command.kind();
        let handlers = self.registry.handlers_for(kind);
        if handlers.is_empty() {
            return Err(DispatchError::UnregisteredCommand(kind));
        }

        info!(
            command.kind = %kind,
            handlers = handlers.len(),
            "dispatching command"
        );
        metrics::commands_dispatched().add(1, &[KeyValue::new("kind", kind.tag())]);

        for handler in handlers {
            handler.handle(command).await.map_err(DispatchError::Handler)?;
        }
        Ok(())
    }
}
