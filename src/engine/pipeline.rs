//! One delivery's path: factory, then dispatcher.

use thiserror::Error;

use crate::command::{CommandError, CommandFactory, CommandKind};
use crate::dispatch::{CommandDispatcher, DispatchError};
use crate::transport::Message;

/// Why a delivery could not be processed.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{kind} dispatch failed: {source}")]
    Dispatch {
        kind: CommandKind,
        source: DispatchError,
    },

    #[error("processing panicked: {0}")]
    Panicked(String),
}

impl ProcessError {
    /// The command kind, when the message got far enough to have one.
    pub fn kind(&self) -> Option<CommandKind> {
        match self {
            Self::Command(CommandError::Validation { kind, .. }) => Some(*kind),
            Self::Dispatch { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Short label for metrics and log fields.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Command(e) => e.class(),
            Self::Dispatch { source, .. } => source.class(),
            Self::Panicked(_) => "panic",
        }
    }
}

/// Result of running one delivery through the pipeline.
#[derive(Debug)]
pub enum Outcome {
    Processed(CommandKind),
    Failed(ProcessError),
}

/// Factory followed by dispatcher. Shared by every in-flight delivery.
#[derive(Debug, Clone)]
pub struct Pipeline {
    factory: CommandFactory,
    dispatcher: CommandDispatcher,
}

impl Pipeline {
    pub fn new(factory: CommandFactory, dispatcher: CommandDispatcher) -> Self {
        Self {
            factory,
            dispatcher,
        }
    }

    /// Build the command and dispatch it. A message that fails to
    /// build never reaches the dispatcher.
    pub async fn process(&self, message: &Message) -> Outcome {
        let command = match self.factory.create(message) {
            Ok(command) => command,
            Err(e) => return Outcome::Failed(e.into()),
        };
        let kind = command.kind();
        match self.dispatcher.dispatch(&command).await {
            Ok(()) => Outcome::Processed(kind),
            Err(source) => Outcome::Failed(ProcessError::Dispatch { kind, source }),
        }
    }
}
