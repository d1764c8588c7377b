//! Typed commands carried by queue messages.
//!
//! A command is validated when it is constructed and is immutable after
//! that, so an invalid command can never reach a handler. Dispatch keys
//! off [`CommandKind`], never off the Rust type of the payload.

pub mod factory;

use thiserror::Error;

pub use factory::CommandFactory;

/// Discriminant identifying which handlers a command routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CreateIncident,
    Ping,
    Echo,
}

impl CommandKind {
    pub const ALL: [CommandKind; 3] = [Self::CreateIncident, Self::Ping, Self::Echo];

    /// Tag used on the wire in a message's `"command"` field.
    pub fn tag(self) -> &'static str {
        match self {
            Self::CreateIncident => "CreateIncident",
            Self::Ping => "ping",
            Self::Echo => "echo",
        }
    }

    /// Resolve a wire tag, ignoring ASCII case.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag().eq_ignore_ascii_case(tag))
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Why a message could not become a command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The payload is not in a shape we know how to read.
    #[error("cannot decode message: {0}")]
    Decoding(String),

    /// The payload decoded, but its fields break a command invariant.
    #[error("invalid {kind} command: {reason}")]
    Validation { kind: CommandKind, reason: String },
}

impl CommandError {
    /// Short label for metrics and log fields.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Decoding(_) => "decoding",
            Self::Validation { .. } => "validation",
        }
    }
}

/// A validated unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateIncident(CreateIncident),
    Ping(Ping),
    Echo(Echo),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::CreateIncident(_) => CommandKind::CreateIncident,
            Self::Ping(_) => CommandKind::Ping,
            Self::Echo(_) => CommandKind::Echo,
        }
    }
}

/// Links a payload type to its [`Command`] variant.
///
/// Handlers are written against a payload type; registration uses
/// [`CommandPayload::KIND`] to bind them to exactly one kind.
pub trait CommandPayload: Send + Sync + 'static {
    const KIND: CommandKind;

    /// Borrow the payload when `command` is of this kind.
    fn from_command(command: &Command) -> Option<&Self>;
}

// ---------------------------------------------------------------------------
// CreateIncident
// ---------------------------------------------------------------------------

/// Open a new incident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIncident {
    description: String,
}

impl CreateIncident {
    /// The description must contain something other than whitespace.
    pub fn new(description: impl Into<String>) -> Result<Self, CommandError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(CommandError::Validation {
                kind: CommandKind::CreateIncident,
                reason: "description cannot be empty".to_string(),
            });
        }
        Ok(Self { description })
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl CommandPayload for CreateIncident {
    const KIND: CommandKind = CommandKind::CreateIncident;

    fn from_command(command: &Command) -> Option<&Self> {
        match command {
            Command::CreateIncident(c) => Some(c),
            _ => None,
        }
    }
}

impl From<CreateIncident> for Command {
    fn from(c: CreateIncident) -> Self {
        Self::CreateIncident(c)
    }
}

// ---------------------------------------------------------------------------
// Ping
// ---------------------------------------------------------------------------

/// Liveness probe. Carries no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ping;

impl CommandPayload for Ping {
    const KIND: CommandKind = CommandKind::Ping;

    fn from_command(command: &Command) -> Option<&Self> {
        match command {
            Command::Ping(c) => Some(c),
            _ => None,
        }
    }
}

impl From<Ping> for Command {
    fn from(c: Ping) -> Self {
        Self::Ping(c)
    }
}

// ---------------------------------------------------------------------------
// Echo
// ---------------------------------------------------------------------------

/// Write an arbitrary payload back to the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Echo {
    payload: serde_json::Value,
}

impl Echo {
    /// A missing payload is represented as JSON `null`, which is allowed.
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

impl CommandPayload for Echo {
    const KIND: CommandKind = CommandKind::Echo;

    fn from_command(command: &Command) -> Option<&Self> {
        match command {
            Command::Echo(c) => Some(c),
            _ => None,
        }
    }
}

impl From<Echo> for Command {
    fn from(c: Echo) -> Self {
        Self::Echo(c)
    }
}
