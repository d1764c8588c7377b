//! Message → command translation.
//!
//! Messages are UTF-8 JSON. An object may name its kind with a
//! `"command"` field; without one the factory falls back to its default
//! kind. A bare JSON string is read as the description of a
//! `CreateIncident` command.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{Command, CommandError, CommandKind, CreateIncident, Echo, Ping};
use crate::transport::Message;

const KIND_FIELD: &str = "command";

#[derive(Deserialize)]
struct CreateIncidentFields {
    description: String,
}

#[derive(Deserialize)]
struct EchoFields {
    #[serde(default)]
    payload: Value,
}

/// Builds commands from raw message payloads. Pure: no I/O, no state.
#[derive(Debug, Clone, Copy)]
pub struct CommandFactory {
    default_kind: CommandKind,
}

impl Default for CommandFactory {
    fn default() -> Self {
        Self {
            default_kind: CommandKind::CreateIncident,
        }
    }
}

impl CommandFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kind used for messages that do not carry a `"command"` tag.
    pub fn with_default_kind(mut self, kind: CommandKind) -> Self {
        self.default_kind = kind;
        self
    }

    /// Build the command carried by a delivered message.
    pub fn create(&self, message: &Message) -> Result<Command, CommandError> {
        self.decode(message.payload())
    }

    /// Build a command from raw payload bytes.
    pub fn decode(&self, payload: &[u8]) -> Result<Command, CommandError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| CommandError::Decoding(format!("payload is not UTF-8: {e}")))?;
        let value: Value = serde_json::from_str(text)
            .map_err(|e| CommandError::Decoding(format!("payload is not JSON: {e}")))?;

        match value {
            Value::Object(fields) => self.command_from_object(fields),
            Value::String(description) if self.default_kind == CommandKind::CreateIncident => {
                CreateIncident::new(description).map(Command::from)
            }
            other => Err(CommandError::Decoding(format!(
                "expected a JSON object, got {}",
                json_type(&other)
            ))),
        }
    }

    fn command_from_object(
        &self,
        mut fields: Map<String, Value>,
    ) -> Result<Command, CommandError> {
        let kind = match fields.remove(KIND_FIELD) {
            None => self.default_kind,
            Some(Value::String(tag)) => CommandKind::from_tag(&tag)
                .ok_or_else(|| CommandError::Decoding(format!("unknown command {tag:?}")))?,
            Some(other) => {
                return Err(CommandError::Decoding(format!(
                    "\"{KIND_FIELD}\" must be a string, got {}",
                    json_type(&other)
                )));
            }
        };

        let fields = Value::Object(fields);
        match kind {
            CommandKind::CreateIncident => {
                let parsed: CreateIncidentFields = from_fields(kind, fields)?;
                CreateIncident::new(parsed.description).map(Command::from)
            }
            CommandKind::Ping => Ok(Command::Ping(Ping)),
            CommandKind::Echo => {
                let parsed: EchoFields = from_fields(kind, fields)?;
                Ok(Command::Echo(Echo::new(parsed.payload)))
            }
        }
    }
}

fn from_fields<T: serde::de::DeserializeOwned>(
    kind: CommandKind,
    fields: Value,
) -> Result<T, CommandError> {
    serde_json::from_value(fields)
        .map_err(|e| CommandError::Decoding(format!("bad {kind} payload: {e}")))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
