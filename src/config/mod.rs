//! Typed configuration from environment variables and an optional file.
//!
//! Loads once at startup, fails fast on malformed values. Values from a
//! config file (TOML, or JSON when the extension is `.json`) override the
//! environment. Sensitive values are wrapped in `secrecy::SecretString`.

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MAX_MESSAGES: usize = 100;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: i32 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Resolved worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace the queue lives in. Informational for pgmq.
    pub project_id: String,
    /// Queue (subscription) the worker consumes from.
    pub subscription_id: String,
    /// Upper bound on concurrently unresolved deliveries.
    pub max_messages: usize,
    /// How long shutdown waits for in-flight deliveries to settle.
    pub drain_timeout: Duration,
    pub database_url: Option<SecretString>,
    /// Lease length for pgmq reads.
    pub visibility_timeout_secs: i32,
    pub poll_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Output format for the fmt logging layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "console" => Ok(Self::Console),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!("unknown log format {other:?}"))),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from the environment, then overlay `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut layered = Layer::from_lookup(|name| std::env::var(name).ok())?;
        if let Some(path) = path {
            layered = layered.overlay(Layer::from_file(path)?);
        }
        layered.resolve()
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Layer::from_lookup(lookup)?.resolve()
    }
}

/// One source of configuration values. Unset fields fall through to the
/// layer below, then to defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Layer {
    project_id: Option<String>,
    subscription_id: Option<String>,
    max_messages: Option<usize>,
    drain_timeout_secs: Option<u64>,
    database_url: Option<String>,
    visibility_timeout_secs: Option<i32>,
    poll_interval_ms: Option<u64>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
    log_format: Option<String>,
}

impl Layer {
    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            project_id: lookup("PUBSUB_PROJECT_ID"),
            subscription_id: lookup("PUBSUB_SUBSCRIPTION_ID"),
            max_messages: parsed(&lookup, "PUBSUB_MAX_MESSAGES")?,
            drain_timeout_secs: parsed(&lookup, "PUBSUB_DRAIN_TIMEOUT_SECS")?,
            database_url: lookup("DATABASE_URL"),
            visibility_timeout_secs: parsed(&lookup, "PGMQ_VISIBILITY_TIMEOUT_SECS")?,
            poll_interval_ms: parsed(&lookup, "PGMQ_POLL_INTERVAL_MS")?,
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("PUBSUB_LOG_LEVEL"),
            log_format: lookup("PUBSUB_LOG_FORMAT"),
        })
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        if is_json {
            serde_json::from_str(&content).map_err(|e| {
                Error::Config(format!("bad config file {}: {e}", path.display()))
            })
        } else {
            toml::from_str(&content).map_err(|e| {
                Error::Config(format!("bad config file {}: {e}", path.display()))
            })
        }
    }

    /// Fields set in `top` win over fields set in `self`.
    fn overlay(self, top: Layer) -> Self {
        Self {
            project_id: top.project_id.or(self.project_id),
            subscription_id: top.subscription_id.or(self.subscription_id),
            max_messages: top.max_messages.or(self.max_messages),
            drain_timeout_secs: top.drain_timeout_secs.or(self.drain_timeout_secs),
            database_url: top.database_url.or(self.database_url),
            visibility_timeout_secs: top.visibility_timeout_secs.or(self.visibility_timeout_secs),
            poll_interval_ms: top.poll_interval_ms.or(self.poll_interval_ms),
            otel_endpoint: top.otel_endpoint.or(self.otel_endpoint),
            log_level: top.log_level.or(self.log_level),
            log_format: top.log_format.or(self.log_format),
        }
    }

    fn resolve(self) -> Result<Config> {
        let subscription_id = self
            .subscription_id
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::Config("subscription_id is not set".to_string()))?;

        let max_messages = self.max_messages.unwrap_or(DEFAULT_MAX_MESSAGES);
        if max_messages == 0 {
            return Err(Error::Config("max_messages must be positive".to_string()));
        }

        let visibility_timeout_secs = self
            .visibility_timeout_secs
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS);
        if visibility_timeout_secs <= 0 {
            return Err(Error::Config(
                "visibility_timeout_secs must be positive".to_string(),
            ));
        }

        let log_format = match self.log_format {
            Some(s) => s.parse()?,
            None => LogFormat::default(),
        };

        Ok(Config {
            project_id: self.project_id.unwrap_or_else(|| "local-project".to_string()),
            subscription_id,
            max_messages,
            drain_timeout: Duration::from_secs(
                self.drain_timeout_secs.unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS),
            ),
            database_url: self.database_url.map(SecretString::from),
            visibility_timeout_secs,
            poll_interval: Duration::from_millis(
                self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            otel_endpoint: self.otel_endpoint,
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            log_format,
        })
    }
}

fn parsed<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid value for {name}: {e}")))
        })
        .transpose()
}
