//! # notification-processor
//!
//! Queue-driven command worker. Leases messages from a durable queue,
//! turns each into a validated [`command::Command`], runs the handlers
//! registered for its kind, and acknowledges or rejects the message
//! depending on the result.
//!
//! Provides the ingestion loop and lifecycle ([`engine`]), the handler
//! registry and dispatcher, pgmq and in-memory transports, and
//! OpenTelemetry observability.

pub mod command;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handler;
pub mod telemetry;
pub mod transport;
