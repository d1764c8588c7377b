//! Error types for notification-processor.
//!
//! Startup and transport failures surface as [`Error`]. Per-delivery
//! failures live in [`crate::command::CommandError`],
//! [`crate::dispatch::DispatchError`] and [`crate::engine::ProcessError`]
//! and never leave the ingestion loop.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
