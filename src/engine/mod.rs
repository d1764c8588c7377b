//! Worker engine: turns deliveries into commands, runs them, settles them.

pub mod ingest;
pub mod lifecycle;
pub mod pipeline;

pub use ingest::{IngestionLoop, LoopExit};
pub use lifecycle::{Phase, RunReport, ShutdownHandle, Worker, WorkerConfig};
pub use pipeline::{Outcome, Pipeline, ProcessError};
