//! Error types for batch building and scheduler lifecycle.
//!
//! Contract violations (mutating a submitted batch, fencing an unknown
//! signal, submitting an empty batch) are programming errors and assert
//! instead of returning; only conditions the caller can plausibly react to
//! are surfaced as errors.

use std::collections::TryReserveError;
use std::io;

use thiserror::Error;

/// Errors surfaced while assembling a batch.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BatchError {
    /// Growing the job storage failed.
    #[error("job storage allocation failed")]
    Alloc(#[from] TryReserveError),
}

/// Errors surfaced by scheduler construction, submission and shutdown.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// Spawning worker `index` failed. Every worker started before it has
    /// already been stopped and joined when this is returned.
    #[error("failed to spawn worker {index}: {source}")]
    WorkerSpawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    /// A stop flag was observed while fanning a batch out. The batch has
    /// been aborted so its waiters settle.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// One or more worker threads panicked before or during shutdown.
    #[error("{count} worker thread(s) panicked")]
    WorkerPanicked { count: usize },
}
