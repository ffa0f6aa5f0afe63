//! Queue and runner errors.

use db::DriverError;
use thiserror::Error;

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A required collaborator has not been set.
    #[error("Queue is not configured: no {0} set")]
    NotConfigured(&'static str),
    /// The queue can no longer be reconfigured.
    #[error("Queue has already started")]
    AlreadyStarted,
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Errors from starting a runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Worker pool size must be positive")]
    WorkersMustBePositive,
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),
}
