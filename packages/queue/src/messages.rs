//! Message types for actor communication.

use ractor::RpcReplyPort;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Pull the next job and work on it.
    Poll,

    /// Check if worker is idle.
    IsIdle { reply: RpcReplyPort<bool> },

    /// Shutdown the worker.
    Shutdown,
}
