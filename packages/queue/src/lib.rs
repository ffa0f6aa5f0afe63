//! Distributed job queue built on shared storage drivers.
//!
//! A [`Queue`] combines a [`db::Driver`] with a [`Runner`]. The queue's
//! dispatch loop pulls ready jobs from the driver, and the runner's workers
//! lock, execute and persist them. Any number of queues, in any number of
//! processes, may share one store; the driver's locks keep each job with a
//! single live owner.
//!
//! ```ignore
//! let registry = Arc::new(JobRegistry::with_defaults());
//! let queue = Arc::new(Queue::new(4));
//! queue.set_driver(Arc::new(InternalDriver::new(registry)))?;
//! queue.start(&token).await?;
//! queue.put(&token, &ShellJob::new("echo hello", "")).await?;
//! ```

mod error;
mod messages;
mod queue;
mod runner;
mod wait;
mod worker_actor;

pub use error::{QueueError, RunnerError};
pub use messages::WorkerMessage;
pub use queue::Queue;
pub use runner::{JobSource, LocalWorkers, Runner};
pub use wait::{wait_for_job, wait_interval};
pub use worker_actor::{WorkerActor, WorkerActorState, WorkerArgs};
