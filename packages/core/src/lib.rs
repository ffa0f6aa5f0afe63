//! Core domain types for the job queue system.
//!
//! This crate contains shared types used across all packages:
//! - `Job`, its persisted `JobRecord` and lock/status state
//! - `Dependency` predicates evaluated before a job runs
//! - `JobRegistry` for decoding records into live jobs
//! - `Stats` and `QueueConfig`
//! - `ShellJob`, the built-in command job

mod dependency;
mod job;
mod queue;
mod registry;
mod shell;

pub use dependency::{Dependency, DependencyState};
pub use job::{
    AsAny, DEFAULT_LOCK_TIMEOUT, Job, JobBase, JobFormat, JobRecord, JobStatus, JobStatusInfo,
    JobType, LockConflict, TimeInfo, generate_id,
};
pub use queue::{QueueConfig, Stats};
pub use registry::{JobFactory, JobKind, JobRegistry, RegistryError};
pub use shell::ShellJob;

/// Re-exported so implementors of [`Job`] share the crate's token type.
pub use tokio_util::sync::CancellationToken;
