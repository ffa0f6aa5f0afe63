//! Job domain types for work items in the queue.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::dependency::Dependency;

/// How long a lock stays live without being renewed.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Generate a unique job id with the given prefix, e.g. `shell-01J...`.
pub fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Ulid::new())
}

/// Wire format of a job's payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum JobFormat {
    #[default]
    Json,
}

impl fmt::Display for JobFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFormat::Json => write!(f, "json"),
        }
    }
}

/// Type descriptor used to pick the right factory when decoding a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobType {
    pub name: String,
    #[serde(default)]
    pub format: JobFormat,
    #[serde(default)]
    pub version: u32,
}

impl JobType {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            format: JobFormat::Json,
            version,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{} ({})", self.name, self.version, self.format)
    }
}

/// Error returned when a lock cannot be taken or released.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockConflict {
    #[error("job {id} is locked by {holder}")]
    Held { id: String, holder: String },
    #[error("job {id} is already completed")]
    Completed { id: String },
    #[error("job {id} has failed")]
    Failed { id: String },
}

/// Lock and completion state of a job.
///
/// `mod_count` grows on every lock transition and is the optimistic
/// concurrency token drivers compare on save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStatus {
    pub completed: bool,
    /// Set when an attempt recorded an error. Failed jobs are not dispatched
    /// again until something clears the flag.
    pub failed: bool,
    pub in_progress: bool,
    pub owner: String,
    pub mod_count: u64,
    pub mod_time: Option<DateTime<Utc>>,
}

impl JobStatus {
    /// Completed or failed: no worker will pick the job up again.
    pub fn is_finished(&self) -> bool {
        self.completed || self.failed
    }

    /// Whether an owner currently holds a lease that has not expired.
    pub fn lock_is_live(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if !self.in_progress || self.owner.is_empty() {
            return false;
        }
        let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
        match self.mod_time {
            Some(mod_time) => now.signed_duration_since(mod_time) < timeout,
            // No timestamp means no lease to honour.
            None => false,
        }
    }

    /// Whether `owner` holds the lock, live or not.
    pub fn is_held_by(&self, owner: &str) -> bool {
        self.in_progress && !owner.is_empty() && self.owner == owner
    }

    /// Whether `owner` may take the lock right now.
    pub fn can_lock(&self, owner: &str, now: DateTime<Utc>, timeout: Duration) -> bool {
        !self.is_finished() && (self.owner == owner || !self.lock_is_live(now, timeout))
    }

    /// Take (or renew) the lock for `owner`.
    pub fn lock(
        &mut self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<(), LockConflict> {
        if self.completed {
            return Err(LockConflict::Completed { id: id.to_string() });
        }
        if self.failed {
            return Err(LockConflict::Failed { id: id.to_string() });
        }
        if !self.can_lock(owner, now, timeout) {
            return Err(LockConflict::Held {
                id: id.to_string(),
                holder: self.owner.clone(),
            });
        }
        self.in_progress = true;
        self.owner = owner.to_string();
        self.mod_count += 1;
        self.mod_time = Some(now);
        Ok(())
    }

    /// Release the lock held by `owner`. Releasing an unlocked job is a no-op.
    pub fn unlock(&mut self, id: &str, owner: &str, now: DateTime<Utc>) -> Result<(), LockConflict> {
        if !self.in_progress {
            return Ok(());
        }
        if self.owner != owner {
            return Err(LockConflict::Held {
                id: id.to_string(),
                holder: self.owner.clone(),
            });
        }
        self.in_progress = false;
        self.owner.clear();
        self.mod_count += 1;
        self.mod_time = Some(now);
        Ok(())
    }
}

/// Lifecycle timestamps. All unset until the job is first dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeInfo {
    pub created: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeInfo {
    pub fn is_zero(&self) -> bool {
        self.created.is_none() && self.start.is_none() && self.end.is_none()
    }

    /// Stamp `created` and `start` if they are still unset.
    pub fn mark_dispatched(&mut self, now: DateTime<Utc>) {
        self.created.get_or_insert(now);
        self.start.get_or_insert(now);
    }

    /// Wall time between start and end, once both are known.
    pub fn duration(&self) -> Option<TimeDelta> {
        Some(self.end?.signed_duration_since(self.start?))
    }
}

/// Fields shared by every job, persisted alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobBase {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub time_info: TimeInfo,
    #[serde(default)]
    pub dependency: Dependency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobBase {
    pub fn new(id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id: id.into(),
            job_type,
            ..Default::default()
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the dependency predicate.
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependency = dependency;
        self
    }
}

/// Upcast helper so `dyn Job` can be inspected as its concrete type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A unit of work the queue can persist and execute.
///
/// Implementors own a [`JobBase`] and a serializable payload. Everything the
/// queue needs besides `run` is provided on top of the base.
#[async_trait]
pub trait Job: AsAny + Send + Sync + fmt::Debug {
    fn base(&self) -> &JobBase;

    fn base_mut(&mut self) -> &mut JobBase;

    /// Job-specific data, stored next to the base fields.
    fn payload(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// Execute the job. Failures are recorded with [`Job::add_error`],
    /// never returned. Long-running jobs should stop when `token` is cancelled.
    async fn run(&mut self, token: &CancellationToken);

    fn id(&self) -> &str {
        &self.base().id
    }

    fn job_type(&self) -> &JobType {
        &self.base().job_type
    }

    fn status(&self) -> &JobStatus {
        &self.base().status
    }

    fn set_status(&mut self, status: JobStatus) {
        self.base_mut().status = status;
    }

    fn priority(&self) -> i32 {
        self.base().priority
    }

    fn set_priority(&mut self, priority: i32) {
        self.base_mut().priority = priority;
    }

    fn time_info(&self) -> TimeInfo {
        self.base().time_info
    }

    fn set_time_info(&mut self, time_info: TimeInfo) {
        self.base_mut().time_info = time_info;
    }

    fn dependency(&self) -> &Dependency {
        &self.base().dependency
    }

    fn set_dependency(&mut self, dependency: Dependency) {
        self.base_mut().dependency = dependency;
    }

    fn error(&self) -> Option<&str> {
        self.base().error.as_deref()
    }

    /// Record an error. Multiple errors are joined in order.
    fn add_error(&mut self, error: String) {
        let base = self.base_mut();
        base.error = Some(match base.error.take() {
            Some(existing) => format!("{existing}; {error}"),
            None => error,
        });
    }

    /// Lock the local copy for `owner` with the default lease.
    fn lock(&mut self, owner: &str) -> Result<(), LockConflict> {
        let base = self.base_mut();
        base.status
            .lock(&base.id, owner, Utc::now(), DEFAULT_LOCK_TIMEOUT)
    }

    /// Release the lock on the local copy.
    fn unlock(&mut self, owner: &str) -> Result<(), LockConflict> {
        let base = self.base_mut();
        base.status.unlock(&base.id, owner, Utc::now())
    }
}

impl dyn Job {
    /// Borrow the job as its concrete type.
    pub fn downcast_ref<T: Job + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Persisted form of a job: the base fields plus the encoded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(flatten)]
    pub base: JobBase,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl JobRecord {
    /// Snapshot a live job.
    pub fn from_job(job: &dyn Job) -> Result<Self, serde_json::Error> {
        Ok(Self {
            base: job.base().clone(),
            payload: job.payload()?,
        })
    }

    pub fn id(&self) -> &str {
        &self.base.id
    }

    pub fn status(&self) -> &JobStatus {
        &self.base.status
    }
}

/// Status summary yielded by `job_stats` streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusInfo {
    pub id: String,
    pub completed: bool,
    #[serde(default)]
    pub failed: bool,
    pub in_progress: bool,
    pub owner: String,
    pub mod_count: u64,
    pub mod_time: Option<DateTime<Utc>>,
}

impl From<&JobRecord> for JobStatusInfo {
    fn from(record: &JobRecord) -> Self {
        let status = &record.base.status;
        Self {
            id: record.base.id.clone(),
            completed: status.completed,
            failed: status.failed,
            in_progress: status.in_progress,
            owner: status.owner.clone(),
            mod_count: status.mod_count,
            mod_time: status.mod_time,
        }
    }
}
