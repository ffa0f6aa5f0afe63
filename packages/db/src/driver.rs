//! The driver contract shared by every backing store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use queue_core::{
    DEFAULT_LOCK_TIMEOUT, Job, JobStatus, JobStatusInfo, LockConflict, RegistryError, Stats,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Driver errors.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Driver is not open")]
    NotOpen,
    #[error("Conflict saving job {id}: {reason}")]
    Conflict { id: String, reason: String },
    #[error(transparent)]
    LockConflict(#[from] LockConflict),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Decode error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl DriverError {
    /// Contention between owners; callers should move on to another job.
    pub fn is_contention(&self) -> bool {
        matches!(self, DriverError::Conflict { .. } | DriverError::LockConflict(_))
    }
}

/// Lease and dispatch tuning shared by all drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOptions {
    /// A lock not renewed within this window is treated as abandoned.
    pub lock_timeout_secs: u64,
    /// A job returned by `next` is not returned again within this window.
    pub dispatch_window_ms: u64,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT.as_secs(),
            dispatch_window_ms: 1000,
        }
    }
}

impl DriverOptions {
    /// Set the lock lease.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the dispatch window.
    pub fn with_dispatch_window(mut self, window: Duration) -> Self {
        self.dispatch_window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn dispatch_window(&self) -> Duration {
        Duration::from_millis(self.dispatch_window_ms)
    }
}

/// Persistence and mutual exclusion over jobs in a shared store.
///
/// Every instance has a unique id. Many instances, possibly in different
/// processes, may point at the same store; `lock` is the only operation
/// that arbitrates between them.
#[async_trait]
pub trait Driver: Send + Sync {
    fn id(&self) -> &str;

    /// Lease length; holders must renew more often than this.
    fn lock_timeout(&self) -> Duration {
        DEFAULT_LOCK_TIMEOUT
    }

    /// Connect to the store. Calling it again is a no-op.
    async fn open(&self, token: &CancellationToken) -> Result<(), DriverError>;

    /// Release resources. Safe to call repeatedly.
    async fn close(&self);

    /// Insert or update a job.
    ///
    /// Fails with [`DriverError::Conflict`] when the caller does not hold
    /// the job's lock and the stored copy is newer or locked by someone else.
    async fn save(&self, token: &CancellationToken, job: &dyn Job) -> Result<(), DriverError>;

    /// Fetch a job. Missing jobs are `None`.
    async fn get(&self, token: &CancellationToken, id: &str) -> Option<Box<dyn Job>>;

    /// A job that is neither completed nor held by a live lock.
    async fn next(&self, token: &CancellationToken) -> Option<Box<dyn Job>>;

    /// Atomically take or renew the lock on `id` for `owner`.
    async fn lock(
        &self,
        token: &CancellationToken,
        id: &str,
        owner: &str,
    ) -> Result<(), DriverError>;

    /// Release the lock on `id` held by `owner`.
    async fn unlock(
        &self,
        token: &CancellationToken,
        id: &str,
        owner: &str,
    ) -> Result<(), DriverError>;

    /// Lazily stream the status of every job.
    fn job_stats(&self, token: &CancellationToken) -> BoxStream<'static, JobStatusInfo>;

    /// Aggregate counts over every job.
    async fn stats(&self, token: &CancellationToken) -> Stats {
        self.job_stats(token)
            .fold(Stats::default(), |mut stats, info| async move {
                stats.record(&info);
                stats
            })
            .await
    }
}

/// Decide whether a save of `incoming` over `stored` may proceed.
pub(crate) fn check_save(
    id: &str,
    stored: &JobStatus,
    incoming: &JobStatus,
    now: DateTime<Utc>,
    lock_timeout: Duration,
) -> Result<(), DriverError> {
    if stored.is_held_by(&incoming.owner) {
        return Ok(());
    }
    if stored.mod_count > incoming.mod_count {
        return Err(DriverError::Conflict {
            id: id.to_string(),
            reason: format!(
                "stored copy is newer (mod count {} > {})",
                stored.mod_count, incoming.mod_count
            ),
        });
    }
    if stored.lock_is_live(now, lock_timeout) {
        return Err(DriverError::Conflict {
            id: id.to_string(),
            reason: format!("locked by {}", stored.owner),
        });
    }
    Ok(())
}

/// Status written by a save that passed [`check_save`].
pub(crate) fn merge_status(stored: &JobStatus, incoming: &JobStatus) -> JobStatus {
    let mut merged = incoming.clone();
    merged.mod_count = stored.mod_count.max(incoming.mod_count);
    merged.mod_time = stored.mod_time.max(incoming.mod_time);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_save_rules() {
        let now = Utc::now();
        let timeout = Duration::from_secs(60);

        let mut stored = JobStatus::default();
        stored.lock("a", "w1", now, timeout).unwrap();

        // Holder may save even with a stale copy.
        let holder = JobStatus {
            in_progress: true,
            owner: "w1".into(),
            ..Default::default()
        };
        assert!(check_save("a", &stored, &holder, now, timeout).is_ok());

        // Someone else with an equal mod count hits the live lock.
        let other = JobStatus {
            mod_count: stored.mod_count,
            ..Default::default()
        };
        let err = check_save("a", &stored, &other, now, timeout).unwrap_err();
        assert!(err.is_contention());

        // Stale copies lose.
        stored.unlock("a", "w1", now).unwrap();
        let stale = JobStatus::default();
        assert!(check_save("a", &stored, &stale, now, timeout).is_err());

        let fresh = JobStatus {
            mod_count: stored.mod_count,
            ..Default::default()
        };
        assert!(check_save("a", &stored, &fresh, now, timeout).is_ok());
    }

    #[test]
    fn test_merge_never_lowers_mod_count() {
        let stored = JobStatus {
            mod_count: 5,
            ..Default::default()
        };
        let incoming = JobStatus {
            completed: true,
            mod_count: 2,
            ..Default::default()
        };
        let merged = merge_status(&stored, &incoming);
        assert_eq!(merged.mod_count, 5);
        assert!(merged.completed);
    }
}
