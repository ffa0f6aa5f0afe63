//! Durable driver backed by SurrealDB.
//!
//! Each job is one record in the configured table. Lock transitions are
//! single conditional `UPDATE ... WHERE` statements, so any number of
//! drivers in any number of processes can share the table.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use queue_core::{Job, JobRecord, JobRegistry, JobStatus, JobStatusInfo, LockConflict, Stats};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::connection::{Database, DbConfig, connect_db};
use crate::driver::{Driver, DriverError, DriverOptions, check_save, merge_status};
use crate::schema::init_schema;

/// Rows fetched per page by `job_stats`.
const PAGE_SIZE: usize = 100;

/// Stored row: the job record plus storage bookkeeping.
#[derive(Debug, Serialize, Deserialize)]
struct JobRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    seq: i64,
    #[serde(default)]
    lease_ms: i64,
    #[serde(default)]
    dispatched_ms: i64,
    job: JobRecord,
}

#[derive(Debug, Deserialize)]
struct StatusRow {
    job: StatusFields,
}

#[derive(Debug, Deserialize)]
struct StatusFields {
    id: String,
    #[serde(default)]
    status: JobStatus,
}

impl From<StatusRow> for JobStatusInfo {
    fn from(row: StatusRow) -> Self {
        let StatusFields { id, status } = row.job;
        Self {
            id,
            completed: status.completed,
            failed: status.failed,
            in_progress: status.in_progress,
            owner: status.owner,
            mod_count: status.mod_count,
            mod_time: status.mod_time,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CountRow {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    completed: u64,
    #[serde(default)]
    failed: u64,
    #[serde(default)]
    running: u64,
}

const SELECT_JOB: &str = "SELECT * FROM type::thing($tb, $id)";

const CREATE_JOB: &str = "CREATE type::thing($tb, $id) CONTENT $row";

const REPLACE_JOB: &str = r#"
UPDATE type::thing($tb, $id) SET job = $job, lease_ms = $lease
WHERE job.status.mod_count = $seen_count
  AND job.status.owner = $seen_owner
  AND job.status.in_progress = $seen_in_progress
RETURN AFTER
"#;

const NEXT_CANDIDATE: &str = r#"
SELECT * FROM type::table($tb)
WHERE job.status.completed = false
  AND job.status.failed != true
  AND (job.status.in_progress = false OR lease_ms <= $live_after)
  AND dispatched_ms <= $dispatch_after
ORDER BY job.priority DESC, seq ASC
LIMIT 1
"#;

const CLAIM_DISPATCH: &str = r#"
UPDATE type::thing($tb, $id) SET dispatched_ms = $now_ms
WHERE dispatched_ms = $seen
RETURN AFTER
"#;

const LOCK_JOB: &str = r#"
UPDATE type::thing($tb, $id) SET
    job.status.in_progress = true,
    job.status.owner = $owner,
    job.status.mod_count += 1,
    job.status.mod_time = $now,
    lease_ms = $now_ms
WHERE job.status.completed = false
  AND job.status.failed != true
  AND (job.status.in_progress = false OR job.status.owner = $owner OR lease_ms <= $live_after)
RETURN AFTER
"#;

const UNLOCK_JOB: &str = r#"
UPDATE type::thing($tb, $id) SET
    job.status.in_progress = false,
    job.status.owner = "",
    job.status.mod_count += 1,
    job.status.mod_time = $now,
    lease_ms = $now_ms
WHERE job.status.in_progress = true AND job.status.owner = $owner
RETURN AFTER
"#;

const COUNT_JOBS: &str = r#"
SELECT
    count() AS total,
    count(job.status.completed = true) AS completed,
    count(job.status.completed = false AND job.status.failed = true) AS failed,
    count(job.status.completed = false AND job.status.failed != true AND job.status.in_progress = true) AS running
FROM type::table($tb)
GROUP ALL
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Lock,
    Unlock,
}

impl Transition {
    fn statement(self) -> &'static str {
        match self {
            Transition::Lock => LOCK_JOB,
            Transition::Unlock => UNLOCK_JOB,
        }
    }
}

fn lease_of(status: &JobStatus) -> i64 {
    status.mod_time.map_or(0, |t| t.timestamp_millis())
}

async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, DriverError> {
    tokio::select! {
        _ = token.cancelled() => Err(DriverError::Cancelled),
        result = fut => result,
    }
}

/// Driver over a SurrealDB table.
pub struct SurrealDriver {
    id: String,
    config: DbConfig,
    options: DriverOptions,
    registry: Arc<JobRegistry>,
    db: Arc<RwLock<Option<Database>>>,
    last_seq: Arc<AtomicI64>,
}

impl SurrealDriver {
    pub fn new(config: DbConfig, registry: Arc<JobRegistry>) -> Self {
        Self::with_options(config, DriverOptions::default(), registry)
    }

    pub fn with_options(config: DbConfig, options: DriverOptions, registry: Arc<JobRegistry>) -> Self {
        Self {
            id: format!("surreal-{}", Ulid::new()),
            config,
            options,
            registry,
            db: Arc::new(RwLock::new(None)),
            last_seq: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Another driver, with its own id, sharing this driver's connection.
    pub fn peer(&self) -> Self {
        Self {
            id: format!("surreal-{}", Ulid::new()),
            config: self.config.clone(),
            options: self.options.clone(),
            registry: Arc::clone(&self.registry),
            db: Arc::clone(&self.db),
            last_seq: Arc::clone(&self.last_seq),
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    async fn conn(&self) -> Result<Database, DriverError> {
        self.db.read().await.clone().ok_or(DriverError::NotOpen)
    }

    /// Insertion order, strictly increasing within this process.
    fn next_seq(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let mut current = self.last_seq.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self.last_seq.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    fn lock_timeout_ms(&self) -> i64 {
        i64::try_from(self.options.lock_timeout().as_millis()).unwrap_or(i64::MAX)
    }

    fn build(&self, row: JobRow) -> Option<Box<dyn Job>> {
        let id = row.job.base.id.clone();
        match self.registry.build(row.job) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::warn!("Skipping undecodable job {}: {}", id, e);
                None
            }
        }
    }

    async fn fetch(&self, db: &Database, id: &str) -> Result<Option<JobRow>, DriverError> {
        let mut response = db
            .query(SELECT_JOB)
            .bind(("tb", self.config.table.clone()))
            .bind(("id", id.to_string()))
            .await?;
        let rows: Vec<JobRow> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn create(&self, db: &Database, record: &JobRecord) -> Result<(), DriverError> {
        let row = JobRow {
            id: None,
            seq: self.next_seq(),
            lease_ms: lease_of(&record.base.status),
            dispatched_ms: 0,
            job: record.clone(),
        };
        let mut response = db
            .query(CREATE_JOB)
            .bind(("tb", self.config.table.clone()))
            .bind(("id", record.base.id.clone()))
            .bind(("row", row))
            .await?;
        let _created: Vec<JobRow> = response.take(0)?;
        Ok(())
    }

    async fn replace(
        &self,
        db: &Database,
        stored: &JobRow,
        mut record: JobRecord,
    ) -> Result<(), DriverError> {
        let seen = &stored.job.base.status;
        check_save(
            &record.base.id,
            seen,
            &record.base.status,
            Utc::now(),
            self.options.lock_timeout(),
        )?;
        record.base.status = merge_status(seen, &record.base.status);

        let id = record.base.id.clone();
        let lease = lease_of(&record.base.status);
        let mut response = db
            .query(REPLACE_JOB)
            .bind(("tb", self.config.table.clone()))
            .bind(("id", id.clone()))
            .bind(("job", record))
            .bind(("lease", lease))
            .bind(("seen_count", seen.mod_count))
            .bind(("seen_owner", seen.owner.clone()))
            .bind(("seen_in_progress", seen.in_progress))
            .await?;
        let updated: Vec<JobRow> = response.take(0)?;

        if updated.is_empty() {
            return Err(DriverError::Conflict {
                id,
                reason: "modified concurrently".to_string(),
            });
        }
        Ok(())
    }

    async fn claim_next(&self, db: &Database) -> Result<Option<JobRow>, DriverError> {
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = i64::try_from(self.options.dispatch_window_ms).unwrap_or(i64::MAX);

        let mut response = db
            .query(NEXT_CANDIDATE)
            .bind(("tb", self.config.table.clone()))
            .bind(("live_after", now_ms.saturating_sub(self.lock_timeout_ms())))
            .bind(("dispatch_after", now_ms.saturating_sub(window_ms)))
            .await?;
        let candidates: Vec<JobRow> = response.take(0)?;
        let Some(candidate) = candidates.into_iter().next() else {
            return Ok(None);
        };

        // Another driver may have claimed it between the two statements.
        let mut response = db
            .query(CLAIM_DISPATCH)
            .bind(("tb", self.config.table.clone()))
            .bind(("id", candidate.job.base.id.clone()))
            .bind(("now_ms", now_ms))
            .bind(("seen", candidate.dispatched_ms))
            .await?;
        let claimed: Vec<JobRow> = response.take(0)?;
        Ok(claimed.into_iter().next())
    }

    /// Run a lock transition; on no match, explain why.
    async fn transition(
        &self,
        token: &CancellationToken,
        transition: Transition,
        id: &str,
        owner: &str,
    ) -> Result<(), DriverError> {
        let db = self.conn().await?;
        cancellable(token, async {
            let now = Utc::now();
            let now_ms = now.timestamp_millis();
            let mut response = db
                .query(transition.statement())
                .bind(("tb", self.config.table.clone()))
                .bind(("id", id.to_string()))
                .bind(("owner", owner.to_string()))
                .bind(("now", now))
                .bind(("now_ms", now_ms))
                .bind(("live_after", now_ms.saturating_sub(self.lock_timeout_ms())))
                .await?;
            let updated: Vec<JobRow> = response.take(0)?;
            if !updated.is_empty() {
                return Ok(());
            }

            let stored = self
                .fetch(&db, id)
                .await?
                .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
            let status = &stored.job.base.status;
            if transition == Transition::Unlock && !status.in_progress {
                return Ok(());
            }
            if status.completed {
                return Err(LockConflict::Completed { id: id.to_string() }.into());
            }
            if status.failed {
                return Err(LockConflict::Failed { id: id.to_string() }.into());
            }
            Err(LockConflict::Held {
                id: id.to_string(),
                holder: status.owner.clone(),
            }
            .into())
        })
        .await
    }
}

#[async_trait]
impl Driver for SurrealDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn lock_timeout(&self) -> Duration {
        self.options.lock_timeout()
    }

    async fn open(&self, token: &CancellationToken) -> Result<(), DriverError> {
        let mut slot = self.db.write().await;
        if slot.is_some() {
            return Ok(());
        }
        self.config.validate()?;

        let db = cancellable(token, async {
            let db = connect_db(&self.config).await?;
            init_schema(&db, &self.config.table).await?;
            Ok(db)
        })
        .await?;

        tracing::info!("Opened driver {} on table {}", self.id, self.config.table);
        *slot = Some(db);
        Ok(())
    }

    async fn close(&self) {
        if self.db.write().await.take().is_some() {
            tracing::info!("Closed driver {}", self.id);
        }
    }

    async fn save(&self, token: &CancellationToken, job: &dyn Job) -> Result<(), DriverError> {
        let record = JobRecord::from_job(job)?;
        let db = self.conn().await?;

        cancellable(token, async {
            if let Some(stored) = self.fetch(&db, &record.base.id).await? {
                return self.replace(&db, &stored, record).await;
            }
            match self.create(&db, &record).await {
                Ok(()) => Ok(()),
                // Lost a create race; fall back to the update path.
                Err(e) => match self.fetch(&db, &record.base.id).await? {
                    Some(stored) => self.replace(&db, &stored, record).await,
                    None => Err(e),
                },
            }
        })
        .await
    }

    async fn get(&self, token: &CancellationToken, id: &str) -> Option<Box<dyn Job>> {
        let db = self.conn().await.ok()?;
        match cancellable(token, self.fetch(&db, id)).await {
            Ok(row) => self.build(row?),
            Err(e) => {
                tracing::warn!("Failed to get job {}: {}", id, e);
                None
            }
        }
    }

    async fn next(&self, token: &CancellationToken) -> Option<Box<dyn Job>> {
        let db = self.conn().await.ok()?;
        match cancellable(token, self.claim_next(&db)).await {
            Ok(row) => self.build(row?),
            Err(DriverError::Cancelled) => None,
            Err(e) => {
                tracing::warn!("Failed to fetch next job: {}", e);
                None
            }
        }
    }

    async fn lock(
        &self,
        token: &CancellationToken,
        id: &str,
        owner: &str,
    ) -> Result<(), DriverError> {
        self.transition(token, Transition::Lock, id, owner).await
    }

    async fn unlock(
        &self,
        token: &CancellationToken,
        id: &str,
        owner: &str,
    ) -> Result<(), DriverError> {
        self.transition(token, Transition::Unlock, id, owner).await
    }

    fn job_stats(&self, token: &CancellationToken) -> BoxStream<'static, JobStatusInfo> {
        struct Cursor {
            offset: usize,
            buffer: VecDeque<JobStatusInfo>,
            exhausted: bool,
        }

        let slot = Arc::clone(&self.db);
        let table = self.config.table.clone();
        let start = Cursor {
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(start, move |mut cursor| {
            let slot = Arc::clone(&slot);
            let table = table.clone();
            async move {
                loop {
                    if let Some(info) = cursor.buffer.pop_front() {
                        return Some((info, cursor));
                    }
                    if cursor.exhausted {
                        return None;
                    }

                    let db = slot.read().await.clone()?;
                    let query = format!(
                        "SELECT id, seq, job.id, job.status FROM type::table($tb) ORDER BY seq ASC, id ASC LIMIT {} START {}",
                        PAGE_SIZE, cursor.offset
                    );
                    let rows: Vec<StatusRow> = match db.query(query).bind(("tb", table.clone())).await {
                        Ok(mut response) => match response.take(0) {
                            Ok(rows) => rows,
                            Err(e) => {
                                tracing::warn!("Failed to read job status page: {}", e);
                                return None;
                            }
                        },
                        Err(e) => {
                            tracing::warn!("Failed to read job status page: {}", e);
                            return None;
                        }
                    };

                    cursor.exhausted = rows.len() < PAGE_SIZE;
                    cursor.offset += rows.len();
                    cursor.buffer.extend(rows.into_iter().map(JobStatusInfo::from));
                }
            }
        })
        .take_until(token.clone().cancelled_owned())
        .boxed()
    }

    async fn stats(&self, token: &CancellationToken) -> Stats {
        let Ok(db) = self.conn().await else {
            return Stats::default();
        };

        let counts = cancellable(token, async {
            let mut response = db
                .query(COUNT_JOBS)
                .bind(("tb", self.config.table.clone()))
                .await?;
            let rows: Vec<CountRow> = response.take(0)?;
            Ok(rows.into_iter().next().unwrap_or_default())
        })
        .await;

        match counts {
            Ok(counts) => Stats {
                total: counts.total,
                pending: counts
                    .total
                    .saturating_sub(counts.completed + counts.failed + counts.running),
                running: counts.running,
                completed: counts.completed,
                failed: counts.failed,
            },
            Err(e) => {
                tracing::warn!("Failed to count jobs: {}", e);
                Stats::default()
            }
        }
    }
}
