//! In-process drivers backed by a shared in-memory store.
//!
//! Useful for tests and single-process deployments. [`MemoryDriver::peer`]
//! hands out another driver over the same records, which is how tests
//! simulate several processes contending for one store.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use queue_core::{Job, JobRecord, JobRegistry, JobStatusInfo};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::driver::{Driver, DriverError, DriverOptions, check_save, merge_status};

/// Order in which eligible jobs are handed out.
pub trait DispatchOrder: Send + Sync + 'static {
    /// Prefix for driver ids.
    const NAME: &'static str;

    /// Sort key; the smallest eligible key is dispatched first.
    fn key(priority: i32, seq: u64) -> (i64, u64);
}

/// Oldest first.
pub struct Fifo;

impl DispatchOrder for Fifo {
    const NAME: &'static str = "internal";

    fn key(_priority: i32, seq: u64) -> (i64, u64) {
        (0, seq)
    }
}

/// Highest priority first, oldest first within a priority.
pub struct ByPriority;

impl DispatchOrder for ByPriority {
    const NAME: &'static str = "priority";

    fn key(priority: i32, seq: u64) -> (i64, u64) {
        (-i64::from(priority), seq)
    }
}

/// In-memory FIFO driver.
pub type InternalDriver = MemoryDriver<Fifo>;

/// In-memory driver ordered by priority.
pub type PriorityDriver = MemoryDriver<ByPriority>;

struct Entry {
    seq: u64,
    record: JobRecord,
    dispatched_at: Option<Instant>,
}

#[derive(Default)]
struct Store {
    jobs: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

struct Shared {
    store: RwLock<Store>,
    registry: Arc<JobRegistry>,
    options: DriverOptions,
}

/// Driver over an in-memory store, generic over dispatch order.
pub struct MemoryDriver<O: DispatchOrder> {
    id: String,
    shared: Arc<Shared>,
    _order: PhantomData<fn() -> O>,
}

impl<O: DispatchOrder> MemoryDriver<O> {
    /// Create a driver over a fresh, empty store.
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self::with_options(registry, DriverOptions::default())
    }

    pub fn with_options(registry: Arc<JobRegistry>, options: DriverOptions) -> Self {
        Self::attach(Arc::new(Shared {
            store: RwLock::new(Store::default()),
            registry,
            options,
        }))
    }

    /// Another driver, with its own id, over the same store.
    pub fn peer(&self) -> Self {
        Self::attach(Arc::clone(&self.shared))
    }

    fn attach(shared: Arc<Shared>) -> Self {
        Self {
            id: format!("{}-{}", O::NAME, Ulid::new()),
            shared,
            _order: PhantomData,
        }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.shared.options
    }

    fn build(&self, record: JobRecord) -> Option<Box<dyn Job>> {
        let id = record.base.id.clone();
        match self.shared.registry.build(record) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::warn!("Skipping undecodable job {}: {}", id, e);
                None
            }
        }
    }
}

#[async_trait]
impl<O: DispatchOrder> Driver for MemoryDriver<O> {
    fn id(&self) -> &str {
        &self.id
    }

    fn lock_timeout(&self) -> Duration {
        self.shared.options.lock_timeout()
    }

    async fn open(&self, _token: &CancellationToken) -> Result<(), DriverError> {
        tracing::debug!("Opened in-memory driver {}", self.id);
        Ok(())
    }

    async fn close(&self) {
        tracing::debug!("Closed in-memory driver {}", self.id);
    }

    async fn save(&self, _token: &CancellationToken, job: &dyn Job) -> Result<(), DriverError> {
        let mut record = JobRecord::from_job(job)?;
        let now = Utc::now();

        let mut guard = self.shared.store.write().await;
        let store = &mut *guard;

        match store.jobs.get_mut(&record.base.id) {
            Some(entry) => {
                let stored = &entry.record.base.status;
                check_save(
                    &record.base.id,
                    stored,
                    &record.base.status,
                    now,
                    self.shared.options.lock_timeout(),
                )?;
                record.base.status = merge_status(stored, &record.base.status);
                entry.record = record;
            }
            None => {
                let seq = store.next_seq;
                store.next_seq += 1;
                let id = record.base.id.clone();
                store.order.insert(seq, id.clone());
                store.jobs.insert(
                    id,
                    Entry {
                        seq,
                        record,
                        dispatched_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get(&self, _token: &CancellationToken, id: &str) -> Option<Box<dyn Job>> {
        let record = {
            let store = self.shared.store.read().await;
            store.jobs.get(id)?.record.clone()
        };
        self.build(record)
    }

    async fn next(&self, token: &CancellationToken) -> Option<Box<dyn Job>> {
        if token.is_cancelled() {
            return None;
        }

        let now = Utc::now();
        let lock_timeout = self.shared.options.lock_timeout();
        let window = self.shared.options.dispatch_window();

        let record = {
            let mut store = self.shared.store.write().await;
            let entry = store
                .jobs
                .values_mut()
                .filter(|entry| {
                    let status = &entry.record.base.status;
                    !status.is_finished()
                        && !status.lock_is_live(now, lock_timeout)
                        && entry.dispatched_at.is_none_or(|at| at.elapsed() >= window)
                })
                .min_by_key(|entry| O::key(entry.record.base.priority, entry.seq))?;
            entry.dispatched_at = Some(Instant::now());
            entry.record.clone()
        };

        self.build(record)
    }

    async fn lock(
        &self,
        _token: &CancellationToken,
        id: &str,
        owner: &str,
    ) -> Result<(), DriverError> {
        let mut store = self.shared.store.write().await;
        let entry = store
            .jobs
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
        entry.record.base.status.lock(
            id,
            owner,
            Utc::now(),
            self.shared.options.lock_timeout(),
        )?;
        Ok(())
    }

    async fn unlock(
        &self,
        _token: &CancellationToken,
        id: &str,
        owner: &str,
    ) -> Result<(), DriverError> {
        let mut store = self.shared.store.write().await;
        let entry = store
            .jobs
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
        entry.record.base.status.unlock(id, owner, Utc::now())?;
        Ok(())
    }

    fn job_stats(&self, token: &CancellationToken) -> BoxStream<'static, JobStatusInfo> {
        let shared = Arc::clone(&self.shared);

        // Walk the insertion index one record at a time so the store is
        // never locked for the whole scan.
        stream::unfold(0u64, move |cursor| {
            let shared = Arc::clone(&shared);
            async move {
                let store = shared.store.read().await;
                let (seq, info) = store.order.range(cursor..).find_map(|(seq, id)| {
                    store
                        .jobs
                        .get(id)
                        .map(|entry| (*seq, JobStatusInfo::from(&entry.record)))
                })?;
                Some((info, seq + 1))
            }
        })
        .take_until(token.clone().cancelled_owned())
        .boxed()
    }
}
