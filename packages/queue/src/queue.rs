//! The queue: one driver, one runner and the dispatch loop between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use db::Driver;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use queue_core::{Job, JobStatusInfo, QueueConfig, Stats};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, RunnerError};
use crate::runner::{JobSource, LocalWorkers, Runner};

struct Slots {
    driver: Option<Arc<dyn Driver>>,
    runner: Option<Arc<dyn Runner>>,
}

/// A job queue backed by a shared [`Driver`].
///
/// Configure the driver and runner, then [`start`](Queue::start) it. Once
/// started the queue cannot be reconfigured.
pub struct Queue {
    config: QueueConfig,
    slots: Mutex<Slots>,
    started: AtomicBool,
    dispatching: Arc<AtomicBool>,
    sender: mpsc::Sender<Box<dyn Job>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Box<dyn Job>>>,
}

impl Queue {
    /// Create a queue whose default runner has `workers` local workers.
    pub fn new(workers: usize) -> Self {
        Self::with_config(QueueConfig::default().with_workers(workers))
    }

    pub fn with_config(config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.dispatch_buffer());
        let runner: Arc<dyn Runner> = Arc::new(LocalWorkers::from_config(&config));
        Self {
            config,
            slots: Mutex::new(Slots {
                driver: None,
                runner: Some(runner),
            }),
            started: AtomicBool::new(false),
            dispatching: Arc::new(AtomicBool::new(false)),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.slots().driver.clone()
    }

    /// Replace the driver. Fails once the queue has started.
    pub fn set_driver(&self, driver: Arc<dyn Driver>) -> Result<(), QueueError> {
        let mut slots = self.slots();
        if self.started() {
            return Err(QueueError::AlreadyStarted);
        }
        slots.driver = Some(driver);
        Ok(())
    }

    pub fn runner(&self) -> Option<Arc<dyn Runner>> {
        self.slots().runner.clone()
    }

    /// Replace the runner. Fails once the queue has started.
    pub fn set_runner(&self, runner: Option<Arc<dyn Runner>>) -> Result<(), QueueError> {
        let mut slots = self.slots();
        if self.started() {
            return Err(QueueError::AlreadyStarted);
        }
        slots.runner = runner;
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Open the driver, start the runner and start dispatching.
    ///
    /// Calling it on a started queue returns `Ok(())` and does nothing. If
    /// the runner fails to start, the queue is left unstarted.
    pub async fn start(self: &Arc<Self>, token: &CancellationToken) -> Result<(), QueueError> {
        let (driver, runner) = self.configured()?;
        if self.started() {
            return Ok(());
        }
        if runner.size() == 0 {
            return Err(RunnerError::WorkersMustBePositive.into());
        }

        driver.open(token).await?;

        {
            let _slots = self.slots();
            if self.started.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }

        let source: Arc<dyn JobSource> = Arc::clone(self) as Arc<dyn JobSource>;
        if let Err(e) = runner.start(token, source).await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        self.spawn_dispatch(Arc::clone(&driver), token.clone());

        tracing::info!(
            "Queue started on driver {} with {} workers",
            driver.id(),
            runner.size()
        );
        Ok(())
    }

    fn configured(&self) -> Result<(Arc<dyn Driver>, Arc<dyn Runner>), QueueError> {
        let slots = self.slots();
        let driver = slots
            .driver
            .clone()
            .ok_or(QueueError::NotConfigured("driver"))?;
        let runner = slots
            .runner
            .clone()
            .ok_or(QueueError::NotConfigured("runner"))?;
        Ok((driver, runner))
    }

    /// Start only the dispatch loop, without a runner.
    ///
    /// Jobs then reach callers of [`Queue::next`]. At most one dispatch
    /// loop runs per queue; [`Queue::start`] shares it.
    pub async fn dispatch(&self, token: &CancellationToken) -> Result<(), QueueError> {
        let driver = self.driver().ok_or(QueueError::NotConfigured("driver"))?;
        driver.open(token).await?;
        self.spawn_dispatch(driver, token.clone());
        Ok(())
    }

    fn spawn_dispatch(&self, driver: Arc<dyn Driver>, token: CancellationToken) {
        if self.dispatching.swap(true, Ordering::SeqCst) {
            return;
        }
        let sender = self.sender.clone();
        let dispatching = Arc::clone(&self.dispatching);
        let poll_interval = self.config.poll_interval();

        tokio::spawn(async move {
            job_server(driver, sender, token, poll_interval).await;
            dispatching.store(false, Ordering::SeqCst);
        });
    }

    /// Store a job. Its time info is left untouched.
    pub async fn put(&self, token: &CancellationToken, job: &dyn Job) -> Result<(), QueueError> {
        let driver = self.driver().ok_or(QueueError::NotConfigured("driver"))?;
        driver.save(token, job).await?;
        Ok(())
    }

    pub async fn get(&self, token: &CancellationToken, id: &str) -> Option<Box<dyn Job>> {
        self.driver()?.get(token, id).await
    }

    /// The next dispatched job.
    ///
    /// While the dispatch loop runs this waits up to one poll interval for
    /// it to hand over a job. Otherwise it asks the driver directly.
    pub async fn next(&self, token: &CancellationToken) -> Option<Box<dyn Job>> {
        if !self.dispatching.load(Ordering::SeqCst) {
            let mut job = self.driver()?.next(token).await?;
            mark_dispatched(job.as_mut());
            return Some(job);
        }

        tokio::select! {
            _ = token.cancelled() => None,
            _ = tokio::time::sleep(self.config.poll_interval()) => None,
            job = async { self.receiver.lock().await.recv().await } => job,
        }
    }

    /// Counts read straight from the driver.
    pub async fn stats(&self, token: &CancellationToken) -> Stats {
        match self.driver() {
            Some(driver) => driver.stats(token).await,
            None => Stats::default(),
        }
    }

    pub fn job_stats(&self, token: &CancellationToken) -> BoxStream<'static, JobStatusInfo> {
        match self.driver() {
            Some(driver) => driver.job_stats(token),
            None => stream::empty().boxed(),
        }
    }
}

#[async_trait]
impl JobSource for Queue {
    async fn next(&self, token: &CancellationToken) -> Option<Box<dyn Job>> {
        Queue::next(self, token).await
    }

    fn driver(&self) -> Option<Arc<dyn Driver>> {
        Queue::driver(self)
    }
}

fn mark_dispatched(job: &mut dyn Job) {
    let mut time_info = job.time_info();
    time_info.mark_dispatched(Utc::now());
    job.set_time_info(time_info);
}

/// Feed jobs from the driver into the hand-off channel until cancelled.
async fn job_server(
    driver: Arc<dyn Driver>,
    sender: mpsc::Sender<Box<dyn Job>>,
    token: CancellationToken,
    poll_interval: Duration,
) {
    tracing::info!("Dispatch loop started on driver {}", driver.id());

    while !token.is_cancelled() {
        match driver.next(&token).await {
            Some(mut job) => {
                mark_dispatched(job.as_mut());
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = sender.send(job) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    tracing::info!("Dispatch loop stopped on driver {}", driver.id());
}
