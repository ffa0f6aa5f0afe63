//! Runners execute the jobs a queue dispatches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use db::Driver;
use queue_core::{Job, QueueConfig};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorRef};
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::messages::WorkerMessage;
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// What a runner pulls work from. Implemented by the queue.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// The next dispatched job, if one arrives within a poll interval.
    async fn next(&self, token: &CancellationToken) -> Option<Box<dyn Job>>;

    /// The driver jobs are locked and saved through.
    fn driver(&self) -> Option<Arc<dyn Driver>>;
}

/// A pool that executes jobs pulled from a [`JobSource`].
#[async_trait]
pub trait Runner: Send + Sync {
    /// Number of concurrent workers.
    fn size(&self) -> usize;

    fn started(&self) -> bool;

    /// Start the workers. They stop when `token` is cancelled. Starting a
    /// started runner is a no-op.
    async fn start(
        &self,
        token: &CancellationToken,
        source: Arc<dyn JobSource>,
    ) -> Result<(), RunnerError>;
}

/// Fixed-size pool of in-process worker actors.
pub struct LocalWorkers {
    size: usize,
    poll_interval: Duration,
    started: AtomicBool,
    workers: Mutex<Vec<ActorRef<WorkerMessage>>>,
}

impl LocalWorkers {
    pub fn new(size: usize) -> Self {
        Self::from_config(&QueueConfig::default().with_workers(size))
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            size: config.workers,
            poll_interval: config.poll_interval(),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn workers(&self) -> Vec<ActorRef<WorkerMessage>> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of workers not currently running a job.
    pub async fn idle(&self) -> usize {
        let mut idle = 0;
        for worker in self.workers() {
            let result = ractor::rpc::call(
                &worker,
                |reply| WorkerMessage::IsIdle { reply },
                Some(self.poll_interval * 4),
            )
            .await;
            if let Ok(CallResult::Success(true)) = result {
                idle += 1;
            }
        }
        idle
    }

    /// Ask every worker to stop after its current job.
    pub fn shutdown(&self) {
        for worker in self.workers() {
            let _ = worker.send_message(WorkerMessage::Shutdown);
        }
    }
}

#[async_trait]
impl Runner for LocalWorkers {
    fn size(&self) -> usize {
        self.size
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn start(
        &self,
        token: &CancellationToken,
        source: Arc<dyn JobSource>,
    ) -> Result<(), RunnerError> {
        if self.size == 0 {
            return Err(RunnerError::WorkersMustBePositive);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut spawned = Vec::with_capacity(self.size);
        for i in 0..self.size {
            let args = WorkerArgs {
                worker_id: format!("worker-{i}"),
                source: Arc::clone(&source),
                token: token.clone(),
                poll_interval: self.poll_interval,
            };
            match Actor::spawn(None, WorkerActor, args).await {
                Ok((worker, _handle)) => spawned.push(worker),
                Err(e) => {
                    for worker in spawned {
                        worker.stop(None);
                    }
                    self.started.store(false, Ordering::SeqCst);
                    return Err(RunnerError::Spawn(e.to_string()));
                }
            }
        }

        // Idle workers may be parked on a delayed poll; stop them promptly.
        let watched = spawned.clone();
        let token = token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            for worker in watched {
                worker.stop(None);
            }
        });

        tracing::info!("Started {} local workers", self.size);
        *self.workers.lock().unwrap_or_else(PoisonError::into_inner) = spawned;
        Ok(())
    }
}
