//! Worker actor for executing jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::{Driver, DriverError};
use queue_core::{DependencyState, Job};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio_util::sync::CancellationToken;

use crate::messages::WorkerMessage;
use crate::runner::JobSource;

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID.
    pub worker_id: String,
    /// Where jobs come from.
    pub source: Arc<dyn JobSource>,
    /// Cancelled when the queue shuts down.
    pub token: CancellationToken,
    /// Back-off between polls when no job is available.
    pub poll_interval: Duration,
    /// Job currently being processed.
    pub current_job: Option<String>,
    /// Jobs this worker ran to completion.
    pub completed: u64,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub source: Arc<dyn JobSource>,
    pub token: CancellationToken,
    pub poll_interval: Duration,
}

enum RunOutcome {
    Finished,
    Cancelled,
    LeaseLost(DriverError),
}

/// Renew the lease until it is refused. Only returns on failure.
async fn keep_lease(
    driver: &dyn Driver,
    token: &CancellationToken,
    id: &str,
    owner: &str,
    every: Duration,
) -> DriverError {
    loop {
        tokio::time::sleep(every).await;
        if let Err(e) = driver.lock(token, id, owner).await {
            return e;
        }
    }
}

fn schedule_poll(myself: &ActorRef<WorkerMessage>, after: Duration) {
    let myself = myself.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        // The worker may have stopped in the meantime.
        let _ = myself.send_message(WorkerMessage::Poll);
    });
}

impl WorkerActorState {
    fn owner(&self, driver: &dyn Driver) -> String {
        format!("{}/{}", driver.id(), self.worker_id)
    }

    /// Whether the worker is between jobs.
    pub fn is_idle(&self) -> bool {
        self.current_job.is_none()
    }

    async fn process(&mut self, candidate: Box<dyn Job>) {
        self.current_job = Some(candidate.id().to_string());
        self.process_job(candidate).await;
        self.current_job = None;
    }

    /// Lock, run, persist and release one job. Contention and job failures
    /// are absorbed here; the worker keeps going either way.
    async fn process_job(&mut self, candidate: Box<dyn Job>) {
        let Some(driver) = self.source.driver() else {
            return;
        };
        if candidate.status().is_finished() {
            return;
        }

        let token = self.token.clone();
        let id = candidate.id().to_string();
        let owner = self.owner(driver.as_ref());

        match driver.lock(&token, &id, &owner).await {
            Ok(()) => {}
            Err(e) if e.is_contention() => {
                tracing::debug!("Worker {} skipped job {}: {}", self.worker_id, id, e);
                return;
            }
            Err(e) => {
                tracing::warn!("Worker {} failed to lock job {}: {}", self.worker_id, id, e);
                return;
            }
        }

        // Work from the latest stored copy, not the dispatched snapshot.
        let Some(mut job) = driver.get(&token, &id).await else {
            self.release(driver.as_ref(), &id, &owner).await;
            return;
        };
        if job.status().is_finished() {
            self.release(driver.as_ref(), &id, &owner).await;
            return;
        }

        match self.dependency_state(driver.as_ref(), job.as_ref()).await {
            DependencyState::Ready => {}
            DependencyState::Passed => {
                tracing::debug!("Job {} dependency already satisfied, marking complete", id);
                job.base_mut().status.completed = true;
                self.persist(driver.as_ref(), job.as_ref()).await;
                self.release(driver.as_ref(), &id, &owner).await;
                return;
            }
            state => {
                tracing::debug!("Job {} not runnable yet ({})", id, state);
                self.release(driver.as_ref(), &id, &owner).await;
                return;
            }
        }

        let mut time_info = job.time_info();
        time_info.mark_dispatched(Utc::now());
        job.set_time_info(time_info);
        // Only this attempt's errors are kept.
        job.base_mut().error = None;

        tracing::debug!("Worker {} running job {}", self.worker_id, id);

        let renew_every = driver.lock_timeout() / 2;
        let outcome = tokio::select! {
            _ = token.cancelled() => RunOutcome::Cancelled,
            e = keep_lease(driver.as_ref(), &token, &id, &owner, renew_every) => RunOutcome::LeaseLost(e),
            _ = job.run(&token) => RunOutcome::Finished,
        };

        match outcome {
            RunOutcome::Finished => {}
            RunOutcome::Cancelled => {
                // Leave the lock to expire; nothing about this attempt is saved.
                tracing::debug!("Worker {} abandoned job {} on shutdown", self.worker_id, id);
                return;
            }
            RunOutcome::LeaseLost(e) => {
                tracing::warn!("Worker {} lost the lease on job {}: {}", self.worker_id, id, e);
                return;
            }
        }

        let mut time_info = job.time_info();
        time_info.end = Some(Utc::now());
        job.set_time_info(time_info);

        let failure = job.error().map(str::to_string);
        match failure {
            None => job.base_mut().status.completed = true,
            Some(error) => {
                tracing::info!("Job {} failed: {}", id, error);
                job.base_mut().status.failed = true;
            }
        }

        if self.persist(driver.as_ref(), job.as_ref()).await && job.status().completed {
            self.completed += 1;
        }
        self.release(driver.as_ref(), &id, &owner).await;
    }

    async fn dependency_state(&self, driver: &dyn Driver, job: &dyn Job) -> DependencyState {
        let mut edges = HashMap::new();
        for edge in job.dependency().edges() {
            let completed = driver
                .get(&self.token, edge)
                .await
                .map(|j| j.status().completed);
            edges.insert(edge.as_str(), completed);
        }
        job.dependency()
            .state(|edge| edges.get(edge).copied().flatten())
    }

    async fn persist(&self, driver: &dyn Driver, job: &dyn Job) -> bool {
        match driver.save(&self.token, job).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Worker {} failed to save job {}: {}", self.worker_id, job.id(), e);
                false
            }
        }
    }

    async fn release(&self, driver: &dyn Driver, id: &str, owner: &str) {
        if let Err(e) = driver.unlock(&self.token, id, owner).await {
            tracing::warn!("Worker {} failed to unlock job {}: {}", self.worker_id, id, e);
        }
    }
}

/// Worker actor that pulls jobs from a [`JobSource`] and executes them.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        // Start the work loop
        myself.send_message(WorkerMessage::Poll)?;

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            source: args.source,
            token: args.token,
            poll_interval: args.poll_interval,
            current_job: None,
            completed: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                if state.token.is_cancelled() {
                    myself.stop(None);
                    return Ok(());
                }

                let token = state.token.clone();
                let next = tokio::select! {
                    _ = token.cancelled() => None,
                    job = state.source.next(&token) => job,
                };

                match next {
                    Some(job) => {
                        state.process(job).await;
                        let _ = myself.send_message(WorkerMessage::Poll);
                    }
                    None => schedule_poll(&myself, state.poll_interval),
                }
            }

            WorkerMessage::IsIdle { reply } => {
                // Messages are handled one at a time, so a busy worker only
                // answers once its job is done; callers bound the wait.
                let _ = reply.send(state.is_idle());
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down worker: {}", state.worker_id);
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            "Worker {} stopped after completing {} jobs",
            state.worker_id,
            state.completed
        );
        Ok(())
    }
}
