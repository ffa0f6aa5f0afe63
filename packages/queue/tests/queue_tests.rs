mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{MockJob, fast_options, memory_driver, runs};
use db::{Driver, DriverOptions};
use futures_util::StreamExt;
use queue::{
    JobSource, LocalWorkers, Queue, QueueError, Runner, RunnerError, wait_for_job, wait_interval,
};
use queue_core::{CancellationToken, Dependency, Job, ShellJob};

const TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(20);

fn queue_with(driver: Arc<dyn Driver>, workers: usize) -> Arc<Queue> {
    let queue = Arc::new(Queue::new(workers));
    queue.set_driver(driver).unwrap();
    queue
}

/// Runner that never manages to start.
struct BrokenRunner;

#[async_trait]
impl Runner for BrokenRunner {
    fn size(&self) -> usize {
        1
    }

    fn started(&self) -> bool {
        false
    }

    async fn start(
        &self,
        _token: &CancellationToken,
        _source: Arc<dyn JobSource>,
    ) -> Result<(), RunnerError> {
        Err(RunnerError::Spawn("no workers available".into()))
    }
}

async fn wait_done(token: &CancellationToken, queue: &Queue) {
    let done = tokio::time::timeout(TIMEOUT, wait_interval(token, queue, POLL))
        .await
        .expect("queue did not drain in time");
    assert!(done);
}

#[tokio::test]
async fn test_new_queue_has_no_driver() {
    let queue = Queue::new(2);
    assert!(queue.driver().is_none());
    assert!(queue.runner().is_some());
    assert!(!queue.started());
}

#[tokio::test]
async fn test_start_requires_driver_and_runner() {
    let token = CancellationToken::new();

    let queue = Arc::new(Queue::new(1));
    let err = queue.start(&token).await.unwrap_err();
    assert!(matches!(err, QueueError::NotConfigured("driver")));

    queue
        .set_driver(Arc::new(memory_driver(DriverOptions::default())))
        .unwrap();
    queue.set_runner(None).unwrap();
    let err = queue.start(&token).await.unwrap_err();
    assert!(matches!(err, QueueError::NotConfigured("runner")));
    assert!(!queue.started());
}

#[tokio::test]
async fn test_configuration_frozen_after_start() {
    let token = CancellationToken::new();
    let driver = Arc::new(memory_driver(DriverOptions::default()));
    let queue = queue_with(driver.clone(), 1);

    let custom: Arc<dyn Runner> = Arc::new(LocalWorkers::new(2));
    queue.set_runner(Some(custom)).unwrap();
    assert_eq!(queue.runner().unwrap().size(), 2);

    queue.start(&token).await.unwrap();
    assert!(queue.started());

    let err = queue.set_runner(Some(Arc::new(LocalWorkers::new(4)))).unwrap_err();
    assert!(matches!(err, QueueError::AlreadyStarted));
    let err = queue.set_driver(Arc::new(driver.peer())).unwrap_err();
    assert!(matches!(err, QueueError::AlreadyStarted));
    assert_eq!(queue.runner().unwrap().size(), 2);

    token.cancel();
}

#[tokio::test]
async fn test_put_counts_jobs() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(DriverOptions::default())), 1);

    assert_eq!(queue.stats(&token).await.total, 0);
    for _ in 0..5 {
        queue.put(&token, &MockJob::new()).await.unwrap();
    }

    let stats = queue.stats(&token).await;
    assert_eq!(stats.total, 5);
    assert_eq!(stats.pending, 5);
    assert_eq!(stats.completed, 0);
}

#[tokio::test]
async fn test_put_without_driver_fails() {
    let token = CancellationToken::new();
    let queue = Queue::new(1);

    let err = queue.put(&token, &MockJob::new()).await.unwrap_err();
    assert!(matches!(err, QueueError::NotConfigured("driver")));
    assert!(queue.get(&token, "missing").await.is_none());
    assert_eq!(queue.stats(&token).await.total, 0);
    assert_eq!(queue.job_stats(&token).count().await, 0);
}

#[tokio::test]
async fn test_get() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(DriverOptions::default())), 1);

    assert!(queue.get(&token, "mock-missing").await.is_none());

    let job = MockJob::sleeping(5);
    queue.put(&token, &job).await.unwrap();

    let fetched = queue.get(&token, job.id()).await.unwrap();
    assert_eq!(fetched.id(), job.id());
    assert_eq!(fetched.downcast_ref::<MockJob>().unwrap().sleep_ms, 5);

    let doubled = format!("{}{}", job.id(), job.id());
    assert!(queue.get(&token, &doubled).await.is_none());
}

#[tokio::test]
async fn test_shell_job_round_trip() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(DriverOptions::default())), 1);

    let job = ShellJob::new("echo hello", "/tmp");
    queue.put(&token, &job).await.unwrap();

    let fetched = queue.get(&token, job.id()).await.unwrap();
    let shell = fetched.downcast_ref::<ShellJob>().unwrap();
    assert_eq!(shell.id(), job.id());
    assert_eq!(shell.job_type(), job.job_type());
    assert_eq!(shell.command, "echo hello");
    assert_eq!(shell.working_dir, "/tmp");
    assert!(!shell.status().completed);
}

#[tokio::test]
async fn test_shell_job_executes() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(fast_options())), 1);
    queue.start(&token).await.unwrap();

    let job = ShellJob::new("echo hello", "");
    queue.put(&token, &job).await.unwrap();

    let done = tokio::time::timeout(TIMEOUT, wait_for_job(&token, &queue, job.id(), POLL))
        .await
        .unwrap()
        .unwrap();
    let shell = done.downcast_ref::<ShellJob>().unwrap();
    assert_eq!(shell.output.as_deref().map(str::trim), Some("hello"));
    assert!(done.error().is_none());
    assert!(done.time_info().end.is_some());
    assert!(!done.status().in_progress);

    token.cancel();
}

#[tokio::test]
async fn test_repeated_start_runs_each_job_once() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(fast_options())), 4);

    for _ in 0..200 {
        queue.start(&token).await.unwrap();
    }
    assert!(queue.started());

    let jobs: Vec<MockJob> = (0..20).map(|_| MockJob::sleeping(10)).collect();
    for job in &jobs {
        queue.put(&token, job).await.unwrap();
    }

    wait_done(&token, &queue).await;
    for job in &jobs {
        assert_eq!(runs(job.id()), 1, "job {} ran more than once", job.id());
    }

    token.cancel();
}

#[tokio::test]
async fn test_next_skips_locked_jobs() {
    let token = CancellationToken::new();
    let driver = Arc::new(memory_driver(
        DriverOptions::default().with_dispatch_window(Duration::from_secs(60)),
    ));
    let queue = queue_with(driver.clone(), 1);

    let mut locked = HashSet::new();
    let mut unlocked = HashSet::new();
    for i in 0..30 {
        let job = MockJob::new();
        queue.put(&token, &job).await.unwrap();
        if i % 3 == 0 {
            driver.lock(&token, job.id(), "external").await.unwrap();
            locked.insert(job.id().to_string());
        } else {
            unlocked.insert(job.id().to_string());
        }
    }

    queue.dispatch(&token).await.unwrap();

    let mut seen = HashSet::new();
    let drained = tokio::time::timeout(TIMEOUT, async {
        while seen.len() < unlocked.len() {
            if let Some(job) = queue.next(&token).await {
                assert!(seen.insert(job.id().to_string()), "dispatched twice");
            }
        }
    })
    .await;
    assert!(drained.is_ok());
    assert_eq!(seen, unlocked);
    assert!(seen.is_disjoint(&locked));

    // Nothing else is eligible.
    assert!(queue.next(&token).await.is_none());

    let stats = queue.stats(&token).await;
    assert_eq!(stats.total, 30);
    assert_eq!(stats.running, 10);
    assert_eq!(stats.pending, 20);

    token.cancel();
}

#[tokio::test]
async fn test_next_without_dispatch_loop() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(DriverOptions::default())), 1);

    assert!(queue.next(&token).await.is_none());

    let job = MockJob::new();
    queue.put(&token, &job).await.unwrap();

    let next = queue.next(&token).await.unwrap();
    assert_eq!(next.id(), job.id());
    assert!(next.time_info().start.is_some());
    assert!(next.time_info().created.is_some());

    // Stamping happens on the dispatched copy only.
    let stored = queue.get(&token, job.id()).await.unwrap();
    assert!(stored.time_info().is_zero());
}

#[tokio::test]
async fn test_job_stats_lists_every_job() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(DriverOptions::default())), 1);

    let mut ids = HashSet::new();
    for _ in 0..30 {
        let job = MockJob::new();
        ids.insert(job.id().to_string());
        queue.put(&token, &job).await.unwrap();
    }

    let infos: Vec<_> = queue.job_stats(&token).collect().await;
    assert_eq!(infos.len(), 30);
    let seen: HashSet<_> = infos.into_iter().map(|info| info.id).collect();
    assert_eq!(seen, ids);
}

#[tokio::test]
async fn test_cancel_abandons_running_job() {
    let driver = Arc::new(memory_driver(fast_options()));

    let first = CancellationToken::new();
    let queue = queue_with(driver.clone(), 1);
    queue.start(&first).await.unwrap();

    let job = MockJob::sleeping(800);
    queue.put(&first, &job).await.unwrap();

    tokio::time::timeout(TIMEOUT, async {
        while runs(job.id()) == 0 {
            tokio::time::sleep(POLL).await;
        }
    })
    .await
    .unwrap();
    first.cancel();

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let stored = driver.get(&CancellationToken::new(), job.id()).await.unwrap();
    assert!(!stored.status().completed);
    assert_eq!(runs(job.id()), 1);

    // A fresh queue picks the job up once the abandoned lease expires.
    let second = CancellationToken::new();
    let fresh = queue_with(Arc::new(driver.peer()), 1);
    fresh.start(&second).await.unwrap();

    let done = tokio::time::timeout(TIMEOUT, wait_for_job(&second, &fresh, job.id(), POLL))
        .await
        .unwrap()
        .unwrap();
    assert!(done.status().completed);
    assert_eq!(runs(job.id()), 2);

    second.cancel();
}

#[tokio::test]
async fn test_failed_job_is_finished_and_not_retried() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(fast_options())), 1);
    queue.start(&token).await.unwrap();

    let job = MockJob::failing();
    queue.put(&token, &job).await.unwrap();

    wait_done(&token, &queue).await;
    // Several dispatch windows pass without another attempt.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let failed = queue.get(&token, job.id()).await.unwrap();
    assert_eq!(failed.error(), Some("mock failure"));
    assert!(failed.status().failed);
    assert!(!failed.status().completed);
    assert!(!failed.status().in_progress);
    assert_eq!(runs(job.id()), 1);

    let stats = queue.stats(&token).await;
    assert_eq!(stats.failed, 1);
    assert!(stats.is_complete());

    // Clearing the flag retries it; only the new attempt's error is kept.
    let mut retry = failed;
    retry.base_mut().status.failed = false;
    queue.put(&token, retry.as_ref()).await.unwrap();

    wait_done(&token, &queue).await;
    let failed = queue.get(&token, job.id()).await.unwrap();
    assert_eq!(runs(job.id()), 2);
    assert_eq!(failed.error(), Some("mock failure"));

    token.cancel();
}

#[tokio::test]
async fn test_dependency_runs_after_edge() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(fast_options())), 2);

    let first = MockJob::sleeping(200);
    let mut second = MockJob::new();
    second.set_dependency(Dependency::after([first.id()]));

    // Put the dependent job first so it is dispatched first.
    queue.put(&token, &second).await.unwrap();
    queue.put(&token, &first).await.unwrap();
    queue.start(&token).await.unwrap();

    wait_done(&token, &queue).await;

    let first = queue.get(&token, first.id()).await.unwrap();
    let second = queue.get(&token, second.id()).await.unwrap();
    let first_end = first.time_info().end.unwrap();
    let second_start = second.time_info().start.unwrap();
    assert!(second_start >= first_end);
    assert_eq!(runs(second.id()), 1);

    token.cancel();
}

#[tokio::test]
async fn test_zero_workers_fails_to_start() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(DriverOptions::default())), 0);

    let err = queue.start(&token).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::Runner(RunnerError::WorkersMustBePositive)
    ));
    assert!(!queue.started());
    token.cancel();
}

#[tokio::test]
async fn test_competing_queues_share_driver() {
    let token = CancellationToken::new();
    let driver = Arc::new(memory_driver(fast_options()));
    let left = queue_with(driver.clone(), 2);
    let right = queue_with(Arc::new(driver.peer()), 2);
    left.start(&token).await.unwrap();
    right.start(&token).await.unwrap();

    let jobs: Vec<MockJob> = (0..40).map(|_| MockJob::sleeping(5)).collect();
    for (i, job) in jobs.iter().enumerate() {
        let target = if i % 2 == 0 { &left } else { &right };
        target.put(&token, job).await.unwrap();
    }

    wait_done(&token, &left).await;
    for job in &jobs {
        assert_eq!(runs(job.id()), 1);
    }
    assert_eq!(right.stats(&token).await.completed, 40);

    token.cancel();
}

#[tokio::test]
async fn test_local_workers_report_idle() {
    let token = CancellationToken::new();
    let workers = Arc::new(LocalWorkers::new(3));
    let queue = queue_with(Arc::new(memory_driver(DriverOptions::default())), 1);
    queue.set_runner(Some(workers.clone())).unwrap();

    assert!(!workers.started());
    queue.start(&token).await.unwrap();
    assert!(workers.started());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(workers.idle().await, 3);

    token.cancel();
}

#[tokio::test]
async fn test_wait_helpers_stop_on_cancel() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(DriverOptions::default())), 1);

    // An empty queue has nothing left to finish.
    assert!(wait_interval(&token, &queue, POLL).await);

    let job = MockJob::new();
    queue.put(&token, &job).await.unwrap();
    token.cancel();

    assert!(!wait_interval(&token, &queue, POLL).await);
    assert!(wait_for_job(&token, &queue, job.id(), POLL).await.is_none());
}

#[tokio::test]
async fn test_failed_runner_leaves_queue_unstarted() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(fast_options())), 1);
    queue.set_runner(Some(Arc::new(BrokenRunner))).unwrap();

    let err = queue.start(&token).await.unwrap_err();
    assert!(matches!(err, QueueError::Runner(RunnerError::Spawn(_))));
    assert!(!queue.started());

    // Still reconfigurable, and a later start really starts.
    queue.set_runner(Some(Arc::new(LocalWorkers::new(1)))).unwrap();
    queue.start(&token).await.unwrap();
    assert!(queue.started());

    let job = MockJob::new();
    queue.put(&token, &job).await.unwrap();
    wait_done(&token, &queue).await;
    assert_eq!(runs(job.id()), 1);

    token.cancel();
}

#[tokio::test]
async fn test_dispatch_loop_stamps_time_info() {
    let token = CancellationToken::new();
    let queue = queue_with(Arc::new(memory_driver(DriverOptions::default())), 1);

    let job = MockJob::new();
    queue.put(&token, &job).await.unwrap();
    queue.dispatch(&token).await.unwrap();

    let dispatched = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(job) = queue.next(&token).await {
                return job;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(dispatched.id(), job.id());
    let time_info = dispatched.time_info();
    assert!(!time_info.is_zero());
    assert!(time_info.created.is_some());
    assert!(time_info.start.is_some());

    token.cancel();
}

#[tokio::test]
async fn test_local_workers_shutdown() {
    let token = CancellationToken::new();
    let workers = Arc::new(LocalWorkers::new(2));
    let queue = queue_with(Arc::new(memory_driver(DriverOptions::default())), 1);
    queue.set_runner(Some(workers.clone())).unwrap();
    queue.start(&token).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(workers.idle().await, 2);

    workers.shutdown();
    let stopped = tokio::time::timeout(TIMEOUT, async {
        while workers.idle().await > 0 {
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    assert!(stopped.is_ok());

    token.cancel();
}
