//! Helpers for waiting on queue progress.

use std::time::Duration;

use queue_core::Job;
use tokio_util::sync::CancellationToken;

use crate::queue::Queue;

/// Poll until every job in the queue has completed or failed.
///
/// Returns `false` if `token` is cancelled first.
pub async fn wait_interval(token: &CancellationToken, queue: &Queue, interval: Duration) -> bool {
    while !token.is_cancelled() {
        if queue.stats(token).await.is_complete() {
            return true;
        }
        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    false
}

/// Poll until the job `id` has completed or failed and return it.
pub async fn wait_for_job(
    token: &CancellationToken,
    queue: &Queue,
    id: &str,
    interval: Duration,
) -> Option<Box<dyn Job>> {
    while !token.is_cancelled() {
        if let Some(job) = queue.get(token, id).await
            && job.status().is_finished()
        {
            return Some(job);
        }
        tokio::select! {
            _ = token.cancelled() => return None,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    None
}
