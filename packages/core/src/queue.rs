//! Queue configuration and statistics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::JobStatusInfo;

/// Configuration for queue behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of local workers in the default runner.
    pub workers: usize,
    /// How long the dispatch loop and idle workers wait before polling again.
    pub poll_interval_ms: u64,
    /// Capacity of the hand-off channel between the dispatch loop and workers.
    pub dispatch_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval_ms: 50,
            dispatch_buffer: 16,
        }
    }
}

impl QueueConfig {
    /// Set the number of local workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn dispatch_buffer(&self) -> usize {
        self.dispatch_buffer.max(1)
    }
}

/// Aggregate counts over every job in a driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub total: u64,
    /// Not completed and not locked.
    pub pending: u64,
    /// Locked and not finished.
    pub running: u64,
    pub completed: u64,
    /// Gave up after an attempt recorded an error.
    pub failed: u64,
}

impl Stats {
    /// Count one job.
    pub fn record(&mut self, info: &JobStatusInfo) {
        self.total += 1;
        if info.completed {
            self.completed += 1;
        } else if info.failed {
            self.failed += 1;
        } else if info.in_progress {
            self.running += 1;
        } else {
            self.pending += 1;
        }
    }

    /// Jobs not yet finished.
    pub fn active(&self) -> u64 {
        self.pending + self.running
    }

    /// Whether every known job has finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        self.total == self.completed + self.failed
    }
}

impl<'a> FromIterator<&'a JobStatusInfo> for Stats {
    fn from_iter<I: IntoIterator<Item = &'a JobStatusInfo>>(iter: I) -> Self {
        let mut stats = Stats::default();
        for info in iter {
            stats.record(info);
        }
        stats
    }
}
