#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use db::{DriverOptions, InternalDriver};
use queue_core::{CancellationToken, Job, JobBase, JobKind, JobRegistry, JobType, generate_id};
use serde::{Deserialize, Serialize};

static RUNS: LazyLock<Mutex<HashMap<String, usize>>> = LazyLock::new(Default::default);

/// Number of times the job `id` has started running in this process.
pub fn runs(id: &str) -> usize {
    RUNS.lock().unwrap().get(id).copied().unwrap_or(0)
}

/// Test job that counts its runs, optionally sleeps and optionally fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockJob {
    #[serde(skip)]
    base: JobBase,
    #[serde(default)]
    pub sleep_ms: u64,
    #[serde(default)]
    pub fail: bool,
}

impl MockJob {
    pub fn new() -> Self {
        Self {
            base: JobBase::new(generate_id("mock"), Self::kind()),
            ..Default::default()
        }
    }

    pub fn sleeping(ms: u64) -> Self {
        Self {
            sleep_ms: ms,
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

impl JobKind for MockJob {
    fn kind() -> JobType {
        JobType::new("mock", 0)
    }
}

#[async_trait]
impl Job for MockJob {
    fn base(&self) -> &JobBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut JobBase {
        &mut self.base
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    async fn run(&mut self, _token: &CancellationToken) {
        *RUNS.lock().unwrap().entry(self.id().to_string()).or_default() += 1;
        if self.sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
        }
        if self.fail {
            self.add_error("mock failure".to_string());
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn registry() -> Arc<JobRegistry> {
    let mut registry = JobRegistry::with_defaults();
    registry.register::<MockJob>();
    Arc::new(registry)
}

/// Short dispatch window and lease so retries happen within a test.
pub fn fast_options() -> DriverOptions {
    DriverOptions::default()
        .with_dispatch_window(Duration::from_millis(50))
        .with_lock_timeout(Duration::from_secs(1))
}

pub fn memory_driver(options: DriverOptions) -> InternalDriver {
    init_tracing();
    InternalDriver::with_options(registry(), options)
}
