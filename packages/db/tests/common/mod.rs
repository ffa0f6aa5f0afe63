use std::sync::Arc;
use std::time::Duration;

use db::{DbConfig, Driver, DriverError, DriverOptions, SurrealDriver};
use queue_core::{CancellationToken, JobRegistry};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Open a driver over a fresh in-memory SurrealDB instance.
pub async fn setup_driver(options: DriverOptions) -> Result<SurrealDriver, DriverError> {
    init_tracing();
    let registry = Arc::new(JobRegistry::with_defaults());
    let driver = SurrealDriver::with_options(DbConfig::memory(), options, registry);
    driver.open(&CancellationToken::new()).await?;
    Ok(driver)
}

pub fn long_window() -> DriverOptions {
    DriverOptions::default().with_dispatch_window(Duration::from_secs(60))
}
