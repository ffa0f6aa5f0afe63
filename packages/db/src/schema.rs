//! Database schema definitions using SurrealQL.

use crate::connection::Database;
use crate::driver::DriverError;

/// Create the job table and its indexes if they do not exist yet.
pub async fn init_schema(db: &Database, table: &str) -> Result<(), DriverError> {
    tracing::info!("Initializing job schema on table {}", table);

    db.query(job_schema(table)).await?.check()?;

    tracing::info!("Job schema initialized");

    Ok(())
}

/// Job table schema.
///
/// The persisted job lives under `job`; the remaining fields are storage
/// bookkeeping: `seq` orders jobs by insertion, `lease_ms` is the epoch
/// millisecond of the last lock transition and `dispatched_ms` the last
/// time `next` handed the job out.
fn job_schema(table: &str) -> String {
    format!(
        r#"
DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;

DEFINE FIELD IF NOT EXISTS seq ON {table} TYPE int;
DEFINE FIELD IF NOT EXISTS lease_ms ON {table} TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS dispatched_ms ON {table} TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS job ON {table} TYPE object;

DEFINE INDEX IF NOT EXISTS {table}_seq ON {table} FIELDS seq;
DEFINE INDEX IF NOT EXISTS {table}_pending ON {table} FIELDS job.status.completed, job.priority, seq;
"#
    )
}
