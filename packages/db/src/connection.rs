//! Connection settings for the SurrealDB driver.

use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;

use crate::driver::DriverError;

/// SurrealDB handle over whichever engine the endpoint selects.
pub type Database = Surreal<Any>;

/// Where the SurrealDB driver keeps its jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Connection endpoint: "mem://", "file://path", "ws://host:port", ...
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    /// Table holding one row per job.
    pub table: String,
    /// Root credentials, for servers that require them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "jobqueue".to_string(),
            database: "main".to_string(),
            table: "job".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Embedded in-memory store. Each connection gets its own data.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Embedded store persisted under `path`.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("file://{}", path.into()),
            ..Default::default()
        }
    }

    /// Embedded RocksDB store. Needs the `rocksdb` feature.
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the job table.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Sign in as root before selecting the namespace.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// The table name is spliced into schema statements, so it must be a
    /// plain identifier.
    pub fn validate(&self) -> Result<(), DriverError> {
        let valid = !self.table.is_empty()
            && !self.table.starts_with(|c: char| c.is_ascii_digit())
            && self
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(())
        } else {
            Err(DriverError::InvalidConfig(format!(
                "table name must be an identifier: {:?}",
                self.table
            )))
        }
    }
}

/// Open a connection and select the namespace and database.
pub async fn connect_db(config: &DbConfig) -> Result<Database, DriverError> {
    tracing::info!("Connecting to database: {}", config.endpoint);

    let db = connect(&config.endpoint)
        .await
        .map_err(|e| DriverError::Connection(e.to_string()))?;

    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }

    db.use_ns(&config.namespace).use_db(&config.database).await?;

    tracing::info!(
        "Connected to database: {}/{}",
        config.namespace,
        config.database
    );

    Ok(db)
}
