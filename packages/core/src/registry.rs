//! Registry that turns persisted records back into live jobs.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::job::{Job, JobRecord, JobType};

/// A job type the registry knows how to decode.
pub trait JobKind: Job + DeserializeOwned + 'static {
    /// Type descriptor stamped on new jobs and checked on decode.
    fn kind() -> JobType;
}

/// Errors raised while decoding a record.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no factory registered for job type: {0}")]
    UnknownType(String),
    #[error("job type {name} is registered at version {expected}, record has version {found}")]
    VersionMismatch {
        name: String,
        expected: u32,
        found: u32,
    },
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Factory building a job from its record.
pub type JobFactory = Arc<dyn Fn(JobRecord) -> Result<Box<dyn Job>, RegistryError> + Send + Sync>;

struct Entry {
    version: u32,
    factory: JobFactory,
}

/// Maps job type names to factories.
///
/// Built once by the application and handed to every driver.
#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<String, Entry>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in job types registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<crate::shell::ShellJob>();
        registry
    }

    /// Register a serde-decodable job type.
    pub fn register<T: JobKind>(&mut self) {
        let kind = T::kind();
        self.register_fn(kind.name, kind.version, |record| {
            let JobRecord { base, payload } = record;
            let mut job: T = serde_json::from_value(payload)?;
            *job.base_mut() = base;
            Ok(Box::new(job) as Box<dyn Job>)
        });
    }

    /// Register a custom factory.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, version: u32, factory: F)
    where
        F: Fn(JobRecord) -> Result<Box<dyn Job>, RegistryError> + Send + Sync + 'static,
    {
        self.factories.insert(
            name.into(),
            Entry {
                version,
                factory: Arc::new(factory),
            },
        );
    }

    /// Decode a record into a live job.
    pub fn build(&self, record: JobRecord) -> Result<Box<dyn Job>, RegistryError> {
        let job_type = &record.base.job_type;
        let entry = self
            .factories
            .get(&job_type.name)
            .ok_or_else(|| RegistryError::UnknownType(job_type.name.clone()))?;

        if entry.version != job_type.version {
            return Err(RegistryError::VersionMismatch {
                name: job_type.name.clone(),
                expected: entry.version,
                found: job_type.version,
            });
        }

        (entry.factory)(record)
    }

    /// Check if a factory exists for a job type.
    pub fn has_type(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// List all registered job types.
    pub fn job_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
