//! Dependency predicates evaluated before a job runs.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Outcome of evaluating a job's dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyState {
    /// The job should run now.
    Ready,
    /// The job's work is already done; mark it completed without running.
    Passed,
    /// Waiting on other jobs.
    Blocked,
    /// The predicate could not be evaluated.
    Unresolved,
}

impl fmt::Display for DependencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyState::Ready => write!(f, "ready"),
            DependencyState::Passed => write!(f, "passed"),
            DependencyState::Blocked => write!(f, "blocked"),
            DependencyState::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// Predicate that decides whether a job may run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dependency {
    /// Always ready.
    #[default]
    Always,
    /// Ready once every job listed in `edges` is completed.
    Edges { edges: Vec<String> },
    /// Passed when `path` exists, ready otherwise.
    CreatesFile { path: PathBuf },
}

impl Dependency {
    pub fn after(edges: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Dependency::Edges {
            edges: edges.into_iter().map(Into::into).collect(),
        }
    }

    pub fn creates_file(path: impl AsRef<Path>) -> Self {
        Dependency::CreatesFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Ids of the jobs this one waits on.
    pub fn edges(&self) -> &[String] {
        match self {
            Dependency::Edges { edges } => edges,
            _ => &[],
        }
    }

    /// Evaluate the predicate. `is_completed` reports the completion of
    /// an edge, or `None` when the edge job is unknown.
    pub fn state(&self, is_completed: impl Fn(&str) -> Option<bool>) -> DependencyState {
        match self {
            Dependency::Always => DependencyState::Ready,
            Dependency::Edges { edges } => {
                let mut blocked = false;
                for edge in edges {
                    match is_completed(edge) {
                        Some(true) => {}
                        Some(false) => blocked = true,
                        None => return DependencyState::Unresolved,
                    }
                }
                if blocked {
                    DependencyState::Blocked
                } else {
                    DependencyState::Ready
                }
            }
            Dependency::CreatesFile { path } => {
                if path.exists() {
                    DependencyState::Passed
                } else {
                    DependencyState::Ready
                }
            }
        }
    }
}
