//! Job that runs a shell command.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::job::{Job, JobBase, JobType, generate_id};
use crate::registry::JobKind;

/// Runs `command` through `sh -c` and captures its combined output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellJob {
    #[serde(skip)]
    base: JobBase,
    pub command: String,
    /// Directory to run in. Empty means the worker's current directory.
    #[serde(default)]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ShellJob {
    pub fn new(command: impl Into<String>, working_dir: impl Into<String>) -> Self {
        Self {
            base: JobBase::new(generate_id("shell"), Self::kind()),
            command: command.into(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
            output: None,
        }
    }

    /// Add an environment variable for the command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if !self.working_dir.is_empty() {
            cmd.current_dir(&self.working_dir);
        }
        cmd
    }
}

impl JobKind for ShellJob {
    fn kind() -> JobType {
        JobType::new("shell", 0)
    }
}

#[async_trait]
impl Job for ShellJob {
    fn base(&self) -> &JobBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut JobBase {
        &mut self.base
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    async fn run(&mut self, token: &CancellationToken) {
        if self.command.trim().is_empty() {
            self.add_error("empty command".to_string());
            return;
        }

        tracing::debug!("Running shell job {}: {}", self.base.id, self.command);

        // Dropping the output future on cancellation kills the child.
        let mut command = self.build_command();
        let output = tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!("Shell job {} cancelled", self.base.id);
                return;
            }
            output = command.output() => output,
        };

        match output {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                self.output = Some(text);
                if !output.status.success() {
                    self.add_error(format!("command exited with {}", output.status));
                }
            }
            Err(e) => self.add_error(format!("failed to spawn command: {e}")),
        }
    }
}
