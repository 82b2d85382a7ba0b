//! Retryable execution of external commands.
//!
//! Every cloud operation the provisioner performs goes through [`CommandRunner::run`].
//! A run captures stdout, stderr and the exit code of each attempt, retries with a
//! fixed delay, and on exhaustion either hands the last result back to the caller
//! (`suppress_errors`) or fails with [`ProvisionError::CommandFailed`].

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::{ProvisionError, ProvisionResult};

/// Exit code reported when a command could not be spawned at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn is_success(&self, require_output: bool) -> bool {
        self.exit_code == 0 && (!require_output || !self.stdout.is_empty())
    }

    /// Stdout with trailing whitespace removed, the way gcloud `value(...)` output is consumed.
    pub fn trimmed_stdout(&self) -> &str {
        self.stdout.trim_end()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub require_output: bool,
    pub suppress_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            require_output: false,
            suppress_errors: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts,
            retry_delay,
            ..Self::default()
        }
    }

    pub fn single_attempt(self) -> Self {
        Self {
            max_attempts: 1,
            ..self
        }
    }

    pub fn requiring_output(self) -> Self {
        Self {
            require_output: true,
            ..self
        }
    }

    pub fn suppressing_errors(self) -> Self {
        Self {
            suppress_errors: true,
            ..self
        }
    }
}

/// Executes one attempt of a command.
///
/// An `Err` means the command could not be started; a command that ran and failed
/// is reported through the exit code of the returned [`CommandResult`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> anyhow::Result<CommandResult>;
}

/// Runs commands through `sh -c`.
#[derive(Clone, Debug, Default)]
pub struct ShellExecutor;

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str) -> anyhow::Result<CommandResult> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawn `{command}`"))?;
        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }
}

#[derive(Clone)]
pub struct CommandRunner {
    executor: Arc<dyn CommandExecutor>,
    defaults: RetryPolicy,
}

impl CommandRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>, defaults: RetryPolicy) -> Self {
        Self { executor, defaults }
    }

    pub fn shell(defaults: RetryPolicy) -> Self {
        Self::new(Arc::new(ShellExecutor), defaults)
    }

    /// Policy applied by steps that do not override anything.
    pub fn defaults(&self) -> RetryPolicy {
        self.defaults
    }

    pub async fn run_default(&self, command: &str) -> ProvisionResult<CommandResult> {
        self.run(command, self.defaults).await
    }

    pub async fn run(&self, command: &str, policy: RetryPolicy) -> ProvisionResult<CommandResult> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            debug!(attempt, command, "executing command");
            let result = match self.executor.execute(command).await {
                Ok(result) => result,
                Err(err) => CommandResult::new("", format!("{err:#}"), SPAWN_FAILURE_EXIT_CODE),
            };
            debug!(attempt, stdout = %result.stdout, "stdout");
            debug!(attempt, stderr = %result.stderr, "stderr");
            debug!(attempt, exit_code = result.exit_code, "return code");

            if result.is_success(policy.require_output) {
                return Ok(result);
            }
            if attempt < max_attempts {
                attempt += 1;
                tokio::time::sleep(policy.retry_delay).await;
                continue;
            }
            if policy.suppress_errors {
                return Ok(result);
            }
            debug!(command, stderr = %result.stderr.trim(), "final attempt stderr");
            error!(command, exit_code = result.exit_code, "Failed to execute command");
            return Err(ProvisionError::command_failed(
                command,
                result.exit_code,
                &result.stderr,
            ));
        }
    }
}
