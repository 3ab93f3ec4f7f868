//! Shell-backed test-execution service.

use super::{CommandOutput, TestRunner, TimedOut};
use crate::util::tail_lines;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Runs each command through `sh -c`, keeping only the tail of its output.
pub struct ShellRunner {
    tail: usize,
}

impl ShellRunner {
    pub fn new(tail: usize) -> Self {
        Self { tail }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(40)
    }
}

#[async_trait]
impl TestRunner for ShellRunner {
    async fn run(&self, command: &str, cwd: &Path, limit: Duration) -> Result<CommandOutput> {
        tracing::debug!(command, cwd = %cwd.display(), "Running command");
        let started = Instant::now();

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", command))?;

        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.with_context(|| format!("Failed to wait for: {}", command))?,
            // Dropping the child future kills the process.
            Err(_) => {
                return Err(TimedOut {
                    what: format!("command `{}`", command),
                    secs: limit.as_secs(),
                }
                .into());
            }
        };

        let result = CommandOutput {
            // Killed by a signal has no code.
            exit_code: output.status.code().unwrap_or(-1),
            stdout_tail: tail_lines(&String::from_utf8_lossy(&output.stdout), self.tail),
            stderr_tail: tail_lines(&String::from_utf8_lossy(&output.stderr), self.tail),
            duration: started.elapsed(),
        };
        tracing::debug!(
            command,
            exit_code = result.exit_code,
            elapsed_ms = result.duration.as_millis() as u64,
            "Command finished"
        );
        Ok(result)
    }
}
