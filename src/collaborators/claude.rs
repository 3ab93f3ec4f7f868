//! Text generation through the `claude` CLI.
//!
//! The generator runs in the working copy with edit permissions, so a
//! "generate code" request changes files on disk and returns a summary.
//! The prompt and its context are written to stdin.

use super::TextGenerator;
use crate::util::{tail_lines, truncate_str};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub struct ClaudeGenerator {
    command: String,
    args: Vec<String>,
    workdir: PathBuf,
}

impl ClaudeGenerator {
    pub fn new(command: &str, args: &[String], workdir: &Path) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            workdir: workdir.to_path_buf(),
        }
    }

    /// Prompt followed by as much context as the budget allows.
    pub fn compose(prompt: &str, context: &str, budget: usize) -> String {
        if context.trim().is_empty() {
            return prompt.to_string();
        }
        let room = budget.saturating_sub(prompt.chars().count());
        format!("{}\n\n## Context\n\n{}", prompt, truncate_str(context, room))
    }
}

#[async_trait]
impl TextGenerator for ClaudeGenerator {
    async fn generate(&self, prompt: &str, context: &str, budget: usize) -> Result<String> {
        let input = Self::compose(prompt, context, budget);
        tracing::debug!(
            command = %self.command,
            input_chars = input.len(),
            "Invoking generator"
        );

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn generator: {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .context("Failed to write prompt to generator stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for generator")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Generator exited with {}: {}",
                output.status.code().unwrap_or(-1),
                tail_lines(stderr.trim(), 20)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
