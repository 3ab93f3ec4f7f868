//! External collaborators the orchestrator consumes but never re-implements.
//!
//! | Trait            | Adapter                      | Backed by                       |
//! |------------------|------------------------------|---------------------------------|
//! | `IssueTracker`   | [`github::GitHubTracker`]    | GitHub REST API via `reqwest`   |
//! | `VersionControl` | [`git::GitRepository`]       | `git2` + the `git` CLI          |
//! | `TestRunner`     | [`process::ShellRunner`]     | `sh -c` under `tokio::process`  |
//! | `TextGenerator`  | [`claude::ClaudeGenerator`]  | the `claude` CLI                |
//!
//! Every call the orchestrator makes goes through [`call_with_timeout`], so
//! a hung collaborator surfaces as a [`TimedOut`] error instead of a hang.

pub mod claude;
pub mod git;
pub mod github;
pub mod process;

use crate::issue::{CheckResult, Issue, IssueId, IssueState, PullRequest};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How a pull request's branch is folded into the base branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeStrategy::Squash => "squash",
            MergeStrategy::Merge => "merge",
            MergeStrategy::Rebase => "rebase",
        };
        write!(f, "{}", s)
    }
}

/// Fields for a new pull request.
#[derive(Debug, Clone)]
pub struct PullRequestDraft {
    pub issue: IssueId,
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
}

/// Issue-tracking service, bound to one repository.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn list_issues(&self, repo: &str, state: IssueState) -> Result<Vec<Issue>>;

    async fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<IssueId>;

    /// Close an issue, leaving `message` as its closing comment.
    async fn close_issue(&self, id: IssueId, message: &str) -> Result<()>;

    async fn get_pr_for_issue(&self, id: IssueId) -> Result<Option<PullRequest>>;

    async fn open_pull_request(&self, draft: &PullRequestDraft) -> Result<PullRequest>;

    async fn list_required_checks(&self, pr: &PullRequest) -> Result<Vec<CheckResult>>;
}

/// Version-control service for the working copy.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Create `name` from `base` and check it out.
    async fn create_branch(&self, base: &str, name: &str) -> Result<()>;

    /// Whether `name` exists on the remote.
    async fn branch_exists(&self, name: &str) -> Result<bool>;

    /// Commit `paths` (a directory commits everything under it). Returns the
    /// new commit sha, or `None` if there was nothing to commit.
    async fn commit(&self, paths: &[String], message: &str) -> Result<Option<String>>;

    async fn commit_exists(&self, sha: &str) -> Result<bool>;

    async fn push(&self, branch: &str) -> Result<()>;

    /// Unified diff for a revision range such as `main...HEAD`.
    async fn diff(&self, range: &str) -> Result<String>;

    /// Paths touched in a revision range.
    async fn changed_paths(&self, range: &str) -> Result<Vec<String>>;

    async fn merge(&self, pr: &PullRequest, strategy: MergeStrategy) -> Result<()>;
}

/// Result of one command run by the test-execution service.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Both streams, stderr last, for diagnostics.
    pub fn combined_tail(&self) -> String {
        match (self.stdout_tail.is_empty(), self.stderr_tail.is_empty()) {
            (true, _) => self.stderr_tail.clone(),
            (false, true) => self.stdout_tail.clone(),
            (false, false) => format!("{}\n{}", self.stdout_tail, self.stderr_tail),
        }
    }
}

/// Test-execution service: lint, unit, integration and build commands alike.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<CommandOutput>;
}

/// Text-generation service used for plans and code changes.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, context: &str, budget: usize) -> Result<String>;
}

/// The four collaborators a run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub tracker: Arc<dyn IssueTracker>,
    pub vcs: Arc<dyn VersionControl>,
    pub runner: Arc<dyn TestRunner>,
    pub generator: Arc<dyn TextGenerator>,
}

/// A collaborator call that did not finish within its timeout.
#[derive(Debug, Error)]
#[error("{what} timed out after {secs}s")]
pub struct TimedOut {
    pub what: String,
    pub secs: u64,
}

/// Await `fut`, failing with [`TimedOut`] once `limit` elapses.
pub async fn call_with_timeout<T, F>(what: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TimedOut {
            what: what.to_string(),
            secs: limit.as_secs(),
        }
        .into()),
    }
}

/// Whether an error chain is a collaborator timeout.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TimedOut>().is_some()
}
