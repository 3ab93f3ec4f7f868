//! Scripted in-memory collaborators for unit tests.

use crate::collaborators::{
    Collaborators, CommandOutput, IssueTracker, MergeStrategy, PullRequestDraft, TestRunner,
    TextGenerator, VersionControl,
};
use crate::issue::{CheckResult, CheckState, Issue, IssueId, IssueState, IssueStatus, PullRequest};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct TrackerState {
    issues: Vec<Issue>,
    closed: Vec<(IssueId, String)>,
    created: Vec<(String, String)>,
    prs: Vec<PullRequest>,
    checks: VecDeque<Vec<CheckResult>>,
    close_failures: u32,
}

/// Issue tracker holding issues in memory.
#[derive(Default)]
pub struct FakeTracker {
    state: Mutex<TrackerState>,
}

impl FakeTracker {
    pub fn new(issues: Vec<Issue>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                issues,
                ..Default::default()
            }),
        }
    }

    /// Queue the check results returned by successive polls. Once the
    /// queue is empty every poll reports a single passing check.
    pub fn script_checks(&self, polls: Vec<Vec<CheckResult>>) {
        self.state.lock().unwrap().checks.extend(polls);
    }

    /// Make the next `count` close requests fail.
    pub fn fail_closes(&self, count: u32) {
        self.state.lock().unwrap().close_failures = count;
    }

    pub fn closed(&self) -> Vec<(IssueId, String)> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn created(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn prs(&self) -> Vec<PullRequest> {
        self.state.lock().unwrap().prs.clone()
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn list_issues(&self, repo: &str, state: IssueState) -> Result<Vec<Issue>> {
        let guard = self.state.lock().unwrap();
        Ok(guard
            .issues
            .iter()
            .filter(|i| i.repo == repo)
            .filter(|i| match state {
                IssueState::Open => i.is_open(),
                IssueState::Closed => !i.is_open(),
                IssueState::All => true,
            })
            .cloned()
            .collect())
    }

    async fn create_issue(&self, title: &str, body: &str, _labels: &[String]) -> Result<IssueId> {
        let mut guard = self.state.lock().unwrap();
        guard.created.push((title.to_string(), body.to_string()));
        Ok(IssueId(1000 + guard.created.len() as u64))
    }

    async fn close_issue(&self, id: IssueId, message: &str) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        if guard.close_failures > 0 {
            guard.close_failures -= 1;
            bail!("502 Bad Gateway closing issue {}", id);
        }
        let Some(issue) = guard.issues.iter_mut().find(|i| i.id == id) else {
            bail!("issue {} not found", id);
        };
        issue.status = IssueStatus::Closed;
        guard.closed.push((id, message.to_string()));
        Ok(())
    }

    async fn get_pr_for_issue(&self, id: IssueId) -> Result<Option<PullRequest>> {
        let guard = self.state.lock().unwrap();
        Ok(guard.prs.iter().find(|pr| pr.issue == id).cloned())
    }

    async fn open_pull_request(&self, draft: &PullRequestDraft) -> Result<PullRequest> {
        let mut guard = self.state.lock().unwrap();
        let number = 500 + guard.prs.len() as u64;
        let pr = PullRequest {
            number,
            issue: draft.issue,
            head_branch: draft.head_branch.clone(),
            base_branch: draft.base_branch.clone(),
            url: format!("https://example.test/pull/{}", number),
        };
        guard.prs.push(pr.clone());
        Ok(pr)
    }

    async fn list_required_checks(&self, _pr: &PullRequest) -> Result<Vec<CheckResult>> {
        let mut guard = self.state.lock().unwrap();
        Ok(guard
            .checks
            .pop_front()
            .unwrap_or_else(|| vec![CheckResult::new("ci", CheckState::Success, "")]))
    }
}

#[derive(Default)]
struct VcsState {
    remote_branches: BTreeSet<String>,
    commits: Vec<String>,
    changed: Vec<String>,
    pushes: Vec<String>,
    merged: Vec<u64>,
    fail_create: bool,
}

/// Version control that records every call.
pub struct FakeVcs {
    state: Mutex<VcsState>,
}

impl Default for FakeVcs {
    fn default() -> Self {
        Self {
            state: Mutex::new(VcsState {
                changed: vec!["src/session.rs".to_string(), "tests/session_test.rs".to_string()],
                ..Default::default()
            }),
        }
    }
}

impl FakeVcs {
    pub fn failing_branch_creation() -> Self {
        let vcs = Self::default();
        vcs.state.lock().unwrap().fail_create = true;
        vcs
    }

    pub fn set_changed_paths(&self, paths: &[&str]) {
        self.state.lock().unwrap().changed = paths.iter().map(|p| p.to_string()).collect();
    }

    pub fn add_remote_branch(&self, name: &str) {
        self.state.lock().unwrap().remote_branches.insert(name.to_string());
    }

    pub fn delete_remote_branch(&self, name: &str) {
        self.state.lock().unwrap().remote_branches.remove(name);
    }

    pub fn add_commit(&self, sha: &str) {
        self.state.lock().unwrap().commits.push(sha.to_string());
    }

    pub fn commits(&self) -> Vec<String> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn merged(&self) -> Vec<u64> {
        self.state.lock().unwrap().merged.clone()
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn create_branch(&self, _base: &str, name: &str) -> Result<()> {
        if self.state.lock().unwrap().fail_create {
            bail!("cannot create branch {}", name);
        }
        Ok(())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().remote_branches.contains(name))
    }

    async fn commit(&self, _paths: &[String], _message: &str) -> Result<Option<String>> {
        let mut guard = self.state.lock().unwrap();
        let sha = format!("{:040x}", guard.commits.len() + 1);
        guard.commits.push(sha.clone());
        Ok(Some(sha))
    }

    async fn commit_exists(&self, sha: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().commits.iter().any(|c| c == sha))
    }

    async fn push(&self, branch: &str) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        guard.remote_branches.insert(branch.to_string());
        guard.pushes.push(branch.to_string());
        Ok(())
    }

    async fn diff(&self, range: &str) -> Result<String> {
        Ok(format!("diff for {}\n+ added line", range))
    }

    async fn changed_paths(&self, _range: &str) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().changed.clone())
    }

    async fn merge(&self, pr: &PullRequest, _strategy: MergeStrategy) -> Result<()> {
        self.state.lock().unwrap().merged.push(pr.number);
        Ok(())
    }
}

/// Command runner with per-command scripted exit codes.
///
/// Unscripted runs succeed.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<BTreeMap<String, VecDeque<i32>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn script(&self, command: &str, exit_codes: &[i32]) {
        self.scripts
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .extend(exit_codes.iter().copied());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TestRunner for ScriptedRunner {
    async fn run(&self, command: &str, _cwd: &Path, _timeout: Duration) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        let exit_code = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(command)
            .and_then(|q| q.pop_front())
            .unwrap_or(0);
        let stderr_tail = if exit_code == 0 {
            String::new()
        } else {
            format!("{} failed with exit code {}", command, exit_code)
        };
        Ok(CommandOutput {
            exit_code,
            stdout_tail: format!("ran {}", command),
            stderr_tail,
            duration: Duration::from_millis(1),
        })
    }
}

/// Generator returning queued responses, then a default verdict.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String>>>,
    prompts: Mutex<Vec<String>>,
    default: String,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            default: "PASS\nVerified against the diff and test output.".to_string(),
        }
    }
}

impl ScriptedGenerator {
    pub fn push(&self, response: Result<String>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, _context: &str, _budget: usize) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(self.default.clone()),
        }
    }
}

/// Fakes plus a `Collaborators` bundle sharing them.
pub struct Fakes {
    pub tracker: Arc<FakeTracker>,
    pub vcs: Arc<FakeVcs>,
    pub runner: Arc<ScriptedRunner>,
    pub generator: Arc<ScriptedGenerator>,
}

impl Fakes {
    pub fn new(issues: Vec<Issue>) -> Self {
        Self::with_vcs(issues, FakeVcs::default())
    }

    pub fn with_vcs(issues: Vec<Issue>, vcs: FakeVcs) -> Self {
        Self {
            tracker: Arc::new(FakeTracker::new(issues)),
            vcs: Arc::new(vcs),
            runner: Arc::new(ScriptedRunner::default()),
            generator: Arc::new(ScriptedGenerator::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            tracker: self.tracker.clone(),
            vcs: self.vcs.clone(),
            runner: self.runner.clone(),
            generator: self.generator.clone(),
        }
    }
}
