//! Retry / escalation controller.
//!
//! A single [`IterationBudget`] is shared by Phases 3-6 of one issue. Every
//! failed attempt in any of those phases is recorded against it with a
//! structured reason; once the recorded failures reach the limit the
//! controller stops forward progress and returns an [`Escalation`].
//! Successful attempts never refund budget.

use crate::collaborators::TimedOut;
use crate::issue::IssueId;
use crate::orchestrator::phase::Phase;
use crate::util::tail_lines;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

/// Artifact key holding the number of failures already charged to the budget.
pub const BUDGET_ARTIFACT: &str = "budget.failures";

/// Prefix of artifact keys holding serialized failure reasons.
pub const FAILURE_ARTIFACT_PREFIX: &str = "failure.";

/// Lines of diagnostics shown when an escalation is rendered.
const DISPLAY_TAIL_LINES: usize = 20;

/// What kind of check or collaborator produced a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Lint,
    Test,
    Build,
    AcceptanceCriterion,
    Review,
    Ci,
    Generation,
    Timeout,
    Collaborator,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Lint => "lint",
            FailureKind::Test => "test",
            FailureKind::Build => "build",
            FailureKind::AcceptanceCriterion => "acceptance_criterion",
            FailureKind::Review => "review",
            FailureKind::Ci => "ci",
            FailureKind::Generation => "generation",
            FailureKind::Timeout => "timeout",
            FailureKind::Collaborator => "collaborator",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured reason for one failed phase action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub phase: Phase,
    pub kind: FailureKind,
    /// One-line description, e.g. "cargo test exited with 101"
    pub summary: String,
    /// Bounded tail of the tool output (lint output, test log, CI excerpt)
    pub diagnostics: String,
    pub at: DateTime<Utc>,
}

impl AttemptFailure {
    pub fn new(
        phase: Phase,
        kind: FailureKind,
        summary: impl Into<String>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            kind,
            summary: summary.into(),
            diagnostics: diagnostics.into(),
            at: Utc::now(),
        }
    }

    /// A collaborator call that exceeded its timeout.
    pub fn timeout(phase: Phase, what: &str, secs: u64) -> Self {
        Self::new(
            phase,
            FailureKind::Timeout,
            format!("{} timed out after {}s", what, secs),
            String::new(),
        )
    }

    /// A collaborator call that returned an error or timed out.
    pub fn collaborator(phase: Phase, what: &str, err: &anyhow::Error) -> Self {
        if let Some(timed_out) = err.downcast_ref::<TimedOut>() {
            return Self::timeout(phase, &timed_out.what, timed_out.secs);
        }
        Self::new(
            phase,
            FailureKind::Collaborator,
            format!("{} failed", what),
            format!("{:#}", err),
        )
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.phase.number(), self.kind, self.summary)
    }
}

/// Terminal failure for one issue: automated repair is abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub issue_id: IssueId,
    pub phase: Phase,
    /// Attempts made before giving up
    pub attempts: u32,
    /// Every failure recorded for the issue, oldest first
    pub failures: Vec<AttemptFailure>,
    pub escalated_at: DateTime<Utc>,
}

impl Escalation {
    pub fn new(issue_id: IssueId, phase: Phase, attempts: u32, failures: Vec<AttemptFailure>) -> Self {
        Self {
            issue_id,
            phase,
            attempts,
            failures,
            escalated_at: Utc::now(),
        }
    }

    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.failures.last()
    }

    /// Tail of the most recent failure's diagnostic output.
    pub fn last_diagnostics(&self) -> String {
        self.last_failure()
            .map(|f| tail_lines(&f.diagnostics, DISPLAY_TAIL_LINES))
            .unwrap_or_default()
    }

    /// Markdown body used when the escalation is filed with the tracker.
    pub fn report(&self) -> String {
        let mut body = format!(
            "Automated resolution of {} stopped in {} after {} attempt(s).\n\n",
            self.issue_id, self.phase, self.attempts
        );
        body.push_str("## Failures\n\n");
        for (i, failure) in self.failures.iter().enumerate() {
            body.push_str(&format!("{}. {}\n", i + 1, failure));
        }
        let tail = self.last_diagnostics();
        if !tail.is_empty() {
            body.push_str("\n## Last diagnostics\n\n```\n");
            body.push_str(&tail);
            body.push_str("\n```\n");
        }
        body
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Escalation required for issue {} in {} after {} attempt(s)",
            self.issue_id, self.phase, self.attempts
        )?;
        if let Some(last) = self.last_failure() {
            write!(f, ": {}", last.summary)?;
            let tail = self.last_diagnostics();
            if !tail.is_empty() {
                write!(f, "\n--- last diagnostics ---\n{}", tail)?;
            }
        }
        Ok(())
    }
}

/// Outcome of a single attempt that did not exhaust the budget.
#[derive(Debug)]
pub enum Attempt<T> {
    Succeeded(T),
    /// The attempt failed but budget remains; the caller repairs and retries.
    Failed(AttemptFailure),
}

/// Shared failure budget for Phases 3-6 of one issue.
#[derive(Debug, Clone)]
pub struct IterationBudget {
    limit: u32,
    failures: Vec<AttemptFailure>,
}

impl IterationBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            failures: Vec::new(),
        }
    }

    /// Restore a budget from checkpoint artifacts.
    ///
    /// The failure count comes from `budget.failures`; failure reasons that
    /// cannot be decoded are skipped, the count is still honoured.
    pub fn from_artifacts(limit: u32, artifacts: &BTreeMap<String, String>) -> Self {
        let mut failures: Vec<(u32, AttemptFailure)> = artifacts
            .iter()
            .filter_map(|(key, value)| {
                let n = key.strip_prefix(FAILURE_ARTIFACT_PREFIX)?.parse::<u32>().ok()?;
                let failure = serde_json::from_str::<AttemptFailure>(value).ok()?;
                Some((n, failure))
            })
            .collect();
        failures.sort_by_key(|(n, _)| *n);
        let mut failures: Vec<AttemptFailure> = failures.into_iter().map(|(_, f)| f).collect();

        let used = artifacts
            .get(BUDGET_ARTIFACT)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(failures.len());
        failures.truncate(used);
        while failures.len() < used {
            failures.push(AttemptFailure::new(
                Phase::Implementation,
                FailureKind::Collaborator,
                "failure reason not recorded",
                String::new(),
            ));
        }

        Self { limit, failures }
    }

    /// Write the counter and failure reasons into checkpoint artifacts.
    pub fn write_artifacts(&self, artifacts: &mut BTreeMap<String, String>) {
        artifacts.insert(BUDGET_ARTIFACT.to_string(), self.used().to_string());
        for (i, failure) in self.failures.iter().enumerate() {
            if let Ok(json) = serde_json::to_string(failure) {
                artifacts.insert(format!("{}{}", FAILURE_ARTIFACT_PREFIX, i + 1), json);
            }
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn used(&self) -> u32 {
        self.failures.len() as u32
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used())
    }

    pub fn is_exhausted(&self) -> bool {
        self.used() >= self.limit
    }

    pub fn failures(&self) -> &[AttemptFailure] {
        &self.failures
    }

    /// Charge one failure. Returns true when this exhausts the budget.
    pub fn record(&mut self, failure: AttemptFailure) -> bool {
        self.failures.push(failure);
        self.is_exhausted()
    }
}

/// Runs phase actions against the shared budget of one issue.
#[derive(Debug, Clone)]
pub struct RetryController {
    issue: IssueId,
    budget: IterationBudget,
}

impl RetryController {
    pub fn new(issue: IssueId, budget: IterationBudget) -> Self {
        Self { issue, budget }
    }

    pub fn budget(&self) -> &IterationBudget {
        &self.budget
    }

    /// Run one attempt of `action` for `phase`.
    ///
    /// Returns `Err(Escalation)` without running the action if the budget
    /// is already spent, or when the failure just recorded spends it.
    pub async fn attempt<T, F, Fut>(&mut self, phase: Phase, action: F) -> Result<Attempt<T>, Escalation>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
    {
        if self.budget.is_exhausted() {
            return Err(self.escalate(phase));
        }

        match action().await {
            Ok(value) => Ok(Attempt::Succeeded(value)),
            Err(failure) => {
                tracing::warn!(
                    issue = %self.issue,
                    phase = phase.number(),
                    kind = %failure.kind,
                    used = self.budget.used() + 1,
                    limit = self.budget.limit(),
                    "Attempt failed: {}",
                    failure.summary
                );
                if self.budget.record(failure.clone()) {
                    Err(self.escalate(phase))
                } else {
                    Ok(Attempt::Failed(failure))
                }
            }
        }
    }

    fn escalate(&self, phase: Phase) -> Escalation {
        Escalation::new(
            self.issue,
            phase,
            self.budget.used(),
            self.budget.failures().to_vec(),
        )
    }
}
