//! Issue data model shared by the graph builder, selection engine and phases.
//!
//! Issues are created by the issue tracker. The orchestrator only ever
//! changes `status` (on close) and `blockers` (when edges resolve); every
//! other field is read as-is from the tracker on each selection cycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Tracker-assigned issue number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(pub u64);

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for IssueId {
    fn from(id: u64) -> Self {
        IssueId(id)
    }
}

impl FromStr for IssueId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches('#');
        digits
            .parse::<u64>()
            .map(IssueId)
            .map_err(|_| anyhow::anyhow!("Invalid issue id '{}': expected a number like 42 or #42", s))
    }
}

/// Lifecycle state of an issue as reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    InProgress,
    Closed,
}

impl IssueStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, IssueStatus::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Filter used when listing issues from the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueState {
    Open,
    Closed,
    All,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueState::Open => "open",
            IssueState::Closed => "closed",
            IssueState::All => "all",
        }
    }
}

/// Priority declared on the issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Urgency sub-score in [0, 1] used by impact scoring.
    pub fn urgency(&self) -> f64 {
        match self {
            Priority::Critical => 1.0,
            Priority::High => 0.75,
            Priority::Medium => 0.5,
            Priority::Low => 0.25,
        }
    }

    /// Parse a priority from a tracker label such as `priority:high` or `P1`.
    pub fn from_label(label: &str) -> Option<Self> {
        let lower = label.to_lowercase();
        let value = lower
            .strip_prefix("priority:")
            .or_else(|| lower.strip_prefix("priority/"))
            .unwrap_or(&lower)
            .trim();
        match value {
            "critical" | "p0" => Some(Priority::Critical),
            "high" | "p1" => Some(Priority::High),
            "medium" | "p2" => Some(Priority::Medium),
            "low" | "p3" => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of requested work tracked by the issue tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub id: IssueId,
    pub repo: String,
    pub title: String,
    /// Free-form body. Only used for advisory "blocks #N" edges.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Canonical blocker list. The only trusted source of dependency edges.
    #[serde(default)]
    pub blockers: BTreeSet<IssueId>,
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub estimated_hours: f64,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Files touched by pull requests linked to this issue, if any.
    #[serde(default)]
    pub linked_files: Vec<String>,
}

impl Issue {
    /// Create an open issue with no blockers and medium priority.
    pub fn new(id: u64, repo: &str, title: &str) -> Self {
        Self {
            id: IssueId(id),
            repo: repo.to_string(),
            title: title.to_string(),
            description: String::new(),
            labels: BTreeSet::new(),
            blockers: BTreeSet::new(),
            status: IssueStatus::Open,
            priority: Priority::default(),
            estimated_hours: 0.0,
            acceptance_criteria: Vec::new(),
            linked_files: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_blockers(mut self, blockers: &[u64]) -> Self {
        self.blockers = blockers.iter().copied().map(IssueId).collect();
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_estimate(mut self, hours: f64) -> Self {
        self.estimated_hours = hours;
        self
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_closed()
    }
}

/// A pull request linked to an issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    pub issue: IssueId,
    pub head_branch: String,
    pub base_branch: String,
    #[serde(default)]
    pub url: String,
}

/// State of a single required CI check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Pending,
    Success,
    Failure,
}

/// Result of one required check on a pull request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    pub name: String,
    pub state: CheckState,
    /// Log excerpt or summary reported by the CI provider.
    #[serde(default)]
    pub summary: String,
}

impl CheckResult {
    pub fn new(name: &str, state: CheckState, summary: &str) -> Self {
        Self {
            name: name.to_string(),
            state,
            summary: summary.to_string(),
        }
    }
}
