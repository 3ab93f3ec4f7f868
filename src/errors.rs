//! Typed error hierarchy for the orchestrator.
//!
//! Two top-level enums:
//! - `ConfigurationError`: fatal, never retried (cyclic graph, stale or
//!   malformed checkpoint, unknown explicit issue)
//! - `OrchestratorError`: everything that bubbles past the orchestrator
//!   boundary for one issue
//!
//! Single failed attempts are not errors here: they are
//! [`AttemptFailure`](crate::orchestrator::AttemptFailure) values consumed
//! by the retry controller, and only surface as part of an escalation.

use crate::issue::IssueId;
use crate::orchestrator::Escalation;
use std::path::PathBuf;
use thiserror::Error;

fn format_ids(ids: &[IssueId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Fatal configuration problems. Reported, never silently repaired.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Cycle detected in issue dependencies. Involved issues: [{}]", format_ids(.issues))]
    CyclicDependency { issues: Vec<IssueId> },

    #[error("Stale checkpoint for issue {issue}: {reason}")]
    StaleCheckpoint { issue: IssueId, reason: String },

    #[error("Invalid checkpoint at {path}: {message}")]
    InvalidCheckpoint { path: PathBuf, message: String },

    #[error("No checkpoint found for issue {issue}")]
    MissingCheckpoint { issue: IssueId },

    #[error("Issue {issue} already has a checkpoint; continue it with `conductor resume`")]
    CheckpointExists { issue: IssueId },

    #[error("Issue {issue} not found in {repo}")]
    UnknownIssue { issue: IssueId, repo: String },

    #[error("Issue {issue} is already closed")]
    IssueClosed { issue: IssueId },

    #[error("Invalid knowledge base at {path}: {message}")]
    InvalidKnowledgeBase { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidSettings(String),
}

/// Errors that halt the run for the current issue.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("{0}")]
    EscalationRequired(Box<Escalation>),

    #[error("Checkpoint store at {path} is owned by another orchestrator instance")]
    StoreLocked { path: PathBuf },

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// The escalation carried by this error, if any.
    pub fn escalation(&self) -> Option<&Escalation> {
        match self {
            OrchestratorError::EscalationRequired(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, OrchestratorError::Configuration(_))
    }
}

impl From<Escalation> for OrchestratorError {
    fn from(escalation: Escalation) -> Self {
        OrchestratorError::EscalationRequired(Box::new(escalation))
    }
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;
