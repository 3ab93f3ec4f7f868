//! Per-issue progress record enabling resume after interruption.
//!
//! The record has a fixed shape: every field is required on load and
//! unknown fields are rejected, so a hand-edited or truncated file is
//! reported instead of silently defaulted.

use crate::issue::IssueId;
use crate::orchestrator::phase::Phase;
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Artifact key listing the commits made for the issue, one sha per line.
pub const COMMITS_ARTIFACT: &str = "commits";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Checkpoint {
    pub issue_id: IssueId,
    /// Phase currently being worked on (the next incomplete one)
    pub phase: Phase,
    /// Completed phases, always a prefix of the pipeline
    pub completed_phases: Vec<Phase>,
    pub branch_name: String,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint_at: DateTime<Utc>,
    /// Phase outputs: plan path, commit shas, PR number, budget counters
    pub artifacts: BTreeMap<String, String>,
}

impl Checkpoint {
    /// A fresh checkpoint for an issue entering Phase 1.
    pub fn new(issue_id: IssueId, branch_name: &str) -> Self {
        let now = Utc::now();
        Self {
            issue_id,
            phase: Phase::SelectionSetup,
            completed_phases: Vec::new(),
            branch_name: branch_name.to_string(),
            started_at: now,
            last_checkpoint_at: now,
            artifacts: BTreeMap::new(),
        }
    }

    pub fn last_completed(&self) -> Option<Phase> {
        self.completed_phases.last().copied()
    }

    /// The phase a resume starts at: `completed_phases.last + 1`.
    pub fn next_phase(&self) -> Option<Phase> {
        match self.last_completed() {
            Some(last) => last.next(),
            None => Some(Phase::SelectionSetup),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.next_phase().is_none()
    }

    pub fn is_phase_complete(&self, phase: Phase) -> bool {
        self.completed_phases.contains(&phase)
    }

    /// Record `phase` as complete. Phases must complete in order.
    pub fn mark_complete(&mut self, phase: Phase) -> Result<()> {
        if self.next_phase() != Some(phase) {
            bail!(
                "Cannot complete {} for issue {}: next incomplete phase is {}",
                phase,
                self.issue_id,
                self.next_phase()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
        }
        self.completed_phases.push(phase);
        self.phase = phase.next().unwrap_or(phase);
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_checkpoint_at = Utc::now();
    }

    pub fn artifact(&self, key: &str) -> Option<&str> {
        self.artifacts.get(key).map(String::as_str)
    }

    pub fn set_artifact(&mut self, key: &str, value: impl Into<String>) {
        self.artifacts.insert(key.to_string(), value.into());
    }

    /// Commits recorded for this issue, oldest first.
    pub fn commits(&self) -> Vec<String> {
        self.artifact(COMMITS_ARTIFACT)
            .map(|v| {
                v.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn push_commit(&mut self, sha: &str) {
        let mut commits = self.commits();
        if !commits.iter().any(|c| c == sha) {
            commits.push(sha.to_string());
        }
        self.set_artifact(COMMITS_ARTIFACT, commits.join("\n"));
    }

    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (i, phase) in self.completed_phases.iter().enumerate() {
            if phase.number() as usize != i + 1 {
                return Err(format!(
                    "completed_phases is out of order: position {} holds {}",
                    i + 1,
                    phase
                ));
            }
        }
        if let Some(next) = self.next_phase()
            && self.phase != next
        {
            return Err(format!(
                "phase {} does not follow completed phases (expected {})",
                self.phase, next
            ));
        }
        if self.branch_name.trim().is_empty() {
            return Err("branch_name is empty".to_string());
        }
        if self.last_checkpoint_at < self.started_at {
            return Err("last_checkpoint_at precedes started_at".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checkpoint_starts_at_phase_one() {
        let cp = Checkpoint::new(IssueId(24), "conductor/issue-24-fix");
        assert_eq!(cp.phase, Phase::SelectionSetup);
        assert_eq!(cp.next_phase(), Some(Phase::SelectionSetup));
        assert!(cp.validate().is_ok());
    }

    #[test]
    fn test_mark_complete_advances_in_order() {
        let mut cp = Checkpoint::new(IssueId(1), "b");
        cp.mark_complete(Phase::SelectionSetup).unwrap();
        cp.mark_complete(Phase::ContextPlanning).unwrap();
        assert_eq!(cp.phase, Phase::Implementation);
        assert_eq!(cp.next_phase(), Some(Phase::Implementation));
        assert!(cp.mark_complete(Phase::QualityChecks).is_err());
    }

    #[test]
    fn test_complete_after_last_phase() {
        let mut cp = Checkpoint::new(IssueId(1), "b");
        for phase in Phase::ALL {
            cp.mark_complete(phase).unwrap();
        }
        assert!(cp.is_complete());
        assert_eq!(cp.phase, Phase::CiAndPr);
        assert!(cp.validate().is_ok());
    }

    #[test]
    fn test_commits_are_deduplicated() {
        let mut cp = Checkpoint::new(IssueId(1), "b");
        cp.push_commit("abc");
        cp.push_commit("def");
        cp.push_commit("abc");
        assert_eq!(cp.commits(), vec!["abc", "def"]);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let cp = Checkpoint::new(IssueId(5), "b");
        let mut value = serde_json::to_value(&cp).unwrap();
        value["surprise"] = serde_json::json!(true);
        let result: std::result::Result<Checkpoint, _> = serde_json::from_value(value);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let json = r#"{"issue_id": 5, "phase": "implementation", "branch_name": "b"}"#;
        let result: std::result::Result<Checkpoint, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_gaps() {
        let mut cp = Checkpoint::new(IssueId(5), "b");
        cp.completed_phases = vec![Phase::SelectionSetup, Phase::Implementation];
        cp.phase = Phase::QualityChecks;
        assert!(cp.validate().is_err());
    }
}
