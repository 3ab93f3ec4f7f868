use crate::errors::{ConfigurationError, OrchestratorResult};
use crate::issue::IssueId;
use crate::util::write_atomic;
use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Multiplier at or below which a completion counts as a success factor.
const SUCCESS_MULTIPLIER: f64 = 1.0;

/// Multiplier above which a completion counts as a risk factor.
const RISK_MULTIPLIER: f64 = 1.25;

/// Cap on the number of success / risk factors kept in the patterns.
const MAX_FACTORS: usize = 10;

/// One completed issue. Never mutated after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeEntry {
    pub issue_id: IssueId,
    pub estimated_hours: f64,
    pub actual_hours: f64,
    /// actual / estimated
    pub multiplier: f64,
    pub completed_at: DateTime<Utc>,
    pub notes: String,
}

/// Aggregates derived from every entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Patterns {
    /// Arithmetic mean of all multipliers; 1.0 with no history
    pub avg_time_multiplier: f64,
    pub success_factors: Vec<String>,
    pub risk_factors: Vec<String>,
}

impl Default for Patterns {
    fn default() -> Self {
        Self {
            avg_time_multiplier: 1.0,
            success_factors: Vec::new(),
            risk_factors: Vec::new(),
        }
    }
}

impl Patterns {
    /// Recompute from the full history. No decay.
    pub fn from_entries(entries: &[KnowledgeEntry]) -> Self {
        if entries.is_empty() {
            return Self::default();
        }

        let avg_time_multiplier =
            entries.iter().map(|e| e.multiplier).sum::<f64>() / entries.len() as f64;

        Self {
            avg_time_multiplier,
            success_factors: factors(entries, |m| m <= SUCCESS_MULTIPLIER),
            risk_factors: factors(entries, |m| m > RISK_MULTIPLIER),
        }
    }

    /// Estimate scaled by historical accuracy.
    pub fn adjust_estimate(&self, estimated_hours: f64) -> f64 {
        estimated_hours * self.avg_time_multiplier
    }
}

/// Distinct non-empty notes of matching entries, most recent first.
fn factors(entries: &[KnowledgeEntry], matches: impl Fn(f64) -> bool) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for entry in entries.iter().rev() {
        let note = entry.notes.trim();
        if note.is_empty() || !matches(entry.multiplier) {
            continue;
        }
        if !result.iter().any(|existing| existing == note) {
            result.push(note.to_string());
        }
        if result.len() == MAX_FACTORS {
            break;
        }
    }
    result
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct KnowledgeFile {
    entries: Vec<KnowledgeEntry>,
    patterns: Patterns,
}

/// Append-only history of completed issues plus derived patterns.
#[derive(Debug)]
pub struct KnowledgeBase {
    path: PathBuf,
    entries: Vec<KnowledgeEntry>,
    patterns: Patterns,
}

impl KnowledgeBase {
    /// Load from `path`, or start empty if the file does not exist.
    ///
    /// Stored patterns are ignored and recomputed from the entries.
    pub fn open(path: &Path) -> OrchestratorResult<Self> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                entries: Vec::new(),
                patterns: Patterns::default(),
            });
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read knowledge base: {}", path.display()))?;
        let file: KnowledgeFile =
            serde_json::from_str(&content).map_err(|e| ConfigurationError::InvalidKnowledgeBase {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let patterns = Patterns::from_entries(&file.entries);
        Ok(Self {
            path: path.to_path_buf(),
            entries: file.entries,
            patterns,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[KnowledgeEntry] {
        &self.entries
    }

    pub fn patterns(&self) -> &Patterns {
        &self.patterns
    }

    /// Whether `issue_id` already has an entry completed at or after `since`.
    pub fn has_entry_since(&self, issue_id: IssueId, since: DateTime<Utc>) -> bool {
        self.entries
            .iter()
            .any(|e| e.issue_id == issue_id && e.completed_at >= since)
    }

    /// Append an entry, recompute patterns and persist both.
    pub fn record(
        &mut self,
        issue_id: IssueId,
        estimated_hours: f64,
        actual_hours: f64,
        notes: &str,
    ) -> anyhow::Result<&KnowledgeEntry> {
        if !estimated_hours.is_finite() || estimated_hours <= 0.0 {
            bail!(
                "Estimated hours for {} must be positive, got {}",
                issue_id,
                estimated_hours
            );
        }
        if !actual_hours.is_finite() || actual_hours < 0.0 {
            bail!(
                "Actual hours for {} must be non-negative, got {}",
                issue_id,
                actual_hours
            );
        }

        let entry = KnowledgeEntry {
            issue_id,
            estimated_hours,
            actual_hours,
            multiplier: actual_hours / estimated_hours,
            completed_at: Utc::now(),
            notes: notes.trim().to_string(),
        };

        let mut entries = self.entries.clone();
        entries.push(entry);
        let patterns = Patterns::from_entries(&entries);
        Self::persist(&self.path, &entries, &patterns)?;

        self.entries = entries;
        self.patterns = patterns;

        tracing::info!(
            issue = %issue_id,
            estimated_hours,
            actual_hours,
            avg_time_multiplier = self.patterns.avg_time_multiplier,
            "Knowledge entry recorded"
        );

        self.entries
            .last()
            .context("Knowledge entry missing after append")
    }

    fn persist(path: &Path, entries: &[KnowledgeEntry], patterns: &Patterns) -> anyhow::Result<()> {
        let file = KnowledgeFile {
            entries: entries.to_vec(),
            patterns: patterns.clone(),
        };
        let json = serde_json::to_string_pretty(&file).context("Failed to serialize knowledge base")?;
        write_atomic(path, &json)
    }
}
