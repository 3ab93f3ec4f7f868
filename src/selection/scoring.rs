//! Impact scoring.
//!
//! Scoring weights (configurable, must sum to 1.0):
//! - Value: 35%
//! - Urgency (priority): 25%
//! - Unblock count, normalised: 20%
//! - Risk retired: 10%
//! - Effort, inverted: 10%
//!
//! Every sub-score lies in [0, 1], so the impact score does too.

use crate::issue::Issue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sub-score used when no label maps to a value or risk score.
const NEUTRAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImpactWeights {
    #[serde(default = "default_value_weight")]
    pub value: f64,
    #[serde(default = "default_urgency_weight")]
    pub urgency: f64,
    #[serde(default = "default_unblock_weight")]
    pub unblock: f64,
    #[serde(default = "default_risk_weight")]
    pub risk: f64,
    #[serde(default = "default_effort_weight")]
    pub effort: f64,
}

fn default_value_weight() -> f64 {
    0.35
}

fn default_urgency_weight() -> f64 {
    0.25
}

fn default_unblock_weight() -> f64 {
    0.20
}

fn default_risk_weight() -> f64 {
    0.10
}

fn default_effort_weight() -> f64 {
    0.10
}

impl Default for ImpactWeights {
    fn default() -> Self {
        Self {
            value: default_value_weight(),
            urgency: default_urgency_weight(),
            unblock: default_unblock_weight(),
            risk: default_risk_weight(),
            effort: default_effort_weight(),
        }
    }
}

impl ImpactWeights {
    pub fn sum(&self) -> f64 {
        self.value + self.urgency + self.unblock + self.risk + self.effort
    }
}

/// Sub-scores of one issue. `effort` is normalised, not yet inverted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubScores {
    pub value: f64,
    pub urgency: f64,
    pub unblock: f64,
    pub risk: f64,
    pub effort: f64,
}

impl SubScores {
    /// Weighted sum; smaller effort scores higher.
    pub fn impact(&self, weights: &ImpactWeights) -> f64 {
        weights.value * self.value
            + weights.urgency * self.urgency
            + weights.unblock * self.unblock
            + weights.risk * self.risk
            + weights.effort * (1.0 - self.effort)
    }
}

/// Computes sub-scores from issue fields and label maps.
#[derive(Debug, Clone)]
pub struct ImpactScorer {
    pub weights: ImpactWeights,
    pub value_labels: BTreeMap<String, f64>,
    pub risk_labels: BTreeMap<String, f64>,
    pub effort_ceiling_hours: f64,
    pub default_estimate_hours: f64,
}

impl Default for ImpactScorer {
    fn default() -> Self {
        let selection = crate::config::SelectionSection::default();
        Self::from_settings(&selection)
    }
}

impl ImpactScorer {
    pub fn from_settings(selection: &crate::config::SelectionSection) -> Self {
        Self {
            weights: selection.impact.clone(),
            value_labels: lowercase_keys(&selection.value_labels),
            risk_labels: lowercase_keys(&selection.risk_labels),
            effort_ceiling_hours: selection.effort_ceiling_hours,
            default_estimate_hours: selection.default_estimate_hours,
        }
    }

    /// Estimate used for scoring and adjustment; falls back to the default
    /// when the issue carries none.
    pub fn base_estimate(&self, issue: &Issue) -> f64 {
        if issue.estimated_hours.is_finite() && issue.estimated_hours > 0.0 {
            issue.estimated_hours
        } else {
            self.default_estimate_hours
        }
    }

    pub fn sub_scores(&self, issue: &Issue, unblock_count: usize, max_unblock: usize) -> SubScores {
        let unblock = if max_unblock == 0 {
            0.0
        } else {
            unblock_count as f64 / max_unblock as f64
        };

        let effort = if self.effort_ceiling_hours > 0.0 {
            (self.base_estimate(issue) / self.effort_ceiling_hours).min(1.0)
        } else {
            1.0
        };

        SubScores {
            value: label_score(issue, &self.value_labels),
            urgency: issue.priority.urgency(),
            unblock: clamp_unit(unblock),
            risk: label_score(issue, &self.risk_labels),
            effort: clamp_unit(effort),
        }
    }

    pub fn score(&self, issue: &Issue, unblock_count: usize, max_unblock: usize) -> f64 {
        self.sub_scores(issue, unblock_count, max_unblock)
            .impact(&self.weights)
    }
}

fn lowercase_keys(map: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    map.iter()
        .map(|(k, v)| (k.to_lowercase(), clamp_unit(*v)))
        .collect()
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}

/// Highest mapped score among the issue's labels, neutral if none map.
fn label_score(issue: &Issue, map: &BTreeMap<String, f64>) -> f64 {
    issue
        .labels
        .iter()
        .filter_map(|label| map.get(&label.to_lowercase()).copied())
        .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))))
        .unwrap_or(NEUTRAL_SCORE)
}
