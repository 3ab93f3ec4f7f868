//! Selection of the next unit of work.
//!
//! - `scoring` - pure impact score over explicit sub-scores
//! - `engine` - duplicate closure, blocker gating, ranking

pub mod engine;
pub mod scoring;

pub use engine::{ScoredIssue, Selection, SelectionEngine, duplicate_close_message};
pub use scoring::{ImpactScorer, ImpactWeights, SubScores};
