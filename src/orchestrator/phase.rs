//! The six fixed phases an issue moves through.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A step of the per-issue pipeline. Executed strictly in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SelectionSetup,
    ContextPlanning,
    Implementation,
    QualityChecks,
    ReviewCycle,
    CiAndPr,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::SelectionSetup,
        Phase::ContextPlanning,
        Phase::Implementation,
        Phase::QualityChecks,
        Phase::ReviewCycle,
        Phase::CiAndPr,
    ];

    /// 1-based position in the pipeline.
    pub fn number(&self) -> u8 {
        match self {
            Phase::SelectionSetup => 1,
            Phase::ContextPlanning => 2,
            Phase::Implementation => 3,
            Phase::QualityChecks => 4,
            Phase::ReviewCycle => 5,
            Phase::CiAndPr => 6,
        }
    }

    pub fn from_number(number: u8) -> Option<Phase> {
        Phase::ALL.iter().copied().find(|p| p.number() == number)
    }

    /// The phase that follows, or `None` after the last one.
    pub fn next(&self) -> Option<Phase> {
        Phase::from_number(self.number() + 1)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::SelectionSetup => "Selection & Setup",
            Phase::ContextPlanning => "Context & Planning",
            Phase::Implementation => "Implementation",
            Phase::QualityChecks => "Quality Checks",
            Phase::ReviewCycle => "Review Cycle",
            Phase::CiAndPr => "CI & PR",
        }
    }

    /// Whether failures in this phase draw on the shared iteration budget.
    pub fn consumes_budget(&self) -> bool {
        self.number() >= 3
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase {} ({})", self.number(), self.name())
    }
}
