//! Per-issue orchestration: the six-phase state machine, its checkpoints
//! and the shared retry budget.

pub mod checkpoint;
pub mod machine;
pub mod phase;
pub mod retry;
pub mod runner;
pub mod state;

pub use checkpoint::Checkpoint;
pub use machine::{PhaseMachine, Resolution};
pub use phase::Phase;
pub use retry::{Attempt, AttemptFailure, Escalation, FailureKind, IterationBudget, RetryController};
pub use runner::{Orchestrator, Preview, RunSummary, StopReason};
pub use state::CheckpointStore;
