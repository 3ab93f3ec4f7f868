//! Knowledge Base: history of completed issues and the patterns derived
//! from it.
//!
//! | Submodule | What it owns                                              |
//! |-----------|-----------------------------------------------------------|
//! | `base`    | `KnowledgeEntry`, `Patterns`, `KnowledgeBase` persistence |
//! | `display` | `display_entries()`, `display_patterns()`                 |
//!
//! Patterns feed the adjusted estimate surfaced by selection. They never
//! influence ordering.

pub mod base;
pub mod display;

pub use base::{KnowledgeBase, KnowledgeEntry, Patterns};
pub use display::{display_entries, display_patterns};
