//! Dependency graph over the issue backlog.
//!
//! ## Architecture
//!
//! 1. **Builder** - Constructs the blocks/blocked-by DAG from the issues the
//!    tracker returns and rejects cycles
//! 2. **Duplicates** - Groups open issues that describe the same work
//!
//! The graph is rebuilt from live tracker data at the start of every
//! selection cycle and never persisted.
//!
//! ## Example
//!
//! ```
//! use conductor::dag::GraphBuilder;
//! use conductor::issue::Issue;
//!
//! let issues = vec![
//!     Issue::new(24, "acme/app", "Upgrade session store"),
//!     Issue::new(25, "acme/app", "Persist login session").with_blockers(&[24]),
//! ];
//! let (graph, duplicates) = GraphBuilder::new(issues).build().unwrap();
//! assert!(graph.has_edge(24.into(), 25.into()));
//! assert!(duplicates.is_empty());
//! ```

mod builder;
mod duplicates;

pub use builder::{DependencyGraph, Edge, GraphBuilder};
pub use duplicates::{DuplicateDetector, DuplicateGroup, DuplicateWeights, Similarity};
