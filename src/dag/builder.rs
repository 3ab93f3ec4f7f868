//! Dependency graph builder.
//!
//! Turns the flat issue list fetched from the tracker into a directed
//! acyclic graph of "blocks → blocked by" relations. The canonical
//! `blockers` field is the only trusted edge source; relations mentioned in
//! issue descriptions are checked against it and reported when unconfirmed.

use crate::dag::duplicates::{DuplicateDetector, DuplicateGroup};
use crate::errors::ConfigurationError;
use crate::issue::{Issue, IssueId};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static RELATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(blocked\s+by|depends\s+on|blocks)\s+#(\d+)")
        .expect("relation pattern is a valid regex")
});

/// Directed edge: `from` must be closed before `to` is eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub from: IssueId,
    pub to: IssueId,
}

impl Edge {
    pub fn new(from: IssueId, to: IssueId) -> Self {
        Self { from, to }
    }
}

/// Acyclic graph over the open issues of a repository.
///
/// Closed issues are kept for blocker verification but are not nodes.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    issues: BTreeMap<IssueId, Issue>,
    nodes: BTreeSet<IssueId>,
    edges: BTreeSet<Edge>,
    /// Text-derived relations the `blockers` field does not confirm
    unconfirmed_edges: Vec<Edge>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Open issue ids, ascending.
    pub fn nodes(&self) -> impl Iterator<Item = IssueId> + '_ {
        self.nodes.iter().copied()
    }

    /// Open issues, ascending by id.
    pub fn open_issues(&self) -> impl Iterator<Item = &Issue> + '_ {
        self.nodes.iter().filter_map(|id| self.issues.get(id))
    }

    /// Any fetched issue, open or closed.
    pub fn issue(&self, id: IssueId) -> Option<&Issue> {
        self.issues.get(&id)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter()
    }

    pub fn has_edge(&self, from: IssueId, to: IssueId) -> bool {
        self.edges.contains(&Edge::new(from, to))
    }

    pub fn unconfirmed_edges(&self) -> &[Edge] {
        &self.unconfirmed_edges
    }

    /// Open issues directly blocked by `id`.
    pub fn dependents(&self, id: IssueId) -> Vec<IssueId> {
        self.edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| e.to)
            .collect()
    }

    /// True only if the tracker returned `id` and reports it closed.
    ///
    /// A blocker that was not returned at all is unknown, and unknown is
    /// never treated as resolved.
    pub fn is_verified_closed(&self, id: IssueId) -> bool {
        self.issues
            .get(&id)
            .map(|issue| issue.status.is_closed())
            .unwrap_or(false)
    }

    /// Blockers of `id` that are not verifiably closed.
    pub fn open_blockers(&self, id: IssueId) -> Vec<IssueId> {
        self.issues
            .get(&id)
            .map(|issue| {
                issue
                    .blockers
                    .iter()
                    .copied()
                    .filter(|b| !self.is_verified_closed(*b))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether every blocker of `id` is verifiably closed.
    pub fn is_unblocked(&self, id: IssueId) -> bool {
        self.open_blockers(id).is_empty()
    }

    /// Record that a non-canonical duplicate was closed.
    pub fn mark_closed(&mut self, id: IssueId) {
        if let Some(issue) = self.issues.get_mut(&id) {
            issue.status = crate::issue::IssueStatus::Closed;
        }
        self.nodes.remove(&id);
        self.edges.retain(|e| e.from != id && e.to != id);
    }

    /// Nodes in dependency order, ties broken by ascending id.
    pub fn topological_order(&self) -> Vec<IssueId> {
        let mut in_degree: BTreeMap<IssueId, usize> = self.nodes.iter().map(|id| (*id, 0)).collect();
        for edge in &self.edges {
            if let Some(deg) = in_degree.get_mut(&edge.to) {
                *deg += 1;
            }
        }

        let mut ready: BTreeSet<IssueId> = in_degree
            .iter()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for dependent in self.dependents(node) {
                if let Some(deg) = in_degree.get_mut(&dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        order
    }
}

/// Builder for dependency graphs.
pub struct GraphBuilder {
    issues: Vec<Issue>,
    detector: DuplicateDetector,
}

impl GraphBuilder {
    pub fn new(issues: Vec<Issue>) -> Self {
        Self {
            issues,
            detector: DuplicateDetector::default(),
        }
    }

    pub fn with_detector(mut self, detector: DuplicateDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Build the graph and detect duplicates among open issues.
    ///
    /// Fails with `CyclicDependency` if the blocker relation contains a
    /// cycle. No edge is ever dropped to break one.
    pub fn build(self) -> Result<(DependencyGraph, Vec<DuplicateGroup>), ConfigurationError> {
        let mut issues: BTreeMap<IssueId, Issue> = BTreeMap::new();
        for issue in self.issues {
            issues.insert(issue.id, issue);
        }

        let nodes: BTreeSet<IssueId> = issues
            .values()
            .filter(|i| i.is_open())
            .map(|i| i.id)
            .collect();

        let mut edges = BTreeSet::new();
        for id in &nodes {
            if let Some(issue) = issues.get(id) {
                for blocker in &issue.blockers {
                    if nodes.contains(blocker) {
                        edges.insert(Edge::new(*blocker, *id));
                    }
                }
            }
        }

        let unconfirmed_edges = advisory_edges(&issues, &nodes)
            .into_iter()
            .filter(|edge| {
                let confirmed = issues
                    .get(&edge.to)
                    .map(|i| i.blockers.contains(&edge.from))
                    .unwrap_or(false);
                if !confirmed {
                    tracing::warn!(
                        from = %edge.from,
                        to = %edge.to,
                        "Ignoring dependency mentioned in text but absent from blockers"
                    );
                }
                !confirmed
            })
            .collect();

        let graph = DependencyGraph {
            issues,
            nodes,
            edges,
            unconfirmed_edges,
        };

        validate_no_cycles(&graph)?;

        let duplicates = self.detector.detect(graph.open_issues());

        tracing::info!(
            nodes = graph.len(),
            edges = graph.edges.len(),
            unconfirmed = graph.unconfirmed_edges.len(),
            duplicate_groups = duplicates.len(),
            "Dependency graph built"
        );

        Ok((graph, duplicates))
    }
}

/// Relations mentioned in open issue descriptions.
fn advisory_edges(issues: &BTreeMap<IssueId, Issue>, nodes: &BTreeSet<IssueId>) -> BTreeSet<Edge> {
    let mut edges = BTreeSet::new();
    for id in nodes {
        let Some(issue) = issues.get(id) else {
            continue;
        };
        for caps in RELATION_RE.captures_iter(&issue.description) {
            let Some(other) = caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok()) else {
                continue;
            };
            let other = IssueId(other);
            if other == *id {
                continue;
            }
            let relation = caps
                .get(1)
                .map(|m| m.as_str().to_lowercase())
                .unwrap_or_default();
            let edge = if relation.starts_with("blocks") {
                Edge::new(*id, other)
            } else {
                Edge::new(other, *id)
            };
            edges.insert(edge);
        }
    }

    edges
}

/// Validate that the graph has no cycles using Kahn's algorithm.
fn validate_no_cycles(graph: &DependencyGraph) -> Result<(), ConfigurationError> {
    let order = graph.topological_order();
    if order.len() == graph.len() {
        return Ok(());
    }

    let processed: BTreeSet<IssueId> = order.into_iter().collect();
    let issues: Vec<IssueId> = graph
        .nodes()
        .filter(|id| !processed.contains(id))
        .collect();

    tracing::error!(issues = ?issues, "Cycle detected in issue dependencies");
    Err(ConfigurationError::CyclicDependency { issues })
}
