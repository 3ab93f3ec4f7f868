//! Selection engine.
//!
//! Picks the next issue to work on: closes non-canonical duplicates,
//! filters to issues whose blockers are verifiably closed, ranks them by
//! impact score and returns the head of the list. An explicitly supplied
//! issue bypasses all of that.

use crate::collaborators::{IssueTracker, call_with_timeout};
use crate::dag::{DependencyGraph, DuplicateGroup};
use crate::errors::{ConfigurationError, OrchestratorResult};
use crate::issue::{Issue, IssueId};
use crate::knowledge::Patterns;
use crate::selection::scoring::{ImpactScorer, SubScores};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;

/// An eligible issue with its impact score.
#[derive(Debug, Clone)]
pub struct ScoredIssue {
    pub issue: Issue,
    pub score: f64,
    pub sub_scores: SubScores,
    /// Estimate scaled by the historical multiplier. Never used for ranking.
    pub adjusted_estimate_hours: f64,
}

impl ScoredIssue {
    pub fn id(&self) -> IssueId {
        self.issue.id
    }
}

#[derive(Debug, Clone)]
pub enum Selection {
    Selected(Box<ScoredIssue>),
    /// Nothing is eligible right now. Not an error.
    NoEligibleIssue,
}

impl Selection {
    pub fn issue(&self) -> Option<&ScoredIssue> {
        match self {
            Selection::Selected(scored) => Some(scored),
            Selection::NoEligibleIssue => None,
        }
    }
}

/// Message left on a duplicate when it is closed.
pub fn duplicate_close_message(canonical: IssueId) -> String {
    format!(
        "Closing as a duplicate of {}. Work continues there.",
        canonical
    )
}

pub struct SelectionEngine {
    repo: String,
    scorer: ImpactScorer,
    patterns: Patterns,
    /// Issues owned by a retained checkpoint; they continue only via resume.
    excluded: BTreeSet<IssueId>,
}

impl SelectionEngine {
    pub fn new(repo: &str, scorer: ImpactScorer, patterns: Patterns) -> Self {
        Self {
            repo: repo.to_string(),
            scorer,
            patterns,
            excluded: BTreeSet::new(),
        }
    }

    pub fn with_excluded(mut self, excluded: BTreeSet<IssueId>) -> Self {
        self.excluded = excluded;
        self
    }

    /// Select the next issue.
    ///
    /// Duplicate closure goes through the tracker and is reflected in
    /// `graph` before anything is scored.
    pub async fn select(
        &self,
        graph: &mut DependencyGraph,
        duplicates: &[DuplicateGroup],
        explicit: Option<IssueId>,
        tracker: &dyn IssueTracker,
        timeout: Duration,
    ) -> OrchestratorResult<Selection> {
        if let Some(id) = explicit {
            let scored = self.explicit(graph, id)?;
            tracing::info!(
                issue = %id,
                score = scored.score,
                adjusted_estimate_hours = scored.adjusted_estimate_hours,
                "Selected explicit issue"
            );
            return Ok(Selection::Selected(Box::new(scored)));
        }

        self.close_duplicates(graph, duplicates, tracker, timeout)
            .await?;

        let ranked = self.rank(graph, &[]);
        match ranked.into_iter().next() {
            Some(head) => {
                tracing::info!(
                    issue = %head.id(),
                    score = head.score,
                    adjusted_estimate_hours = head.adjusted_estimate_hours,
                    "Selected issue"
                );
                Ok(Selection::Selected(Box::new(head)))
            }
            None => {
                tracing::info!("No eligible issue");
                Ok(Selection::NoEligibleIssue)
            }
        }
    }

    /// Close every non-canonical member of each group. Returns closed ids.
    pub async fn close_duplicates(
        &self,
        graph: &mut DependencyGraph,
        duplicates: &[DuplicateGroup],
        tracker: &dyn IssueTracker,
        timeout: Duration,
    ) -> OrchestratorResult<Vec<IssueId>> {
        let mut closed = Vec::new();
        for group in duplicates {
            let message = duplicate_close_message(group.canonical);
            for duplicate in group.duplicates() {
                call_with_timeout(
                    "close duplicate issue",
                    timeout,
                    tracker.close_issue(duplicate, &message),
                )
                .await?;
                graph.mark_closed(duplicate);
                tracing::info!(
                    issue = %duplicate,
                    canonical = %group.canonical,
                    "Closed duplicate issue"
                );
                closed.push(duplicate);
            }
        }
        Ok(closed)
    }

    /// Eligible issues ranked by impact, highest first, ties by ascending id.
    ///
    /// Pure: members of `pending_duplicates` that are not canonical are
    /// treated as already closed, which lets a dry run preview selection
    /// without touching the tracker.
    pub fn rank(&self, graph: &DependencyGraph, pending_duplicates: &[DuplicateGroup]) -> Vec<ScoredIssue> {
        let closing: BTreeSet<IssueId> = pending_duplicates
            .iter()
            .flat_map(|g| g.duplicates())
            .collect();

        let eligible: Vec<&Issue> = graph
            .open_issues()
            .filter(|issue| !closing.contains(&issue.id))
            .filter(|issue| !self.excluded.contains(&issue.id))
            .filter(|issue| {
                let blockers = graph.open_blockers(issue.id);
                let gated = blockers.iter().any(|b| !closing.contains(b));
                if gated {
                    tracing::debug!(issue = %issue.id, ?blockers, "Issue is blocked");
                }
                !gated
            })
            .collect();

        let unblock = |id: IssueId| {
            graph
                .dependents(id)
                .into_iter()
                .filter(|d| !closing.contains(d))
                .count()
        };
        let max_unblock = eligible.iter().map(|i| unblock(i.id)).max().unwrap_or(0);

        let mut ranked: Vec<ScoredIssue> = eligible
            .into_iter()
            .map(|issue| self.score(issue, unblock(issue.id), max_unblock))
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id().cmp(&b.id()))
        });
        ranked
    }

    /// Score an explicitly requested issue, bypassing gating and ranking.
    pub fn explicit(&self, graph: &DependencyGraph, id: IssueId) -> Result<ScoredIssue, ConfigurationError> {
        let issue = graph.issue(id).ok_or_else(|| ConfigurationError::UnknownIssue {
            issue: id,
            repo: self.repo.clone(),
        })?;
        if !issue.is_open() {
            return Err(ConfigurationError::IssueClosed { issue: id });
        }
        let max_unblock = graph
            .nodes()
            .map(|n| graph.dependents(n).len())
            .max()
            .unwrap_or(0);
        Ok(self.score(issue, graph.dependents(id).len(), max_unblock))
    }

    fn score(&self, issue: &Issue, unblock_count: usize, max_unblock: usize) -> ScoredIssue {
        let sub_scores = self.scorer.sub_scores(issue, unblock_count, max_unblock);
        ScoredIssue {
            issue: issue.clone(),
            score: sub_scores.impact(&self.scorer.weights),
            sub_scores,
            adjusted_estimate_hours: self
                .patterns
                .adjust_estimate(self.scorer.base_estimate(issue)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::GraphBuilder;
    use crate::issue::Priority;
    use crate::testing::FakeTracker;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn engine() -> SelectionEngine {
        SelectionEngine::new("acme/app", ImpactScorer::default(), Patterns::default())
    }

    fn scenario_issues() -> Vec<Issue> {
        vec![
            Issue::new(24, "acme/app", "Add session store")
                .with_priority(Priority::Critical)
                .with_criteria(&["Sessions persist across restarts"]),
            Issue::new(25, "acme/app", "Login page redirect loop")
                .with_blockers(&[24])
                .with_criteria(&["Login redirects to dashboard", "Logout clears session"]),
            Issue::new(30, "acme/app", "Login page redirect loop")
                .with_blockers(&[24])
                .with_criteria(&["Login redirects to dashboard", "Logout clears session"]),
        ]
    }

    #[tokio::test]
    async fn test_scenario_closes_duplicate_and_selects_unblocked() {
        let tracker = FakeTracker::new(scenario_issues());
        let (mut graph, duplicates) = GraphBuilder::new(scenario_issues()).build().unwrap();

        let selection = engine()
            .select(&mut graph, &duplicates, None, &tracker, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(selection.issue().unwrap().id(), IssueId(24));
        let closed = tracker.closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].0, IssueId(30));
        assert!(closed[0].1.contains("#25"));
        assert!(graph.issue(IssueId(25)).unwrap().is_open());
    }

    #[tokio::test]
    async fn test_duplicate_group_of_three_closes_two() {
        let issues: Vec<Issue> = [7, 3, 9]
            .iter()
            .map(|id| {
                Issue::new(*id, "acme/app", "Crash when saving settings")
                    .with_criteria(&["Saving settings does not crash"])
            })
            .collect();
        let tracker = FakeTracker::new(issues.clone());
        let (mut graph, duplicates) = GraphBuilder::new(issues).build().unwrap();

        let selection = engine()
            .select(&mut graph, &duplicates, None, &tracker, TIMEOUT)
            .await
            .unwrap();

        let closed = tracker.closed();
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|(_, msg)| msg.contains("#3")));
        assert!(closed.iter().all(|(id, _)| *id != IssueId(3)));
        assert_eq!(selection.issue().unwrap().id(), IssueId(3));
    }

    #[tokio::test]
    async fn test_explicit_issue_bypasses_blockers() {
        let tracker = FakeTracker::new(scenario_issues());
        let (mut graph, duplicates) = GraphBuilder::new(scenario_issues()).build().unwrap();

        let selection = engine()
            .select(&mut graph, &duplicates, Some(IssueId(25)), &tracker, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(selection.issue().unwrap().id(), IssueId(25));
        // Explicit selection skips duplicate closure
        assert!(tracker.closed().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_unknown_and_closed_issues() {
        let mut issues = scenario_issues();
        issues[0].status = crate::issue::IssueStatus::Closed;
        let tracker = FakeTracker::new(issues.clone());
        let (mut graph, duplicates) = GraphBuilder::new(issues).build().unwrap();

        let err = engine()
            .select(&mut graph, &duplicates, Some(IssueId(99)), &tracker, TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("#99"));

        let err = engine()
            .select(&mut graph, &duplicates, Some(IssueId(24)), &tracker, TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already closed"));
    }

    #[test]
    fn test_selection_is_deterministic_on_ties() {
        let issues: Vec<Issue> = [12, 4, 8]
            .iter()
            .map(|id| Issue::new(*id, "acme/app", &format!("Unrelated task {}", id * 1000)))
            .collect();
        let (graph, _) = GraphBuilder::new(issues).build().unwrap();
        let engine = engine();

        for _ in 0..10 {
            let ranked = engine.rank(&graph, &[]);
            let ids: Vec<u64> = ranked.iter().map(|s| s.id().0).collect();
            assert_eq!(ids, vec![4, 8, 12]);
        }
    }

    #[test]
    fn test_blocked_issue_is_never_ranked() {
        let issues = vec![
            Issue::new(1, "acme/app", "Foundation").with_priority(Priority::Low),
            Issue::new(2, "acme/app", "Urgent follow-up")
                .with_priority(Priority::Critical)
                .with_labels(&["security"])
                .with_blockers(&[1]),
        ];
        let (graph, _) = GraphBuilder::new(issues).build().unwrap();
        let ranked = engine().rank(&graph, &[]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id(), IssueId(1));
    }

    #[test]
    fn test_blocker_missing_from_tracker_gates_issue() {
        let issues = vec![Issue::new(2, "acme/app", "Needs #1").with_blockers(&[1])];
        let (graph, _) = GraphBuilder::new(issues).build().unwrap();
        assert!(engine().rank(&graph, &[]).is_empty());
    }

    #[test]
    fn test_closed_blocker_unblocks() {
        let mut blocker = Issue::new(1, "acme/app", "Done already");
        blocker.status = crate::issue::IssueStatus::Closed;
        let issues = vec![blocker, Issue::new(2, "acme/app", "Next").with_blockers(&[1])];
        let (graph, _) = GraphBuilder::new(issues).build().unwrap();
        let ranked = engine().rank(&graph, &[]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id(), IssueId(2));
    }

    #[test]
    fn test_excluded_issues_are_skipped() {
        let issues = vec![
            Issue::new(1, "acme/app", "In flight"),
            Issue::new(2, "acme/app", "Fresh"),
        ];
        let (graph, _) = GraphBuilder::new(issues).build().unwrap();
        let engine = engine().with_excluded([IssueId(1)].into_iter().collect());
        let ranked = engine.rank(&graph, &[]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id(), IssueId(2));
    }

    #[test]
    fn test_adjusted_estimate_does_not_change_ranking() {
        let issues = vec![
            Issue::new(1, "acme/app", "Small thing").with_estimate(2.0),
            Issue::new(2, "acme/app", "Large thing").with_estimate(20.0),
        ];
        let (graph, _) = GraphBuilder::new(issues).build().unwrap();

        let plain = engine().rank(&graph, &[]);
        let patterns = Patterns {
            avg_time_multiplier: 3.0,
            ..Patterns::default()
        };
        let calibrated =
            SelectionEngine::new("acme/app", ImpactScorer::default(), patterns).rank(&graph, &[]);

        let ids = |r: &[ScoredIssue]| r.iter().map(|s| s.id()).collect::<Vec<_>>();
        assert_eq!(ids(&plain), ids(&calibrated));
        assert_eq!(calibrated[0].adjusted_estimate_hours, 6.0);
        assert_eq!(plain[0].score, calibrated[0].score);
    }

    #[test]
    fn test_dry_run_rank_previews_duplicate_closure() {
        let (graph, duplicates) = GraphBuilder::new(scenario_issues()).build().unwrap();
        let ranked = engine().rank(&graph, &duplicates);
        let ids: Vec<u64> = ranked.iter().map(|s| s.id().0).collect();
        assert_eq!(ids, vec![24]);
        // Only the canonical duplicate counts toward 24's unblock score
        assert_eq!(ranked[0].sub_scores.unblock, 1.0);
    }
}
