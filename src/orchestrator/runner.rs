//! Top-level run loop: build the graph, select, drive, repeat.

use crate::collaborators::{Collaborators, call_with_timeout};
use crate::config::ConductorConfig;
use crate::dag::{DependencyGraph, DuplicateDetector, DuplicateGroup, Edge, GraphBuilder};
use crate::errors::OrchestratorResult;
use crate::issue::{IssueId, IssueState};
use crate::knowledge::KnowledgeBase;
use crate::orchestrator::machine::{PhaseMachine, Resolution};
use crate::orchestrator::state::CheckpointStore;
use crate::selection::{ImpactScorer, ScoredIssue, Selection, SelectionEngine};
use tracing::Instrument;
use uuid::Uuid;

/// Why a run stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NoEligibleIssue,
    MaxIssues,
    /// The explicitly requested issue was resolved.
    ExplicitDone,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub resolved: Vec<Resolution>,
    pub stop: StopReason,
}

/// Dry-run view of what selection would do, without side effects.
#[derive(Debug, Clone)]
pub struct Preview {
    pub duplicates: Vec<DuplicateGroup>,
    pub ranked: Vec<ScoredIssue>,
    pub unconfirmed_edges: Vec<Edge>,
    /// Issues skipped because a checkpoint already owns them
    pub retained: Vec<IssueId>,
}

pub struct Orchestrator {
    config: ConductorConfig,
    collab: Collaborators,
    machine: PhaseMachine,
}

impl Orchestrator {
    /// Open the state directory and take ownership of the checkpoint store.
    pub fn new(config: ConductorConfig, collab: Collaborators) -> OrchestratorResult<Self> {
        config.ensure_directories()?;
        let store = CheckpointStore::open(&config.checkpoints_dir())?;
        Self::with_store(config, collab, store)
    }

    /// Open without taking the store lock. Only previews are possible.
    pub fn read_only(config: ConductorConfig, collab: Collaborators) -> OrchestratorResult<Self> {
        let store = CheckpointStore::open_read_only(&config.checkpoints_dir());
        Self::with_store(config, collab, store)
    }

    fn with_store(
        config: ConductorConfig,
        collab: Collaborators,
        store: CheckpointStore,
    ) -> OrchestratorResult<Self> {
        let knowledge = KnowledgeBase::open(&config.knowledge_file())?;
        let machine = PhaseMachine::new(config.clone(), collab.clone(), store, knowledge);
        Ok(Self {
            config,
            collab,
            machine,
        })
    }

    pub fn machine(&self) -> &PhaseMachine {
        &self.machine
    }

    /// Resolve issues one at a time until nothing is eligible.
    ///
    /// An explicit issue is resolved on its own and ends the run. Any error,
    /// escalations included, stops the run with the checkpoint retained.
    pub async fn run(
        &mut self,
        explicit: Option<IssueId>,
        max_issues: Option<usize>,
    ) -> OrchestratorResult<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("run", run_id = %run_id);
        self.run_loop(run_id.clone(), explicit, max_issues)
            .instrument(span)
            .await
    }

    async fn run_loop(
        &mut self,
        run_id: String,
        explicit: Option<IssueId>,
        max_issues: Option<usize>,
    ) -> OrchestratorResult<RunSummary> {
        let mut resolved = Vec::new();
        tracing::info!(?explicit, ?max_issues, "Run started");

        let stop = loop {
            if max_issues.is_some_and(|max| resolved.len() >= max) {
                break StopReason::MaxIssues;
            }

            let (mut graph, duplicates) = self.load_graph().await?;
            let engine = self.engine()?;
            let selection = engine
                .select(
                    &mut graph,
                    &duplicates,
                    explicit,
                    self.collab.tracker.as_ref(),
                    self.config.toml.timeouts.tracker(),
                )
                .await?;

            let scored = match selection {
                Selection::Selected(scored) => scored,
                Selection::NoEligibleIssue => break StopReason::NoEligibleIssue,
            };
            let resolution = self.machine.start(&scored.issue).await?;
            resolved.push(resolution);

            if explicit.is_some() {
                break StopReason::ExplicitDone;
            }
        };

        tracing::info!(resolved = resolved.len(), ?stop, "Run finished");
        Ok(RunSummary {
            run_id,
            resolved,
            stop,
        })
    }

    /// Continue a single checkpointed issue.
    pub async fn resume(&mut self, id: IssueId) -> OrchestratorResult<Resolution> {
        let span = tracing::info_span!("run", run_id = %Uuid::new_v4());
        self.machine.resume(id).instrument(span).await
    }

    /// Rank eligible issues as the next run would, without closing
    /// duplicates or touching checkpoints.
    pub async fn preview(&self, explicit: Option<IssueId>) -> OrchestratorResult<Preview> {
        let (graph, duplicates) = self.load_graph().await?;
        let engine = self.engine()?;
        let ranked = match explicit {
            Some(id) => vec![engine.explicit(&graph, id)?],
            None => engine.rank(&graph, &duplicates),
        };
        Ok(Preview {
            duplicates,
            ranked,
            unconfirmed_edges: graph.unconfirmed_edges().to_vec(),
            retained: self.machine.store().retained_ids()?.into_iter().collect(),
        })
    }

    async fn load_graph(&self) -> OrchestratorResult<(DependencyGraph, Vec<DuplicateGroup>)> {
        let repo = self.config.repo()?;
        let issues = call_with_timeout(
            "list issues",
            self.config.toml.timeouts.tracker(),
            self.collab.tracker.list_issues(&repo, IssueState::All),
        )
        .await?;

        let selection = &self.config.toml.selection;
        let detector =
            DuplicateDetector::new(selection.duplicates.clone(), selection.similarity_threshold);
        let (graph, duplicates) = GraphBuilder::new(issues).with_detector(detector).build()?;

        tracing::debug!(
            issues = graph.len(),
            duplicate_groups = duplicates.len(),
            "Dependency graph built"
        );
        Ok((graph, duplicates))
    }

    fn engine(&self) -> OrchestratorResult<SelectionEngine> {
        let repo = self.config.repo()?;
        let scorer = ImpactScorer::from_settings(&self.config.toml.selection);
        let patterns = self.machine.knowledge().patterns().clone();
        let retained = self.machine.store().retained_ids()?;
        Ok(SelectionEngine::new(&repo, scorer, patterns).with_excluded(retained))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::OrchestratorError;
    use crate::issue::{Issue, Priority};
    use crate::orchestrator::Phase;
    use crate::testing::Fakes;
    use std::path::Path;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> ConductorConfig {
        let mut config = ConductorConfig::new(dir.to_path_buf()).unwrap();
        config.toml.project.repo = Some("acme/app".to_string());
        config.toml.checks.lint = vec!["lint".to_string()];
        config.toml.timeouts.ci_poll = 0;
        config
    }

    fn scenario_issues() -> Vec<Issue> {
        vec![
            Issue::new(24, "acme/app", "Add session store")
                .with_priority(Priority::Critical)
                .with_criteria(&["Sessions persist across restarts"]),
            Issue::new(25, "acme/app", "Login page redirect loop")
                .with_blockers(&[24])
                .with_criteria(&["Login redirects to dashboard"]),
            Issue::new(30, "acme/app", "Login page redirect loop")
                .with_blockers(&[24])
                .with_criteria(&["Login redirects to dashboard"]),
        ]
    }

    fn resolved_ids(summary: &RunSummary) -> Vec<IssueId> {
        summary.resolved.iter().map(|r| r.issue_id).collect()
    }

    #[tokio::test]
    async fn test_run_resolves_in_dependency_order() {
        let dir = tempdir().unwrap();
        let fakes = Fakes::new(scenario_issues());
        let mut orchestrator =
            Orchestrator::new(test_config(dir.path()), fakes.collaborators()).unwrap();

        let summary = orchestrator.run(None, None).await.unwrap();

        assert_eq!(resolved_ids(&summary), vec![IssueId(24), IssueId(25)]);
        assert_eq!(summary.stop, StopReason::NoEligibleIssue);

        let closed: Vec<IssueId> = fakes.tracker.closed().iter().map(|(id, _)| *id).collect();
        assert_eq!(closed, vec![IssueId(30), IssueId(24), IssueId(25)]);
        assert_eq!(orchestrator.machine().knowledge().entries().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_at_max_issues() {
        let dir = tempdir().unwrap();
        let fakes = Fakes::new(scenario_issues());
        let mut orchestrator =
            Orchestrator::new(test_config(dir.path()), fakes.collaborators()).unwrap();

        let summary = orchestrator.run(None, Some(1)).await.unwrap();
        assert_eq!(resolved_ids(&summary), vec![IssueId(24)]);
        assert_eq!(summary.stop, StopReason::MaxIssues);
    }

    #[tokio::test]
    async fn test_explicit_issue_bypasses_gating_and_ends_run() {
        let dir = tempdir().unwrap();
        let fakes = Fakes::new(scenario_issues());
        let mut orchestrator =
            Orchestrator::new(test_config(dir.path()), fakes.collaborators()).unwrap();

        let summary = orchestrator.run(Some(IssueId(25)), None).await.unwrap();
        assert_eq!(resolved_ids(&summary), vec![IssueId(25)]);
        assert_eq!(summary.stop, StopReason::ExplicitDone);
        // Duplicates are not closed on the explicit path
        assert!(!fakes.tracker.closed().iter().any(|(id, _)| *id == IssueId(30)));
    }

    #[tokio::test]
    async fn test_escalation_halts_run_and_retains_checkpoint() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(scenario_issues());
        fakes.runner.script("lint", &[1; 5]);
        let mut orchestrator = Orchestrator::new(config.clone(), fakes.collaborators()).unwrap();

        let err = orchestrator.run(None, None).await.unwrap_err();
        assert_eq!(err.escalation().unwrap().phase, Phase::QualityChecks);
        assert!(orchestrator.machine().store().load(IssueId(24)).unwrap().is_some());

        // 24 is owned by its checkpoint and 25 is still blocked by it
        let summary = orchestrator.run(None, None).await.unwrap();
        assert!(summary.resolved.is_empty());
        assert_eq!(summary.stop, StopReason::NoEligibleIssue);
    }

    #[tokio::test]
    async fn test_preview_has_no_side_effects() {
        let dir = tempdir().unwrap();
        let fakes = Fakes::new(scenario_issues());
        let orchestrator =
            Orchestrator::read_only(test_config(dir.path()), fakes.collaborators()).unwrap();

        let preview = orchestrator.preview(None).await.unwrap();
        assert_eq!(preview.duplicates.len(), 1);
        let ranked: Vec<IssueId> = preview.ranked.iter().map(|s| s.id()).collect();
        assert_eq!(ranked, vec![IssueId(24)]);
        assert!(fakes.tracker.closed().is_empty());
        assert!(fakes.vcs.pushes().is_empty());

        let explicit = orchestrator.preview(Some(IssueId(25))).await.unwrap();
        assert_eq!(explicit.ranked[0].id(), IssueId(25));
    }

    #[tokio::test]
    async fn test_text_only_dependency_is_reported_not_enforced() {
        let dir = tempdir().unwrap();
        let mut issues = scenario_issues();
        issues[0] = issues[0].clone().with_description("Depends on #30 landing first.");
        let fakes = Fakes::new(issues);
        let orchestrator =
            Orchestrator::read_only(test_config(dir.path()), fakes.collaborators()).unwrap();

        let preview = orchestrator.preview(None).await.unwrap();
        assert_eq!(preview.unconfirmed_edges, vec![Edge::new(IssueId(30), IssueId(24))]);
        let ranked: Vec<IssueId> = preview.ranked.iter().map(|s| s.id()).collect();
        assert_eq!(ranked, vec![IssueId(24)]);
    }

    #[tokio::test]
    async fn test_second_instance_is_locked_out() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(scenario_issues());
        let _first = Orchestrator::new(config.clone(), fakes.collaborators()).unwrap();
        let second = Orchestrator::new(config, fakes.collaborators());
        assert!(matches!(second, Err(OrchestratorError::StoreLocked { .. })));
    }

    #[tokio::test]
    async fn test_cyclic_graph_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let fakes = Fakes::new(vec![
            Issue::new(1, "acme/app", "First").with_blockers(&[2]),
            Issue::new(2, "acme/app", "Second").with_blockers(&[1]),
        ]);
        let mut orchestrator =
            Orchestrator::new(test_config(dir.path()), fakes.collaborators()).unwrap();

        let err = orchestrator.run(None, None).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Cycle"));
    }
}
