//! Phase state machine: drives one issue through the six phases.
//!
//! Every phase is marked complete only after its exit condition has been
//! checked against the collaborators (branch on the remote, plan on disk,
//! commits present, checks green, issue reported closed). The checkpoint is
//! saved right after each completion and after every failed attempt, so a
//! crash never leaves it pointing past unfinished work.

use crate::collaborators::{Collaborators, CommandOutput, PullRequestDraft, call_with_timeout};
use crate::config::ConductorConfig;
use crate::errors::{ConfigurationError, OrchestratorResult};
use crate::issue::{CheckResult, CheckState, Issue, IssueId, IssueState, PullRequest};
use crate::knowledge::KnowledgeBase;
use crate::orchestrator::checkpoint::Checkpoint;
use crate::orchestrator::phase::Phase;
use crate::orchestrator::retry::{
    Attempt, AttemptFailure, Escalation, FailureKind, IterationBudget, RetryController,
};
use crate::orchestrator::state::CheckpointStore;
use crate::selection::ImpactScorer;
use crate::util::{slugify, tail_lines, truncate_str, write_atomic};
use anyhow::Context;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Instrument;

const PLAN_ARTIFACT: &str = "plan";
const PR_NUMBER_ARTIFACT: &str = "pr.number";
const PR_URL_ARTIFACT: &str = "pr.url";
const MERGED_ARTIFACT: &str = "merged";
const ACTUAL_HOURS_ARTIFACT: &str = "knowledge.actual_hours";
const EVIDENCE_ARTIFACT_PREFIX: &str = "evidence.";

/// Extra time granted on top of a command's own timeout.
const COMMAND_GRACE: Duration = Duration::from_secs(5);

const SLUG_LEN: usize = 40;

/// Terminal success for one issue.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub issue_id: IssueId,
    pub branch: String,
    pub pr: Option<PullRequest>,
    pub actual_hours: Option<f64>,
    /// Failed attempts charged against the iteration budget
    pub failures: u32,
}

/// PASS/FAIL answer parsed from a generator response.
#[derive(Debug, Clone, PartialEq)]
enum Verdict {
    Pass(String),
    Fail(String),
}

/// Parse a response whose first line starts with PASS or FAIL.
fn parse_verdict(text: &str) -> Verdict {
    let trimmed = text.trim();
    let (first, rest) = trimmed.split_once('\n').unwrap_or((trimmed, ""));
    let head = first.trim();
    let upper = head.to_ascii_uppercase();

    let detail = || {
        let mut detail = head[4..]
            .trim_start_matches([':', '-', ' '])
            .trim()
            .to_string();
        let rest = rest.trim();
        if !rest.is_empty() {
            if !detail.is_empty() {
                detail.push('\n');
            }
            detail.push_str(rest);
        }
        detail
    };

    if upper.starts_with("PASS") {
        Verdict::Pass(detail())
    } else if upper.starts_with("FAIL") {
        Verdict::Fail(detail())
    } else {
        Verdict::Fail(format!(
            "response did not start with PASS or FAIL: {}",
            truncate_str(head, 80)
        ))
    }
}

/// Title, description and acceptance criteria as generator context.
fn issue_brief(issue: &Issue) -> String {
    let mut brief = format!("# {}: {}\n", issue.id, issue.title);
    if !issue.description.trim().is_empty() {
        brief.push('\n');
        brief.push_str(issue.description.trim());
        brief.push('\n');
    }
    if !issue.acceptance_criteria.is_empty() {
        brief.push_str("\n## Acceptance criteria\n");
        for criterion in &issue.acceptance_criteria {
            brief.push_str(&format!("- {}\n", criterion));
        }
    }
    brief
}

fn repair_context(previous: &AttemptFailure) -> String {
    format!(
        "## Previous attempt failed\n{}\n\n```\n{}\n```\n",
        previous, previous.diagnostics
    )
}

/// Note stored with the knowledge entry, summarising repair effort.
fn knowledge_notes(budget: &IterationBudget) -> String {
    if budget.used() == 0 {
        return "Resolved without repair attempts".to_string();
    }
    let mut counts: BTreeMap<&'static str, u32> = BTreeMap::new();
    for failure in budget.failures() {
        *counts.entry(failure.kind.as_str()).or_default() += 1;
    }
    let kinds: Vec<String> = counts
        .iter()
        .map(|(kind, n)| format!("{} x{}", kind, n))
        .collect();
    format!(
        "Needed {} repair attempt(s): {}",
        budget.used(),
        kinds.join(", ")
    )
}

pub struct PhaseMachine {
    config: ConductorConfig,
    collab: Collaborators,
    store: CheckpointStore,
    knowledge: KnowledgeBase,
    scorer: ImpactScorer,
}

impl PhaseMachine {
    pub fn new(
        config: ConductorConfig,
        collab: Collaborators,
        store: CheckpointStore,
        knowledge: KnowledgeBase,
    ) -> Self {
        let scorer = ImpactScorer::from_settings(&config.toml.selection);
        Self {
            config,
            collab,
            store,
            knowledge,
            scorer,
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    /// Work branch for an issue: `<prefix>/issue-<id>-<slug>`.
    pub fn branch_name(&self, issue: &Issue) -> String {
        let prefix = &self.config.toml.project.branch_prefix;
        let slug = slugify(&issue.title, SLUG_LEN);
        if slug.is_empty() {
            format!("{}/issue-{}", prefix, issue.id.0)
        } else {
            format!("{}/issue-{}-{}", prefix, issue.id.0, slug)
        }
    }

    fn repo(&self) -> OrchestratorResult<String> {
        Ok(self.config.repo()?)
    }

    fn diff_range(&self) -> String {
        let project = &self.config.toml.project;
        format!("{}/{}...HEAD", project.remote, project.base_branch)
    }

    /// Run a freshly selected issue from Phase 1.
    pub async fn start(&mut self, issue: &Issue) -> OrchestratorResult<Resolution> {
        if self.store.load(issue.id)?.is_some() {
            return Err(ConfigurationError::CheckpointExists { issue: issue.id }.into());
        }
        let checkpoint = Checkpoint::new(issue.id, &self.branch_name(issue));
        self.store.save(&checkpoint)?;
        tracing::info!(issue = %issue.id, branch = %checkpoint.branch_name, "Checkpoint created");
        self.drive(issue, checkpoint).await
    }

    /// Continue an issue from its checkpoint at the next incomplete phase.
    ///
    /// The recorded branch and commits must still exist; a stale checkpoint
    /// is a configuration error and is never restarted from Phase 1.
    pub async fn resume(&mut self, id: IssueId) -> OrchestratorResult<Resolution> {
        let checkpoint = self
            .store
            .load(id)?
            .ok_or(ConfigurationError::MissingCheckpoint { issue: id })?;
        self.validate_resume(&checkpoint).await?;

        let issue = self.fetch_issue(id).await?;
        tracing::info!(
            issue = %id,
            next = ?checkpoint.next_phase().map(|p| p.number()),
            "Resuming from checkpoint"
        );
        self.drive(&issue, checkpoint).await
    }

    async fn validate_resume(&self, checkpoint: &Checkpoint) -> OrchestratorResult<()> {
        let id = checkpoint.issue_id;
        let vcs_timeout = self.config.toml.timeouts.vcs();

        if checkpoint.is_phase_complete(Phase::SelectionSetup) {
            let exists = call_with_timeout(
                "check branch",
                vcs_timeout,
                self.collab.vcs.branch_exists(&checkpoint.branch_name),
            )
            .await?;
            if !exists {
                return Err(ConfigurationError::StaleCheckpoint {
                    issue: id,
                    reason: format!(
                        "branch '{}' no longer exists upstream",
                        checkpoint.branch_name
                    ),
                }
                .into());
            }
        }

        for sha in checkpoint.commits() {
            let exists = call_with_timeout(
                "check commit",
                vcs_timeout,
                self.collab.vcs.commit_exists(&sha),
            )
            .await?;
            if !exists {
                return Err(ConfigurationError::StaleCheckpoint {
                    issue: id,
                    reason: format!("recorded commit {} no longer exists", sha),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Live tracker record for an issue.
    async fn fetch_issue(&self, id: IssueId) -> OrchestratorResult<Issue> {
        let repo = self.repo()?;
        let issues = call_with_timeout(
            "list issues",
            self.config.toml.timeouts.tracker(),
            self.collab.tracker.list_issues(&repo, IssueState::All),
        )
        .await?;
        issues
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| ConfigurationError::UnknownIssue { issue: id, repo }.into())
    }

    async fn drive(&mut self, issue: &Issue, checkpoint: Checkpoint) -> OrchestratorResult<Resolution> {
        let span = tracing::info_span!("issue", issue = %issue.id, phase = tracing::field::Empty);
        self.drive_phases(issue, checkpoint).instrument(span).await
    }

    async fn drive_phases(
        &mut self,
        issue: &Issue,
        mut checkpoint: Checkpoint,
    ) -> OrchestratorResult<Resolution> {
        let limit = self.config.toml.budget.iterations;
        let mut controller = RetryController::new(
            issue.id,
            IterationBudget::from_artifacts(limit, &checkpoint.artifacts),
        );

        while let Some(phase) = checkpoint.next_phase() {
            tracing::Span::current().record("phase", phase.number());
            tracing::info!(remaining_budget = controller.budget().remaining(), "Entering {}", phase);

            let result = match phase {
                Phase::SelectionSetup => self.setup(issue, &mut checkpoint).await,
                Phase::ContextPlanning => self.plan(issue, &mut checkpoint).await,
                Phase::CiAndPr => {
                    match self
                        .run_budgeted(phase, issue, &mut checkpoint, &mut controller)
                        .await
                    {
                        Ok(()) => self.finish(issue, &mut checkpoint, controller.budget()),
                        Err(e) => Err(e),
                    }
                }
                _ => {
                    self.run_budgeted(phase, issue, &mut checkpoint, &mut controller)
                        .await
                }
            };

            controller.budget().write_artifacts(&mut checkpoint.artifacts);
            if let Err(err) = result {
                checkpoint.touch();
                self.store.save(&checkpoint)?;
                if let Some(escalation) = err.escalation() {
                    self.report_escalation(issue, escalation).await;
                }
                return Err(err);
            }

            checkpoint.mark_complete(phase)?;
            self.store.save(&checkpoint)?;
            tracing::info!(
                used_budget = controller.budget().used(),
                "Completed {}",
                phase
            );
        }

        self.store.delete(issue.id)?;
        let resolution = Resolution {
            issue_id: issue.id,
            branch: checkpoint.branch_name.clone(),
            pr: self.pr_from_artifacts(&checkpoint),
            actual_hours: checkpoint
                .artifact(ACTUAL_HOURS_ARTIFACT)
                .and_then(|v| v.parse().ok()),
            failures: controller.budget().used(),
        };
        tracing::info!(
            pr = ?resolution.pr.as_ref().map(|p| p.number),
            failures = resolution.failures,
            "Issue resolved"
        );
        Ok(resolution)
    }

    /// Phase 1: create and publish the work branch. Failure is fatal.
    async fn setup(&self, issue: &Issue, checkpoint: &mut Checkpoint) -> OrchestratorResult<()> {
        let phase = Phase::SelectionSetup;
        let base = &self.config.toml.project.base_branch;
        let branch = checkpoint.branch_name.clone();
        let vcs_timeout = self.config.toml.timeouts.vcs();
        let vcs = &self.collab.vcs;

        let result = async {
            call_with_timeout("create branch", vcs_timeout, vcs.create_branch(base, &branch)).await?;
            call_with_timeout("push branch", vcs_timeout, vcs.push(&branch)).await?;
            let published =
                call_with_timeout("check branch", vcs_timeout, vcs.branch_exists(&branch)).await?;
            if !published {
                anyhow::bail!("branch '{}' is not on the remote after push", branch);
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        result.map_err(|e| {
            let failure = AttemptFailure::collaborator(phase, "branch setup", &e);
            Escalation::new(issue.id, phase, 1, vec![failure]).into()
        })
    }

    /// Phase 2: produce a plan document. One retry with broadened context,
    /// outside the shared budget.
    async fn plan(&self, issue: &Issue, checkpoint: &mut Checkpoint) -> OrchestratorResult<()> {
        let phase = Phase::ContextPlanning;
        let attempts = 1 + self.config.toml.budget.planning_retries;
        let base_budget = self.config.toml.generation.context_budget;
        let mut failures = Vec::new();

        for attempt in 0..attempts {
            let broadened = attempt > 0;
            let budget = if broadened { base_budget * 2 } else { base_budget };
            let context = self.planning_context(issue, broadened);
            let prompt = format!(
                "Write a numbered, step-by-step implementation plan for issue {} ({}). \
                 Name the files to change and the tests to add.",
                issue.id, issue.title
            );

            match self.generate(phase, "plan generation", &prompt, &context, budget).await {
                Ok(plan) if !plan.trim().is_empty() => match self.write_plan(issue.id, &plan) {
                    Ok(path) => {
                        checkpoint.set_artifact(PLAN_ARTIFACT, path.display().to_string());
                        tracing::info!(path = %path.display(), broadened, "Plan written");
                        return Ok(());
                    }
                    Err(e) => failures.push(AttemptFailure::collaborator(phase, "plan write", &e)),
                },
                Ok(_) => failures.push(AttemptFailure::new(
                    phase,
                    FailureKind::Generation,
                    "generator returned an empty plan",
                    String::new(),
                )),
                Err(failure) => failures.push(failure),
            }
            if let Some(last) = failures.last() {
                tracing::warn!(attempt = attempt + 1, attempts, "Planning failed: {}", last.summary);
            }
        }

        Err(Escalation::new(issue.id, phase, attempts, failures).into())
    }

    fn planning_context(&self, issue: &Issue, broadened: bool) -> String {
        let mut context = issue_brief(issue);
        if !broadened {
            return context;
        }
        if !issue.labels.is_empty() {
            let labels: Vec<&str> = issue.labels.iter().map(String::as_str).collect();
            context.push_str(&format!("\nLabels: {}\n", labels.join(", ")));
        }
        if !issue.linked_files.is_empty() {
            context.push_str("\n## Files touched by linked pull requests\n");
            for file in &issue.linked_files {
                context.push_str(&format!("- {}\n", file));
            }
        }
        let patterns = self.knowledge.patterns();
        if !patterns.risk_factors.is_empty() {
            context.push_str("\n## Past risk factors\n");
            for factor in &patterns.risk_factors {
                context.push_str(&format!("- {}\n", factor));
            }
        }
        if !patterns.success_factors.is_empty() {
            context.push_str("\n## Past success factors\n");
            for factor in &patterns.success_factors {
                context.push_str(&format!("- {}\n", factor));
            }
        }
        context
    }

    /// Write the plan and read it back, so the exit condition is checked
    /// on disk rather than assumed.
    fn write_plan(&self, id: IssueId, plan: &str) -> anyhow::Result<PathBuf> {
        let path = self.config.plans_dir().join(format!("{}.md", id.0));
        write_atomic(&path, plan)?;
        let written = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read back plan: {}", path.display()))?;
        if written.trim().is_empty() {
            anyhow::bail!("plan at {} is empty", path.display());
        }
        Ok(path)
    }

    /// Phases 3-6: attempt, repair and retry against the shared budget.
    async fn run_budgeted(
        &self,
        phase: Phase,
        issue: &Issue,
        checkpoint: &mut Checkpoint,
        controller: &mut RetryController,
    ) -> OrchestratorResult<()> {
        let mut previous: Option<AttemptFailure> = None;
        loop {
            let attempt_checkpoint = &mut *checkpoint;
            let prior = previous.take();
            let outcome = controller
                .attempt(phase, move || {
                    let checkpoint = attempt_checkpoint;
                    self.run_attempt(phase, issue, checkpoint, prior)
                })
                .await;

            controller.budget().write_artifacts(&mut checkpoint.artifacts);
            match outcome {
                Ok(Attempt::Succeeded(())) => return Ok(()),
                Ok(Attempt::Failed(failure)) => {
                    checkpoint.touch();
                    self.store.save(checkpoint)?;
                    previous = Some(failure);
                }
                Err(escalation) => return Err(escalation.into()),
            }
        }
    }

    async fn run_attempt(
        &self,
        phase: Phase,
        issue: &Issue,
        checkpoint: &mut Checkpoint,
        previous: Option<AttemptFailure>,
    ) -> Result<(), AttemptFailure> {
        match phase {
            Phase::Implementation => self.implement(issue, checkpoint, previous).await,
            Phase::QualityChecks => self.quality_checks(issue, checkpoint, previous).await,
            Phase::ReviewCycle => self.review(issue, checkpoint, previous).await,
            Phase::CiAndPr => self.ci(issue, checkpoint, previous).await,
            Phase::SelectionSetup | Phase::ContextPlanning => Ok(()),
        }
    }

    /// Phase 3: generate the change and verify code plus tests are committed.
    async fn implement(
        &self,
        issue: &Issue,
        checkpoint: &mut Checkpoint,
        previous: Option<AttemptFailure>,
    ) -> Result<(), AttemptFailure> {
        let phase = Phase::Implementation;
        let plan_path = checkpoint.artifact(PLAN_ARTIFACT).unwrap_or_default().to_string();
        let plan = std::fs::read_to_string(&plan_path).map_err(|e| {
            AttemptFailure::new(
                phase,
                FailureKind::Collaborator,
                "plan document is missing",
                format!("{}: {}", plan_path, e),
            )
        })?;

        let mut context = format!("{}\n## Plan\n{}\n", issue_brief(issue), plan);
        if let Some(previous) = &previous {
            context.push_str(&repair_context(previous));
        }
        let prompt = format!(
            "Implement issue {} following the plan. Add or update tests that cover \
             every acceptance criterion. Reply with a short summary of the change.",
            issue.id
        );
        let budget = self.config.toml.generation.context_budget;
        let summary = self
            .generate(phase, "code generation", &prompt, &context, budget)
            .await?;
        tracing::debug!(summary = %truncate_str(&summary, 200), "Change generated");

        self.commit(phase, checkpoint, &format!("Implement {}: {}", issue.id, issue.title))
            .await?;
        self.verify_committed(phase, checkpoint).await?;
        self.push(phase, checkpoint).await
    }

    /// At least one recorded commit exists and the branch diff touches tests.
    async fn verify_committed(
        &self,
        phase: Phase,
        checkpoint: &Checkpoint,
    ) -> Result<(), AttemptFailure> {
        let vcs_timeout = self.config.toml.timeouts.vcs();
        let Some(head) = checkpoint.commits().last().cloned() else {
            return Err(AttemptFailure::new(
                phase,
                FailureKind::Generation,
                "no changes were committed",
                String::new(),
            ));
        };
        let exists = call_with_timeout("check commit", vcs_timeout, self.collab.vcs.commit_exists(&head))
            .await
            .map_err(|e| AttemptFailure::collaborator(phase, "commit lookup", &e))?;
        if !exists {
            return Err(AttemptFailure::new(
                phase,
                FailureKind::Collaborator,
                format!("commit {} is not in the repository", head),
                String::new(),
            ));
        }

        let range = self.diff_range();
        let changed = call_with_timeout(
            "list changed paths",
            vcs_timeout,
            self.collab.vcs.changed_paths(&range),
        )
        .await
        .map_err(|e| AttemptFailure::collaborator(phase, "changed paths", &e))?;

        let markers = &self.config.toml.checks.test_path_markers;
        let has_tests = changed.iter().any(|path| {
            let lower = path.to_lowercase();
            markers.iter().any(|m| lower.contains(&m.to_lowercase()))
        });
        if !has_tests {
            return Err(AttemptFailure::new(
                phase,
                FailureKind::Test,
                "no tests were committed with the change",
                changed.join("\n"),
            ));
        }
        Ok(())
    }

    /// Phase 4: run every check, then verify each acceptance criterion.
    async fn quality_checks(
        &self,
        issue: &Issue,
        checkpoint: &mut Checkpoint,
        previous: Option<AttemptFailure>,
    ) -> Result<(), AttemptFailure> {
        let phase = Phase::QualityChecks;
        if let Some(previous) = &previous {
            self.apply_fix(phase, issue, checkpoint, previous, "Fix quality checks")
                .await?;
        }
        let outputs = self.run_checks(phase).await?;
        self.verify_criteria(issue, checkpoint, &outputs).await
    }

    async fn verify_criteria(
        &self,
        issue: &Issue,
        checkpoint: &mut Checkpoint,
        outputs: &[(String, CommandOutput)],
    ) -> Result<(), AttemptFailure> {
        let phase = Phase::QualityChecks;
        if issue.acceptance_criteria.is_empty() {
            tracing::debug!("Issue has no acceptance criteria to verify");
            return Ok(());
        }

        let diff = self.diff(phase).await?;
        let mut context = format!("{}\n## Diff\n{}\n\n## Check output\n", issue_brief(issue), diff);
        for (command, output) in outputs {
            context.push_str(&format!("$ {}\n{}\n", command, output.combined_tail()));
        }
        let budget = self.config.toml.generation.context_budget;

        let mut unverified = Vec::new();
        for (i, criterion) in issue.acceptance_criteria.iter().enumerate() {
            let prompt = format!(
                "Verify acceptance criterion {} of issue {}: \"{}\". Answer PASS or FAIL \
                 on the first line, then cite the evidence in the diff or check output.",
                i + 1,
                issue.id,
                criterion
            );
            let response = self
                .generate(phase, "criterion verification", &prompt, &context, budget)
                .await?;
            match parse_verdict(&response) {
                Verdict::Pass(evidence) if !evidence.is_empty() => {
                    checkpoint.set_artifact(&format!("{}{}", EVIDENCE_ARTIFACT_PREFIX, i + 1), evidence);
                }
                Verdict::Pass(_) => unverified.push(format!("{}: PASS given without evidence", criterion)),
                Verdict::Fail(reason) => unverified.push(format!("{}: {}", criterion, reason)),
            }
        }

        if unverified.is_empty() {
            return Ok(());
        }
        Err(AttemptFailure::new(
            phase,
            FailureKind::AcceptanceCriterion,
            format!(
                "{} of {} acceptance criteria not verified",
                unverified.len(),
                issue.acceptance_criteria.len()
            ),
            unverified.join("\n"),
        ))
    }

    /// Phase 5: self-review and automated review must both come back clean.
    async fn review(
        &self,
        issue: &Issue,
        checkpoint: &mut Checkpoint,
        previous: Option<AttemptFailure>,
    ) -> Result<(), AttemptFailure> {
        let phase = Phase::ReviewCycle;
        let review = &self.config.toml.review;

        if let Some(previous) = &previous {
            self.apply_fix(phase, issue, checkpoint, previous, "Address review feedback")
                .await?;
            // Feedback changes must not break what Phase 4 verified.
            self.run_checks(phase).await?;
        }

        let mut findings = Vec::new();
        if review.self_review {
            let diff = self.diff(phase).await?;
            let context = format!("{}\n## Diff\n{}\n", issue_brief(issue), diff);
            let prompt = format!(
                "Review this change for issue {}. Answer PASS on the first line if it is \
                 ready to merge, otherwise FAIL followed by each problem on its own line.",
                issue.id
            );
            let budget = self.config.toml.generation.context_budget;
            let response = self
                .generate(phase, "self-review", &prompt, &context, budget)
                .await?;
            if let Verdict::Fail(reason) = parse_verdict(&response) {
                findings.push(format!("self-review: {}", reason));
            }
        }

        if !review.commands.is_empty() {
            let commands = review
                .commands
                .iter()
                .map(|c| (FailureKind::Review, c.as_str()))
                .collect();
            if let Err(failure) = self.run_commands(phase, commands).await {
                if failure.kind != FailureKind::Review {
                    return Err(failure);
                }
                findings.push(failure.diagnostics);
            }
        }

        if findings.is_empty() {
            return Ok(());
        }
        Err(AttemptFailure::new(
            phase,
            FailureKind::Review,
            format!("{} review finding(s) to address", findings.len()),
            findings.join("\n\n"),
        ))
    }

    /// Phase 6 attempt: publish, open or reuse the PR, wait for required
    /// checks, then merge.
    async fn ci(
        &self,
        issue: &Issue,
        checkpoint: &mut Checkpoint,
        previous: Option<AttemptFailure>,
    ) -> Result<(), AttemptFailure> {
        let phase = Phase::CiAndPr;
        // Only failing checks are the generator's to repair
        if let Some(previous) = previous.as_ref().filter(|p| p.kind == FailureKind::Ci) {
            self.apply_fix(phase, issue, checkpoint, previous, "Fix CI failures")
                .await?;
        }
        self.push(phase, checkpoint).await?;

        let pr = self.ensure_pr(issue, checkpoint).await?;
        let checks = self.wait_for_checks(&pr).await?;
        tracing::info!(pr = pr.number, checks = checks.len(), "Required checks passed");

        let ci = &self.config.toml.ci;
        if ci.auto_merge && checkpoint.artifact(MERGED_ARTIFACT).is_none() {
            call_with_timeout(
                "merge pull request",
                self.config.toml.timeouts.vcs(),
                self.collab.vcs.merge(&pr, ci.merge_strategy),
            )
            .await
            .map_err(|e| AttemptFailure::collaborator(phase, "merge", &e))?;
            checkpoint.set_artifact(MERGED_ARTIFACT, ci.merge_strategy.to_string());
            self.save_progress(phase, checkpoint)?;
            tracing::info!(pr = pr.number, strategy = %ci.merge_strategy, "Pull request merged");
        }

        self.close_resolved(issue, &pr).await
    }

    /// Close the issue against its pull request and confirm the tracker
    /// reports it closed.
    async fn close_resolved(&self, issue: &Issue, pr: &PullRequest) -> Result<(), AttemptFailure> {
        let phase = Phase::CiAndPr;
        if !self.live_issue(phase, issue.id).await?.is_open() {
            return Ok(());
        }

        let message = format!("Resolved by pull request #{} ({})", pr.number, pr.url);
        call_with_timeout(
            "close issue",
            self.config.toml.timeouts.tracker(),
            self.collab.tracker.close_issue(issue.id, &message),
        )
        .await
        .map_err(|e| AttemptFailure::collaborator(phase, "issue close", &e))?;

        if self.live_issue(phase, issue.id).await?.is_open() {
            return Err(AttemptFailure::new(
                phase,
                FailureKind::Collaborator,
                format!("tracker still reports {} as open after closing", issue.id),
                String::new(),
            ));
        }
        tracing::info!(pr = pr.number, "Issue closed");
        Ok(())
    }

    async fn live_issue(&self, phase: Phase, id: IssueId) -> Result<Issue, AttemptFailure> {
        let found: anyhow::Result<Issue> = async {
            let repo = self.config.repo()?;
            let issues = call_with_timeout(
                "list issues",
                self.config.toml.timeouts.tracker(),
                self.collab.tracker.list_issues(&repo, IssueState::All),
            )
            .await?;
            issues
                .into_iter()
                .find(|i| i.id == id)
                .with_context(|| format!("{} is not in {}", id, repo))
        }
        .await;
        found.map_err(|e| AttemptFailure::collaborator(phase, "issue lookup", &e))
    }

    /// Persist mid-attempt progress that must survive a crash.
    fn save_progress(&self, phase: Phase, checkpoint: &mut Checkpoint) -> Result<(), AttemptFailure> {
        checkpoint.touch();
        self.store.save(checkpoint).map_err(|e| {
            AttemptFailure::new(
                phase,
                FailureKind::Collaborator,
                "checkpoint save failed",
                e.to_string(),
            )
        })
    }

    fn pr_from_artifacts(&self, checkpoint: &Checkpoint) -> Option<PullRequest> {
        let number = checkpoint.artifact(PR_NUMBER_ARTIFACT)?.parse().ok()?;
        Some(PullRequest {
            number,
            issue: checkpoint.issue_id,
            head_branch: checkpoint.branch_name.clone(),
            base_branch: self.config.toml.project.base_branch.clone(),
            url: checkpoint.artifact(PR_URL_ARTIFACT).unwrap_or_default().to_string(),
        })
    }

    async fn ensure_pr(
        &self,
        issue: &Issue,
        checkpoint: &mut Checkpoint,
    ) -> Result<PullRequest, AttemptFailure> {
        let phase = Phase::CiAndPr;
        if let Some(pr) = self.pr_from_artifacts(checkpoint) {
            return Ok(pr);
        }

        let tracker_timeout = self.config.toml.timeouts.tracker();
        let tracker = &self.collab.tracker;
        let existing = call_with_timeout("find pull request", tracker_timeout, tracker.get_pr_for_issue(issue.id))
            .await
            .map_err(|e| AttemptFailure::collaborator(phase, "pull request lookup", &e))?;

        let pr = match existing {
            Some(pr) => pr,
            None => {
                let draft = PullRequestDraft {
                    issue: issue.id,
                    title: format!("Resolve {}: {}", issue.id, issue.title),
                    body: self.pr_body(issue, checkpoint),
                    head_branch: checkpoint.branch_name.clone(),
                    base_branch: self.config.toml.project.base_branch.clone(),
                };
                let pr = call_with_timeout("open pull request", tracker_timeout, tracker.open_pull_request(&draft))
                    .await
                    .map_err(|e| AttemptFailure::collaborator(phase, "pull request creation", &e))?;
                tracing::info!(pr = pr.number, url = %pr.url, "Pull request opened");
                pr
            }
        };

        checkpoint.set_artifact(PR_NUMBER_ARTIFACT, pr.number.to_string());
        checkpoint.set_artifact(PR_URL_ARTIFACT, pr.url.clone());
        Ok(pr)
    }

    fn pr_body(&self, issue: &Issue, checkpoint: &Checkpoint) -> String {
        let mut body = format!("Closes {}\n\n", issue.id);
        if !issue.acceptance_criteria.is_empty() {
            body.push_str("## Acceptance criteria\n\n");
            for (i, criterion) in issue.acceptance_criteria.iter().enumerate() {
                let key = format!("{}{}", EVIDENCE_ARTIFACT_PREFIX, i + 1);
                match checkpoint.artifact(&key) {
                    Some(evidence) => {
                        let first = evidence.lines().next().unwrap_or_default();
                        body.push_str(&format!("- [x] {}: {}\n", criterion, first));
                    }
                    None => body.push_str(&format!("- [ ] {}\n", criterion)),
                }
            }
        }
        body
    }

    /// Poll required checks until none is pending. An empty check list is
    /// treated as pending for two poll intervals so late-registering CI
    /// providers are not skipped.
    async fn wait_for_checks(&self, pr: &PullRequest) -> Result<Vec<CheckResult>, AttemptFailure> {
        let phase = Phase::CiAndPr;
        let timeouts = &self.config.toml.timeouts;
        let poll = timeouts.ci_poll();
        let started = tokio::time::Instant::now();
        let deadline = started + timeouts.ci();
        let grace = poll * 2;

        loop {
            let checks = call_with_timeout(
                "list required checks",
                timeouts.tracker(),
                self.collab.tracker.list_required_checks(pr),
            )
            .await
            .map_err(|e| AttemptFailure::collaborator(phase, "check status", &e))?;

            let failed: Vec<&CheckResult> = checks
                .iter()
                .filter(|c| c.state == CheckState::Failure)
                .collect();
            if !failed.is_empty() {
                let names: Vec<&str> = failed.iter().map(|c| c.name.as_str()).collect();
                let logs: Vec<String> = failed
                    .iter()
                    .map(|c| {
                        format!(
                            "{}:\n{}",
                            c.name,
                            tail_lines(&c.summary, self.config.toml.checks.log_tail_lines)
                        )
                    })
                    .collect();
                return Err(AttemptFailure::new(
                    phase,
                    FailureKind::Ci,
                    format!("required check(s) failed: {}", names.join(", ")),
                    logs.join("\n\n"),
                ));
            }

            let pending = checks.iter().any(|c| c.state == CheckState::Pending)
                || (checks.is_empty() && started.elapsed() < grace);
            if !pending {
                return Ok(checks);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AttemptFailure::timeout(phase, "required CI checks", timeouts.ci));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// End of Phase 6: record the knowledge entry once per resolution.
    fn finish(
        &mut self,
        issue: &Issue,
        checkpoint: &mut Checkpoint,
        budget: &IterationBudget,
    ) -> OrchestratorResult<()> {
        if checkpoint.artifact(ACTUAL_HOURS_ARTIFACT).is_some() {
            return Ok(());
        }

        let elapsed = Utc::now().signed_duration_since(checkpoint.started_at);
        let actual_hours = elapsed.num_milliseconds().max(0) as f64 / 3_600_000.0;
        if self.knowledge.has_entry_since(issue.id, checkpoint.started_at) {
            tracing::debug!("Knowledge entry already recorded for this run");
        } else {
            let estimated_hours = self.scorer.base_estimate(issue);
            self.knowledge
                .record(issue.id, estimated_hours, actual_hours, &knowledge_notes(budget))?;
        }
        checkpoint.set_artifact(ACTUAL_HOURS_ARTIFACT, format!("{:.4}", actual_hours));
        checkpoint.touch();
        self.store.save(checkpoint)?;
        Ok(())
    }

    async fn report_escalation(&self, issue: &Issue, escalation: &Escalation) {
        tracing::error!(
            phase = escalation.phase.number(),
            attempts = escalation.attempts,
            "{}",
            escalation
        );

        let path = self
            .config
            .escalations_dir()
            .join(format!("{}.json", issue.id.0));
        let written = serde_json::to_string_pretty(escalation)
            .context("Failed to serialize escalation")
            .and_then(|json| write_atomic(&path, &json));
        if let Err(e) = written {
            tracing::warn!("Failed to write escalation report: {:#}", e);
        }

        if self.config.toml.escalation.open_issue {
            let title = format!("Escalation: {} {}", issue.id, issue.title);
            let labels = vec!["conductor".to_string(), "escalation".to_string()];
            let filed = call_with_timeout(
                "file escalation",
                self.config.toml.timeouts.tracker(),
                self.collab
                    .tracker
                    .create_issue(&title, &escalation.report(), &labels),
            )
            .await;
            match filed {
                Ok(id) => tracing::info!(escalation_issue = %id, "Escalation filed"),
                Err(e) => tracing::warn!("Failed to file escalation issue: {:#}", e),
            }
        }
    }

    async fn generate(
        &self,
        phase: Phase,
        what: &str,
        prompt: &str,
        context: &str,
        budget: usize,
    ) -> Result<String, AttemptFailure> {
        call_with_timeout(
            what,
            self.config.toml.timeouts.generation(),
            self.collab.generator.generate(prompt, context, budget),
        )
        .await
        .map_err(|e| {
            let mut failure = AttemptFailure::collaborator(phase, what, &e);
            if failure.kind == FailureKind::Collaborator {
                failure.kind = FailureKind::Generation;
            }
            failure
        })
    }

    /// Ask the generator to repair `previous`, then commit whatever it changed.
    async fn apply_fix(
        &self,
        phase: Phase,
        issue: &Issue,
        checkpoint: &mut Checkpoint,
        previous: &AttemptFailure,
        message: &str,
    ) -> Result<(), AttemptFailure> {
        let context = format!("{}\n{}", issue_brief(issue), repair_context(previous));
        let prompt = format!(
            "{} for issue {}. Change only what is needed to resolve the failure below.",
            message, issue.id
        );
        let budget = self.config.toml.generation.context_budget;
        self.generate(phase, "fix generation", &prompt, &context, budget)
            .await?;
        self.commit(phase, checkpoint, &format!("{} ({})", message, issue.id))
            .await
    }

    async fn commit(
        &self,
        phase: Phase,
        checkpoint: &mut Checkpoint,
        message: &str,
    ) -> Result<(), AttemptFailure> {
        let paths = vec![".".to_string()];
        let sha = call_with_timeout(
            "commit",
            self.config.toml.timeouts.vcs(),
            self.collab.vcs.commit(&paths, message),
        )
        .await
        .map_err(|e| AttemptFailure::collaborator(phase, "commit", &e))?;
        match sha {
            Some(sha) => {
                tracing::debug!(sha = %sha, "Committed");
                checkpoint.push_commit(&sha);
            }
            None => tracing::debug!("Nothing to commit"),
        }
        Ok(())
    }

    async fn push(&self, phase: Phase, checkpoint: &Checkpoint) -> Result<(), AttemptFailure> {
        call_with_timeout(
            "push branch",
            self.config.toml.timeouts.vcs(),
            self.collab.vcs.push(&checkpoint.branch_name),
        )
        .await
        .map_err(|e| AttemptFailure::collaborator(phase, "push", &e))
    }

    async fn diff(&self, phase: Phase) -> Result<String, AttemptFailure> {
        let range = self.diff_range();
        call_with_timeout("diff", self.config.toml.timeouts.vcs(), self.collab.vcs.diff(&range))
            .await
            .map_err(|e| AttemptFailure::collaborator(phase, "diff", &e))
    }

    /// Lint, test and build commands, all of them, in that order.
    async fn run_checks(&self, phase: Phase) -> Result<Vec<(String, CommandOutput)>, AttemptFailure> {
        let checks = &self.config.toml.checks;
        let commands = checks
            .lint
            .iter()
            .map(|c| (FailureKind::Lint, c.as_str()))
            .chain(checks.test.iter().map(|c| (FailureKind::Test, c.as_str())))
            .chain(checks.build.iter().map(|c| (FailureKind::Build, c.as_str())))
            .collect();
        self.run_commands(phase, commands).await
    }

    /// Run every command even after one fails, so the failure reports the
    /// full picture. The first failing command decides the failure kind.
    async fn run_commands(
        &self,
        phase: Phase,
        commands: Vec<(FailureKind, &str)>,
    ) -> Result<Vec<(String, CommandOutput)>, AttemptFailure> {
        let limit = self.config.toml.timeouts.command();
        let tail = self.config.toml.checks.log_tail_lines;
        let mut outputs = Vec::new();
        let mut failed: Vec<(FailureKind, String, String)> = Vec::new();

        for (kind, command) in commands {
            let what = format!("command `{}`", command);
            let output = call_with_timeout(
                &what,
                limit + COMMAND_GRACE,
                self.collab.runner.run(command, &self.config.project_dir, limit),
            )
            .await
            .map_err(|e| AttemptFailure::collaborator(phase, &what, &e))?;

            if output.success() {
                tracing::debug!(command, elapsed_ms = output.duration.as_millis() as u64, "Check passed");
            } else {
                failed.push((
                    kind,
                    format!("{} `{}` exited with {}", kind, command, output.exit_code),
                    tail_lines(&output.combined_tail(), tail),
                ));
            }
            outputs.push((command.to_string(), output));
        }

        let Some((kind, _, _)) = failed.first() else {
            return Ok(outputs);
        };
        let summary: Vec<&str> = failed.iter().map(|(_, s, _)| s.as_str()).collect();
        let diagnostics: Vec<String> = failed
            .iter()
            .map(|(_, s, d)| format!("{}\n{}", s, d))
            .collect();
        Err(AttemptFailure::new(
            phase,
            *kind,
            summary.join("; "),
            diagnostics.join("\n\n"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::OrchestratorError;
    use crate::orchestrator::retry::BUDGET_ARTIFACT;
    use crate::testing::{FakeVcs, Fakes};
    use std::path::Path;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> ConductorConfig {
        let mut config = ConductorConfig::new(dir.to_path_buf()).unwrap();
        config.toml.project.repo = Some("acme/app".to_string());
        config.toml.checks.lint = vec!["lint".to_string()];
        config.toml.checks.test = vec!["test".to_string()];
        config.toml.timeouts.ci_poll = 0;
        config.toml.timeouts.ci = 5;
        config.toml.escalation.open_issue = true;
        config
    }

    fn machine(config: &ConductorConfig, fakes: &Fakes) -> PhaseMachine {
        let store = CheckpointStore::open(&config.checkpoints_dir()).unwrap();
        let knowledge = KnowledgeBase::open(&config.knowledge_file()).unwrap();
        PhaseMachine::new(config.clone(), fakes.collaborators(), store, knowledge)
    }

    fn login_issue() -> Issue {
        Issue::new(25, "acme/app", "Persist login session")
            .with_criteria(&["Session survives a restart"])
            .with_estimate(4.0)
    }

    #[test]
    fn test_parse_verdict() {
        assert_eq!(
            parse_verdict("PASS: covered by tests/session.rs"),
            Verdict::Pass("covered by tests/session.rs".to_string())
        );
        assert_eq!(
            parse_verdict("fail\nmissing restart test\nno docs"),
            Verdict::Fail("missing restart test\nno docs".to_string())
        );
        assert_eq!(parse_verdict("PASS"), Verdict::Pass(String::new()));
        assert!(matches!(parse_verdict("Looks good to me"), Verdict::Fail(_)));
    }

    #[test]
    fn test_branch_name() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![]);
        let machine = machine(&config, &fakes);
        assert_eq!(
            machine.branch_name(&login_issue()),
            "conductor/issue-25-persist-login-session"
        );
        assert_eq!(
            machine.branch_name(&Issue::new(7, "acme/app", "!!!")),
            "conductor/issue-7"
        );
    }

    #[tokio::test]
    async fn test_full_run_resolves_issue() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        let mut machine = machine(&config, &fakes);

        let resolution = machine.start(&login_issue()).await.unwrap();

        assert_eq!(resolution.failures, 0);
        assert_eq!(resolution.pr.as_ref().unwrap().number, 500);
        assert!(machine.store().load(IssueId(25)).unwrap().is_none());
        assert_eq!(fakes.vcs.merged(), vec![500]);

        let closed = fakes.tracker.closed();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].1.contains("#500"));

        assert_eq!(machine.knowledge().entries().len(), 1);
        assert_eq!(machine.knowledge().entries()[0].estimated_hours, 4.0);
        assert!(config.plans_dir().join("25.md").exists());

        let prompts = fakes.generator.prompts();
        assert!(prompts.iter().any(|p| p.contains("Session survives a restart")));
    }

    #[tokio::test]
    async fn test_start_refuses_existing_checkpoint() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        let mut machine = machine(&config, &fakes);
        machine
            .store()
            .save(&Checkpoint::new(IssueId(25), "conductor/issue-25-x"))
            .unwrap();

        let err = machine.start(&login_issue()).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_branch_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::with_vcs(vec![login_issue()], FakeVcs::failing_branch_creation());
        let mut machine = machine(&config, &fakes);

        let err = machine.start(&login_issue()).await.unwrap_err();
        let escalation = err.escalation().unwrap();
        assert_eq!(escalation.phase, Phase::SelectionSetup);
        assert_eq!(escalation.attempts, 1);

        let cp = machine.store().load(IssueId(25)).unwrap().unwrap();
        assert!(cp.completed_phases.is_empty());
        assert!(config.escalations_dir().join("25.json").exists());
        assert_eq!(fakes.tracker.created().len(), 1);
    }

    #[tokio::test]
    async fn test_quality_failures_consume_shared_budget() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        fakes.runner.script("lint", &[1, 1]);
        fakes.runner.script("test", &[0, 0, 1, 1]);
        let mut machine = machine(&config, &fakes);

        let resolution = machine.start(&login_issue()).await.unwrap();

        assert_eq!(resolution.failures, 4);
        let lint_runs = fakes.runner.calls().iter().filter(|c| *c == "lint").count();
        assert_eq!(lint_runs, 5);
        let notes = &machine.knowledge().entries()[0].notes;
        assert!(notes.contains("4 repair"));
        assert!(notes.contains("lint x2"));
        assert!(notes.contains("test x2"));
    }

    #[tokio::test]
    async fn test_four_failures_leave_one_for_later_phases() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.toml.review.commands = vec!["review".to_string()];
        let fakes = Fakes::new(vec![login_issue()]);
        fakes.runner.script("lint", &[1, 1]);
        fakes.runner.script("test", &[0, 0, 1, 1]);
        fakes.runner.script("review", &[1]);
        let mut machine = machine(&config, &fakes);

        let err = machine.start(&login_issue()).await.unwrap_err();
        let escalation = err.escalation().unwrap();
        assert_eq!(escalation.phase, Phase::ReviewCycle);
        assert_eq!(escalation.attempts, 5);
        assert_eq!(escalation.last_failure().unwrap().kind, FailureKind::Review);

        let cp = machine.store().load(IssueId(25)).unwrap().unwrap();
        assert_eq!(cp.completed_phases.len(), 4);
        assert_eq!(cp.artifact(BUDGET_ARTIFACT), Some("5"));
        assert!(fakes.tracker.closed().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_budget_never_retries_a_sixth_time() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        fakes.runner.script("lint", &[1; 10]);
        let mut machine = machine(&config, &fakes);

        let err = machine.start(&login_issue()).await.unwrap_err();
        let escalation = err.escalation().unwrap();
        assert_eq!(escalation.phase, Phase::QualityChecks);
        assert_eq!(escalation.attempts, 5);
        assert!(err.to_string().contains("lint"));
        let lint_runs = || fakes.runner.calls().iter().filter(|c| *c == "lint").count();
        assert_eq!(lint_runs(), 5);
        drop(machine);

        // A resumed run starts out exhausted and escalates without running.
        let mut resumed = self::machine(&config, &fakes);
        let err = resumed.resume(IssueId(25)).await.unwrap_err();
        assert_eq!(err.escalation().unwrap().phase, Phase::QualityChecks);
        assert_eq!(lint_runs(), 5);
    }

    #[tokio::test]
    async fn test_change_without_tests_is_not_accepted() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        fakes.vcs.set_changed_paths(&["src/session.rs"]);
        let mut machine = machine(&config, &fakes);

        let err = machine.start(&login_issue()).await.unwrap_err();
        let escalation = err.escalation().unwrap();
        assert_eq!(escalation.phase, Phase::Implementation);
        assert!(escalation.last_failure().unwrap().summary.contains("no tests"));
    }

    #[tokio::test]
    async fn test_unverified_criterion_is_repaired() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        let generator = &fakes.generator;
        generator.push(Ok("1. Store sessions on disk".to_string()));
        generator.push(Ok("Added disk-backed session store".to_string()));
        generator.push(Ok("FAIL\nno test restarts the server".to_string()));
        generator.push(Ok("Added restart test".to_string()));
        generator.push(Ok("PASS\ntests/session_test.rs::survives_restart".to_string()));
        let mut machine = machine(&config, &fakes);

        let resolution = machine.start(&login_issue()).await.unwrap();
        assert_eq!(resolution.failures, 1);
        assert!(fakes.generator.prompts().iter().any(|p| p.starts_with("Fix quality checks")));
    }

    #[tokio::test]
    async fn test_ci_failure_is_fixed_and_retried() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        fakes.tracker.script_checks(vec![
            vec![CheckResult::new("build", CheckState::Pending, "")],
            vec![CheckResult::new("build", CheckState::Failure, "error[E0308]: mismatched types")],
        ]);
        let mut machine = machine(&config, &fakes);

        let resolution = machine.start(&login_issue()).await.unwrap();
        assert_eq!(resolution.failures, 1);
        assert!(fakes.generator.prompts().iter().any(|p| p.starts_with("Fix CI failures")));
        // The PR is reused on the second attempt
        assert_eq!(fakes.tracker.prs().len(), 1);
    }

    #[tokio::test]
    async fn test_close_failure_is_charged_and_retried() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        fakes.tracker.fail_closes(1);
        let mut machine = machine(&config, &fakes);

        let resolution = machine.start(&login_issue()).await.unwrap();

        assert_eq!(resolution.failures, 1);
        assert_eq!(fakes.tracker.closed().len(), 1);
        // Merged once; the retry picks up from the recorded merge
        assert_eq!(fakes.vcs.merged(), vec![500]);
        assert_eq!(machine.knowledge().entries().len(), 1);
        assert!(
            !fakes
                .generator
                .prompts()
                .iter()
                .any(|p| p.starts_with("Fix CI failures"))
        );
    }

    #[tokio::test]
    async fn test_close_failures_escalate_in_phase_six() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        fakes.tracker.fail_closes(5);
        let mut machine = machine(&config, &fakes);

        let err = machine.start(&login_issue()).await.unwrap_err();
        let escalation = err.escalation().unwrap();
        assert_eq!(escalation.phase, Phase::CiAndPr);
        assert_eq!(escalation.attempts, 5);
        assert!(config.escalations_dir().join("25.json").exists());

        let cp = machine.store().load(IssueId(25)).unwrap().unwrap();
        assert_eq!(cp.artifact(MERGED_ARTIFACT), Some("squash"));
        assert_eq!(fakes.vcs.merged(), vec![500]);
    }

    #[tokio::test]
    async fn test_resume_after_merge_and_record_repeats_neither() {
        use crate::issue::IssueStatus;

        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let branch = "conductor/issue-25-persist-login-session";
        let mut closed = login_issue();
        closed.status = IssueStatus::Closed;
        let fakes = Fakes::new(vec![closed]);
        fakes.vcs.add_remote_branch(branch);

        let mut cp = Checkpoint::new(IssueId(25), branch);
        for phase in [
            Phase::SelectionSetup,
            Phase::ContextPlanning,
            Phase::Implementation,
            Phase::QualityChecks,
            Phase::ReviewCycle,
        ] {
            cp.mark_complete(phase).unwrap();
        }
        cp.set_artifact(PR_NUMBER_ARTIFACT, "500");
        cp.set_artifact(PR_URL_ARTIFACT, "https://example.test/pull/500");
        cp.set_artifact(MERGED_ARTIFACT, "squash");

        // The entry was written just before the process stopped
        let mut kb = KnowledgeBase::open(&config.knowledge_file()).unwrap();
        kb.record(IssueId(25), 4.0, 1.0, "").unwrap();
        drop(kb);

        let mut machine = machine(&config, &fakes);
        machine.store().save(&cp).unwrap();
        let resolution = machine.resume(IssueId(25)).await.unwrap();

        assert_eq!(resolution.pr.map(|p| p.number), Some(500));
        assert!(fakes.vcs.merged().is_empty());
        assert!(fakes.tracker.closed().is_empty());
        assert_eq!(machine.knowledge().entries().len(), 1);
    }

    #[tokio::test]
    async fn test_planning_retries_once_then_escalates_without_budget() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        fakes.generator.push(Err(anyhow::anyhow!("model overloaded")));
        fakes.generator.push(Ok("   ".to_string()));
        let mut machine = machine(&config, &fakes);

        let err = machine.start(&login_issue()).await.unwrap_err();
        let escalation = err.escalation().unwrap();
        assert_eq!(escalation.phase, Phase::ContextPlanning);
        assert_eq!(escalation.attempts, 2);

        let cp = machine.store().load(IssueId(25)).unwrap().unwrap();
        assert_eq!(cp.completed_phases, vec![Phase::SelectionSetup]);
        assert_eq!(cp.artifact(BUDGET_ARTIFACT), Some("0"));
    }

    #[tokio::test]
    async fn test_resume_matches_uninterrupted_run() {
        // Uninterrupted
        let straight_dir = tempdir().unwrap();
        let straight_config = test_config(straight_dir.path());
        let straight = Fakes::new(vec![login_issue()]);
        let straight_resolution = machine(&straight_config, &straight)
            .start(&login_issue())
            .await
            .unwrap();

        // Interrupted in Phase 2, then resumed by a new machine
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        fakes.generator.push(Err(anyhow::anyhow!("connection reset")));
        fakes.generator.push(Err(anyhow::anyhow!("connection reset")));
        let mut first = machine(&config, &fakes);
        assert!(first.start(&login_issue()).await.is_err());
        drop(first);

        let mut second = machine(&config, &fakes);
        let resolution = second.resume(IssueId(25)).await.unwrap();

        assert_eq!(resolution.issue_id, straight_resolution.issue_id);
        assert_eq!(resolution.branch, straight_resolution.branch);
        assert_eq!(
            resolution.pr.map(|p| p.number),
            straight_resolution.pr.map(|p| p.number)
        );
        assert_eq!(resolution.failures, straight_resolution.failures);
        assert_eq!(fakes.tracker.closed(), straight.tracker.closed());
        assert_eq!(second.knowledge().entries().len(), 1);
        assert!(second.store().load(IssueId(25)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_with_missing_branch_is_stale() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        let sha = "0000000000000000000000000000000000000001";
        fakes.vcs.add_commit(sha);

        let mut cp = Checkpoint::new(IssueId(25), "conductor/issue-25-persist-login-session");
        for phase in [Phase::SelectionSetup, Phase::ContextPlanning, Phase::Implementation] {
            cp.mark_complete(phase).unwrap();
        }
        cp.push_commit(sha);

        let mut machine = machine(&config, &fakes);
        machine.store().save(&cp).unwrap();

        let err = machine.resume(IssueId(25)).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("no longer exists upstream"));

        // Not restarted: the checkpoint is untouched and no work happened
        let kept = machine.store().load(IssueId(25)).unwrap().unwrap();
        assert_eq!(kept.completed_phases.len(), 3);
        assert!(fakes.vcs.pushes().is_empty());
        assert!(fakes.generator.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_resume_with_missing_commit_is_stale() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        let branch = "conductor/issue-25-persist-login-session";
        fakes.vcs.add_remote_branch(branch);

        let mut cp = Checkpoint::new(IssueId(25), branch);
        for phase in [Phase::SelectionSetup, Phase::ContextPlanning, Phase::Implementation] {
            cp.mark_complete(phase).unwrap();
        }
        cp.push_commit("00000000000000000000000000000000000000ff");

        let mut machine = machine(&config, &fakes);
        machine.store().save(&cp).unwrap();

        let err = machine.resume(IssueId(25)).await.unwrap_err();
        assert!(err.to_string().contains("no longer exists"));
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let fakes = Fakes::new(vec![login_issue()]);
        let mut machine = machine(&config, &fakes);

        let err = machine.resume(IssueId(25)).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Configuration(ConfigurationError::MissingCheckpoint { .. })
        ));
    }
}
