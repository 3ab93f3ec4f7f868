//! Unified configuration for the orchestrator.
//!
//! Reads `.conductor/conductor.toml`. Every field has a default, so a
//! missing or empty file is valid. Values are layered file → environment →
//! CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! repo = "acme/widgets"
//! base_branch = "main"
//!
//! [selection]
//! similarity_threshold = 0.75
//! effort_ceiling_hours = 40.0
//!
//! [selection.impact]
//! value = 0.35
//! urgency = 0.25
//! unblock = 0.20
//! risk = 0.10
//! effort = 0.10
//!
//! [budget]
//! iterations = 5
//! planning_retries = 1
//!
//! [checks]
//! lint = ["cargo clippy -- -D warnings"]
//! test = ["cargo test"]
//!
//! [ci]
//! merge_strategy = "squash"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collaborators::MergeStrategy;
use crate::dag::DuplicateWeights;
use crate::selection::ImpactWeights;

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".conductor";

/// Name of the configuration file inside the state directory.
pub const CONFIG_FILE: &str = "conductor.toml";

/// Repository and branch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// `owner/name` of the tracked repository
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Prefix for work branches (`<prefix>/issue-<id>-<slug>`)
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch_prefix() -> String {
    "conductor".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            repo: None,
            base_branch: default_base_branch(),
            remote: default_remote(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

/// Selection and duplicate-detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSection {
    /// Duplicate similarity threshold on a 0.0-1.0 scale
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default)]
    pub impact: ImpactWeights,
    #[serde(default)]
    pub duplicates: DuplicateWeights,
    /// Estimate at which the effort sub-score saturates to 1.0
    #[serde(default = "default_effort_ceiling_hours")]
    pub effort_ceiling_hours: f64,
    /// Estimate used for issues that carry none
    #[serde(default = "default_estimate_hours")]
    pub default_estimate_hours: f64,
    /// Label → value sub-score
    #[serde(default = "default_value_labels")]
    pub value_labels: BTreeMap<String, f64>,
    /// Label → risk sub-score
    #[serde(default = "default_risk_labels")]
    pub risk_labels: BTreeMap<String, f64>,
}

fn default_similarity_threshold() -> f64 {
    0.75
}

fn default_effort_ceiling_hours() -> f64 {
    40.0
}

fn default_estimate_hours() -> f64 {
    4.0
}

fn default_value_labels() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("security".to_string(), 1.0),
        ("bug".to_string(), 0.8),
        ("feature".to_string(), 0.7),
        ("enhancement".to_string(), 0.6),
        ("documentation".to_string(), 0.3),
        ("chore".to_string(), 0.2),
    ])
}

fn default_risk_labels() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("risk:high".to_string(), 1.0),
        ("risk:medium".to_string(), 0.5),
        ("risk:low".to_string(), 0.1),
    ])
}

impl Default for SelectionSection {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            impact: ImpactWeights::default(),
            duplicates: DuplicateWeights::default(),
            effort_ceiling_hours: default_effort_ceiling_hours(),
            default_estimate_hours: default_estimate_hours(),
            value_labels: default_value_labels(),
            risk_labels: default_risk_labels(),
        }
    }
}

/// Retry budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSection {
    /// Failed attempts allowed across Phases 3-6 combined
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Extra planning attempts with broadened context
    #[serde(default = "default_planning_retries")]
    pub planning_retries: u32,
}

fn default_iterations() -> u32 {
    5
}

fn default_planning_retries() -> u32 {
    1
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            planning_retries: default_planning_retries(),
        }
    }
}

/// Per-collaborator timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_tracker_timeout")]
    pub tracker: u64,
    #[serde(default = "default_vcs_timeout")]
    pub vcs: u64,
    #[serde(default = "default_command_timeout")]
    pub command: u64,
    #[serde(default = "default_generation_timeout")]
    pub generation: u64,
    /// Overall wait for required CI checks
    #[serde(default = "default_ci_timeout")]
    pub ci: u64,
    #[serde(default = "default_ci_poll")]
    pub ci_poll: u64,
}

fn default_tracker_timeout() -> u64 {
    30
}

fn default_vcs_timeout() -> u64 {
    120
}

fn default_command_timeout() -> u64 {
    900
}

fn default_generation_timeout() -> u64 {
    1800
}

fn default_ci_timeout() -> u64 {
    3600
}

fn default_ci_poll() -> u64 {
    30
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            tracker: default_tracker_timeout(),
            vcs: default_vcs_timeout(),
            command: default_command_timeout(),
            generation: default_generation_timeout(),
            ci: default_ci_timeout(),
            ci_poll: default_ci_poll(),
        }
    }
}

impl TimeoutsSection {
    pub fn tracker(&self) -> Duration {
        Duration::from_secs(self.tracker)
    }

    pub fn vcs(&self) -> Duration {
        Duration::from_secs(self.vcs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command)
    }

    pub fn generation(&self) -> Duration {
        Duration::from_secs(self.generation)
    }

    pub fn ci(&self) -> Duration {
        Duration::from_secs(self.ci)
    }

    pub fn ci_poll(&self) -> Duration {
        Duration::from_secs(self.ci_poll)
    }
}

/// Quality-check commands run in Phase 4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksSection {
    #[serde(default)]
    pub lint: Vec<String>,
    #[serde(default)]
    pub test: Vec<String>,
    #[serde(default)]
    pub build: Vec<String>,
    /// Lines of command output kept as diagnostics
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
    /// Path fragments that mark a changed file as a test
    #[serde(default = "default_test_path_markers")]
    pub test_path_markers: Vec<String>,
}

fn default_log_tail_lines() -> usize {
    40
}

fn default_test_path_markers() -> Vec<String> {
    vec![
        "test".to_string(),
        "spec".to_string(),
        "__tests__".to_string(),
    ]
}

impl Default for ChecksSection {
    fn default() -> Self {
        Self {
            lint: Vec::new(),
            test: Vec::new(),
            build: Vec::new(),
            log_tail_lines: default_log_tail_lines(),
            test_path_markers: default_test_path_markers(),
        }
    }
}

/// Review cycle settings for Phase 5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSection {
    #[serde(default = "default_self_review")]
    pub self_review: bool,
    /// Automated reviewer commands; non-zero exit means findings
    #[serde(default)]
    pub commands: Vec<String>,
}

fn default_self_review() -> bool {
    true
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            self_review: default_self_review(),
            commands: Vec::new(),
        }
    }
}

/// Text-generation collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSection {
    #[serde(default = "default_generation_command")]
    pub command: String,
    #[serde(default = "default_generation_args")]
    pub args: Vec<String>,
    /// Context budget in characters
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,
}

fn default_generation_command() -> String {
    "claude".to_string()
}

fn default_generation_args() -> Vec<String> {
    vec!["--print".to_string(), "--dangerously-skip-permissions".to_string()]
}

fn default_context_budget() -> usize {
    60_000
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            command: default_generation_command(),
            args: default_generation_args(),
            context_budget: default_context_budget(),
        }
    }
}

/// CI and merge settings for Phase 6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiSection {
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default = "default_auto_merge")]
    pub auto_merge: bool,
}

fn default_auto_merge() -> bool {
    true
}

impl Default for CiSection {
    fn default() -> Self {
        Self {
            merge_strategy: MergeStrategy::default(),
            auto_merge: default_auto_merge(),
        }
    }
}

/// What happens besides the on-disk report when an issue escalates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationSection {
    /// Also file a tracker issue containing the escalation report
    #[serde(default)]
    pub open_issue: bool,
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Write a daily-rolling log file under `.conductor/logs`
    #[serde(default = "default_log_file")]
    pub file: bool,
}

fn default_log_level() -> String {
    "conductor=info".to_string()
}

fn default_log_file() -> bool {
    true
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: default_log_file(),
        }
    }
}

/// The complete conductor.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub selection: SelectionSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub checks: ChecksSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub ci: CiSection,
    #[serde(default)]
    pub escalation: EscalationSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load from `<state_dir>/conductor.toml`, or defaults if absent.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let threshold = self.selection.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            warnings.push(format!(
                "similarity_threshold {} is outside 0.0-1.0",
                threshold
            ));
        }

        let impact_sum = self.selection.impact.sum();
        if (impact_sum - 1.0).abs() > 1e-6 {
            warnings.push(format!(
                "Impact weights sum to {:.3}, expected 1.0",
                impact_sum
            ));
        }

        let dup_sum = self.selection.duplicates.sum();
        if (dup_sum - 1.0).abs() > 1e-6 {
            warnings.push(format!(
                "Duplicate weights sum to {:.3}, expected 1.0",
                dup_sum
            ));
        }

        if self.selection.effort_ceiling_hours <= 0.0 {
            warnings.push("effort_ceiling_hours must be positive".to_string());
        }

        if self.selection.default_estimate_hours <= 0.0 {
            warnings.push("default_estimate_hours must be positive".to_string());
        }

        if self.budget.iterations == 0 {
            warnings.push(
                "budget.iterations is 0: every repair attempt will escalate immediately"
                    .to_string(),
            );
        }

        if self.checks.lint.is_empty() && self.checks.test.is_empty() {
            warnings.push(
                "No lint or test commands configured: quality checks only verify acceptance criteria"
                    .to_string(),
            );
        }

        if self.project.repo.is_none() && std::env::var("CONDUCTOR_REPO").is_err() {
            warnings.push("No repository configured ([project] repo or CONDUCTOR_REPO)".to_string());
        }

        warnings
    }
}

/// CLI-level overrides applied on top of file and environment values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub repo: Option<String>,
    pub base_branch: Option<String>,
    pub budget: Option<u32>,
    pub log_json: bool,
}

/// Resolved runtime configuration.
///
/// Merges settings from:
/// 1. conductor.toml
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub toml: ConductorToml,
    pub verbose: bool,
}

impl ConductorConfig {
    /// Load configuration for a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_overrides(project_dir, false, CliOverrides::default())
    }

    /// Load configuration and apply CLI overrides.
    pub fn with_overrides(
        project_dir: PathBuf,
        verbose: bool,
        overrides: CliOverrides,
    ) -> Result<Self> {
        let state_dir = project_dir.join(STATE_DIR);
        let mut toml = ConductorToml::load_or_default(&state_dir)?;

        if let Ok(repo) = std::env::var("CONDUCTOR_REPO") {
            toml.project.repo = Some(repo);
        }
        if let Ok(cmd) = std::env::var("CONDUCTOR_GENERATOR_CMD") {
            toml.generation.command = cmd;
        }

        if let Some(repo) = overrides.repo {
            toml.project.repo = Some(repo);
        }
        if let Some(base) = overrides.base_branch {
            toml.project.base_branch = base;
        }
        if let Some(budget) = overrides.budget {
            toml.budget.iterations = budget;
        }
        if overrides.log_json {
            toml.logging.json = true;
        }

        Ok(Self {
            project_dir,
            state_dir,
            toml,
            verbose,
        })
    }

    /// The tracked repository, required for anything that talks to the tracker.
    pub fn repo(&self) -> Result<String> {
        self.toml.project.repo.clone().ok_or_else(|| {
            anyhow::anyhow!(
                "No repository configured. Set [project] repo in {} or CONDUCTOR_REPO",
                self.config_path().display()
            )
        })
    }

    /// API token for the issue tracker.
    pub fn github_token(&self) -> Result<String> {
        std::env::var("GITHUB_TOKEN")
            .context("GITHUB_TOKEN must be set to talk to the issue tracker")
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn knowledge_file(&self) -> PathBuf {
        self.state_dir.join("knowledge.json")
    }

    pub fn escalations_dir(&self) -> PathBuf {
        self.state_dir.join("escalations")
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.state_dir.join("plans")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).with_context(|| {
            format!("Failed to create directory: {}", self.state_dir.display())
        })?;
        // The state directory lives inside the work tree; keep it out of commits
        let ignore = self.state_dir.join(".gitignore");
        if !ignore.exists() {
            std::fs::write(&ignore, "*\n")
                .with_context(|| format!("Failed to write {}", ignore.display()))?;
        }

        for dir in [
            self.checkpoints_dir(),
            self.escalations_dir(),
            self.plans_dir(),
            self.log_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}
