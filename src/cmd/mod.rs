//! CLI command implementations.
//!
//! | Module      | Commands handled              |
//! |-------------|-------------------------------|
//! | `run`       | `Run`, `Select`, `Resume`     |
//! | `status`    | `Status`                      |
//! | `knowledge` | `Knowledge`                   |
//! | `config`    | `Config`                      |

pub mod config;
pub mod knowledge;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use knowledge::cmd_knowledge;
pub use run::{cmd_resume, cmd_run, cmd_select};
pub use status::cmd_status;

use anyhow::Result;
use conductor::collaborators::Collaborators;
use conductor::collaborators::claude::ClaudeGenerator;
use conductor::collaborators::git::GitRepository;
use conductor::collaborators::github::{
    GitHubTracker, is_valid_github_token, parse_owner_repo_from_url,
};
use conductor::collaborators::process::ShellRunner;
use conductor::config::{CliOverrides, ConductorConfig};
use std::path::PathBuf;
use std::sync::Arc;

use super::Cli;

/// Resolve configuration from conductor.toml, the environment and CLI flags.
pub fn load_config(cli: &Cli, project_dir: PathBuf) -> Result<ConductorConfig> {
    let overrides = CliOverrides {
        repo: cli.repo.clone(),
        base_branch: cli.base_branch.clone(),
        budget: cli.budget,
        log_json: cli.log_json,
    };
    ConductorConfig::with_overrides(project_dir, cli.verbose, overrides)
}

/// Wire the production collaborators: GitHub, git, shell and the generator CLI.
///
/// When no repository is configured it is derived from the git remote.
pub fn build_collaborators(config: &mut ConductorConfig) -> Result<Collaborators> {
    let vcs = GitRepository::new(&config.project_dir, &config.toml.project.remote);

    if config.toml.project.repo.is_none()
        && let Some(repo) = vcs.remote_url().as_deref().and_then(parse_owner_repo_from_url)
    {
        tracing::info!(repo = %repo, "Using repository from git remote");
        config.toml.project.repo = Some(repo);
    }
    let repo = config.repo()?;
    if let Ok(branch) = vcs.current_branch() {
        tracing::debug!(branch = %branch, "Working tree branch");
    }

    let token = config.github_token()?;
    if !is_valid_github_token(&token) {
        tracing::warn!("GITHUB_TOKEN does not look like a GitHub token");
    }

    let generation = &config.toml.generation;
    Ok(Collaborators {
        tracker: Arc::new(GitHubTracker::new(&token, &repo)),
        vcs: Arc::new(vcs),
        runner: Arc::new(ShellRunner::new(config.toml.checks.log_tail_lines)),
        generator: Arc::new(ClaudeGenerator::new(
            &generation.command,
            &generation.args,
            &config.project_dir,
        )),
    })
}
