use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor::errors::OrchestratorError;
use conductor::issue::IssueId;
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Select interdependent issues and drive each one to a merged pull request")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Tracker repository as owner/name. Overrides conductor.toml
    #[arg(long, global = true)]
    pub repo: Option<String>,

    /// Base branch work branches are cut from and merged into
    #[arg(long, global = true)]
    pub base_branch: Option<String>,

    /// Failed attempts allowed across Phases 3-6 of one issue
    #[arg(long, global = true)]
    pub budget: Option<u32>,

    /// Emit console logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Select issues and drive each through the six phases
    Run {
        /// Work on this issue only, bypassing ranking and blocker gating
        #[arg(short, long)]
        issue: Option<IssueId>,

        /// Stop after resolving this many issues
        #[arg(long)]
        max_issues: Option<usize>,
    },
    /// Show what selection would do, without changing anything
    Select {
        #[arg(short, long)]
        issue: Option<IssueId>,
    },
    /// Continue an interrupted or escalated issue from its checkpoint
    Resume { issue: IssueId },
    /// List retained checkpoints
    Status,
    /// Inspect or extend the knowledge base
    Knowledge {
        #[command(subcommand)]
        command: Option<KnowledgeCommands>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum KnowledgeCommands {
    /// List recorded entries
    Show,
    /// Show patterns derived from the entries
    Patterns,
    /// Record a completed issue by hand
    Record {
        issue: IssueId,
        /// Estimated effort in hours
        #[arg(long)]
        estimated: f64,
        /// Actual effort in hours
        #[arg(long)]
        actual: f64,
        #[arg(long, default_value = "")]
        notes: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

/// Process exit code for a failed command.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<OrchestratorError>() {
        Some(OrchestratorError::Configuration(_)) => 2,
        Some(OrchestratorError::EscalationRequired(_)) => 3,
        Some(OrchestratorError::StoreLocked { .. }) => 4,
        _ => 1,
    }
}

async fn dispatch(cli: &Cli) -> Result<()> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Config commands must work even when conductor.toml does not parse.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, command.clone());
    }

    let config = cmd::load_config(cli, project_dir)?;
    let _log_guard = conductor::logging::init_logging(&config)?;

    match &cli.command {
        Commands::Run { issue, max_issues } => cmd::cmd_run(config, *issue, *max_issues).await,
        Commands::Select { issue } => cmd::cmd_select(config, *issue).await,
        Commands::Resume { issue } => cmd::cmd_resume(config, *issue).await,
        Commands::Status => cmd::cmd_status(&config),
        Commands::Knowledge { command } => cmd::cmd_knowledge(&config, command.clone()),
        Commands::Config { .. } => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), err);
            ExitCode::from(exit_code(&err))
        }
    }
}
