//! Configuration view and validation commands: `conductor config`.

use anyhow::Result;
use conductor::config::{CONFIG_FILE, ConductorConfig, ConductorToml, STATE_DIR};

use super::super::ConfigCommands;

fn print_sections(toml: &ConductorToml) {
    let project = &toml.project;
    println!("[project]");
    match &project.repo {
        Some(repo) => println!("  repo = \"{}\"", repo),
        None => println!("  repo = (unset)"),
    }
    println!("  base_branch = \"{}\"", project.base_branch);
    println!("  remote = \"{}\"", project.remote);
    println!("  branch_prefix = \"{}\"", project.branch_prefix);
    println!();

    let selection = &toml.selection;
    println!("[selection]");
    println!("  similarity_threshold = {}", selection.similarity_threshold);
    println!("  effort_ceiling_hours = {}", selection.effort_ceiling_hours);
    println!("  default_estimate_hours = {}", selection.default_estimate_hours);
    let w = &selection.impact;
    println!(
        "  impact = value {} / urgency {} / unblock {} / risk {} / effort {}",
        w.value, w.urgency, w.unblock, w.risk, w.effort
    );
    let d = &selection.duplicates;
    println!(
        "  duplicates = title {} / criteria {} / files {}",
        d.title, d.criteria, d.files
    );
    println!();

    println!("[budget]");
    println!("  iterations = {}", toml.budget.iterations);
    println!("  planning_retries = {}", toml.budget.planning_retries);
    println!();

    let t = &toml.timeouts;
    println!("[timeouts]");
    println!(
        "  tracker = {}s, vcs = {}s, command = {}s, generation = {}s, ci = {}s (poll {}s)",
        t.tracker, t.vcs, t.command, t.generation, t.ci, t.ci_poll
    );
    println!();

    println!("[checks]");
    for (name, commands) in [
        ("lint", &toml.checks.lint),
        ("test", &toml.checks.test),
        ("build", &toml.checks.build),
    ] {
        if !commands.is_empty() {
            println!("  {} = {:?}", name, commands);
        }
    }
    println!("  log_tail_lines = {}", toml.checks.log_tail_lines);
    println!();

    println!("[review]");
    println!("  self_review = {}", toml.review.self_review);
    if !toml.review.commands.is_empty() {
        println!("  commands = {:?}", toml.review.commands);
    }
    println!();

    println!("[ci]");
    println!("  merge_strategy = \"{}\"", toml.ci.merge_strategy);
    println!("  auto_merge = {}", toml.ci.auto_merge);
    println!();
}

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let state_dir = project_dir.join(STATE_DIR);
    let config_path = state_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_sections(&ConductorToml::load(&config_path)?);

                // Show effective values (including env overrides)
                println!("Effective values (with env overrides):");
                let config = ConductorConfig::new(project_dir.to_path_buf())?;
                println!(
                    "  repo = {}",
                    config.toml.project.repo.as_deref().unwrap_or("(unset)")
                );
                println!("  generator = \"{}\"", config.toml.generation.command);
                println!();
            } else {
                println!("No conductor.toml found at {}", config_path.display());
                println!();
                println!("Using default configuration:");
                println!();
                print_sections(&ConductorToml::default());
                println!("Run 'conductor config init' to create a conductor.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conductor.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ConductorToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conductor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !state_dir.exists() {
                std::fs::create_dir_all(&state_dir)?;
            }

            let toml = ConductorToml::default();
            toml.save(&config_path)?;

            println!("Created conductor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [project] repo, base_branch, branch_prefix");
            println!("  - [checks] lint, test and build commands");
            println!("  - [selection] impact and duplicate weights");
            println!();
        }
    }

    Ok(())
}
