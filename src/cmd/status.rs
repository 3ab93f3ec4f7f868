//! `conductor status`: retained checkpoints and escalation reports.

use anyhow::Result;
use conductor::config::ConductorConfig;
use conductor::orchestrator::{CheckpointStore, IterationBudget};
use console::style;

pub fn cmd_status(config: &ConductorConfig) -> Result<()> {
    let store = CheckpointStore::open_read_only(&config.checkpoints_dir());
    let checkpoints = store.list()?;

    println!();
    if checkpoints.is_empty() {
        println!("No retained checkpoints.");
        println!();
        return Ok(());
    }

    println!(
        "{:<8} {:<30} {:<10} {:<8} {:<20} {:<40}",
        "Issue", "Next phase", "Completed", "Budget", "Last checkpoint", "Branch"
    );
    println!(
        "{:<8} {:<30} {:<10} {:<8} {:<20} {:<40}",
        "--------",
        "------------------------------",
        "----------",
        "--------",
        "--------------------",
        "----------------------------------------"
    );

    let limit = config.toml.budget.iterations;
    for entry in checkpoints {
        let checkpoint = match entry {
            Ok(cp) => cp,
            Err(e) => {
                println!("{} {}", style("invalid").red(), e);
                continue;
            }
        };
        let budget = IterationBudget::from_artifacts(limit, &checkpoint.artifacts);
        let next = checkpoint
            .next_phase()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "done".to_string());
        let escalated = config
            .escalations_dir()
            .join(format!("{}.json", checkpoint.issue_id.0))
            .exists();
        let next = if escalated {
            style(format!("{} !", next)).red().to_string()
        } else {
            next
        };
        println!(
            "{:<8} {:<30} {:<10} {:<8} {:<20} {:<40}",
            checkpoint.issue_id.to_string(),
            next,
            format!("{}/6", checkpoint.completed_phases.len()),
            format!("{}/{}", budget.used(), budget.limit()),
            checkpoint.last_checkpoint_at.format("%Y-%m-%d %H:%M"),
            checkpoint.branch_name
        );
    }
    println!();
    println!("Continue an issue with 'conductor resume <ISSUE>'. '!' marks an escalated issue.");
    println!();
    Ok(())
}
