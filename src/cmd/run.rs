//! Orchestration commands: `conductor run`, `select` and `resume`.

use anyhow::Result;
use conductor::config::ConductorConfig;
use conductor::errors::{ConfigurationError, OrchestratorError};
use conductor::issue::IssueId;
use conductor::orchestrator::{CheckpointStore, Orchestrator, Resolution, StopReason};
use console::style;

use super::build_collaborators;

fn print_resolution(resolution: &Resolution) {
    let pr = resolution
        .pr
        .as_ref()
        .map(|pr| format!("PR #{} {}", pr.number, pr.url))
        .unwrap_or_else(|| "no PR".to_string());
    println!(
        "  {} {} on {} ({}, {} failed attempt{})",
        style("✓").green(),
        resolution.issue_id,
        resolution.branch,
        pr,
        resolution.failures,
        if resolution.failures == 1 { "" } else { "s" }
    );
}

pub async fn cmd_run(
    mut config: ConductorConfig,
    issue: Option<IssueId>,
    max_issues: Option<usize>,
) -> Result<()> {
    let collab = build_collaborators(&mut config)?;
    let mut orchestrator = Orchestrator::new(config, collab)?;

    let summary = orchestrator.run(issue, max_issues).await?;

    println!();
    println!(
        "{} resolved {} issue{}",
        style("conductor").bold(),
        summary.resolved.len(),
        if summary.resolved.len() == 1 { "" } else { "s" }
    );
    for resolution in &summary.resolved {
        print_resolution(resolution);
    }
    let reason = match summary.stop {
        StopReason::NoEligibleIssue => "no eligible issue remains",
        StopReason::MaxIssues => "reached --max-issues",
        StopReason::ExplicitDone => "requested issue resolved",
    };
    println!("  Stopped: {}", style(reason).dim());
    println!();
    Ok(())
}

pub async fn cmd_select(mut config: ConductorConfig, issue: Option<IssueId>) -> Result<()> {
    let collab = build_collaborators(&mut config)?;
    let orchestrator = Orchestrator::read_only(config, collab)?;
    let preview = orchestrator.preview(issue).await?;

    println!();
    if !preview.duplicates.is_empty() {
        println!("{}", style("Duplicates that would be closed").bold());
        for group in &preview.duplicates {
            let closing: Vec<String> = group.duplicates().map(|id| id.to_string()).collect();
            println!("  {} (keeps {})", closing.join(", "), group.canonical);
        }
        println!();
    }

    if !preview.unconfirmed_edges.is_empty() {
        println!("{}", style("Advisory relations not confirmed by the tracker").bold());
        for edge in &preview.unconfirmed_edges {
            println!("  {} -> {}", edge.from, edge.to);
        }
        println!();
    }

    if !preview.retained.is_empty() {
        let ids: Vec<String> = preview.retained.iter().map(|id| id.to_string()).collect();
        println!("Skipped (checkpoint retained): {}", ids.join(", "));
        println!();
    }

    if preview.ranked.is_empty() {
        println!("No eligible issue.");
        println!();
        return Ok(());
    }

    println!(
        "{:<4} {:<8} {:<8} {:<10} {:<40}",
        "Rank", "Issue", "Score", "Est. (h)", "Title"
    );
    println!(
        "{:<4} {:<8} {:<8} {:<10} {:<40}",
        "----", "--------", "--------", "----------", "----------------------------------------"
    );
    for (rank, scored) in preview.ranked.iter().enumerate() {
        println!(
            "{:<4} {:<8} {:<8.3} {:<10.1} {:<40}",
            rank + 1,
            scored.id().to_string(),
            scored.score,
            scored.adjusted_estimate_hours,
            conductor::util::truncate_str(&scored.issue.title, 40)
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_resume(mut config: ConductorConfig, issue: IssueId) -> Result<()> {
    // Fail on a missing or unreadable checkpoint before touching credentials.
    let store = CheckpointStore::open_read_only(&config.checkpoints_dir());
    let checkpoint = store
        .load(issue)?
        .ok_or(ConfigurationError::MissingCheckpoint { issue })
        .map_err(OrchestratorError::from)?;
    println!(
        "Resuming {} at {}",
        issue,
        checkpoint
            .next_phase()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "completion".to_string())
    );

    let collab = build_collaborators(&mut config)?;
    let mut orchestrator = Orchestrator::new(config, collab)?;
    let resolution = orchestrator.resume(issue).await?;

    println!();
    print_resolution(&resolution);
    println!();
    Ok(())
}
