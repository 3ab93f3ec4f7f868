//! Terminal rendering of the knowledge base.

use console::style;

use super::base::{KnowledgeEntry, Patterns};
use crate::util::truncate_str;

/// Display recorded entries, oldest first.
pub fn display_entries(entries: &[KnowledgeEntry]) {
    if entries.is_empty() {
        println!("No completed issues recorded yet.");
        println!();
        println!("Entries are added when an issue finishes Phase 6, or with 'conductor knowledge record'.");
        return;
    }

    println!();
    println!(
        "{:<8} {:<10} {:<10} {:<10} {:<20} {:<30}",
        "Issue", "Estimate", "Actual", "Mult.", "Completed", "Notes"
    );
    println!(
        "{:<8} {:<10} {:<10} {:<10} {:<20} {:<30}",
        "--------", "----------", "----------", "----------", "--------------------",
        "------------------------------"
    );

    for entry in entries {
        let multiplier = format!("{:.2}x", entry.multiplier);
        let multiplier = if entry.multiplier > 1.25 {
            style(multiplier).red().to_string()
        } else if entry.multiplier <= 1.0 {
            style(multiplier).green().to_string()
        } else {
            multiplier
        };
        println!(
            "{:<8} {:<10.1} {:<10.1} {:<10} {:<20} {:<30}",
            entry.issue_id.to_string(),
            entry.estimated_hours,
            entry.actual_hours,
            multiplier,
            entry.completed_at.format("%Y-%m-%d %H:%M"),
            truncate_str(&entry.notes, 30)
        );
    }
    println!();
}

/// Display derived patterns.
pub fn display_patterns(patterns: &Patterns, entry_count: usize) {
    println!();
    println!(
        "{} (across {} completed issue{})",
        style("Knowledge patterns").bold(),
        entry_count,
        if entry_count == 1 { "" } else { "s" }
    );
    println!(
        "  Average time multiplier: {:.2}x",
        patterns.avg_time_multiplier
    );

    println!();
    println!("  Success factors:");
    if patterns.success_factors.is_empty() {
        println!("    {}", style("(none yet)").dim());
    }
    for factor in &patterns.success_factors {
        println!("    {} {}", style("+").green(), factor);
    }

    println!();
    println!("  Risk factors:");
    if patterns.risk_factors.is_empty() {
        println!("    {}", style("(none yet)").dim());
    }
    for factor in &patterns.risk_factors {
        println!("    {} {}", style("!").red(), factor);
    }
    println!();
}
