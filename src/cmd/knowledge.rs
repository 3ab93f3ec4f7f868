//! `conductor knowledge`: inspect or append to the knowledge base.

use anyhow::Result;
use conductor::config::ConductorConfig;
use conductor::knowledge::{KnowledgeBase, display_entries, display_patterns};

use super::super::KnowledgeCommands;

pub fn cmd_knowledge(config: &ConductorConfig, command: Option<KnowledgeCommands>) -> Result<()> {
    let mut kb = KnowledgeBase::open(&config.knowledge_file())?;

    match command {
        None | Some(KnowledgeCommands::Show) => display_entries(kb.entries()),
        Some(KnowledgeCommands::Patterns) => display_patterns(kb.patterns(), kb.entries().len()),
        Some(KnowledgeCommands::Record {
            issue,
            estimated,
            actual,
            notes,
        }) => {
            let entry = kb.record(issue, estimated, actual, &notes)?;
            println!(
                "Recorded {}: {:.1}h estimated, {:.1}h actual ({:.2}x)",
                entry.issue_id, entry.estimated_hours, entry.actual_hours, entry.multiplier
            );
        }
    }
    Ok(())
}
