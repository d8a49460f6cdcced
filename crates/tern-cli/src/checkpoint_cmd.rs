//! `tern checkpoint` commands: inspect or clear persisted checkpoints.

use anyhow::{Context, Result};

use tern_store::CheckpointLoad;
use tern_store::checkpoint::HistoryEntry;
use tern_store::models::Mode;

use crate::CheckpointCommands;
use crate::project::Project;

pub fn run_checkpoint_command(command: CheckpointCommands, project: &Project) -> Result<()> {
    match command {
        CheckpointCommands::Show { mode } => show(project, mode),
        CheckpointCommands::History { mode, limit } => {
            let entries = project.checkpoints().history(mode, limit);
            print_history(mode, &entries);
            Ok(())
        }
        CheckpointCommands::Clear { mode } => {
            let _lock = project.lock()?;
            project
                .checkpoints()
                .clear(mode)
                .with_context(|| format!("failed to clear the {mode} checkpoint"))?;
            println!("Cleared everything stored for the {mode} workflow.");
            Ok(())
        }
    }
}

fn show(project: &Project, mode: Mode) -> Result<()> {
    match project.checkpoints().load(mode) {
        CheckpointLoad::Missing => {
            println!("No checkpoint for the {mode} workflow.");
        }
        CheckpointLoad::Corrupt(reason) => {
            eprintln!("warning: the {mode} checkpoint is unusable: {reason}");
            eprintln!("The next `tern run {mode}` will start over.");
        }
        CheckpointLoad::Found(run) => {
            let rendered =
                serde_json::to_string_pretty(&run).context("failed to serialize checkpoint")?;
            println!("{rendered}");
        }
    }
    Ok(())
}

fn print_history(mode: Mode, entries: &[HistoryEntry]) {
    if entries.is_empty() {
        println!("No checkpoint history for the {mode} workflow.");
        return;
    }

    println!(
        "{:<20} {:<18} {:<28} {:<12} {:>9}",
        "SAVED", "STATE", "STEP", "PROVIDER", "COMPLETED"
    );
    println!("{}", "-".repeat(91));
    for entry in entries {
        println!(
            "{:<20} {:<18} {:<28} {:<12} {:>9}",
            entry.saved_at.format("%Y-%m-%d %H:%M:%S"),
            entry.state.to_string(),
            entry.current_step_id.as_deref().unwrap_or("-"),
            entry.current_provider_id.as_deref().unwrap_or("-"),
            entry.completed
        );
    }
}
