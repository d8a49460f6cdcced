//! `tern status` command: show workflow progress and per-step status.

use anyhow::{Context, Result};

use tern_core::HarnessRunner;
use tern_store::models::WorkflowState;

use crate::project::Project;

/// Entries of the execution log shown after the step list.
const RECENT_LOG_ENTRIES: usize = 5;

pub fn run_status(project: &Project, runner: &HarnessRunner, json: bool) -> Result<()> {
    let report = runner.status();

    if json {
        let rendered =
            serde_json::to_string_pretty(&report.run).context("failed to serialize run")?;
        println!("{rendered}");
        return Ok(());
    }

    if let Some(warning) = &report.warning {
        eprintln!("warning: {warning}");
    }

    let run = &report.run;
    println!("Workflow: {} ({})", run.mode, run.project_dir.display());
    println!("State: {}", run.state);
    if run.state != WorkflowState::Idle {
        println!("Started: {}", run.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        println!("Updated: {}", run.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(provider) = &run.current_provider_id {
        println!("Provider: {provider}");
    }
    if let Some(at) = run.resume_after {
        println!("Resume after: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!(
        "Progress: {}/{} steps completed",
        report.total_steps - report.remaining_steps,
        report.total_steps
    );
    println!(
        "  attempts={} retries={} switches={} rate_limit_waits={}",
        run.metrics.total_attempts,
        run.metrics.retries,
        run.metrics.provider_switches,
        run.metrics.rate_limit_waits,
    );
    println!();

    println!("Steps:");
    for step in runner.catalog().steps() {
        let icon = if run.is_completed(&step.id) {
            "+"
        } else if run.current_step_id.as_deref() == Some(step.id.as_str()) {
            "*"
        } else {
            "."
        };
        let gate = if step.requires_gate_approval {
            " [gate]"
        } else {
            ""
        };
        println!("  [{icon}] {} {}{gate}", step.id, step.display_title());
    }

    if let Some(pending) = &run.pending_input {
        println!();
        println!("Waiting for input on {}:", pending.step_id);
        for question in &pending.questions {
            println!("  {}. {}", question.number, question.text);
        }
    }

    if let Some(failure) = &run.last_failure {
        println!();
        println!("Last failure: {failure}");
    }

    let log = project.checkpoints().read_log(run.mode);
    if !log.is_empty() {
        println!();
        println!("Recent log:");
        let skip = log.len().saturating_sub(RECENT_LOG_ENTRIES);
        for entry in &log[skip..] {
            println!(
                "  {} {:<5} {}",
                entry.timestamp.format("%H:%M:%S"),
                entry.level.to_string(),
                entry.message
            );
        }
    }

    Ok(())
}
