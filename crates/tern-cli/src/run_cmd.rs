//! `tern run` command: run or resume a workflow.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use tern_core::config::HarnessConfig;
use tern_core::runner::LivenessCallback;
use tern_core::{RunOutcome, RunRequest, RunSummary};
use tern_store::models::Mode;

use crate::project::Project;

pub struct RunArgs {
    pub mode: Mode,
    pub step: Option<String>,
    pub force: bool,
    pub answers: Vec<(u32, String)>,
    pub timeout: Option<u64>,
}

/// Parse `N=TEXT` into a question number and answer.
pub fn parse_answer(raw: &str) -> Result<(u32, String), String> {
    let (number, text) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected N=TEXT, got {raw:?}"))?;
    let number: u32 = number
        .trim()
        .parse()
        .map_err(|_| format!("question number must be a positive integer, got {number:?}"))?;
    if number == 0 {
        return Err("question numbers start at 1".to_string());
    }
    Ok((number, text.to_string()))
}

/// Run the workflow and return the process exit code.
pub async fn run(project: &Project, mut config: HarnessConfig, args: RunArgs) -> Result<i32> {
    if let Some(secs) = args.timeout {
        config.harness.step_timeout_secs = secs;
        config.validate().context("invalid --timeout")?;
    }

    let _lock = project.lock()?;

    let liveness: LivenessCallback = Arc::new(|step_id: &str, elapsed: Duration| {
        eprintln!("  ... {step_id} still running ({}s)", elapsed.as_secs());
    });
    let mut runner = project.runner(args.mode, config)?.with_liveness(liveness);

    println!("Running {} workflow in {}", args.mode, project.dir.display());

    let cancel = CancellationToken::new();
    let signals = spawn_signal_handler(cancel.clone());

    let request = RunRequest {
        step: args.step,
        force: args.force,
        answers: args.answers.into_iter().collect(),
    };
    let result = runner.run(request, cancel).await;
    signals.abort();

    let summary = result.with_context(|| format!("{} workflow could not run", args.mode))?;
    print_summary(args.mode, &summary);
    Ok(summary.outcome.exit_code())
}

/// First Ctrl-C (or SIGTERM) cancels gracefully, a second force-exits.
fn spawn_signal_handler(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let got_first_signal = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        loop {
            wait_for_signal().await;
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nStopping after the current step is cancelled (Ctrl+C again to force)...");
            cancel.cancel();
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}

fn print_summary(mode: Mode, summary: &RunSummary) {
    for warning in &summary.warnings {
        eprintln!("warning: {warning}");
    }

    let run = &summary.run;
    match &summary.outcome {
        RunOutcome::Completed => {
            println!(
                "\n{mode} workflow completed ({} steps).",
                run.completed_steps.len()
            );
        }
        RunOutcome::PausedForUserInput { step_id, questions } => {
            println!("\nPaused: step {step_id} needs your input.");
            for question in questions {
                let marker = if question.required { "" } else { " (optional)" };
                println!("  {}. {}{marker}", question.number, question.text);
            }
            println!();
            println!("Answer and resume with:");
            println!("  tern run {mode} --answer 1=\"...\"");
        }
        RunOutcome::PausedRateLimited { resume_after } => {
            match resume_after {
                Some(at) => println!(
                    "\nPaused: every provider is unavailable until {}.",
                    at.format("%Y-%m-%d %H:%M:%S UTC")
                ),
                None => println!("\nPaused: no provider is available."),
            }
            println!("Re-run `tern run {mode}` to resume.");
        }
        RunOutcome::PausedError { step_id, message } => {
            println!("\nPaused on {step_id} after an internal error: {message}");
            println!("Re-run `tern run {mode}` to retry.");
        }
        RunOutcome::Failed(record) => {
            println!("\nAborted: {record}");
            println!();
            println!("Options:");
            println!("  retry the step:     tern run {mode} --force");
            println!("  start over:         tern reset {mode}");
        }
        RunOutcome::Interrupted { step_id } => {
            match step_id {
                Some(id) => println!("\nInterrupted during {id}."),
                None => println!("\nInterrupted."),
            }
            println!("Re-run `tern run {mode}` to resume.");
        }
    }
}
