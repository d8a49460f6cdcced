//! `tern jobs` commands: inspect and stop provider jobs.
//!
//! Jobs run inside the `tern run` process that submitted them; these
//! commands read the records it mirrors to the state directory. Stopping a
//! live job signals its owner, which treats it like Ctrl-C.

use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;

use tern_core::JobError;
use tern_store::JobStore;
use tern_store::lock::process_alive;
use tern_store::models::{JobRecord, JobStatus};

use crate::JobsCommands;
use crate::project::Project;

pub async fn run_jobs_command(command: JobsCommands, project: &Project) -> Result<()> {
    let jobs = project.jobs();
    match command {
        JobsCommands::List => {
            let records = jobs.list_jobs().await.context("failed to list jobs")?;
            print_table(&records);
        }
        JobsCommands::Status { job_id } => {
            let id = parse_job_id(&job_id)?;
            let record = jobs.job_status(id).await.map_err(not_found)?;
            print_record(&record);
        }
        JobsCommands::Logs { job_id } => {
            let id = parse_job_id(&job_id)?;
            for line in jobs.job_logs(id).await.map_err(not_found)? {
                println!("{line}");
            }
        }
        JobsCommands::Stop { job_id } => {
            let id = parse_job_id(&job_id)?;
            let record = jobs.job_status(id).await.map_err(not_found)?;
            stop(project, record)?;
        }
        JobsCommands::Clear => {
            let removed = jobs
                .clear_finished()
                .await
                .context("failed to clear job records")?;
            println!("Removed {removed} finished job(s).");
        }
    }
    Ok(())
}

fn parse_job_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid job ID: {raw}"))
}

fn not_found(e: JobError) -> anyhow::Error {
    match e {
        JobError::NotFound(id) => anyhow::anyhow!("job {id} not found"),
        other => anyhow::Error::new(other),
    }
}

fn stop(project: &Project, mut record: JobRecord) -> Result<()> {
    if record.status.is_terminal() {
        println!("Job {} already finished ({}).", record.id, record.status);
        return Ok(());
    }

    let pid = record.owner_pid;
    if pid != std::process::id() && process_alive(pid) {
        signal_owner(pid)?;
        println!(
            "Asked harness process {pid} to stop; job {} will be cancelled and the run saved.",
            record.id
        );
        return Ok(());
    }

    // The owner is gone, so nothing will ever finish this record.
    record.status = JobStatus::Cancelled;
    record.finished_at = Some(Utc::now());
    record.error = Some(format!("owner process {pid} exited"));
    JobStore::new(&project.store)
        .put(&record)
        .context("failed to update job record")?;
    println!("Owner process {pid} is gone; marked job {} as cancelled.", record.id);
    Ok(())
}

#[cfg(unix)]
fn signal_owner(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid).with_context(|| format!("invalid pid {pid}"))?;
    // SAFETY: sends SIGTERM to a process we verified exists; no memory is touched.
    let ret = unsafe { libc::kill(raw, libc::SIGTERM) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to signal process {pid}"));
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_owner(pid: u32) -> Result<()> {
    anyhow::bail!("stopping jobs owned by another process (pid {pid}) is only supported on Unix")
}

fn print_table(records: &[JobRecord]) {
    if records.is_empty() {
        println!("No jobs found.");
        return;
    }

    println!(
        "{:<38} {:<28} {:<12} {:<10} {:>9}",
        "ID", "STEP", "PROVIDER", "STATUS", "DURATION"
    );
    println!("{}", "-".repeat(101));
    for record in records {
        let duration = record
            .duration()
            .map(|d| format!("{}s", d.num_seconds()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<28} {:<12} {:<10} {:>9}",
            record.id,
            record.step_id,
            record.provider_id,
            record.status.to_string(),
            duration
        );
    }
}

fn print_record(record: &JobRecord) {
    println!("Job: {}", record.id);
    println!("Step: {}", record.step_id);
    println!("Provider: {}", record.provider_id);
    println!("Status: {}", record.status);
    println!("Owner pid: {}", record.owner_pid);
    println!("Created: {}", record.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(at) = record.started_at {
        println!("Started: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(at) = record.finished_at {
        println!("Finished: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(code) = record.exit_status {
        println!("Exit status: {code}");
    }
    if let Some(error) = &record.error {
        println!("Error: {error}");
    }
    if let Some(result) = &record.result {
        println!();
        println!("{result}");
    }
}
