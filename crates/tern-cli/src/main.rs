mod checkpoint_cmd;
mod config;
mod jobs_cmd;
mod project;
mod providers_cmd;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};

use tern_store::models::Mode;

use project::Project;

#[derive(Parser)]
#[command(
    name = "tern",
    version,
    about = "Resumable, provider-failover harness for AI-assisted development workflows"
)]
struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Config file (overrides TERN_CONFIG and the config search path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run or resume a workflow
    Run {
        /// Workflow mode: analyze or execute
        mode: Mode,
        /// Run this step next instead of the next eligible one
        step: Option<String>,
        /// Ignore unmet dependencies and re-run completed or failed work
        #[arg(long)]
        force: bool,
        /// Answer a pending question, as N=TEXT (repeatable)
        #[arg(long = "answer", value_name = "N=TEXT", value_parser = run_cmd::parse_answer)]
        answers: Vec<(u32, String)>,
        /// Per-step timeout in seconds (overrides the config)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show workflow progress
    Status {
        /// Workflow mode: analyze or execute
        mode: Mode,
        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Discard a workflow's checkpoint and log
    Reset {
        /// Workflow mode: analyze or execute
        mode: Mode,
    },
    /// Inspect and control provider jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
    /// Inspect or clear persisted checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// List configured providers
    Providers,
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum JobsCommands {
    /// List all known jobs
    List,
    /// Show one job
    Status {
        /// Job ID
        job_id: String,
    },
    /// Stop a running job
    Stop {
        /// Job ID
        job_id: String,
    },
    /// Print a job's output lines
    Logs {
        /// Job ID
        job_id: String,
    },
    /// Remove finished job records
    Clear,
}

#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// Print the checkpoint as JSON
    Show {
        /// Workflow mode: analyze or execute
        mode: Mode,
    },
    /// List past checkpoint saves
    History {
        /// Workflow mode: analyze or execute
        mode: Mode,
        /// Show only the most recent N entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete the checkpoint, log, history and step outputs
    Clear {
        /// Workflow mode: analyze or execute
        mode: Mode,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
        /// Write the user config instead of the project config
        #[arg(long)]
        user: bool,
    },
    /// Print the effective configuration and where it came from
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "tern", &mut std::io::stdout());
        }
        Commands::Config { command } => {
            let project = Project::open(cli.project_dir.as_deref())?;
            match command {
                ConfigCommands::Init { force, user } => {
                    let path = if user {
                        config::user_config_path()
                    } else {
                        config::project_config_path(&project.store)
                    };
                    config::cmd_init(&path, force)?;
                }
                ConfigCommands::Show => {
                    let resolved = config::resolve(cli.config.as_deref(), &project)?;
                    config::cmd_show(&resolved)?;
                }
            }
        }
        Commands::Providers => {
            let project = Project::open(cli.project_dir.as_deref())?;
            let resolved = config::resolve(cli.config.as_deref(), &project)?;
            providers_cmd::run_providers(&resolved.config);
        }
        Commands::Run {
            mode,
            step,
            force,
            answers,
            timeout,
        } => {
            let project = Project::open(cli.project_dir.as_deref())?;
            let resolved = config::resolve(cli.config.as_deref(), &project)?;
            let args = run_cmd::RunArgs {
                mode,
                step,
                force,
                answers,
                timeout,
            };
            let code = run_cmd::run(&project, resolved.config, args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status { mode, json } => {
            let project = Project::open(cli.project_dir.as_deref())?;
            let resolved = config::resolve(cli.config.as_deref(), &project)?;
            let runner = project.runner(mode, resolved.config)?;
            status_cmd::run_status(&project, &runner, json)?;
        }
        Commands::Reset { mode } => {
            let project = Project::open(cli.project_dir.as_deref())?;
            let resolved = config::resolve(cli.config.as_deref(), &project)?;
            let _lock = project.lock()?;
            project
                .runner(mode, resolved.config)?
                .reset()
                .with_context(|| format!("failed to reset the {mode} workflow"))?;
            println!("Reset the {mode} workflow.");
        }
        Commands::Jobs { command } => {
            let project = Project::open(cli.project_dir.as_deref())?;
            jobs_cmd::run_jobs_command(command, &project).await?;
        }
        Commands::Checkpoint { command } => {
            let project = Project::open(cli.project_dir.as_deref())?;
            checkpoint_cmd::run_checkpoint_command(command, &project)?;
        }
    }

    Ok(())
}
