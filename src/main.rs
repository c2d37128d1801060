use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(version, about = "Autonomous development orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new crucible project
    Init,
    /// Run the coordinator loop
    Run {
        /// Continue from the existing pipeline state instead of starting fresh
        #[arg(long)]
        resume: bool,

        /// Stop after this many iterations
        #[arg(long)]
        max_iterations: Option<u64>,

        /// Override the retry ceiling from crucible.toml
        #[arg(long)]
        retry_ceiling: Option<u32>,
    },
    /// Add a task to the pipeline state
    AddTask {
        description: String,

        /// File the task targets
        #[arg(short, long)]
        target: String,

        /// 1 (most urgent) to 10
        #[arg(short, long, default_value = "5")]
        priority: u8,

        /// feature, fix, refactor or documentation (inferred when omitted)
        #[arg(short, long)]
        kind: Option<String>,

        /// Objective title to link the task to
        #[arg(long)]
        objective: Option<String>,
    },
    /// List tasks in scheduling order
    Tasks {
        /// Only show tasks with this status
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Show task counts, counters and any pending intervention
    Status,
    /// Print the escalation report of a failed task
    Report { task_id: String },
    /// Remove the pipeline state
    Reset {
        /// Also remove archived states
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let crucible_dir = project_dir.join(crucible::config::CRUCIBLE_DIR);
    let _log_guard = if crucible_dir.is_dir() {
        Some(crucible::logging::init(&crucible_dir.join("logs"), cli.verbose)?)
    } else {
        crucible::logging::init_stderr(cli.verbose);
        None
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Run {
            resume,
            max_iterations,
            retry_ceiling,
        } => {
            cmd::cmd_run(&cli, project_dir, *resume, *max_iterations, *retry_ceiling).await?;
        }
        Commands::AddTask {
            description,
            target,
            priority,
            kind,
            objective,
        } => cmd::cmd_add_task(
            &cli,
            &project_dir,
            description,
            target,
            *priority,
            kind.as_deref(),
            objective.as_deref(),
        )?,
        Commands::Tasks { status } => cmd::cmd_tasks(&cli, &project_dir, status.as_deref())?,
        Commands::Status => cmd::cmd_status(&cli, &project_dir)?,
        Commands::Report { task_id } => cmd::cmd_report(&cli, &project_dir, task_id)?,
        Commands::Reset { force } => cmd::cmd_reset(&cli, &project_dir, *force)?,
    }

    Ok(())
}
