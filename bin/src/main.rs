//! inflow CLI - file-arrival-triggered job coordination.

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod handlers;

#[derive(Parser)]
#[command(name = "inflow")]
#[command(about = "Coordinates analysis jobs triggered by file arrivals", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Data directory holding jobs.db and watchers.db
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: recovery, stored watchers, dispatcher
    Run {
        /// Seconds between expected-file readiness probes
        #[arg(long, default_value = "5")]
        probe_interval: u64,

        /// Hard cap in seconds on a job's readiness probing
        #[arg(long, default_value = "300")]
        probe_timeout: u64,

        /// Seconds a file's size must stay unchanged to count as arrived
        #[arg(long, default_value = "2")]
        settle: u64,
    },

    /// Manage folder watchers
    Watcher {
        #[command(subcommand)]
        action: WatcherAction,
    },

    /// List jobs
    Jobs {
        /// Filter by status (waiting, queued, running, completed, errored, cancelled)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Manage individual jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Reconcile stored state after an unclean shutdown
    Recovery {
        /// Run a reconciliation pass instead of just reporting
        #[arg(long)]
        run: bool,
    },
}

/// Actions for managing folder watchers.
#[derive(Subcommand)]
enum WatcherAction {
    /// Register a new watcher
    Add {
        /// Folder to watch
        folder: PathBuf,

        /// Semicolon-separated file patterns (exact names and/or globs)
        patterns: String,

        /// Handler type for spawned jobs
        #[arg(long, default_value = "command")]
        job_type: String,

        /// Handler parameters as a JSON object
        #[arg(long, default_value = "{}")]
        demands: String,

        /// Name for spawned jobs
        #[arg(long, default_value = "watched")]
        job_name: String,

        /// Submitter recorded on spawned jobs
        #[arg(long, default_value = "cli")]
        submitter: String,
    },

    /// List watchers
    List {
        /// Filter by status (monitoring, completed, cancelled, paused)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Cancel a watcher
    Stop {
        /// Watcher id
        watcher_id: i64,
    },

    /// Walk a watcher's folder once, capturing qualifying files
    Rescan {
        /// Watcher id
        watcher_id: i64,

        /// Seconds a file's size must stay unchanged to count as arrived
        #[arg(long, default_value = "2")]
        settle: u64,
    },
}

/// Actions for managing individual jobs.
#[derive(Subcommand)]
enum JobAction {
    /// Show one job's status and progress
    Status {
        /// Job id
        job_id: String,
    },

    /// Cancel a job
    Cancel {
        /// Job id
        job_id: String,
    },

    /// Restart an errored or cancelled job
    Restart {
        /// Job id
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = commands::resolve_data_dir(cli.data_dir);

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Commands::Run {
            probe_interval,
            probe_timeout,
            settle,
        } => commands::run::run(data_dir, probe_interval, probe_timeout, settle).await,
        Commands::Watcher { action } => match action {
            WatcherAction::Add {
                folder,
                patterns,
                job_type,
                demands,
                job_name,
                submitter,
            } => commands::watcher::add(
                &data_dir, folder, &patterns, job_type, &demands, job_name, submitter,
            ),
            WatcherAction::List { status } => {
                commands::watcher::list(&data_dir, status.as_deref())
            }
            WatcherAction::Stop { watcher_id } => commands::watcher::stop(&data_dir, watcher_id),
            WatcherAction::Rescan { watcher_id, settle } => {
                commands::watcher::rescan(&data_dir, watcher_id, settle).await
            }
        },
        Commands::Jobs { status } => commands::jobs::list(&data_dir, status.as_deref()),
        Commands::Job { action } => match action {
            JobAction::Status { job_id } => commands::jobs::status(&data_dir, &job_id),
            JobAction::Cancel { job_id } => commands::jobs::cancel(&data_dir, &job_id),
            JobAction::Restart { job_id } => commands::jobs::restart(&data_dir, &job_id),
        },
        Commands::Recovery { run } => commands::recovery::recovery(&data_dir, run),
    }
}
