//! Kiln CLI - command-line front end for the kiln training manager.
//!
//! Provides the `kiln` command for starting and following training runs
//! and for inspecting the durable artifacts they leave behind: run
//! records, metric history, checkpoints and logs.

mod commands;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::checkpoints::CheckpointsCommand;
use commands::train::TrainArgs;

/// Kiln - training-run lifecycle manager
#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    author,
    version,
    about = "Kiln - training-run lifecycle manager",
    long_about = "Kiln manages training runs end to end: durable run records, append-only metric history, resumable checkpoints and a live event stream, all rooted in a single data directory."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Data directory (overrides KILN_DATA_DIR; defaults to ./.kiln)
    #[arg(short = 'd', long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to ./kiln.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a training run and follow it until it finishes
    ///
    /// Creates the run in the data directory, spawns the training loop
    /// in-process and renders its events live. Ctrl-C requests a
    /// graceful stop: the in-flight step completes and a final
    /// checkpoint is saved before the run transitions to stopped.
    Train(TrainArgs),

    /// List all runs in the data directory
    Runs {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one run's record
    Status {
        /// Run identifier
        run_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a run's log tail
    Logs {
        /// Run identifier
        run_id: String,
        /// Maximum lines to show (default 200)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show a run's metric history
    Metrics {
        /// Run identifier
        run_id: String,
        /// Maximum data points to show
        #[arg(long)]
        limit: Option<usize>,
        /// Append loss/accuracy aggregates
        #[arg(long)]
        summary: bool,
        /// Append a completion estimate
        #[arg(long)]
        eta: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect and manage checkpoints
    #[command(subcommand)]
    Checkpoints(CheckpointsCommand),

    /// Delete a run's record, logs and metrics
    ///
    /// Refused while the run's loop is active. Checkpoints are kept
    /// unless --checkpoints is passed.
    Delete {
        /// Run identifier
        run_id: String,
        /// Also delete the run's checkpoints
        #[arg(long)]
        checkpoints: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber =
        FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli_config = config::load(args.config.as_deref())?;
    let data_dir = resolve_data_dir(args.data_dir);

    let manager = commands::open_manager(&data_dir, &cli_config)?;
    match args.command {
        Command::Train(train_args) => {
            commands::train::execute(&manager, train_args, &cli_config.train, &cli_config.stream)
                .await
        }
        Command::Runs { json } => commands::runs::list(&manager, json),
        Command::Status { run_id, json } => commands::runs::status(&manager, &run_id, json),
        Command::Logs { run_id, limit } => commands::metrics::logs(&manager, &run_id, limit),
        Command::Metrics { run_id, limit, summary, eta, json } => {
            commands::metrics::metrics(&manager, &run_id, limit, summary, eta, json)
        }
        Command::Checkpoints(command) => commands::checkpoints::execute(&manager, command),
        Command::Delete { run_id, checkpoints } => {
            commands::runs::delete(&manager, &run_id, checkpoints)
        }
    }
}

/// Flag wins over `KILN_DATA_DIR`; the default is a `.kiln` directory
/// under the working directory.
fn resolve_data_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("KILN_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./.kiln"))
}
