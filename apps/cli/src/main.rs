//! thred CLI - train and evaluate hierarchical conversation models
//!
//! Provides a `thred` command that drives the training loop over a model
//! directory: start or resume training, decode and score a test set, and
//! inspect a run's persisted progress.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{status, test, train};

/// thred - hierarchical conversation model trainer
#[derive(Parser, Debug)]
#[command(
    name = "thred",
    author,
    version,
    about = "Train and evaluate hierarchical conversation models"
)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model, resuming if the model directory already holds a run
    Train {
        /// Run configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        #[command(flatten)]
        overrides: train::TrainOverrides,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decode and score the test set with the latest saved checkpoint
    Test {
        /// Model directory of a previous training run
        #[arg(short, long)]
        model_dir: PathBuf,

        #[command(flatten)]
        overrides: test::DecodeOverrides,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the persisted progress of a run
    Status {
        /// Model directory of a previous training run
        #[arg(short, long)]
        model_dir: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.log_json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.without_time().finish())?;
    }

    match args.command {
        Command::Train { config, overrides, json } => train::execute(&config, &overrides, json),
        Command::Test { model_dir, overrides, json } => test::execute(&model_dir, &overrides, json),
        Command::Status { model_dir, json } => status::execute(&model_dir, json),
    }
}
