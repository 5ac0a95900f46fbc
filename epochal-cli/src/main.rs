//! Epochal CLI: drive training runs, inspect hook tables, prune checkpoints.

mod commands;
mod demo;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Epochal: training-loop orchestration with lifecycle hooks
#[derive(Parser, Debug)]
#[command(name = "epochal", version, about, long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Work directory for checkpoints, logs and run metadata
    #[arg(short, long, global = true)]
    work_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train the synthetic regression job with the configured hooks
    Run {
        /// Train for this many epochs
        #[arg(long, conflicts_with = "max_iters")]
        max_epochs: Option<u64>,
        /// Train for this many iterations
        #[arg(long)]
        max_iters: Option<u64>,
        /// Seed for the synthetic dataset
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Samples in the synthetic dataset
        #[arg(long, default_value = "256")]
        samples: usize,
        /// Samples per batch
        #[arg(short, long, default_value = "16")]
        batch_size: usize,
        /// SGD learning rate
        #[arg(long, default_value = "0.05")]
        lr: f64,
    },
    /// Print the stage-by-stage hook table for the configured hooks
    Hooks,
    /// Delete checkpoints outside a retention window
    Prune {
        /// Directory holding the checkpoints (defaults to the work dir)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Filename template with one `{}` placeholder
        #[arg(short, long, default_value = "epoch_{}.pth")]
        template: String,
        /// Most recent epoch or iteration number
        #[arg(long)]
        current: u64,
        /// Save interval the checkpoints were written with
        #[arg(short, long, default_value = "1")]
        interval: i64,
        /// Checkpoints to keep
        #[arg(short, long)]
        max_keep: i64,
        /// Only list what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Load configuration, then apply CLI overrides
    let mut config = epochal_core::load_config(cli.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Some(work_dir) = &cli.work_dir {
        config.work_dir = work_dir.clone();
    }

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr (always active)
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = config.work_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "epochal.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, config)
}
