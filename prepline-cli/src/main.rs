//! Prepline CLI: run the dataset pipeline from the terminal.
//!
//! Every command prints JSON to stdout; logs go to stderr and to a daily
//! rolling JSON log file.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Prepline: validate, clean, analyze and augment tabular datasets
#[derive(Parser, Debug)]
#[command(name = "prepline", version, about, long_about = None)]
struct Cli {
    /// Configuration file path (TOML, or JSON with a .json extension)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the full pipeline on a dataset file
    Run {
        /// Input file (.csv, .tsv, .json, .jsonl)
        input: PathBuf,
        /// Artifact root directory
        #[arg(short, long)]
        artifacts: Option<PathBuf>,
        /// Persist each stage's table and report
        #[arg(long)]
        save_intermediate: bool,
        /// Write the final table as JSON records to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a dataset against a rules file
    Validate {
        /// Input file
        input: PathBuf,
        /// Rules file (JSON or TOML); the config's validation rules otherwise
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },
    /// Print the analysis report for a dataset
    Analyze {
        /// Input file
        input: PathBuf,
    },
    /// Inspect persisted runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
    /// Remove persisted runs older than a threshold
    Cleanup {
        /// Maximum age in hours
        #[arg(long, default_value = "168")]
        max_age_hours: u64,
        /// Artifact root directory
        #[arg(short, long)]
        artifacts: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum RunsAction {
    /// List persisted run ids
    List {
        /// Artifact root directory
        #[arg(short, long)]
        artifacts: Option<PathBuf>,
    },
    /// Show a persisted run report
    Show {
        /// Run ID
        run_id: String,
        /// Artifact root directory
        #[arg(short, long)]
        artifacts: Option<PathBuf>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write a default configuration file
    Init {
        /// Destination path
        #[arg(default_value = "prepline.toml")]
        path: PathBuf,
    },
}

/// Default data directory for artifacts and logs.
fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "prepline", "prepline")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".prepline"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = data_dir().join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "prepline.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, cli.config.as_deref()).await
}
