//! Sentinel CLI - sentinel command

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

/// Sentinel - Recursive file system change notifications
#[derive(Parser)]
#[command(name = "sentinel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a directory tree (or a single file) and print changes
    Watch {
        /// Directory or file to watch
        path: PathBuf,
        /// Load watcher settings from a TOML file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Delivery interval in milliseconds (overrides the config file)
        #[arg(long)]
        debounce_ms: Option<u64>,
        /// Print one JSON object per event
        #[arg(long)]
        json: bool,
    },
    /// Show the effective watcher configuration
    Config {
        /// Load watcher settings from a TOML file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Print raw TOML instead of the annotated listing
        #[arg(long)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { path, config, debounce_ms, json } => {
            cmd::watch::run(&path, config.as_deref(), debounce_ms, json).await
        }
        Commands::Config { config, raw } => cmd::config::run(config.as_deref(), raw).await,
    }
}
