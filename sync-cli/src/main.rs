//! # roomsync
//!
//! CLI tool for exercising roomsync.
//!
//! ## Commands
//!
//! - `simulate`: Race several clients through estimation rounds
//! - `config`: Print the effective configuration
//!
//! ## Example
//!
//! ```bash
//! # Four players, three rounds, 5ms store latency
//! roomsync simulate --clients 4 --rounds 3
//!
//! # Show the defaults, or a config file merged over them
//! roomsync config
//! roomsync --config roomsync.toml config
//!
//! # Follow conflict resolution as it happens
//! RUST_LOG=roomsync_client=debug roomsync simulate
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roomsync_client::Config;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::simulate::SimulateOptions;

/// CLI tool for exercising roomsync.
#[derive(Parser, Debug)]
#[command(name = "roomsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Race several clients through estimation rounds on an in-memory store
    Simulate {
        /// Room code
        #[arg(long, default_value = "DEMO01")]
        room: String,

        /// Number of players, host included
        #[arg(long, default_value = "4")]
        clients: usize,

        /// Rounds to play
        #[arg(long, default_value = "3")]
        rounds: u32,

        /// Artificial store latency in milliseconds
        #[arg(long, default_value = "5")]
        latency_ms: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Simulate {
            room,
            clients,
            rounds,
            latency_ms,
        } => {
            let options = SimulateOptions {
                room,
                clients,
                rounds,
                latency: Duration::from_millis(latency_ms),
            };
            commands::simulate::run(&config, &options).await?;
        }
        Commands::Config => {
            commands::config::run(&config)?;
        }
    }

    Ok(())
}
