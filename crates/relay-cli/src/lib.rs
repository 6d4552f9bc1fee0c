//! # relay-cli
//!
//! Command-line interface for the relay proxy: `start | stop | restart |
//! status`, with PID-file discipline under `~/.relay/`.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// relay: reverse proxy and router for LLM chat APIs
#[derive(Parser)]
#[command(name = "relay", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to relay.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy in the foreground
    Start,
    /// Stop a running proxy via its PID file
    Stop,
    /// Stop, then start again
    Restart,
    /// Query a running proxy's health endpoint
    Status,
}

impl Cli {
    pub async fn run(self) -> relay_core::Result<()> {
        match self.command {
            Commands::Start => {
                commands::cmd_start(self.config.as_deref(), self.log_level.as_deref()).await
            }
            Commands::Stop => commands::cmd_stop(),
            Commands::Restart => {
                commands::cmd_stop()?;
                commands::cmd_start(self.config.as_deref(), self.log_level.as_deref()).await
            }
            Commands::Status => commands::cmd_status(self.config.as_deref()).await,
        }
    }
}
