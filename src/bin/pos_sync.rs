//! Operator tool for a terminal's sync queue.
//!
//! # Commands
//!
//! - `status` - Reachability, queue counts and the sync indicator
//! - `sync` - Run one push then pull cycle now
//! - `run` - Keep syncing in the background until interrupted
//! - `retry` / `discard` - Resolve an order the server rejected
//! - `diagnostics` - Write a diagnostics zip
//! - `configure` - Store terminal credentials in the OS keyring
//! - `reset` - Delete the stored terminal credentials

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use the_small_pos_sync::diagnostics::{self, DiagnosticsExportOptions};
use the_small_pos_sync::{init_logging, storage, SyncConfig, SyncEngine};

#[derive(Parser)]
#[command(name = "pos-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show reachability, queue counts and the sync indicator
    Status,

    /// Run one full sync (push, then pull) now
    Sync,

    /// Sync in the background until Ctrl-C
    Run,

    /// Put a rejected order back in the queue
    Retry {
        /// Temp id of the rejected order
        temp_id: String,
    },

    /// Delete a rejected order and its payments
    Discard {
        /// Temp id of the rejected order
        temp_id: String,
    },

    /// Write a diagnostics zip into a directory
    Diagnostics {
        /// Output directory
        dir: PathBuf,

        /// Redact secrets and customer fields; leaves logs out
        #[arg(short, long)]
        redact: bool,

        /// Do not bundle log files
        #[arg(long)]
        no_logs: bool,
    },

    /// Store terminal credentials from an API key or connection string
    Configure {
        /// API key or connection string
        api_key: String,

        /// Terminal id (taken from the connection string when present)
        #[arg(short, long)]
        terminal_id: Option<String>,

        /// Admin dashboard URL (taken from the connection string when present)
        #[arg(short, long)]
        admin_url: Option<String>,
    },

    /// Delete the stored terminal credentials; the queue database is kept
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn configure(api_key: &str, terminal_id: Option<&str>, admin_url: Option<&str>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .init();
    let credentials = storage::resolve_terminal_credentials(api_key, terminal_id, admin_url)?;
    storage::store_terminal_credentials(&credentials)?;
    println!("Terminal {} configured", credentials.terminal_id);
    Ok(())
}

fn reset(yes: bool) -> Result<()> {
    if !yes {
        bail!("reset deletes this terminal's credentials; pass --yes to confirm");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .init();
    storage::clear_credentials()?;
    println!("Terminal credentials deleted");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Configure {
            api_key,
            terminal_id,
            admin_url,
        } => return configure(&api_key, terminal_id.as_deref(), admin_url.as_deref()),
        Commands::Reset { yes } => return reset(yes),
        other => other,
    };

    let config = SyncConfig::from_env().context("terminal is not configured")?;
    let log_dir = config.log_dir();
    let _guard = init_logging(&log_dir)?;
    let engine = SyncEngine::open(config)?;

    match command {
        Commands::Status => {
            engine.probe_once().await;
            print_json(&json!({
                "online": engine.connectivity().is_online(),
                "indicator": engine.orchestrator().indicator()?,
                "queue": engine.queue().queue_counts()?,
                "lastPull": engine.queue().snapshot_pulled_at()?,
            }))?;
        }
        Commands::Sync => {
            if !engine.probe_once().await {
                bail!("admin dashboard is unreachable; queued work stays pending");
            }
            let report = engine.orchestrator().full_sync().await?;
            print_json(&report)?;
        }
        Commands::Run => {
            let handle = engine.start();
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            handle.stop().await;
        }
        Commands::Retry { temp_id } => {
            engine.queue().retry_error_order(&temp_id)?;
            println!("{temp_id} queued for the next push");
        }
        Commands::Discard { temp_id } => {
            engine.queue().discard_error_order(&temp_id)?;
            println!("{temp_id} discarded");
        }
        Commands::Diagnostics {
            dir,
            redact,
            no_logs,
        } => {
            let path = diagnostics::export_diagnostics(
                engine.orchestrator(),
                &dir,
                &log_dir,
                DiagnosticsExportOptions {
                    include_logs: !no_logs,
                    redact_sensitive: redact,
                },
            )?;
            println!("{}", path.display());
        }
        Commands::Configure { .. } | Commands::Reset { .. } => {
            bail!("credential commands run without opening the queue")
        }
    }

    Ok(())
}
