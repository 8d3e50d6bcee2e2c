//! Taskbox - run task payloads in native or QEMU sandboxes
//!
//! Main entry point for the taskbox CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};

mod commands;

use commands::{run, vm};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Taskbox - run task payloads in native or QEMU sandboxes
#[derive(Parser)]
#[command(name = "taskbox")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (default: <config dir>/config.toml)
    #[arg(long, global = true, env = "TASKBOX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command in a native sandbox
    Run(run::RunArgs),

    /// Boot a virtual machine image
    Vm(vm::VmArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = taskbox_config::load_config(cli.config.as_deref())
        .context("failed to load configuration")?;

    // Initialize tracing: console (human-readable) + rotating JSON file
    let filter = if cli.verbose {
        "taskbox=debug,taskbox_native=debug,taskbox_qemu=debug,taskbox_types=debug,taskbox_config=debug,info"
    } else {
        "taskbox=info,taskbox_native=info,taskbox_qemu=info,warn"
    };

    let log_dir = config
        .logging
        .directory
        .clone()
        .or_else(|| taskbox_config::config_dir().map(|d| d.join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "taskbox.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "taskbox=trace,taskbox_native=trace,taskbox_qemu=trace,taskbox_types=trace,info",
                )),
        )
        .init();

    let ctx = commands::Context {
        config,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Vm(args) => vm::run(args, &ctx).await,
    }
}
