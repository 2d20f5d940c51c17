//! Convoy - fleet coordination for multi-process workflow deployments
//!
//! Main entry point for the Convoy CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod status;

use commands::{config, publish, start};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Convoy - fleet coordination for multi-process workflow deployments
#[derive(Parser)]
#[command(name = "convoy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Boot a main, worker, or webhook instance
    Start(start::StartArgs),

    /// Publish a command to the fleet
    Publish(publish::PublishArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console (human-readable) + rotating JSON file
    let filter = if cli.verbose {
        "convoy=debug,convoy_pubsub=debug,convoy_tasks=debug,convoy_config=debug,info"
    } else {
        "convoy=info,convoy_pubsub=info,convoy_tasks=info,warn"
    };
    let console_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let log_dir = convoy_config::user_config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| std::path::PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "convoy.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "convoy=trace,convoy_pubsub=trace,convoy_tasks=trace,convoy_config=trace,info",
                )),
        )
        .init();

    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Start(args) => start::run(args, &ctx).await,
        Commands::Publish(args) => publish::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}
