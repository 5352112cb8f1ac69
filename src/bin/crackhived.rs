//! CrackHive daemon
//!
//! Loads settings, opens the database, starts the orchestrator loops and
//! runs until interrupted. Real deployments wire the collaborator services
//! (hashlists, files, notifications, binaries) to their own backends; this
//! binary runs with the in-memory set, which is enough for a single-node
//! standalone instance.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use crackhive::{Orchestrator, OrchestratorConfig, ServiceSet, Settings};

#[derive(Debug, Parser)]
#[command(name = "crackhived", about = "Distributed password-cracking orchestrator daemon")]
struct Cli {
    /// Path to the TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file; omit to run in memory.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log filter, e.g. `info` or `crackhive=debug`.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone())),
        )
        .init();

    let settings = match &cli.config {
        Some(path) => Settings::from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };

    let config = OrchestratorConfig {
        db_path: cli.db.clone(),
        settings,
        ..Default::default()
    };

    let (services, _hashlists, _files, _notifier) = ServiceSet::in_memory();
    let orchestrator = Orchestrator::new(config, services).context("starting orchestrator")?;
    orchestrator.start();

    let health = orchestrator.check_health().await?;
    tracing::info!(
        "crackhived running ({} jobs, {} agents online); Ctrl-C to stop",
        health.jobs_total,
        health.agents_online
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutting down");
    orchestrator.shutdown().await;
    Ok(())
}
