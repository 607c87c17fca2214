use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use common::Configuration;
use sweeper::{EventLog, SweepMetrics, SweepWorker, TrackerVariant};

/// Run one sweep pass over the deletion log.
#[derive(Parser)]
#[command(name = "refsweep", version, about = "Deletion propagation sweeper")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "refsweep.toml")]
    config: PathBuf,

    /// Run under the escalated turbo budget to drain a backlog
    #[arg(long)]
    turbo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config =
        Configuration::load_from_path(&args.config).context("failed to load configuration")?;
    config
        .sweep
        .validate()
        .context("invalid sweep configuration")?;

    if config.sweep.relations.is_empty() {
        log::warn!("No relations configured, nothing to sweep");
        return Ok(());
    }

    let event_log = EventLog::connect(&config.database.dsn, config.sweep.rotation_interval)
        .await
        .context("failed to connect to the deletion log database")?;
    let worker = SweepWorker::new(event_log, &config.sweep, SweepMetrics::new())?;

    let variant = if args.turbo {
        TrackerVariant::Turbo
    } else {
        TrackerVariant::Standard
    };
    let stats = worker.run_pass(variant).await?;

    log::info!(
        "Sweep pass finished: {}",
        serde_json::to_string(&stats).context("failed to serialize pass stats")?
    );
    Ok(())
}
