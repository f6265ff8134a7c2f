//! Ensemble builder - builds ensembles from the predictions of running training workers
//!
//! Runs next to the training workers, polls their prediction files, fits a weighted
//! ensemble of the best candidates and publishes its predictions until the time budget
//! is spent.

use anyhow::{bail, Context, Result};
use ensemble_lib::{
    health::HealthRegistry,
    worker::{ResourceGovernor, WorkerContext},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const BUILDER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting ensemble-builder");

    // Load configuration; anything invalid is fatal
    let daemon = config::DaemonConfig::load()?;
    let config = daemon
        .builder_config()
        .context("Invalid builder configuration")?;
    info!(
        work_dir = %config.work_dir.display(),
        dataset = %config.dataset_name,
        seed = config.seed,
        time_limit_secs = config.time_limit.as_secs(),
        memory_limit_mb = config.memory_limit_mb,
        "Builder configured"
    );

    // Readiness follows the governor's phase
    let health_registry = HealthRegistry::new();

    let ctx = WorkerContext::new(&config, health_registry.clone());
    ctx.logger
        .log_startup(BUILDER_VERSION, config.ensemble_nbest, config.ensemble_size);

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let api_handle = tokio::spawn(api::serve(daemon.api_port, app_state));

    // Ctrl-C stops the worker at its next phase boundary
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_tx.send(());
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let mut governor = ResourceGovernor::from_config(config, ctx.clone());

    let report = governor.run(shutdown_rx).await;
    api_handle.abort();
    ctx.logger.log_shutdown(report.termination.as_str());

    if report.termination.is_failure() {
        error!(
            restarts = report.restarts,
            n_best = report.final_n_best,
            "Ensemble builder could not stay within its memory limit"
        );
        bail!("ensemble builder terminated: {}", report.termination);
    }

    info!(published = report.index_run, "Shutting down");
    Ok(())
}
