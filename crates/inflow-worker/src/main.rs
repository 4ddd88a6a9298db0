//! Worker process entry point.
//!
//! Loads configuration, opens the database pool, runs pending migrations,
//! loads the registered [`Function`](inflow_common::types::Function) set
//! into an in-process [`Registry`](inflow_worker::pipeline::registry::Registry),
//! and hands both to an [`Orchestrator`](inflow_worker::orchestrator::Orchestrator)
//! that runs until asked to shut down.

use std::sync::Arc;

use anyhow::{Context, Result};
use inflow_common::logging::{init_logging, LogConfig};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::info;

use inflow_worker::config::WorkerConfig;
use inflow_worker::db::Store;
use inflow_worker::orchestrator::Orchestrator;
use inflow_worker::pipeline::registry::{NativeRegistry, Registry};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("inflow-worker".to_string())
        .filter_directives("inflow_worker=debug,inflow_common=debug,sqlx=warn".to_string())
        .build();
    let log_config = LogConfig::from_env().unwrap_or(log_config);
    init_logging(&log_config)?;

    info!("starting inflow-worker");

    let config = WorkerConfig::from_env().context("loading worker configuration")?;
    info!(files_root = %config.files_root.display(), "configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(config.pool.max_connections)
        .min_connections(config.pool.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(config.pool.connect_timeout_secs))
        .connect(&config.database_url)
        .await
        .context("connecting to the document store")?;

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("running database migrations")?;
    info!("database migrations applied");

    let store = Store::new(pool.clone());
    let functions = store.load_all_functions().await.context("loading registered functions")?;
    info!(count = functions.len(), "function registry loaded");
    let registry = Arc::new(Registry::new(NativeRegistry::builtin(), functions, pool));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let orchestrator = Orchestrator::new(store, registry, config.files_root.clone());

    let run_handle = tokio::spawn(orchestrator.run(shutdown_rx));

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight stage tasks");
    let _ = shutdown_tx.send(true);

    run_handle.await.context("joining orchestrator task")??;
    info!("inflow-worker shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
