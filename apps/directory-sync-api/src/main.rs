//! Directory sync API server.
//!
//! Serves the directory sync routes over Postgres and, unless disabled,
//! triggers scheduled source runs on a fixed tick.

mod config;
mod logging;

use anyhow::Context;
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use config::AppConfig;
use xavyo_api_directory_sync::{directory_sync_router, DirectorySyncState};
use xavyo_directory_sync::{
    run_migrations, Clock, DirectorySyncService, PgAuditSink, PgDirectoryStore, SyncScheduler,
    SystemClock,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;
    logging::init_logging(&config.rust_log)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_addr = %config.bind_addr,
        scheduler_enabled = config.scheduler_enabled,
        "Starting directory sync API"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    info!("Database connection established");

    run_migrations(&pool).await.context("running migrations")?;

    let store = Arc::new(PgDirectoryStore::new(pool.clone()));
    let service = DirectorySyncService::builder(store.clone(), store)
        .audit(Arc::new(PgAuditSink::new(pool)))
        .config(config.sync.clone())
        .build();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = config.scheduler_enabled.then(|| {
        let tick = Duration::from_secs(config.sync.scheduler_tick_secs);
        tokio::spawn(scheduler_loop(service.clone(), tick, shutdown_rx))
    });

    let app = Router::new()
        .merge(directory_sync_router(DirectorySyncState::new(service)))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    // Let an in-flight scheduler tick finish before exiting.
    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            tracing::error!("Scheduler task failed: {e}");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Trigger due scheduled runs once per tick until shutdown.
async fn scheduler_loop(
    service: DirectorySyncService,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(tick_secs = tick.as_secs(), "Scheduler started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        match SyncScheduler::run_due(&service, SystemClock.now()).await {
            Ok(report) => {
                if !report.triggered.is_empty() || !report.failed.is_empty() {
                    info!(
                        triggered = report.triggered.len(),
                        skipped = report.skipped.len(),
                        failed = report.failed.len(),
                        "Scheduler tick completed"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Scheduler tick failed"),
        }
    }

    info!("Scheduler stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
