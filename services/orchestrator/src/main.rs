//! Convoy orchestrator
//!
//! Accepts jobs over HTTP, keeps the evaluation broker fed and runs the
//! scheduling workers and housekeeping until interrupted.

use std::sync::Arc;

use anyhow::Result;
use convoy_orchestrator::{
    api,
    broker::{EvaluationBroker, InMemoryBroker},
    config::Config,
    store::{InMemoryStore, PostgresStore, StateStore},
    Orchestrator,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to CONVOY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting convoy orchestrator");
    info!(
        listen_addr = %config.listen_addr,
        workers = config.workers.count,
        "Configuration loaded"
    );

    let store: Arc<dyn StateStore> = match &config.database {
        Some(db_config) => {
            let store = match PostgresStore::connect(db_config).await {
                Ok(store) => {
                    info!("Database connection established");
                    store
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = store.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; state is kept in memory and lost on exit");
            Arc::new(InMemoryStore::new())
        }
    };
    let broker: Arc<dyn EvaluationBroker> = Arc::new(InMemoryBroker::new(config.broker.clone()));

    let orchestrator = Orchestrator::from_config(store, broker, &config);
    orchestrator.restore_pending_evaluations().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = orchestrator.spawn_background(shutdown_rx.clone());

    let app = api::create_router(orchestrator);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Orchestrator API listening");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping orchestrator");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Draining scheduling workers and housekeeping");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    let drained = tokio::time::timeout(shutdown_timeout, async {
        while let Some(result) = background.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Background task panicked");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Background tasks did not shut down in time");
        background.abort_all();
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
