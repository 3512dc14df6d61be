//! Portico gateway
//!
//! Serves the admin API, health endpoints and the proxy on one listener,
//! and keeps the dispatch table in step with backend health.

use std::sync::Arc;

use anyhow::{Context, Result};
use portico_gateway::{
    config,
    repository::{InMemoryRouteRepository, SharedRouteRepository, StatePersistence},
    routing::{HealthRefresher, HealthRefresherConfig},
    server,
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PORTICO_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting portico gateway");
    info!(
        listen_addr = %config.listen_addr,
        health_check_host = %config.health_check_host,
        state_file = ?config.state_file,
        "Configuration loaded"
    );

    let repository: SharedRouteRepository = match &config.state_file {
        Some(path) => Arc::new(
            InMemoryRouteRepository::with_persistence(StatePersistence::new(path.clone()))
                .context("Failed to load route state")?,
        ),
        None => Arc::new(InMemoryRouteRepository::new()),
    };

    let state = AppState::build(&config, repository)?;

    // Initial compile; failures leave an empty table and the refresher retries.
    if let Err(e) = state.compiler().compile().await {
        warn!(error = %e, "Initial route compile failed");
    }

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let refresher_handle = config.health_refresh_interval.map(|interval| {
        let refresher = HealthRefresher::new(
            state.compiler().clone(),
            HealthRefresherConfig { interval },
        );
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            refresher.run(shutdown_rx).await;
        })
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn(server::serve(listener, state, shutdown_rx));

    // Wait for shutdown signal (Ctrl+C)
    let server_exited = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut server_handle => {
            log_server_exit(result);
            true
        }
    };

    // Signal shutdown to the server and the refresher
    let _ = shutdown_tx.send(true);

    if !server_exited {
        log_server_exit(server_handle.await);
    }

    if let Some(handle) = refresher_handle {
        let shutdown_timeout = std::time::Duration::from_secs(10);
        if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
            warn!("Health refresher did not shut down in time");
        }
    }

    info!("Gateway stopped");
    Ok(())
}

fn log_server_exit(result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!("Server exited normally"),
        Ok(Err(e)) => error!(error = %e, "Server error"),
        Err(e) => error!(error = %e, "Server task panicked"),
    }
}
