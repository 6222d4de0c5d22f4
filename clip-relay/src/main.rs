//! clipsync-relay binary entry point.
//!
//! Usage:
//! ```bash
//! clipsync-relay --config relay.toml
//! ```
//!
//! A missing config file is not an error; the built-in defaults apply.

use anyhow::Context;
use clipsync_relay::cleanup::spawn_cleanup_task;
use clipsync_relay::http::build_router;
use clipsync_relay::{Config, RelayServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config(&get_config_path())?;
    let relay = Arc::new(RelayServer::new(config.clone()).context("invalid relay configuration")?);

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.server.bind_address))?;
    let http_listener = TcpListener::bind(&config.http.bind_address)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http.bind_address))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup = spawn_cleanup_task(relay.clone(), config.cleanup.clone());

    let router = build_router(relay.clone());
    let mut http_shutdown = shutdown_rx.clone();
    let http = tokio::spawn(async move {
        tracing::info!(addr = %config.http.bind_address, "HTTP endpoints listening");
        axum::serve(http_listener, router)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await
    });

    let relay_task = tokio::spawn(relay.clone().serve(listener, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);

    cleanup.abort();
    relay_task.await.context("relay task panicked")??;
    http.await
        .context("HTTP task panicked")?
        .context("HTTP server failed")?;
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        tracing::info!(path = %path.display(), "loading configuration");
        Ok(Config::from_file(path)?)
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("relay.toml"))
}
