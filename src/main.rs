//! Chario Relay entry point
//!
//! Wires the pipeline: chain event source -> reconciliation engine ->
//! store + bus -> SSE gateway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chario_relay::bus::EventBus;
use chario_relay::chain::ChainSource;
use chario_relay::config::AppConfig;
use chario_relay::oracle::PriceOracle;
use chario_relay::reconcile::Reconciler;
use chario_relay::server::{self, AppState};
use chario_relay::store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    info!(config = %config.digest(), "starting chario-relay");

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let oracle = Arc::new(PriceOracle::new(&config.price)?);
    let bus = EventBus::new();
    let reconciler = Arc::new(Reconciler::new(store, oracle, bus.clone()));

    let (event_tx, event_rx) = mpsc::channel(256);
    let source = ChainSource::new(&config.chain)?;
    tokio::spawn(source.run(event_tx));
    tokio::spawn(reconciler.run(event_rx));

    let state = AppState {
        bus,
        heartbeat: Duration::from_millis(config.stream.heartbeat_ms),
    };
    let router = server::create_router(state, &config.server.cors_origin)?;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.server.port))?;
    info!(port = config.server.port, "SSE gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server failed")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
