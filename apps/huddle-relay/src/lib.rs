//! Room membership coordinator and signaling relay.
//!
//! Peers connect over a websocket, join named rooms, learn who else is there,
//! and exchange opaque negotiation payloads addressed by connection id. Media
//! never passes through the relay.

pub mod config;
pub mod connections;
pub mod gate;
pub mod gateway;
pub mod registry;
pub mod relay;
pub mod telemetry;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;

pub use config::{Cli, RelayConfig};
pub use gateway::RelayState;

/// Binds `config.listen_addr` and serves until `shutdown` resolves.
pub async fn run<F>(config: RelayConfig, metrics: Option<PrometheusHandle>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(listen_addr = %config.listen_addr, "huddle-relay listening");
    let state = Arc::new(RelayState::new(config, metrics));
    serve(listener, state, shutdown).await
}

/// Serves on an already bound listener. When `shutdown` resolves every open
/// websocket is evicted through its normal teardown path.
pub async fn serve<F>(listener: TcpListener, state: Arc<RelayState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let reaper = gateway::spawn_reaper(state.clone());
    let connections = state.connections.clone();
    let app = gateway::router(state);

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        let evicted = connections.evict_all();
        info!(evicted, "shutdown requested; closing connections");
    })
    .await
    .context("server shutdown with error");

    reaper.abort();
    result
}
