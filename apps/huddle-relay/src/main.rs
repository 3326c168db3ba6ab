use anyhow::Result;
use clap::Parser;
use huddle_relay::{telemetry::Telemetry, Cli, RelayConfig};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    let shutdown_grace = config.shutdown_grace;
    info!(
        listen_addr = %config.listen_addr,
        gate = if config.auth_secret.is_some() { "shared-secret" } else { "open" },
        allowed_origin = config.allowed_origin.as_deref().unwrap_or("*"),
        "starting huddle-relay"
    );

    huddle_relay::run(config, Some(telemetry.metrics_handle()), shutdown_signal()).await?;

    info!(
        grace_seconds = shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
