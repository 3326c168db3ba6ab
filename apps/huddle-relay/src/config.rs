use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "huddle-relay",
    author,
    version,
    about = "Room membership and signaling relay for peer-to-peer calls"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "HUDDLE_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:3001")]
    pub listen_addr: String,

    /// Origin allowed by CORS. Every origin is allowed when unset.
    #[arg(long, env = "HUDDLE_RELAY_ALLOWED_ORIGIN")]
    pub allowed_origin: Option<String>,

    /// HS256 secret used to verify `?token=` on websocket upgrades.
    /// Connections are admitted without a token when unset.
    #[arg(long, env = "HUDDLE_RELAY_AUTH_SECRET", hide_env_values = true)]
    pub auth_secret: Option<String>,

    /// Messages queued per connection before new ones are dropped.
    #[arg(long, env = "HUDDLE_RELAY_OUTBOUND_BUFFER", default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Connections silent for longer than this are closed.
    #[arg(long, env = "HUDDLE_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    pub idle_timeout_secs: u64,

    /// How often idle connections are looked for.
    #[arg(long, env = "HUDDLE_RELAY_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "HUDDLE_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub allowed_origin: Option<String>,
    pub auth_secret: Option<String>,
    pub outbound_buffer: usize,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            allowed_origin: None,
            auth_secret: None,
            outbound_buffer: 256,
            idle_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one message");
        }
        if cli.idle_timeout_secs == 0 {
            bail!("idle timeout must be greater than zero");
        }
        if cli.heartbeat_interval_secs == 0 {
            bail!("heartbeat interval must be greater than zero");
        }
        let auth_secret = cli.auth_secret.filter(|secret| !secret.trim().is_empty());
        Ok(RelayConfig {
            listen_addr,
            allowed_origin: cli.allowed_origin,
            auth_secret,
            outbound_buffer: cli.outbound_buffer,
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
