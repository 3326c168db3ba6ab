use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_peer::media::silent_audio;
use huddle_peer::render::LoggingRenderer;
use huddle_peer::webrtc::{RemoteTrack, WebRtcFactory, DEFAULT_STUN_SERVERS};
use huddle_peer::{run_session, MediaRenderer, SessionConfig, SessionEnd, TransportFactory};
use huddle_proto::RoomId;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "huddle-peer",
    author,
    version,
    about = "Joins a huddle room and holds a WebRTC link to every other member"
)]
struct Cli {
    /// Relay websocket endpoint.
    #[arg(long, env = "HUDDLE_SIGNALING_URL", default_value = "ws://127.0.0.1:3001/ws")]
    url: String,

    /// Room to join.
    #[arg(long, env = "HUDDLE_ROOM", default_value = "general-video-chat")]
    room: String,

    /// Admission token passed to the relay as `?token=`.
    #[arg(long, env = "HUDDLE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// STUN server url; repeat for several.
    #[arg(long = "stun")]
    stun: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let cli = Cli::parse();
    let stun = if cli.stun.is_empty() {
        DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
    } else {
        cli.stun
    };
    let config = SessionConfig {
        signaling_url: cli.url,
        room_id: RoomId::from(cli.room),
        token: cli.token,
    };
    info!(url = %config.signaling_url, room_id = %config.room_id, "starting huddle-peer");

    let renderer: Arc<dyn MediaRenderer<RemoteTrack>> = Arc::new(LoggingRenderer::new());
    let end = run_session(
        &config,
        || Ok(silent_audio()),
        |media| {
            let factory = WebRtcFactory::new(&stun, media.tracks().to_vec())?;
            Ok(Arc::new(factory) as Arc<dyn TransportFactory<RemoteTrack>>)
        },
        renderer,
        async {
            let _ = signal::ctrl_c().await;
        },
    )
    .await
    .context("session failed")?;

    match end {
        SessionEnd::Requested => info!("left room"),
        SessionEnd::SignalingClosed => info!("relay closed the connection"),
    }
    Ok(())
}
