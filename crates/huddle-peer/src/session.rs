use std::future::Future;
use std::sync::Arc;

use huddle_proto::RoomId;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::error::PeerError;
use crate::media::LocalMedia;
use crate::signaling::SignalingClient;
use crate::transport::{MediaRenderer, TransportFactory};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub signaling_url: String,
    pub room_id: RoomId,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The caller's shutdown future resolved.
    Requested,
    /// The relay closed the socket.
    SignalingClosed,
}

/// Runs one room session from connect to teardown.
///
/// Local media is acquired after the relay connection is up and before the
/// room is joined, so every link opened during the session can carry it.
/// Teardown closes links before the socket and releases the media guard last.
pub async fn run_session<T, M, A, B, S>(
    config: &SessionConfig,
    acquire_media: A,
    build_factory: B,
    renderer: Arc<dyn MediaRenderer<M>>,
    shutdown: S,
) -> Result<SessionEnd, PeerError>
where
    M: Send + 'static,
    A: FnOnce() -> Result<LocalMedia<T>, PeerError>,
    B: FnOnce(&LocalMedia<T>) -> Result<Arc<dyn TransportFactory<M>>, PeerError>,
    S: Future<Output = ()>,
{
    let client = SignalingClient::connect(&config.signaling_url, config.token.as_deref()).await?;

    let prepared = acquire_media().and_then(|media| {
        let factory = build_factory(&media)?;
        let events = client.events()?;
        Ok((media, factory, events))
    });
    let (mut media, factory, mut events) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            client.close().await;
            return Err(err);
        }
    };

    let coordinator = Coordinator::spawn(
        client.local_id().clone(),
        factory,
        renderer,
        client.sender(),
    );

    let started = coordinator
        .local_media_ready()
        .and_then(|()| client.join(config.room_id.clone()));

    let outcome = match started {
        Ok(()) => {
            info!(
                local_id = %client.local_id(),
                room_id = %config.room_id,
                "joined room"
            );
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break Ok(SessionEnd::Requested),
                    message = events.recv() => match message {
                        Some(message) => {
                            if let Err(err) = coordinator.handle_server_message(message) {
                                break Err(err);
                            }
                        }
                        None => {
                            warn!("signaling connection closed");
                            break Ok(SessionEnd::SignalingClosed);
                        }
                    },
                }
            }
        }
        Err(err) => Err(err),
    };

    coordinator.shutdown().await;
    client.close().await;
    media.release();
    info!(local_id = %client.local_id(), "session ended");
    outcome
}
