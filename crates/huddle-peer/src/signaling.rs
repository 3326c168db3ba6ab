use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_proto::{ClientMessage, ConnectionId, RoomId, ServerMessage};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

use crate::error::PeerError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket connection to the relay.
///
/// Outbound messages go through an unbounded queue drained by a writer task,
/// so any number of producers (the coordinator, the heartbeat) can send
/// without holding the socket. Everything the relay sends after `welcome`
/// comes out of [`SignalingClient::events`].
pub struct SignalingClient {
    local_id: ConnectionId,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    close_notify: Arc<Notify>,
    writer: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connects and waits for the relay to assign an identity.
    pub async fn connect(url: &str, token: Option<&str>) -> Result<Arc<Self>, PeerError> {
        let websocket_url = signaling_url(url, token)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| PeerError::Signaling(format!("websocket connect failed: {err}")))?;
        tracing::debug!(url = %websocket_url.path(), "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (welcome_tx, welcome_rx) = oneshot::channel::<ConnectionId>();
        let close_notify = Arc::new(Notify::new());

        let writer_close = Arc::clone(&close_notify);
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_close.notified() => break,
                    message = send_rx.recv() => {
                        let Some(message) = message else { break };
                        let text = match message.to_json() {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to encode signaling message");
                                continue;
                            }
                        };
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            let mut welcome_tx = Some(welcome_tx);
            while let Some(frame) = ws_read.next().await {
                let message = match frame {
                    Ok(Message::Text(text)) => ServerMessage::from_json(&text),
                    Ok(Message::Binary(bytes)) => ServerMessage::from_bytes(&bytes),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!("signaling websocket closed: {err}");
                            }
                            _ => tracing::warn!("signaling websocket error: {err}"),
                        }
                        break;
                    }
                };
                match message {
                    Ok(ServerMessage::Welcome { id }) => {
                        if let Some(tx) = welcome_tx.take() {
                            let _ = tx.send(id);
                        }
                    }
                    Ok(message) => {
                        tracing::trace!(kind = message.kind(), "signaling message received");
                        if events_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::debug!(error = %err, "ignoring unparsable signaling frame"),
                }
            }
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let local_id = match tokio::time::timeout(WELCOME_TIMEOUT, welcome_rx).await {
            Ok(Ok(id)) => id,
            Ok(Err(_)) => {
                writer.abort();
                heartbeat.abort();
                return Err(PeerError::Signaling(
                    "connection closed before welcome".into(),
                ));
            }
            Err(_) => {
                writer.abort();
                reader.abort();
                heartbeat.abort();
                return Err(PeerError::Signaling("timed out waiting for welcome".into()));
            }
        };
        tracing::info!(local_id = %local_id, "signaling connected");

        Ok(Arc::new(Self {
            local_id,
            send_tx,
            events_rx: Mutex::new(Some(events_rx)),
            close_notify,
            writer: Mutex::new(Some(writer)),
            tasks: Mutex::new(vec![reader, heartbeat]),
        }))
    }

    pub fn local_id(&self) -> &ConnectionId {
        &self.local_id
    }

    /// Queue for outbound messages; cloned into whoever needs to send.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.send_tx.clone()
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), PeerError> {
        self.send_tx
            .send(message)
            .map_err(|_| PeerError::ChannelClosed)
    }

    pub fn join(&self, room_id: RoomId) -> Result<(), PeerError> {
        self.send(ClientMessage::JoinRoom { room_id })
    }

    /// The inbound message stream. It can be taken once; it ends when the
    /// socket closes.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<ServerMessage>, PeerError> {
        self.events_rx
            .lock()
            .take()
            .ok_or_else(|| PeerError::Signaling("event stream already taken".into()))
    }

    /// Sends a close frame and stops every task. Safe to call repeatedly.
    pub async fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            self.close_notify.notify_one();
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
    }
}

/// Adds `token` to the query string, keeping whatever else the url carries.
fn signaling_url(url: &str, token: Option<&str>) -> Result<Url, PeerError> {
    let mut parsed = Url::parse(url)
        .map_err(|err| PeerError::Setup(format!("invalid signaling url {url}: {err}")))?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        "http" => set_scheme(&mut parsed, "ws")?,
        "https" => set_scheme(&mut parsed, "wss")?,
        other => {
            return Err(PeerError::Setup(format!(
                "unsupported signaling url scheme: {other}"
            )))
        }
    }
    if let Some(token) = token.filter(|token| !token.is_empty()) {
        parsed.query_pairs_mut().append_pair("token", token);
    }
    Ok(parsed)
}

fn set_scheme(url: &mut Url, scheme: &str) -> Result<(), PeerError> {
    url.set_scheme(scheme)
        .map_err(|_| PeerError::Setup("invalid websocket scheme".into()))
}
