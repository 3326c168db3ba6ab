use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use huddle_proto::{ClientMessage, ConnectionId, ServerMessage};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::connections::{now_millis, ConnectionTable};
use crate::gate::{Admission, AdmissionGate};
use crate::registry::{RoomRegistry, RoomSnapshot};
use crate::relay::{SignalEnvelope, SignalRelay};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RelayState {
    pub connections: ConnectionTable,
    pub registry: RoomRegistry,
    pub relay: SignalRelay,
    pub gate: AdmissionGate,
    pub config: RelayConfig,
    metrics: Option<PrometheusHandle>,
}

impl RelayState {
    pub fn new(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Self {
        let connections = ConnectionTable::new(config.outbound_buffer);
        Self {
            registry: RoomRegistry::new(connections.clone()),
            relay: SignalRelay::new(connections.clone()),
            gate: AdmissionGate::from_secret(config.auth_secret.as_deref()),
            connections,
            config,
            metrics,
        }
    }

    fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct RoomsResponse {
    connections: usize,
    rooms: Vec<RoomSnapshot>,
}

pub fn router(state: Arc<RelayState>) -> Router {
    let cors = cors_layer(state.config.allowed_origin.as_deref());
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/rooms", get(rooms_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(allowed_origin: Option<&str>) -> CorsLayer {
    match allowed_origin.map(HeaderValue::from_str) {
        None => CorsLayer::permissive(),
        Some(Ok(origin)) => CorsLayer::new()
            .allow_origin(AllowOrigin::exact(origin))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
        Some(Err(err)) => {
            warn!(error = %err, "allowed origin is not a valid header value; allowing every origin");
            CorsLayer::permissive()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<RelayState>>) -> Response {
    match state.render_metrics() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn rooms_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(RoomsResponse {
        connections: state.connections.len(),
        rooms: state.registry.snapshot(),
    })
}

async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.gate.admit(query.token.as_deref()) {
        Ok(admission) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, remote_addr, admission))
            .into_response(),
        Err(err) => {
            counter!("huddle_relay_gate_rejections_total", 1, "reason" => err.reason());
            warn!(remote_addr = %remote_addr, "admission rejected: {err}");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<RelayState>,
    remote_addr: SocketAddr,
    admission: Admission,
) {
    let connection_id = ConnectionId::generate();
    let registration = state
        .connections
        .register(connection_id.clone(), Some(remote_addr));
    let mut outbound = registration.receiver;
    let evict = registration.evict;

    counter!("huddle_relay_connections_total", 1);
    gauge!("huddle_relay_connections_active", state.connections.len() as f64);
    info!(
        connection_id = %connection_id,
        remote_addr = %remote_addr,
        subject = admission.subject.as_deref().unwrap_or("-"),
        "connection established"
    );

    state.connections.send(
        &connection_id,
        ServerMessage::Welcome {
            id: connection_id.clone(),
        },
    );

    let (mut sink, mut stream) = socket.split();

    let writer_id = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(err) => {
                    warn!(connection_id = %writer_id, error = %err, "failed to encode message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
        debug!(connection_id = %writer_id, "writer task finished");
    });

    let reason = loop {
        tokio::select! {
            _ = evict.notified() => break "evicted",
            frame = stream.next() => match frame {
                None => break "stream ended",
                Some(Err(err)) => {
                    debug!(connection_id = %connection_id, error = %err, "websocket read failed");
                    break "read error";
                }
                Some(Ok(Message::Close(_))) => break "client closed",
                Some(Ok(Message::Text(text))) => {
                    state.connections.touch(&connection_id);
                    handle_frame(&state, &connection_id, text.as_bytes());
                }
                Some(Ok(Message::Binary(bytes))) => {
                    state.connections.touch(&connection_id);
                    handle_frame(&state, &connection_id, &bytes);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    state.connections.touch(&connection_id);
                }
            },
        }
    };

    // Leave first: departure notices go out before the id stops resolving.
    let rooms = state.registry.leave(&connection_id);
    state.connections.remove(&connection_id);
    gauge!("huddle_relay_connections_active", state.connections.len() as f64);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    info!(
        connection_id = %connection_id,
        reason,
        rooms_left = rooms.len(),
        "connection closed"
    );
}

fn handle_frame(state: &RelayState, connection_id: &ConnectionId, bytes: &[u8]) {
    let message = match ClientMessage::from_bytes(bytes) {
        Ok(message) => message,
        Err(err) => {
            debug!(connection_id = %connection_id, error = %err, "ignoring unparsable frame");
            counter!("huddle_relay_unparsable_frames_total", 1);
            return;
        }
    };

    match message {
        ClientMessage::JoinRoom { room_id } => {
            state.registry.join(connection_id, &room_id);
        }
        ClientMessage::Signal { to, signal } => {
            state.relay.relay(SignalEnvelope {
                from: connection_id.clone(),
                to,
                payload: signal,
            });
        }
        ClientMessage::Ping => {
            state.connections.send(connection_id, ServerMessage::Pong);
        }
    }
}

/// Periodically evicts connections that have gone quiet. Eviction runs the
/// connection's own teardown, so each reaped connection leaves its rooms once.
pub fn spawn_reaper(state: Arc<RelayState>) -> JoinHandle<()> {
    let mut interval = tokio::time::interval(state.config.heartbeat_interval);
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            let stale = state
                .connections
                .stale(now_millis(), state.config.idle_timeout);
            for connection_id in stale {
                let remote_addr = state.connections.remote_addr(&connection_id);
                if state.connections.evict(&connection_id) {
                    counter!("huddle_relay_idle_reaps_total", 1);
                    info!(
                        connection_id = %connection_id,
                        remote_addr = ?remote_addr,
                        "closing idle connection"
                    );
                }
            }
        }
    })
}
