use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use crate::error::PeerError;
use crate::media::LocalTrack;
use crate::transport::{LinkContext, LinkEvents, LinkRole, PeerTransport, TransportFactory};

pub type RemoteTrack = Arc<TrackRemote>;

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Payloads exchanged between two links through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NegotiationPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default)]
        sdp_mline_index: Option<u16>,
    },
}

impl NegotiationPayload {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Opens one `RTCPeerConnection` per link, each carrying the local tracks.
pub struct WebRtcFactory {
    api: Arc<API>,
    rtc_config: RTCConfiguration,
    tracks: Vec<LocalTrack>,
}

impl WebRtcFactory {
    pub fn new(stun_servers: &[String], tracks: Vec<LocalTrack>) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| PeerError::Setup(format!("register codecs: {err}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| PeerError::Setup(format!("register interceptors: {err}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api: Arc::new(api),
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            tracks,
        })
    }
}

impl TransportFactory<RemoteTrack> for WebRtcFactory {
    fn open(
        &self,
        context: LinkContext<RemoteTrack>,
    ) -> Result<Box<dyn PeerTransport>, PeerError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let setup = LinkSetup {
            api: Arc::clone(&self.api),
            rtc_config: self.rtc_config.clone(),
            tracks: self.tracks.clone(),
        };
        let task = tokio::spawn(run_link(setup, context, inbound_rx));
        Ok(Box::new(WebRtcTransport {
            inbound: Some(inbound_tx),
            task: Some(task),
        }))
    }
}

struct WebRtcTransport {
    inbound: Option<mpsc::UnboundedSender<Value>>,
    task: Option<JoinHandle<()>>,
}

impl PeerTransport for WebRtcTransport {
    fn deliver(&mut self, payload: Value) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(payload);
        }
    }

    /// Closing the inbound queue lets the link task close its peer
    /// connection and exit on its own.
    fn close(&mut self) {
        self.inbound.take();
        self.task.take();
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct LinkSetup {
    api: Arc<API>,
    rtc_config: RTCConfiguration,
    tracks: Vec<LocalTrack>,
}

async fn run_link(
    setup: LinkSetup,
    context: LinkContext<RemoteTrack>,
    mut inbound: mpsc::UnboundedReceiver<Value>,
) {
    let LinkContext {
        remote_id,
        role,
        generation,
        events,
    } = context;

    let peer_connection = match open_peer_connection(&setup, &events).await {
        Ok(pc) => pc,
        Err(err) => {
            events.failed(err.to_string());
            return;
        }
    };

    let mut negotiation = Negotiation {
        peer_connection: Arc::clone(&peer_connection),
        role,
        events: events.clone(),
        remote_description_set: false,
        pending_candidates: Vec::new(),
    };

    let mut result = Ok(());
    if role == LinkRole::Initiator {
        result = negotiation.send_offer().await;
    }
    if result.is_ok() {
        while let Some(payload) = inbound.recv().await {
            if let Err(err) = negotiation.apply(payload).await {
                result = Err(err);
                break;
            }
        }
    }

    if let Err(err) = result {
        warn!(remote_id = %remote_id, generation, error = %err, "negotiation failed");
        events.failed(err.to_string());
    }
    if let Err(err) = peer_connection.close().await {
        debug!(remote_id = %remote_id, generation, error = %err, "peer connection close failed");
    }
    trace!(remote_id = %remote_id, generation, "link task finished");
}

async fn open_peer_connection(
    setup: &LinkSetup,
    events: &LinkEvents<RemoteTrack>,
) -> Result<Arc<RTCPeerConnection>, PeerError> {
    let peer_connection = Arc::new(
        setup
            .api
            .new_peer_connection(setup.rtc_config.clone())
            .await
            .map_err(|err| PeerError::Setup(format!("create peer connection: {err}")))?,
    );

    for track in &setup.tracks {
        peer_connection
            .add_track(Arc::clone(track))
            .await
            .map_err(|err| PeerError::Setup(format!("add local track: {err}")))?;
    }

    let ice_events = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = ice_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    events.outbound(
                        NegotiationPayload::Candidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }
                        .to_value(),
                    );
                }
                Err(err) => debug!(error = %err, "failed to serialise local candidate"),
            }
        })
    }));

    let track_events = events.clone();
    peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
        info!(
            remote_id = %track_events.remote_id(),
            kind = %track.kind(),
            track_id = %track.id(),
            "remote track arrived"
        );
        track_events.media(track);
        Box::pin(async {})
    }));

    let state_events = events.clone();
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            debug!(
                remote_id = %state_events.remote_id(),
                generation = state_events.generation(),
                %state,
                "peer connection state changed"
            );
            if state == RTCPeerConnectionState::Failed {
                state_events.failed("peer connection failed");
            }
            Box::pin(async {})
        },
    ));

    Ok(peer_connection)
}

struct Negotiation {
    peer_connection: Arc<RTCPeerConnection>,
    role: LinkRole,
    events: LinkEvents<RemoteTrack>,
    remote_description_set: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

impl Negotiation {
    async fn send_offer(&mut self) -> Result<(), PeerError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(negotiation_error("create offer"))?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation_error("set local offer"))?;
        self.events
            .outbound(NegotiationPayload::Offer { sdp: offer.sdp }.to_value());
        Ok(())
    }

    async fn apply(&mut self, payload: Value) -> Result<(), PeerError> {
        let payload = match NegotiationPayload::from_value(payload) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(error = %err, "ignoring unrecognised negotiation payload");
                return Ok(());
            }
        };

        match (payload, self.role) {
            (NegotiationPayload::Offer { sdp }, LinkRole::Responder) => {
                if self.remote_description_set {
                    debug!("ignoring repeated offer");
                    return Ok(());
                }
                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(negotiation_error("parse offer"))?;
                self.peer_connection
                    .set_remote_description(offer)
                    .await
                    .map_err(negotiation_error("set remote offer"))?;
                self.remote_description_set = true;

                let answer = self
                    .peer_connection
                    .create_answer(None)
                    .await
                    .map_err(negotiation_error("create answer"))?;
                self.peer_connection
                    .set_local_description(answer.clone())
                    .await
                    .map_err(negotiation_error("set local answer"))?;
                self.events
                    .outbound(NegotiationPayload::Answer { sdp: answer.sdp }.to_value());
                self.flush_candidates().await
            }
            (NegotiationPayload::Answer { sdp }, LinkRole::Initiator) => {
                if self.remote_description_set {
                    debug!("ignoring repeated answer");
                    return Ok(());
                }
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(negotiation_error("parse answer"))?;
                self.peer_connection
                    .set_remote_description(answer)
                    .await
                    .map_err(negotiation_error("set remote answer"))?;
                self.remote_description_set = true;
                self.flush_candidates().await
            }
            (
                NegotiationPayload::Candidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                },
                _,
            ) => {
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    ..Default::default()
                };
                if self.remote_description_set {
                    self.add_candidate(init).await;
                } else {
                    self.pending_candidates.push(init);
                }
                Ok(())
            }
            (payload, role) => {
                debug!(?role, ?payload, "ignoring description not meant for this role");
                Ok(())
            }
        }
    }

    async fn flush_candidates(&mut self) -> Result<(), PeerError> {
        for init in std::mem::take(&mut self.pending_candidates) {
            self.add_candidate(init).await;
        }
        Ok(())
    }

    /// A bad candidate is not fatal; others may still connect.
    async fn add_candidate(&self, init: RTCIceCandidateInit) {
        if let Err(err) = self.peer_connection.add_ice_candidate(init).await {
            debug!(error = %err, "failed to add remote candidate");
        }
    }
}

fn negotiation_error(step: &'static str) -> impl Fn(webrtc::Error) -> PeerError {
    move |err| PeerError::Negotiation(format!("{step}: {err}"))
}
