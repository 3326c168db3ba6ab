//! Signaling messages exchanged between the huddle relay and its peers.
//!
//! Every frame is a JSON object tagged by `type`. The `signal` payload is an
//! opaque JSON value owned by the negotiation protocol running between two
//! peers; nothing in this crate looks inside it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Identity of one transport session, assigned by the relay at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RoomId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages sent from a peer to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Enter a room; answered with `existing-peers`.
    JoinRoom { room_id: RoomId },
    /// Forward an opaque negotiation payload to another connection.
    Signal { to: ConnectionId, signal: Value },
    /// Application heartbeat.
    Ping,
}

/// Messages sent from the relay to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Identity assigned to this connection.
    Welcome { id: ConnectionId },
    /// Members already in the room when the recipient joined.
    ExistingPeers { ids: Vec<ConnectionId> },
    /// A connection joined a room the recipient is in.
    PeerConnected { id: ConnectionId },
    /// Negotiation payload relayed from another connection.
    Signal { from: ConnectionId, signal: Value },
    /// A connection left a room the recipient is in.
    PeerDisconnected { id: ConnectionId },
    Pong,
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame is not valid utf-8")]
    NotUtf8,
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Binary frames are accepted when they carry UTF-8 JSON.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtoError::NotUtf8)?;
        Self::from_json(text)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtoError::NotUtf8)?;
        Self::from_json(text)
    }

    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::ExistingPeers { .. } => "existing-peers",
            ServerMessage::PeerConnected { .. } => "peer-connected",
            ServerMessage::Signal { .. } => "signal",
            ServerMessage::PeerDisconnected { .. } => "peer-disconnected",
            ServerMessage::Pong => "pong",
        }
    }
}
