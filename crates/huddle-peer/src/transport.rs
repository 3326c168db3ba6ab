//! Seams between the coordinator and whatever actually moves media.
//!
//! A transport is opened per link and talks back to the coordinator only
//! through [`LinkEvents`], which tags everything it sends with the link's
//! generation. Events from a link that has since been replaced or destroyed
//! are recognised by that tag and discarded.

use huddle_proto::ConnectionId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::coordinator::Command;
use crate::error::PeerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    /// Sends the first negotiation message.
    Initiator,
    /// Waits for the remote side to start.
    Responder,
}

/// One direct connection to a remote peer.
pub trait PeerTransport: Send {
    /// Hands an inbound negotiation payload to the transport. Must not block.
    fn deliver(&mut self, payload: Value);

    /// Releases everything the transport holds. Calling it twice is harmless.
    fn close(&mut self);
}

pub trait TransportFactory<M>: Send + Sync {
    fn open(&self, context: LinkContext<M>) -> Result<Box<dyn PeerTransport>, PeerError>;
}

/// Where inbound media ends up. `withdraw` may be called for a remote that
/// was never shown.
pub trait MediaRenderer<M>: Send + Sync {
    fn show(&self, remote: &ConnectionId, media: M);
    fn withdraw(&self, remote: &ConnectionId);
}

pub struct LinkContext<M> {
    pub remote_id: ConnectionId,
    pub role: LinkRole,
    pub generation: u64,
    pub events: LinkEvents<M>,
}

#[derive(Debug)]
pub(crate) enum LinkEvent<M> {
    Outbound(Value),
    Media(M),
    Failed(String),
}

/// Reports from a transport back to the coordinator. Every method returns
/// false once the coordinator has stopped.
pub struct LinkEvents<M> {
    remote_id: ConnectionId,
    generation: u64,
    sender: mpsc::UnboundedSender<Command<M>>,
}

impl<M> Clone for LinkEvents<M> {
    fn clone(&self) -> Self {
        Self {
            remote_id: self.remote_id.clone(),
            generation: self.generation,
            sender: self.sender.clone(),
        }
    }
}

impl<M> LinkEvents<M> {
    pub(crate) fn new(
        remote_id: ConnectionId,
        generation: u64,
        sender: mpsc::UnboundedSender<Command<M>>,
    ) -> Self {
        Self {
            remote_id,
            generation,
            sender,
        }
    }

    /// A negotiation step to relay to the remote peer.
    pub fn outbound(&self, payload: Value) -> bool {
        self.emit(LinkEvent::Outbound(payload))
    }

    /// An inbound media handle became available.
    pub fn media(&self, media: M) -> bool {
        self.emit(LinkEvent::Media(media))
    }

    pub fn failed(&self, reason: impl Into<String>) -> bool {
        self.emit(LinkEvent::Failed(reason.into()))
    }

    pub fn remote_id(&self) -> &ConnectionId {
        &self.remote_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn emit(&self, event: LinkEvent<M>) -> bool {
        self.sender
            .send(Command::Link {
                remote_id: self.remote_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}
