use std::collections::HashMap;

use huddle_proto::ConnectionId;
use serde::Serialize;
use tracing::debug;

use crate::transport::{LinkRole, PeerTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Initiating,
    Answering,
    Connected,
    Closed,
}

impl LinkState {
    fn initial(role: LinkRole) -> Self {
        match role {
            LinkRole::Initiator => LinkState::Initiating,
            LinkRole::Responder => LinkState::Answering,
        }
    }
}

pub struct PeerLink {
    remote_id: ConnectionId,
    role: LinkRole,
    state: LinkState,
    generation: u64,
    transport: Box<dyn PeerTransport>,
    media_surfaced: usize,
}

impl PeerLink {
    pub fn new(
        remote_id: ConnectionId,
        role: LinkRole,
        generation: u64,
        transport: Box<dyn PeerTransport>,
    ) -> Self {
        Self {
            remote_id,
            role,
            state: LinkState::initial(role),
            generation,
            transport,
            media_surfaced: 0,
        }
    }

    pub fn remote_id(&self) -> &ConnectionId {
        &self.remote_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_media(&self) -> bool {
        self.media_surfaced > 0
    }

    pub fn deliver(&mut self, payload: serde_json::Value) {
        if self.state != LinkState::Closed {
            self.transport.deliver(payload);
        }
    }

    /// Records an inbound media handle. Returns true for the first one, which
    /// is what moves the link to `Connected`.
    pub fn media_arrived(&mut self) -> bool {
        self.media_surfaced += 1;
        if self.state == LinkState::Initiating || self.state == LinkState::Answering {
            self.state = LinkState::Connected;
            return true;
        }
        false
    }

    /// Closes the transport the first time only.
    pub fn destroy(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        self.state = LinkState::Closed;
        self.transport.close();
        debug!(
            remote_id = %self.remote_id,
            generation = self.generation,
            "link destroyed"
        );
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            remote_id: self.remote_id.clone(),
            role: self.role,
            state: self.state,
            generation: self.generation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkSnapshot {
    pub remote_id: ConnectionId,
    pub role: LinkRole,
    pub state: LinkState,
    pub generation: u64,
}

/// At most one live link per remote id. Links leave the table destroyed.
#[derive(Default)]
pub struct LinkTable {
    links: HashMap<ConnectionId, PeerLink>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `link`, destroying whatever link the same remote had before.
    /// The superseded link is returned so the caller can clean up after it.
    pub fn replace(&mut self, link: PeerLink) -> Option<PeerLink> {
        let mut previous = self.links.insert(link.remote_id.clone(), link);
        if let Some(old) = previous.as_mut() {
            old.destroy();
        }
        previous
    }

    pub fn remove(&mut self, remote_id: &ConnectionId) -> Option<PeerLink> {
        let mut removed = self.links.remove(remote_id)?;
        removed.destroy();
        Some(removed)
    }

    pub fn get_mut(&mut self, remote_id: &ConnectionId) -> Option<&mut PeerLink> {
        self.links.get_mut(remote_id)
    }

    /// The live link for `remote_id`, but only if it is the given generation.
    pub fn current_mut(&mut self, remote_id: &ConnectionId, generation: u64) -> Option<&mut PeerLink> {
        self.links
            .get_mut(remote_id)
            .filter(|link| link.generation == generation)
    }

    pub fn drain(&mut self) -> Vec<PeerLink> {
        self.links
            .drain()
            .map(|(_, mut link)| {
                link.destroy();
                link
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        let mut links: Vec<LinkSnapshot> = self.links.values().map(PeerLink::snapshot).collect();
        links.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        links
    }
}
