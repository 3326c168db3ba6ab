use huddle_proto::{ConnectionId, ServerMessage};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, trace};

use crate::connections::{ConnectionTable, SendOutcome};

/// A negotiation payload in flight between two connections. The payload is
/// never inspected.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub from: ConnectionId,
    pub to: ConnectionId,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    Dropped,
}

#[derive(Clone)]
pub struct SignalRelay {
    connections: ConnectionTable,
}

impl SignalRelay {
    pub fn new(connections: ConnectionTable) -> Self {
        Self { connections }
    }

    /// Point-to-point forward. Undeliverable signals vanish; the sender is
    /// never told.
    pub fn relay(&self, envelope: SignalEnvelope) -> RelayOutcome {
        let SignalEnvelope { from, to, payload } = envelope;
        let outcome = self.connections.send(
            &to,
            ServerMessage::Signal {
                from: from.clone(),
                signal: payload,
            },
        );
        match outcome {
            SendOutcome::Queued => {
                trace!(from = %from, to = %to, "signal relayed");
                counter!("huddle_relay_signals_total", 1, "outcome" => "delivered");
                RelayOutcome::Delivered
            }
            other => {
                debug!(from = %from, to = %to, reason = ?other, "signal dropped");
                counter!("huddle_relay_signals_total", 1, "outcome" => "dropped");
                RelayOutcome::Dropped
            }
        }
    }
}
