use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use huddle_proto::{ConnectionId, ServerMessage};
use metrics::counter;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Live connections and their outbound queues, keyed by identity.
///
/// This is the only place that knows how to reach a connection. The registry
/// and the relay address connections through it and never hold a sender of
/// their own, so removing an id here makes it unreachable everywhere.
#[derive(Clone)]
pub struct ConnectionTable {
    inner: Arc<ConnectionTableInner>,
}

struct ConnectionTableInner {
    entries: DashMap<ConnectionId, ConnectionEntry>,
    buffer: usize,
}

struct ConnectionEntry {
    sender: mpsc::Sender<ServerMessage>,
    last_seen: AtomicU64,
    evict: Arc<Notify>,
    remote_addr: Option<SocketAddr>,
}

pub struct ConnectionRegistration {
    pub receiver: mpsc::Receiver<ServerMessage>,
    /// Notified when the connection should be torn down from the server side.
    pub evict: Arc<Notify>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// The id is not (or no longer) connected.
    Unknown,
    /// The target's queue is full; the message was dropped.
    Full,
    /// The writer side is gone; the message was dropped.
    Closed,
}

impl ConnectionTable {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(ConnectionTableInner {
                entries: DashMap::new(),
                buffer: buffer.max(1),
            }),
        }
    }

    pub fn register(
        &self,
        id: ConnectionId,
        remote_addr: Option<SocketAddr>,
    ) -> ConnectionRegistration {
        let (sender, receiver) = mpsc::channel(self.inner.buffer);
        let evict = Arc::new(Notify::new());
        self.inner.entries.insert(
            id,
            ConnectionEntry {
                sender,
                last_seen: AtomicU64::new(now_millis()),
                evict: Arc::clone(&evict),
                remote_addr,
            },
        );
        ConnectionRegistration { receiver, evict }
    }

    /// Queue `message` for `id` without waiting.
    pub fn send(&self, id: &ConnectionId, message: ServerMessage) -> SendOutcome {
        let Some(entry) = self.inner.entries.get(id) else {
            return SendOutcome::Unknown;
        };
        match entry.sender.try_send(message) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(message)) => {
                counter!(
                    "huddle_relay_flow_control_drops_total",
                    1,
                    "kind" => message.kind()
                );
                debug!(connection_id = %id, kind = message.kind(), "outbound queue full; dropping");
                SendOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    pub fn touch(&self, id: &ConnectionId) {
        if let Some(entry) = self.inner.entries.get(id) {
            entry.last_seen.store(now_millis(), Ordering::Relaxed);
        }
    }

    pub fn remote_addr(&self, id: &ConnectionId) -> Option<SocketAddr> {
        self.inner.entries.get(id).and_then(|entry| entry.remote_addr)
    }

    /// Drops the identity mapping. Returns false if it was already gone.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        self.inner.entries.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Connections with no inbound activity for longer than `idle_timeout`.
    pub fn stale(&self, now: u64, idle_timeout: Duration) -> Vec<ConnectionId> {
        let limit = idle_timeout.as_millis() as u64;
        self.inner
            .entries
            .iter()
            .filter(|entry| now.saturating_sub(entry.last_seen.load(Ordering::Relaxed)) > limit)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Asks the connection's reader loop to run its teardown.
    pub fn evict(&self, id: &ConnectionId) -> bool {
        match self.inner.entries.get(id) {
            Some(entry) => {
                entry.evict.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn evict_all(&self) -> usize {
        let mut evicted = 0;
        for entry in self.inner.entries.iter() {
            entry.evict.notify_one();
            evicted += 1;
        }
        evicted
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
