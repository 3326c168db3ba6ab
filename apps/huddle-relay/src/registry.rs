use std::sync::Arc;

use dashmap::mapref::entry::{Entry, OccupiedEntry};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use huddle_proto::{ConnectionId, RoomId, ServerMessage};
use metrics::{counter, gauge};
use serde::Serialize;
use tracing::{debug, info};

use crate::connections::{ConnectionTable, SendOutcome};

/// Room name -> members, plus the reverse index used on teardown.
///
/// Every mutation of a room happens while holding that room's map entry, and
/// the notifications caused by the mutation are queued before the entry is
/// released. Two joins racing on one room therefore see disjoint, consistent
/// views of who was already there.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    rooms: DashMap<RoomId, Room>,
    memberships: DashMap<ConnectionId, Vec<RoomId>>,
    connections: ConnectionTable,
}

#[derive(Debug, Default)]
struct Room {
    members: Vec<ConnectionId>,
}

impl Room {
    fn insert(&mut self, id: &ConnectionId) -> bool {
        if self.members.contains(id) {
            return false;
        }
        self.members.push(id.clone());
        true
    }

    fn remove(&mut self, id: &ConnectionId) -> bool {
        let before = self.members.len();
        self.members.retain(|member| member != id);
        self.members.len() != before
    }

    fn others(&self, id: &ConnectionId) -> Vec<ConnectionId> {
        self.members
            .iter()
            .filter(|member| *member != id)
            .cloned()
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Members other than the joiner, in join order.
    pub existing: Vec<ConnectionId>,
    /// False when the connection was already a member.
    pub newly_joined: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub members: Vec<ConnectionId>,
}

impl RoomRegistry {
    pub fn new(connections: ConnectionTable) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: DashMap::new(),
                memberships: DashMap::new(),
                connections,
            }),
        }
    }

    /// Adds `connection` to `room_id`, replies `existing-peers` to it and
    /// announces it to the members already present.
    ///
    /// Re-joining a room is a no-op on membership; the joiner still gets the
    /// current member list but nobody is told about it a second time.
    pub fn join(&self, connection: &ConnectionId, room_id: &RoomId) -> JoinOutcome {
        let outcome = {
            let mut room = self.get_or_create(room_id);
            let newly_joined = room.insert(connection);
            let existing = room.others(connection);

            if newly_joined {
                self.inner
                    .memberships
                    .entry(connection.clone())
                    .or_default()
                    .push(room_id.clone());
            }

            self.inner.connections.send(
                connection,
                ServerMessage::ExistingPeers {
                    ids: existing.clone(),
                },
            );
            if newly_joined {
                self.deliver(
                    &existing,
                    ServerMessage::PeerConnected {
                        id: connection.clone(),
                    },
                );
            }

            JoinOutcome {
                existing,
                newly_joined,
            }
        };

        if outcome.newly_joined {
            counter!("huddle_relay_joins_total", 1);
            gauge!("huddle_relay_rooms_active", self.inner.rooms.len() as f64);
        }
        info!(
            connection_id = %connection,
            room_id = %room_id,
            existing = outcome.existing.len(),
            newly_joined = outcome.newly_joined,
            "joined room"
        );
        outcome
    }

    /// Sends `message` to every member of `room_id` except `exclude`.
    pub fn broadcast(
        &self,
        room_id: &RoomId,
        message: ServerMessage,
        exclude: Option<&ConnectionId>,
    ) -> BroadcastReport {
        let Some(room) = self.inner.rooms.get(room_id) else {
            return BroadcastReport::default();
        };
        let targets: Vec<ConnectionId> = match exclude {
            Some(excluded) => room.others(excluded),
            None => room.members.clone(),
        };
        self.deliver(&targets, message)
    }

    /// Removes `connection` from every room it joined, telling the remaining
    /// members. Rooms left empty are deleted. Unknown connections are a no-op.
    pub fn leave(&self, connection: &ConnectionId) -> Vec<RoomId> {
        let Some((_, rooms)) = self.inner.memberships.remove(connection) else {
            return Vec::new();
        };

        let mut left = Vec::with_capacity(rooms.len());
        for room_id in rooms {
            let Entry::Occupied(mut entry) = self.inner.rooms.entry(room_id.clone()) else {
                continue;
            };
            if entry.get_mut().remove(connection) {
                let remaining = entry.get().members.clone();
                let report = self.deliver(
                    &remaining,
                    ServerMessage::PeerDisconnected {
                        id: connection.clone(),
                    },
                );
                debug!(
                    connection_id = %connection,
                    room_id = %room_id,
                    notified = report.delivered,
                    "announced departure"
                );
                left.push(room_id.clone());
            }
            if Self::delete_if_empty(entry) {
                info!(room_id = %room_id, "room emptied; deleted");
            }
        }

        gauge!("huddle_relay_rooms_active", self.inner.rooms.len() as f64);
        left
    }

    pub fn members(&self, room_id: &RoomId) -> Option<Vec<ConnectionId>> {
        self.inner
            .rooms
            .get(room_id)
            .map(|room| room.members.clone())
    }

    pub fn rooms_of(&self, connection: &ConnectionId) -> Vec<RoomId> {
        self.inner
            .memberships
            .get(connection)
            .map(|rooms| rooms.clone())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        let mut rooms: Vec<RoomSnapshot> = self
            .inner
            .rooms
            .iter()
            .map(|entry| RoomSnapshot {
                room_id: entry.key().clone(),
                members: entry.value().members.clone(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    fn get_or_create(&self, room_id: &RoomId) -> RefMut<'_, RoomId, Room> {
        self.inner.rooms.entry(room_id.clone()).or_default()
    }

    fn delete_if_empty(entry: OccupiedEntry<'_, RoomId, Room>) -> bool {
        if entry.get().is_empty() {
            entry.remove();
            true
        } else {
            false
        }
    }

    fn deliver(&self, targets: &[ConnectionId], message: ServerMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for target in targets {
            match self.inner.connections.send(target, message.clone()) {
                SendOutcome::Queued => report.delivered += 1,
                _ => report.dropped += 1,
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionRegistration;
    use std::collections::{HashMap, HashSet};

    struct Harness {
        registry: RoomRegistry,
        connections: ConnectionTable,
        inboxes: HashMap<ConnectionId, ConnectionRegistration>,
    }

    impl Harness {
        fn new() -> Self {
            let connections = ConnectionTable::new(64);
            Self {
                registry: RoomRegistry::new(connections.clone()),
                connections,
                inboxes: HashMap::new(),
            }
        }

        fn connect(&mut self, name: &str) -> ConnectionId {
            let id = ConnectionId::from(name);
            let registration = self.connections.register(id.clone(), None);
            self.inboxes.insert(id.clone(), registration);
            id
        }

        fn disconnect(&mut self, id: &ConnectionId) {
            self.registry.leave(id);
            self.connections.remove(id);
        }

        fn drain(&mut self, id: &ConnectionId) -> Vec<ServerMessage> {
            let registration = self.inboxes.get_mut(id).expect("known connection");
            let mut messages = Vec::new();
            while let Ok(message) = registration.receiver.try_recv() {
                messages.push(message);
            }
            messages
        }
    }

    fn ids(names: &[&str]) -> Vec<ConnectionId> {
        names.iter().map(|name| ConnectionId::from(*name)).collect()
    }

    #[test_timeout::tokio_timeout_test]
    async fn three_peers_join_then_one_leaves() {
        let mut h = Harness::new();
        let room = RoomId::from("r");
        let a = h.connect("A");
        let b = h.connect("B");
        let c = h.connect("C");

        assert_eq!(h.registry.join(&a, &room).existing, ids(&[]));
        assert_eq!(h.registry.join(&b, &room).existing, ids(&["A"]));
        assert_eq!(h.registry.join(&c, &room).existing, ids(&["A", "B"]));

        assert_eq!(
            h.drain(&a),
            vec![
                ServerMessage::ExistingPeers { ids: vec![] },
                ServerMessage::PeerConnected { id: b.clone() },
                ServerMessage::PeerConnected { id: c.clone() },
            ]
        );
        assert_eq!(
            h.drain(&b),
            vec![
                ServerMessage::ExistingPeers { ids: ids(&["A"]) },
                ServerMessage::PeerConnected { id: c.clone() },
            ]
        );
        assert_eq!(
            h.drain(&c),
            vec![ServerMessage::ExistingPeers {
                ids: ids(&["A", "B"])
            }]
        );

        h.disconnect(&b);
        assert_eq!(
            h.drain(&a),
            vec![ServerMessage::PeerDisconnected { id: b.clone() }]
        );
        assert_eq!(
            h.drain(&c),
            vec![ServerMessage::PeerDisconnected { id: b.clone() }]
        );
        assert_eq!(h.registry.members(&room), Some(ids(&["A", "C"])));
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejoin_is_idempotent_and_silent() {
        let mut h = Harness::new();
        let room = RoomId::from("r");
        let a = h.connect("A");
        let b = h.connect("B");
        h.registry.join(&a, &room);
        h.registry.join(&b, &room);
        h.drain(&a);
        h.drain(&b);

        let again = h.registry.join(&b, &room);
        assert!(!again.newly_joined);
        assert_eq!(again.existing, ids(&["A"]));
        assert_eq!(h.registry.members(&room), Some(ids(&["A", "B"])));
        assert!(h.drain(&a).is_empty());
        assert_eq!(
            h.drain(&b),
            vec![ServerMessage::ExistingPeers { ids: ids(&["A"]) }]
        );
        assert_eq!(h.registry.rooms_of(&b), vec![room]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn leave_covers_every_room_once_and_deletes_empty_ones() {
        let mut h = Harness::new();
        let r1 = RoomId::from("r1");
        let r2 = RoomId::from("r2");
        let r3 = RoomId::from("r3");
        let a = h.connect("A");
        let b = h.connect("B");
        let c = h.connect("C");
        h.registry.join(&a, &r1);
        h.registry.join(&c, &r1);
        h.registry.join(&a, &r2);
        h.registry.join(&b, &r2);
        h.registry.join(&a, &r3);
        h.drain(&b);
        h.drain(&c);

        let mut left = h.registry.leave(&a);
        left.sort();
        assert_eq!(left, vec![r1.clone(), r2.clone(), r3.clone()]);

        assert_eq!(
            h.drain(&b),
            vec![ServerMessage::PeerDisconnected { id: a.clone() }]
        );
        assert_eq!(
            h.drain(&c),
            vec![ServerMessage::PeerDisconnected { id: a.clone() }]
        );
        assert_eq!(h.registry.members(&r1), Some(ids(&["C"])));
        assert_eq!(h.registry.members(&r2), Some(ids(&["B"])));
        assert_eq!(h.registry.members(&r3), None);
        assert_eq!(h.registry.room_count(), 2);

        assert!(h.registry.leave(&a).is_empty());
        assert!(h.drain(&b).is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn leave_of_unknown_connection_is_a_no_op() {
        let h = Harness::new();
        assert!(h.registry.leave(&ConnectionId::from("ghost")).is_empty());
        assert_eq!(h.registry.room_count(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn broadcast_skips_excluded_member() {
        let mut h = Harness::new();
        let room = RoomId::from("r");
        let a = h.connect("A");
        let b = h.connect("B");
        h.registry.join(&a, &room);
        h.registry.join(&b, &room);
        h.drain(&a);
        h.drain(&b);

        let report = h.registry.broadcast(&room, ServerMessage::Pong, Some(&a));
        assert_eq!(report.delivered, 1);
        assert!(h.drain(&a).is_empty());
        assert_eq!(h.drain(&b), vec![ServerMessage::Pong]);

        let missing = h
            .registry
            .broadcast(&RoomId::from("nowhere"), ServerMessage::Pong, None);
        assert_eq!(missing, BroadcastReport::default());
    }

    #[test_timeout::tokio_timeout_test]
    async fn members_of_departed_connections_are_counted_as_dropped() {
        let mut h = Harness::new();
        let room = RoomId::from("r");
        let a = h.connect("A");
        let b = h.connect("B");
        h.registry.join(&a, &room);
        h.registry.join(&b, &room);
        h.connections.remove(&a);

        let report = h.registry.broadcast(&room, ServerMessage::Pong, Some(&b));
        assert_eq!(report.dropped, 1);
    }

    #[test_timeout::tokio_timeout_test(30, multi_thread)]
    async fn concurrent_joins_see_each_other_exactly_once() {
        const PEERS: usize = 32;
        let connections = ConnectionTable::new(PEERS * 2);
        let registry = RoomRegistry::new(connections.clone());
        let room = RoomId::from("busy");

        let mut inboxes = Vec::new();
        for n in 0..PEERS {
            let id = ConnectionId::from(format!("peer-{n}"));
            let registration = connections.register(id.clone(), None);
            inboxes.push((id, registration));
        }

        let mut joins = Vec::new();
        for (id, _) in &inboxes {
            let registry = registry.clone();
            let room = room.clone();
            let id = id.clone();
            joins.push(tokio::spawn(async move {
                let outcome = registry.join(&id, &room);
                (id, outcome)
            }));
        }
        for join in joins {
            let (id, outcome) = join.await.expect("join task");
            assert!(!outcome.existing.contains(&id));
        }

        // Each unordered pair must be linked exactly once: either one side
        // listed the other as existing, or it was told via peer-connected.
        let mut seen: HashMap<ConnectionId, Vec<ConnectionId>> = HashMap::new();
        for (id, registration) in inboxes.iter_mut() {
            while let Ok(message) = registration.receiver.try_recv() {
                match message {
                    ServerMessage::ExistingPeers { ids } => {
                        seen.entry(id.clone()).or_default().extend(ids)
                    }
                    ServerMessage::PeerConnected { id: other } => {
                        seen.entry(id.clone()).or_default().push(other)
                    }
                    other => panic!("unexpected message {other:?}"),
                }
            }
        }
        for (id, others) in &seen {
            let unique: HashSet<_> = others.iter().collect();
            assert_eq!(unique.len(), others.len(), "{id} saw a duplicate");
            assert_eq!(others.len(), PEERS - 1, "{id} missed a peer");
        }
        assert_eq!(
            registry.members(&room).map(|members| members.len()),
            Some(PEERS)
        );
    }

    #[test_timeout::tokio_timeout_test(30, multi_thread)]
    async fn concurrent_join_and_leave_leave_no_empty_rooms() {
        let connections = ConnectionTable::new(256);
        let registry = RoomRegistry::new(connections.clone());
        let mut tasks = Vec::new();
        for n in 0..64 {
            let registry = registry.clone();
            let connections = connections.clone();
            tasks.push(tokio::spawn(async move {
                let id = ConnectionId::from(format!("churn-{n}"));
                let _registration = connections.register(id.clone(), None);
                let room = RoomId::from(format!("room-{}", n % 4));
                registry.join(&id, &room);
                tokio::task::yield_now().await;
                registry.leave(&id);
                connections.remove(&id);
            }));
        }
        for task in tasks {
            task.await.expect("churn task");
        }
        assert_eq!(registry.room_count(), 0);
        assert!(registry.snapshot().is_empty());
    }
}
