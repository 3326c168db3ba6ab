//! Client-side peer lifecycle.
//!
//! The coordinator owns every [`PeerLink`] and runs as a single task fed by
//! one queue: room events from signaling, reports from transports, queries
//! and shutdown all arrive there, so the link table is only ever touched by
//! one event at a time. Negotiation itself happens inside each transport.

use std::sync::Arc;

use huddle_proto::{ClientMessage, ConnectionId, ServerMessage};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::PeerError;
use crate::link::{LinkSnapshot, LinkTable, PeerLink};
use crate::transport::{
    LinkContext, LinkEvent, LinkEvents, LinkRole, MediaRenderer, TransportFactory,
};

pub(crate) enum Command<M> {
    ExistingPeers(Vec<ConnectionId>),
    PeerConnected(ConnectionId),
    Signal {
        from: ConnectionId,
        payload: Value,
    },
    PeerDisconnected(ConnectionId),
    LocalMediaReady,
    Link {
        remote_id: ConnectionId,
        generation: u64,
        event: LinkEvent<M>,
    },
    Snapshot(oneshot::Sender<Vec<LinkSnapshot>>),
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Handle to a running coordinator. Dropping it shuts the coordinator down.
pub struct CoordinatorHandle<M> {
    commands: mpsc::UnboundedSender<Command<M>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub struct Coordinator<M> {
    local_id: ConnectionId,
    links: LinkTable,
    factory: Arc<dyn TransportFactory<M>>,
    renderer: Arc<dyn MediaRenderer<M>>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    commands: mpsc::UnboundedSender<Command<M>>,
    media_ready: bool,
    deferred: Vec<(ConnectionId, LinkRole)>,
    next_generation: u64,
}

impl<M: Send + 'static> Coordinator<M> {
    /// Starts the coordinator task. Negotiation steps produced by links are
    /// written to `outbound` as `signal` messages.
    pub fn spawn(
        local_id: ConnectionId,
        factory: Arc<dyn TransportFactory<M>>,
        renderer: Arc<dyn MediaRenderer<M>>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> CoordinatorHandle<M> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            local_id,
            links: LinkTable::new(),
            factory,
            renderer,
            outbound,
            commands: commands.clone(),
            media_ready: false,
            deferred: Vec::new(),
            next_generation: 0,
        };
        let task = tokio::spawn(coordinator.run(receiver));
        CoordinatorHandle {
            commands,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command<M>>) {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::ExistingPeers(ids) => {
                    for id in ids {
                        self.create_or_defer(id, LinkRole::Initiator);
                    }
                }
                Command::PeerConnected(id) => self.create_or_defer(id, LinkRole::Responder),
                Command::Signal { from, payload } => self.on_signal(from, payload),
                Command::PeerDisconnected(id) => self.on_peer_disconnected(&id),
                Command::LocalMediaReady => self.on_media_ready(),
                Command::Link {
                    remote_id,
                    generation,
                    event,
                } => self.on_link_event(remote_id, generation, event),
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.links.snapshot());
                }
                Command::Shutdown(ack) => {
                    self.teardown();
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
        }
        debug!(local_id = %self.local_id, "coordinator stopped");
    }

    fn create_or_defer(&mut self, remote_id: ConnectionId, role: LinkRole) {
        if remote_id == self.local_id {
            return;
        }
        if !self.media_ready {
            debug!(remote_id = %remote_id, ?role, "local media not ready; deferring link");
            self.deferred.retain(|(id, _)| id != &remote_id);
            self.deferred.push((remote_id, role));
            return;
        }
        self.open_link(remote_id, role);
    }

    fn open_link(&mut self, remote_id: ConnectionId, role: LinkRole) -> bool {
        self.next_generation += 1;
        let generation = self.next_generation;
        let context = LinkContext {
            remote_id: remote_id.clone(),
            role,
            generation,
            events: LinkEvents::new(remote_id.clone(), generation, self.commands.clone()),
        };
        let transport = match self.factory.open(context) {
            Ok(transport) => transport,
            Err(err) => {
                warn!(remote_id = %remote_id, ?role, error = %err, "failed to open link");
                return false;
            }
        };

        let link = PeerLink::new(remote_id.clone(), role, generation, transport);
        if let Some(previous) = self.links.replace(link) {
            info!(
                remote_id = %remote_id,
                previous_generation = previous.generation(),
                generation,
                "superseded existing link"
            );
            if previous.has_media() {
                self.renderer.withdraw(&remote_id);
            }
        } else {
            info!(remote_id = %remote_id, ?role, generation, "link created");
        }
        true
    }

    fn on_signal(&mut self, from: ConnectionId, payload: Value) {
        if from == self.local_id {
            debug!("ignoring signal from our own connection");
            return;
        }
        if let Some(link) = self.links.get_mut(&from) {
            link.deliver(payload);
            return;
        }
        if !self.media_ready {
            debug!(remote_id = %from, "signal before local media is ready; dropping");
            return;
        }
        if self.open_link(from.clone(), LinkRole::Responder) {
            if let Some(link) = self.links.get_mut(&from) {
                link.deliver(payload);
            }
        }
    }

    fn on_peer_disconnected(&mut self, remote_id: &ConnectionId) {
        self.deferred.retain(|(id, _)| id != remote_id);
        if let Some(link) = self.links.remove(remote_id) {
            info!(remote_id = %remote_id, generation = link.generation(), "remote peer left");
            self.renderer.withdraw(remote_id);
        }
    }

    fn on_media_ready(&mut self) {
        if self.media_ready {
            return;
        }
        self.media_ready = true;
        for (remote_id, role) in std::mem::take(&mut self.deferred) {
            self.open_link(remote_id, role);
        }
    }

    fn on_link_event(&mut self, remote_id: ConnectionId, generation: u64, event: LinkEvent<M>) {
        let Some(link) = self.links.current_mut(&remote_id, generation) else {
            trace!(remote_id = %remote_id, generation, "discarding event from stale link");
            return;
        };
        match event {
            LinkEvent::Outbound(signal) => {
                let message = ClientMessage::Signal {
                    to: remote_id.clone(),
                    signal,
                };
                if self.outbound.send(message).is_err() {
                    debug!(remote_id = %remote_id, "signaling channel closed; dropping outbound step");
                }
            }
            LinkEvent::Media(media) => {
                if link.media_arrived() {
                    info!(remote_id = %remote_id, generation, "link connected");
                }
                self.renderer.show(&remote_id, media);
            }
            LinkEvent::Failed(reason) => {
                warn!(remote_id = %remote_id, generation, reason = %reason, "link failed");
                self.links.remove(&remote_id);
                self.renderer.withdraw(&remote_id);
            }
        }
    }

    fn teardown(&mut self) {
        self.deferred.clear();
        for link in self.links.drain() {
            self.renderer.withdraw(link.remote_id());
        }
        info!(local_id = %self.local_id, "all links closed");
    }
}

impl<M> CoordinatorHandle<M> {
    fn send(&self, command: Command<M>) -> Result<(), PeerError> {
        self.commands
            .send(command)
            .map_err(|_| PeerError::ChannelClosed)
    }

    pub fn existing_peers(&self, ids: Vec<ConnectionId>) -> Result<(), PeerError> {
        self.send(Command::ExistingPeers(ids))
    }

    pub fn peer_connected(&self, id: ConnectionId) -> Result<(), PeerError> {
        self.send(Command::PeerConnected(id))
    }

    pub fn signal(&self, from: ConnectionId, payload: Value) -> Result<(), PeerError> {
        self.send(Command::Signal { from, payload })
    }

    pub fn peer_disconnected(&self, id: ConnectionId) -> Result<(), PeerError> {
        self.send(Command::PeerDisconnected(id))
    }

    pub fn local_media_ready(&self) -> Result<(), PeerError> {
        self.send(Command::LocalMediaReady)
    }

    /// Routes a relay message to the matching event. Messages that carry no
    /// room event are ignored.
    pub fn handle_server_message(&self, message: ServerMessage) -> Result<(), PeerError> {
        match message {
            ServerMessage::ExistingPeers { ids } => self.existing_peers(ids),
            ServerMessage::PeerConnected { id } => self.peer_connected(id),
            ServerMessage::Signal { from, signal } => self.signal(from, signal),
            ServerMessage::PeerDisconnected { id } => self.peer_disconnected(id),
            ServerMessage::Welcome { .. } | ServerMessage::Pong => Ok(()),
        }
    }

    pub async fn snapshot(&self) -> Result<Vec<LinkSnapshot>, PeerError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        response.await.map_err(|_| PeerError::ChannelClosed)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Closes every link and stops the coordinator. Later calls return
    /// immediately.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.send(Command::Shutdown(Some(ack))).is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl<M> Drop for CoordinatorHandle<M> {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkState;
    use crate::transport::PeerTransport;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    type Media = &'static str;

    #[derive(Default)]
    struct Script {
        opened: Vec<(ConnectionId, LinkRole, u64)>,
        delivered: Vec<(ConnectionId, u64, Value)>,
        closed: Vec<(ConnectionId, u64)>,
        contexts: HashMap<u64, LinkEvents<Media>>,
        fail_opens_for: Vec<ConnectionId>,
    }

    #[derive(Clone, Default)]
    struct ScriptedFactory {
        script: Arc<Mutex<Script>>,
    }

    struct ScriptedTransport {
        remote_id: ConnectionId,
        generation: u64,
        script: Arc<Mutex<Script>>,
    }

    impl PeerTransport for ScriptedTransport {
        fn deliver(&mut self, payload: Value) {
            self.script
                .lock()
                .delivered
                .push((self.remote_id.clone(), self.generation, payload));
        }

        fn close(&mut self) {
            self.script
                .lock()
                .closed
                .push((self.remote_id.clone(), self.generation));
        }
    }

    impl TransportFactory<Media> for ScriptedFactory {
        fn open(&self, context: LinkContext<Media>) -> Result<Box<dyn PeerTransport>, PeerError> {
            let mut script = self.script.lock();
            if script.fail_opens_for.contains(&context.remote_id) {
                return Err(PeerError::Setup("scripted failure".into()));
            }
            script
                .opened
                .push((context.remote_id.clone(), context.role, context.generation));
            script.contexts.insert(context.generation, context.events.clone());
            Ok(Box::new(ScriptedTransport {
                remote_id: context.remote_id,
                generation: context.generation,
                script: Arc::clone(&self.script),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        shown: Mutex<Vec<(ConnectionId, Media)>>,
        withdrawn: Mutex<Vec<ConnectionId>>,
    }

    impl MediaRenderer<Media> for RecordingRenderer {
        fn show(&self, remote: &ConnectionId, media: Media) {
            self.shown.lock().push((remote.clone(), media));
        }

        fn withdraw(&self, remote: &ConnectionId) {
            self.withdrawn.lock().push(remote.clone());
        }
    }

    struct Fixture {
        factory: ScriptedFactory,
        renderer: Arc<RecordingRenderer>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        handle: CoordinatorHandle<Media>,
    }

    fn fixture() -> Fixture {
        let factory = ScriptedFactory::default();
        let renderer = Arc::new(RecordingRenderer::default());
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let handle = Coordinator::spawn(
            id("me"),
            Arc::new(factory.clone()),
            renderer.clone(),
            outbound_tx,
        );
        Fixture {
            factory,
            renderer,
            outbound,
            handle,
        }
    }

    fn id(value: &str) -> ConnectionId {
        ConnectionId::from(value)
    }

    fn events_for(fixture: &Fixture, generation: u64) -> LinkEvents<Media> {
        fixture
            .factory
            .script
            .lock()
            .contexts
            .get(&generation)
            .cloned()
            .expect("link context")
    }

    /// Round-trips a query so every earlier command has been processed.
    async fn settle(fixture: &Fixture) -> Vec<LinkSnapshot> {
        fixture.handle.snapshot().await.expect("snapshot")
    }

    #[test_timeout::tokio_timeout_test]
    async fn existing_peers_become_initiators_once_media_is_ready() {
        let f = fixture();
        f.handle
            .existing_peers(vec![id("A"), id("B")])
            .expect("existing");
        assert!(settle(&f).await.is_empty());

        f.handle.local_media_ready().expect("ready");
        let links = settle(&f).await;
        assert_eq!(links.len(), 2);
        assert!(links
            .iter()
            .all(|link| link.role == LinkRole::Initiator && link.state == LinkState::Initiating));

        let opened = f.factory.script.lock().opened.clone();
        assert_eq!(
            opened,
            vec![
                (id("A"), LinkRole::Initiator, 1),
                (id("B"), LinkRole::Initiator, 2)
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn deferred_peer_that_leaves_is_never_opened() {
        let f = fixture();
        f.handle.peer_connected(id("A")).expect("connected");
        f.handle.peer_connected(id("B")).expect("connected");
        f.handle.peer_disconnected(id("A")).expect("left");
        f.handle.local_media_ready().expect("ready");

        let links = settle(&f).await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].remote_id, id("B"));
        assert_eq!(links[0].role, LinkRole::Responder);
        assert_eq!(links[0].state, LinkState::Answering);
    }

    #[test_timeout::tokio_timeout_test]
    async fn outbound_steps_are_addressed_to_the_remote() {
        let mut f = fixture();
        f.handle.local_media_ready().expect("ready");
        f.handle.existing_peers(vec![id("A")]).expect("existing");
        settle(&f).await;

        let offer = json!({"type": "offer", "sdp": "v=0"});
        assert!(events_for(&f, 1).outbound(offer.clone()));
        settle(&f).await;
        assert_eq!(
            f.outbound.try_recv().expect("outbound signal"),
            ClientMessage::Signal {
                to: id("A"),
                signal: offer
            }
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn unmatched_signal_creates_responder_and_feeds_it() {
        let f = fixture();
        f.handle.local_media_ready().expect("ready");
        let offer = json!({"type": "offer", "sdp": "v=0"});
        f.handle.signal(id("X"), offer.clone()).expect("signal");

        let links = settle(&f).await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].role, LinkRole::Responder);
        let delivered = f.factory.script.lock().delivered.clone();
        assert_eq!(delivered, vec![(id("X"), 1, offer)]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn signal_from_own_connection_opens_no_link() {
        let f = fixture();
        f.handle.local_media_ready().expect("ready");
        f.handle
            .signal(id("me"), json!({"type": "offer", "sdp": "v=0"}))
            .expect("signal");
        assert!(settle(&f).await.is_empty());
        let script = f.factory.script.lock();
        assert!(script.opened.is_empty());
        assert!(script.delivered.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn signal_before_media_is_dropped() {
        let f = fixture();
        f.handle
            .signal(id("X"), json!({"type": "offer"}))
            .expect("signal");
        f.handle.local_media_ready().expect("ready");
        assert!(settle(&f).await.is_empty());
        assert!(f.factory.script.lock().delivered.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn supersede_closes_old_transport_once_and_ignores_its_events() {
        let mut f = fixture();
        f.handle.local_media_ready().expect("ready");
        f.handle.existing_peers(vec![id("X")]).expect("existing");
        f.handle.peer_connected(id("X")).expect("connected");
        let links = settle(&f).await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].generation, 2);
        assert_eq!(links[0].role, LinkRole::Responder);

        let stale = events_for(&f, 1);
        stale.outbound(json!({"type": "candidate"}));
        stale.media("stale-track");
        stale.failed("late failure");
        let links = settle(&f).await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].state, LinkState::Answering);

        assert!(f.outbound.try_recv().is_err());
        assert!(f.renderer.shown.lock().is_empty());
        assert_eq!(f.factory.script.lock().closed, vec![(id("X"), 1)]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn media_connects_link_and_every_handle_is_shown() {
        let f = fixture();
        f.handle.local_media_ready().expect("ready");
        f.handle.peer_connected(id("A")).expect("connected");
        settle(&f).await;

        let events = events_for(&f, 1);
        events.media("audio");
        events.media("video");
        let links = settle(&f).await;
        assert_eq!(links[0].state, LinkState::Connected);
        assert_eq!(
            *f.renderer.shown.lock(),
            vec![(id("A"), "audio"), (id("A"), "video")]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn failure_on_one_link_leaves_others_alone() {
        let f = fixture();
        f.handle.local_media_ready().expect("ready");
        f.handle
            .existing_peers(vec![id("A"), id("B")])
            .expect("existing");
        settle(&f).await;

        events_for(&f, 1).failed("ice failed");
        let links = settle(&f).await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].remote_id, id("B"));
        assert_eq!(f.factory.script.lock().closed, vec![(id("A"), 1)]);
        assert_eq!(*f.renderer.withdrawn.lock(), vec![id("A")]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn factory_failure_is_contained() {
        let f = fixture();
        f.factory.script.lock().fail_opens_for.push(id("bad"));
        f.handle.local_media_ready().expect("ready");
        f.handle
            .existing_peers(vec![id("bad"), id("good")])
            .expect("existing");
        let links = settle(&f).await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].remote_id, id("good"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn peer_disconnected_destroys_and_withdraws() {
        let f = fixture();
        f.handle.local_media_ready().expect("ready");
        f.handle.peer_connected(id("A")).expect("connected");
        f.handle.peer_disconnected(id("A")).expect("left");
        f.handle.peer_disconnected(id("A")).expect("left again");
        assert!(settle(&f).await.is_empty());
        assert_eq!(f.factory.script.lock().closed, vec![(id("A"), 1)]);
        assert_eq!(*f.renderer.withdrawn.lock(), vec![id("A")]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn shutdown_closes_everything_once_and_is_idempotent() {
        let f = fixture();
        f.handle.local_media_ready().expect("ready");
        f.handle
            .existing_peers(vec![id("A"), id("B"), id("me")])
            .expect("existing");
        assert_eq!(settle(&f).await.len(), 2);

        f.handle.shutdown().await;
        f.handle.shutdown().await;
        assert!(!f.handle.is_running());
        assert!(matches!(
            f.handle.peer_connected(id("C")),
            Err(PeerError::ChannelClosed)
        ));

        let mut closed = f.factory.script.lock().closed.clone();
        closed.sort();
        assert_eq!(closed, vec![(id("A"), 1), (id("B"), 2)]);
        let mut withdrawn = f.renderer.withdrawn.lock().clone();
        withdrawn.sort();
        assert_eq!(withdrawn, vec![id("A"), id("B")]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropping_the_handle_stops_the_coordinator() {
        let f = fixture();
        f.handle.local_media_ready().expect("ready");
        f.handle.peer_connected(id("A")).expect("connected");
        settle(&f).await;
        let script = Arc::clone(&f.factory.script);
        drop(f);

        for _ in 0..50 {
            if !script.lock().closed.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(script.lock().closed, vec![(id("A"), 1)]);
    }
}
