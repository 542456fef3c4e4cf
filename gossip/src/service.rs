// Copyright (c) 2024 Botho Foundation

//! The topology gossip service.
//!
//! The TopoService provides:
//! - A broadcaster task that periodically sends this node's peer view to
//!   every connected peer
//! - One receive loop per connected peer that deduplicates inbound snapshots
//!   and floods novel ones to every other peer
//! - Best-effort reporting of every snapshot to the external sink
//!
//! Lifecycle is `Created -> Running -> Stopped`; a stopped service may be
//! started again.

use crate::{
    config::TopoConfig,
    error::{TopoError, TopoResult, TransportError},
    filter::DedupFilter,
    messages::{TopologySnapshot, WireMessage, PROTOCOL_NAME, TOPO_CMD, TOPO_CMD_SET},
    metrics::{
        BROADCASTS, DUPLICATES, MESSAGES_RECEIVED, PEERS, PEER_QUEUE_DROPPED, PROTOCOL_ERRORS,
        RELAYED,
    },
    sink::{ExternalSink, SinkConnector},
    store::{new_shared_registry, PeerHandle, SharedPeerRegistry},
    transport::{Message, NodeTransport, PeerConnection, PeerId, Protocol, ProtocolHandler},
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

/// Externally observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, never started
    Created,
    /// Broadcasting and accepting peers
    Running,
    /// Stopped; no broadcaster or peer task remains
    Stopped,
}

/// What happened to an inbound topology message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Already seen; dropped without relaying
    Duplicate,

    /// New; relayed to other peers and reported
    Relayed {
        /// The decoded snapshot
        snapshot: TopologySnapshot,
        /// Number of peers the message was queued for
        fanout: usize,
    },
}

enum Lifecycle {
    Created,
    Running {
        node: Arc<dyn NodeTransport>,
        shutdown: CancellationToken,
        broadcaster: JoinHandle<()>,
    },
    Stopped,
}

struct Inner {
    config: TopoConfig,
    registry: SharedPeerRegistry,
    filter: DedupFilter,
    sink: ExternalSink,
    lifecycle: Mutex<Lifecycle>,
    peer_tasks: TaskTracker,
}

/// The topology gossip service. Cloning yields another handle to the same
/// service.
#[derive(Clone)]
pub struct TopoService {
    inner: Arc<Inner>,
}

impl fmt::Debug for TopoService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopoService")
            .field("state", &self.state())
            .field("peers", &self.inner.registry.len())
            .finish()
    }
}

impl TopoService {
    /// Create a new topology service.
    ///
    /// The reporting sink is built from `config.sink` through `connector`;
    /// a connector failure aborts construction.
    pub fn new(config: TopoConfig, connector: &dyn SinkConnector) -> TopoResult<Self> {
        config.validate()?;
        let sink = ExternalSink::connect(&config.sink, connector)?;
        Self::with_sink(config, sink)
    }

    /// Create a new topology service reporting to an existing sink.
    pub fn with_sink(config: TopoConfig, sink: ExternalSink) -> TopoResult<Self> {
        config.validate()?;
        let filter = DedupFilter::new(config.filter_capacity);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry: new_shared_registry(),
                filter,
                sink,
                lifecycle: Mutex::new(Lifecycle::Created),
                peer_tasks: TaskTracker::new(),
            }),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &TopoConfig {
        &self.inner.config
    }

    /// Get a reference to the peer registry.
    pub fn registry(&self) -> &SharedPeerRegistry {
        &self.inner.registry
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        match &*self.inner.lifecycle.lock() {
            Lifecycle::Created => ServiceState::Created,
            Lifecycle::Running { .. } => ServiceState::Running,
            Lifecycle::Stopped => ServiceState::Stopped,
        }
    }

    /// The protocol descriptor to register with the transport.
    pub fn protocol(&self) -> Protocol {
        Protocol {
            name: PROTOCOL_NAME,
            id: TOPO_CMD_SET,
            handler: Arc::new(self.clone()),
        }
    }

    /// Start the service.
    ///
    /// Spawns the broadcaster and registers the protocol with `node`, which
    /// then hands new connections to [`TopoService::accept`].
    pub fn start(&self, node: Arc<dyn NodeTransport>) -> TopoResult<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Running { .. }) {
                return Err(TopoError::AlreadyRunning);
            }

            let shutdown = CancellationToken::new();
            let broadcaster = tokio::spawn(self.clone().run_broadcaster(
                node.clone(),
                shutdown.clone(),
            ));
            *lifecycle = Lifecycle::Running {
                node: node.clone(),
                shutdown,
                broadcaster,
            };
        }

        node.register_protocol(self.protocol());

        info!(
            pivot = %node.local_url(),
            interval_secs = self.inner.config.broadcast_interval_secs,
            "Topology gossip started"
        );
        Ok(())
    }

    /// Stop the service.
    ///
    /// Cancels the broadcaster and every peer loop, then waits for the
    /// broadcaster to exit and, within the configured grace period, for the
    /// peer tasks. Every peer connection is closed on the way out. Calling
    /// this when the service is not running is a no-op.
    ///
    /// The sink drainer is not part of the service lifecycle: it keeps
    /// publishing queued reports until the last [`ExternalSink`] handle,
    /// including the one held by this service, is dropped.
    pub async fn stop(&self) {
        let (shutdown, broadcaster) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running {
                    shutdown,
                    broadcaster,
                    ..
                } => (shutdown, broadcaster),
                other => {
                    *lifecycle = other;
                    return;
                }
            }
        };

        info!("Topology gossip stopping");
        shutdown.cancel();

        if let Err(e) = broadcaster.await {
            error!(%e, "Topology broadcaster panicked");
        }

        let tracker = &self.inner.peer_tasks;
        tracker.close();
        if tokio::time::timeout(self.inner.config.shutdown_grace(), tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = tracker.len(),
                "Peer tasks still running after shutdown grace period"
            );
        }
        tracker.reopen();

        info!("Topology gossip stopped");
    }

    /// Build the current topology snapshot.
    pub fn topology(&self) -> TopoResult<TopologySnapshot> {
        let node = match &*self.inner.lifecycle.lock() {
            Lifecycle::Running { node, .. } => node.clone(),
            _ => return Err(TopoError::NotRunning),
        };
        Ok(self.snapshot_for(node.local_url()))
    }

    /// Run one broadcaster tick now.
    ///
    /// Returns the number of peers the snapshot was queued for.
    pub fn broadcast(&self) -> TopoResult<usize> {
        let snapshot = self.topology()?;
        Ok(self.broadcast_snapshot(snapshot))
    }

    /// Spawn a tracked receive loop for a connection handed over by the
    /// transport.
    pub fn accept(&self, conn: Arc<dyn PeerConnection>) {
        if self.shutdown_token().is_none() {
            warn!(peer = %conn.peer_id(), "Topology service not running, closing connection");
            tokio::spawn(async move { conn.close().await });
            return;
        }

        let service = self.clone();
        self.inner.peer_tasks.spawn(async move {
            let peer = conn.peer_id();
            if let Err(e) = service.handle(conn).await {
                debug!(%peer, %e, "Topology peer task ended with error");
            }
        });
    }

    /// Serve one peer connection until it closes, misbehaves, or the service
    /// stops.
    ///
    /// The peer is registered for the lifetime of the call. On return it is
    /// removed and the connection is closed.
    pub async fn handle(&self, conn: Arc<dyn PeerConnection>) -> TopoResult<()> {
        let Some(shutdown) = self.shutdown_token() else {
            conn.close().await;
            return Err(TopoError::NotRunning);
        };
        let session = shutdown.child_token();
        let peer = conn.peer_id();
        let addr = conn.remote_addr();

        let (tx, rx) = mpsc::channel(self.inner.config.peer_queue_depth);
        let handle = PeerHandle::new(peer.clone(), addr.clone(), tx);
        match self.inner.registry.add(handle.clone()) {
            Some(_) => debug!(%peer, "Replaced existing topology connection"),
            None => PEERS.inc(),
        }
        debug!(%peer, %addr, "Topology peer connected");

        let writer = tokio::spawn(write_loop(conn.clone(), rx, session.clone()));
        let result = self.read_loop(conn.as_ref(), &peer, &session).await;

        session.cancel();
        if self.inner.registry.remove_handle(&handle) {
            PEERS.dec();
        }
        if let Err(e) = writer.await {
            error!(%peer, %e, "Topology writer panicked");
        }
        conn.close().await;

        match &result {
            Ok(()) => debug!(%peer, %addr, "Topology peer disconnected"),
            Err(e) => warn!(%peer, %addr, %e, "Topology peer terminated"),
        }
        result
    }

    /// Process one inbound wire message from `sender`.
    ///
    /// New messages are recorded in the filter before being relayed, as the
    /// original bytes, to every registered peer except `sender`.
    pub fn receive(&self, payload: Bytes, sender: &PeerId) -> TopoResult<Received> {
        let wire = WireMessage::parse(payload)?;
        MESSAGES_RECEIVED.inc();

        let digest = wire.digest();
        if !self.inner.filter.insert_unique(&digest) {
            DUPLICATES.inc();
            trace!(%sender, digest = %hex::encode(digest), "Dropping duplicate topology message");
            return Ok(Received::Duplicate);
        }

        let snapshot = wire.decode_snapshot()?;
        let bytes = wire.into_bytes();

        let mut fanout = 0;
        self.inner.registry.for_each_except(sender, |peer| {
            if queue_for(peer, bytes.clone()) {
                fanout += 1;
            }
        });
        RELAYED.inc_by(fanout as u64);

        self.inner
            .sink
            .publish_snapshot(&self.inner.config.sink.topic, &snapshot);

        debug!(
            %sender,
            pivot = snapshot.pivot(),
            peers = snapshot.peers().len(),
            fanout,
            "Relayed topology snapshot"
        );
        Ok(Received::Relayed { snapshot, fanout })
    }

    fn shutdown_token(&self) -> Option<CancellationToken> {
        match &*self.inner.lifecycle.lock() {
            Lifecycle::Running { shutdown, .. } => Some(shutdown.clone()),
            _ => None,
        }
    }

    fn snapshot_for(&self, pivot: String) -> TopologySnapshot {
        let peers = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        TopologySnapshot::now(pivot, peers)
    }

    fn broadcast_snapshot(&self, snapshot: TopologySnapshot) -> usize {
        let wire = snapshot.to_wire();
        // Our own snapshot coming back around a cycle is a duplicate.
        self.inner.filter.insert(&wire.digest());
        let bytes = wire.into_bytes();

        let mut sent = 0;
        self.inner.registry.for_each(|peer| {
            if queue_for(peer, bytes.clone()) {
                sent += 1;
            }
        });
        BROADCASTS.inc();

        self.inner
            .sink
            .publish_snapshot(&self.inner.config.sink.topic, &snapshot);

        trace!(peers = snapshot.peers().len(), sent, "Broadcast topology snapshot");
        sent
    }

    async fn run_broadcaster(self, node: Arc<dyn NodeTransport>, shutdown: CancellationToken) {
        let period = self.inner.config.broadcast_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.snapshot_for(node.local_url());
                    self.broadcast_snapshot(snapshot);
                }
            }
        }

        debug!("Topology broadcaster exited");
    }

    async fn read_loop(
        &self,
        conn: &dyn PeerConnection,
        peer: &PeerId,
        session: &CancellationToken,
    ) -> TopoResult<()> {
        loop {
            let msg = select! {
                _ = session.cancelled() => return Ok(()),
                msg = conn.read_message() => msg,
            };
            let msg = match msg {
                Ok(msg) => msg,
                Err(TransportError::Closed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            if msg.cmd_set != TOPO_CMD_SET || msg.cmd != TOPO_CMD {
                PROTOCOL_ERRORS.inc();
                return Err(TopoError::UnexpectedCommand {
                    cmd_set: msg.cmd_set,
                    cmd: msg.cmd,
                });
            }

            if let Err(e) = self.receive(msg.payload, peer) {
                PROTOCOL_ERRORS.inc();
                return Err(e);
            }
        }
    }
}

impl ProtocolHandler for TopoService {
    fn on_connection(&self, conn: Arc<dyn PeerConnection>) {
        self.accept(conn);
    }
}

/// Queue `bytes` for one peer without blocking. Returns whether it was queued.
fn queue_for(peer: &PeerHandle, bytes: Bytes) -> bool {
    match peer.send(bytes) {
        Ok(()) => true,
        Err(TransportError::QueueFull) => {
            PEER_QUEUE_DROPPED.inc();
            warn!(peer = %peer.id(), "Peer queue full, dropping topology message");
            false
        }
        Err(e) => {
            debug!(peer = %peer.id(), %e, "Skipping departed topology peer");
            false
        }
    }
}

/// Drain one peer's outbound queue into its connection.
///
/// A write failure cancels the session, which also ends the peer's read loop.
async fn write_loop(
    conn: Arc<dyn PeerConnection>,
    mut rx: mpsc::Receiver<Bytes>,
    session: CancellationToken,
) {
    loop {
        let payload = select! {
            _ = session.cancelled() => break,
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        let result = select! {
            _ = session.cancelled() => break,
            result = conn.write_message(Message::new(TOPO_CMD_SET, TOPO_CMD, payload)) => result,
        };
        if let Err(e) = result {
            warn!(peer = %conn.peer_id(), %e, "Failed to write topology message");
            session.cancel();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::TopoConfigBuilder,
        error::DecodeError,
        transport::memory::{connection_pair, MemoryNode},
    };
    use std::time::Duration;

    fn make_service() -> TopoService {
        TopoService::with_sink(TopoConfig::default(), ExternalSink::disabled()).unwrap()
    }

    fn make_node() -> Arc<MemoryNode> {
        Arc::new(MemoryNode::new("pivot", "vnode://pivot@127.0.0.1:8483"))
    }

    fn add_peer(service: &TopoService, name: &str) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(16);
        service.registry().add(PeerHandle::new(
            PeerId::from(name),
            format!("{name}.example:8483"),
            tx,
        ));
        rx
    }

    fn remote_message(pivot: &str, peers: &[&str]) -> WireMessage {
        TopologySnapshot::now(
            pivot.to_string(),
            peers.iter().map(|p| p.to_string()).collect(),
        )
        .to_wire()
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let service = make_service();
        assert_eq!(service.state(), ServiceState::Created);

        // Stopping a service that never started changes nothing.
        service.stop().await;
        assert_eq!(service.state(), ServiceState::Created);

        service.start(make_node()).unwrap();
        assert_eq!(service.state(), ServiceState::Running);
        assert!(matches!(
            service.start(make_node()),
            Err(TopoError::AlreadyRunning)
        ));

        service.stop().await;
        assert_eq!(service.state(), ServiceState::Stopped);
        service.stop().await;
        assert_eq!(service.state(), ServiceState::Stopped);

        service.start(make_node()).unwrap();
        assert_eq!(service.state(), ServiceState::Running);
        service.stop().await;
    }

    #[test]
    fn test_oversized_filter_is_a_construction_error() {
        let config = TopoConfigBuilder::new()
            .filter_capacity(usize::MAX / 2)
            .build();
        assert!(matches!(
            TopoService::with_sink(config, ExternalSink::disabled()),
            Err(TopoError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_topology_requires_running() {
        let service = make_service();
        assert!(matches!(service.topology(), Err(TopoError::NotRunning)));
        assert!(matches!(service.broadcast(), Err(TopoError::NotRunning)));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer_in_registry_order() {
        let service = make_service();
        service.start(make_node()).unwrap();

        let mut receivers: Vec<_> = ["A", "B", "C"]
            .iter()
            .map(|name| add_peer(&service, name))
            .collect();

        assert_eq!(service.broadcast().unwrap(), 3);

        for rx in &mut receivers {
            let bytes = rx.try_recv().unwrap();
            let snapshot = WireMessage::parse(bytes).unwrap().decode_snapshot().unwrap();
            assert_eq!(snapshot.pivot(), "vnode://pivot@127.0.0.1:8483");
            assert_eq!(snapshot.peers(), &["A", "B", "C"]);
        }
        service.stop().await;
    }

    #[tokio::test]
    async fn test_relay_excludes_sender_and_drops_duplicates() {
        let service = make_service();
        let mut a = add_peer(&service, "A");
        let mut b = add_peer(&service, "B");
        let mut c = add_peer(&service, "C");

        let wire = remote_message("remote", &["x", "y"]);
        let received = service
            .receive(wire.as_bytes().clone(), &PeerId::from("A"))
            .unwrap();
        match received {
            Received::Relayed { snapshot, fanout } => {
                assert_eq!(fanout, 2);
                assert_eq!(snapshot.pivot(), "remote");
            }
            Received::Duplicate => panic!("first copy must be relayed"),
        }

        // Relayed bytes are the original message, digest included.
        assert_eq!(b.try_recv().unwrap(), wire.as_bytes().clone());
        assert_eq!(c.try_recv().unwrap(), wire.as_bytes().clone());
        assert!(a.try_recv().is_err());

        let again = service
            .receive(wire.as_bytes().clone(), &PeerId::from("B"))
            .unwrap();
        assert_eq!(again, Received::Duplicate);
        assert!(a.try_recv().is_err());
        assert!(c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_own_broadcast_is_a_duplicate_when_it_returns() {
        let service = make_service();
        service.start(make_node()).unwrap();
        let mut a = add_peer(&service, "A");
        let _b = add_peer(&service, "B");

        service.broadcast().unwrap();
        let echoed = a.try_recv().unwrap();
        assert_eq!(
            service.receive(echoed, &PeerId::from("B")).unwrap(),
            Received::Duplicate
        );
        service.stop().await;
    }

    #[test]
    fn test_short_and_malformed_messages_are_errors() {
        let service = make_service();
        let sender = PeerId::from("A");

        let err = service
            .receive(Bytes::from_static(&[0u8; 10]), &sender)
            .unwrap_err();
        assert!(matches!(
            err,
            TopoError::Decode(DecodeError::TooShort { len: 10 })
        ));

        let mut garbage = vec![0xab; 32];
        garbage.extend_from_slice(&[0xff; 10]);
        let err = service.receive(Bytes::from(garbage), &sender).unwrap_err();
        assert!(matches!(err, TopoError::Decode(DecodeError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_full_peer_queue_only_affects_that_peer() {
        let config = TopoConfigBuilder::new().peer_queue_depth(1).build();
        let service = TopoService::with_sink(config, ExternalSink::disabled()).unwrap();
        service.start(make_node()).unwrap();

        let (stuck_tx, _stuck_rx) = mpsc::channel(1);
        stuck_tx.try_send(Bytes::from_static(b"backlog")).unwrap();
        service
            .registry()
            .add(PeerHandle::new(PeerId::from("stuck"), "stuck:1".into(), stuck_tx));
        let mut healthy = add_peer(&service, "healthy");

        assert_eq!(service.broadcast().unwrap(), 1);
        assert!(healthy.try_recv().is_ok());
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcaster_ticks_on_interval() {
        let service = make_service();
        service.start(make_node()).unwrap();
        let mut a = add_peer(&service, "A");

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(a.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(a.try_recv().is_ok());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(a.try_recv().is_ok());

        service.stop().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_rejects_wrong_command_and_unregisters() {
        let service = make_service();
        service.start(make_node()).unwrap();

        let (ours, theirs) = connection_pair(
            (PeerId::from("pivot"), "local".into()),
            (PeerId::from("A"), "10.0.0.1:8483".into()),
            8,
        );
        // The transport keeps its own reference to the session.
        let ours = Arc::new(ours);
        let task = {
            let service = service.clone();
            let conn: Arc<dyn PeerConnection> = ours.clone();
            tokio::spawn(async move { service.handle(conn).await })
        };

        theirs
            .write_message(Message::new(TOPO_CMD_SET, 2, Bytes::new()))
            .await
            .unwrap();
        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(TopoError::UnexpectedCommand { cmd_set: 7, cmd: 2 })
        ));
        assert!(service.registry().is_empty());
        assert!(ours.is_closed());
        assert_eq!(theirs.read_message().await, Err(TransportError::Closed));
        service.stop().await;
    }

    #[tokio::test]
    async fn test_undecodable_payload_closes_shared_connection() {
        let service = make_service();
        service.start(make_node()).unwrap();

        let (ours, theirs) = connection_pair(
            (PeerId::from("pivot"), "local".into()),
            (PeerId::from("A"), "10.0.0.1:8483".into()),
            8,
        );
        let ours = Arc::new(ours);
        let conn: Arc<dyn PeerConnection> = ours.clone();
        let task = {
            let service = service.clone();
            tokio::spawn(async move { service.handle(conn).await })
        };

        let mut garbage = vec![0xab; 32];
        garbage.extend_from_slice(&[0xff; 10]);
        theirs
            .write_message(Message::new(TOPO_CMD_SET, TOPO_CMD, Bytes::from(garbage)))
            .await
            .unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(TopoError::Decode(DecodeError::Malformed(_)))
        ));
        assert!(ours.is_closed());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_handle_requires_running_service() {
        let service = make_service();
        let (ours, theirs) = connection_pair(
            (PeerId::from("pivot"), "local".into()),
            (PeerId::from("A"), "10.0.0.1:8483".into()),
            8,
        );
        let ours = Arc::new(ours);
        assert!(matches!(
            service.handle(ours.clone()).await,
            Err(TopoError::NotRunning)
        ));
        assert!(theirs.is_closed());
    }

    #[tokio::test]
    async fn test_accept_while_stopped_closes_connection() {
        let service = make_service();
        let (ours, theirs) = connection_pair(
            (PeerId::from("pivot"), "local".into()),
            (PeerId::from("A"), "10.0.0.1:8483".into()),
            8,
        );
        let ours = Arc::new(ours);
        service.accept(ours.clone());

        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), theirs.read_message())
                .await
                .unwrap(),
            Err(TransportError::Closed)
        );
        assert!(ours.is_closed());
        assert!(service.registry().is_empty());
    }
}
