// Copyright (c) 2024 Botho Foundation

//! Transport capability consumed by the topology protocol.
//!
//! Connection establishment, framing and peer identity belong to the
//! transport layer. This module only names what the protocol needs from it:
//!
//! - [`PeerConnection`]: a bidirectional message channel to one peer
//! - [`NodeTransport`]: the local node's address and protocol registration
//! - [`Protocol`]: the descriptor a protocol registers under its reserved
//!   command-set identifier
//!
//! The [`memory`] submodule provides an in-process implementation.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Opaque identity of a connected peer, as assigned by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap a transport-level identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A framed message multiplexed over a peer connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Protocol the message belongs to
    pub cmd_set: u16,
    /// Command within the protocol
    pub cmd: u16,
    /// Request identifier (unused by fire-and-forget protocols)
    pub id: u64,
    /// Message body
    pub payload: Bytes,
}

impl Message {
    /// Create a message with request id zero.
    pub fn new(cmd_set: u16, cmd: u16, payload: Bytes) -> Self {
        Self {
            cmd_set,
            cmd,
            id: 0,
            payload,
        }
    }
}

/// A bidirectional message channel to one connected peer.
///
/// Reads and writes may be issued concurrently from different tasks.
#[async_trait]
pub trait PeerConnection: Send + Sync + fmt::Debug {
    /// Identity of the remote peer.
    fn peer_id(&self) -> PeerId;

    /// Human-readable remote address, for logging.
    fn remote_addr(&self) -> String;

    /// Wait for the next inbound message.
    async fn read_message(&self) -> Result<Message, TransportError>;

    /// Send a message to the peer.
    async fn write_message(&self, msg: Message) -> Result<(), TransportError>;

    /// Terminate the connection. Pending and later reads and writes on
    /// either end fail with [`TransportError::Closed`]. Closing twice is a
    /// no-op.
    async fn close(&self);
}

/// Handler the transport hands new connections to.
pub trait ProtocolHandler: Send + Sync {
    /// Take ownership of a freshly established connection.
    fn on_connection(&self, conn: Arc<dyn PeerConnection>);
}

/// A protocol registered with the transport under a reserved identifier.
#[derive(Clone)]
pub struct Protocol {
    /// Protocol name
    pub name: &'static str,
    /// Reserved command-set identifier
    pub id: u16,
    /// Receives connections for this protocol
    pub handler: Arc<dyn ProtocolHandler>,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

/// The local node as seen by a protocol.
pub trait NodeTransport: Send + Sync {
    /// This node's externally reachable address.
    fn local_url(&self) -> String;

    /// Register a protocol. Registering an id again replaces the old entry.
    fn register_protocol(&self, protocol: Protocol);
}

/// In-process transport built on Tokio channels.
pub mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::sync::{mpsc, Mutex as AsyncMutex};
    use tokio_util::sync::CancellationToken;

    /// Default per-direction channel depth.
    pub const DEFAULT_CHANNEL_DEPTH: usize = 64;

    /// One end of an in-memory connection.
    #[derive(Debug)]
    pub struct MemoryConnection {
        peer_id: PeerId,
        remote_addr: String,
        tx: mpsc::Sender<Message>,
        rx: AsyncMutex<mpsc::Receiver<Message>>,
        closed: CancellationToken,
    }

    impl MemoryConnection {
        /// Close both ends of the connection.
        pub fn close(&self) {
            self.closed.cancel();
        }

        /// Whether the connection has been closed.
        pub fn is_closed(&self) -> bool {
            self.closed.is_cancelled()
        }
    }

    #[async_trait]
    impl PeerConnection for MemoryConnection {
        fn peer_id(&self) -> PeerId {
            self.peer_id.clone()
        }

        fn remote_addr(&self) -> String {
            self.remote_addr.clone()
        }

        async fn read_message(&self) -> Result<Message, TransportError> {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                _ = self.closed.cancelled() => Err(TransportError::Closed),
                msg = rx.recv() => msg.ok_or(TransportError::Closed),
            }
        }

        async fn write_message(&self, msg: Message) -> Result<(), TransportError> {
            tokio::select! {
                _ = self.closed.cancelled() => Err(TransportError::Closed),
                res = self.tx.send(msg) => res.map_err(|_| TransportError::Closed),
            }
        }

        async fn close(&self) {
            self.closed.cancel();
        }
    }

    /// Create a connected pair.
    ///
    /// The first end talks to `b` (its `peer_id` is `b`), the second to `a`.
    /// Each direction buffers at most `depth` messages; a writer blocks once
    /// the reader falls that far behind.
    pub fn connection_pair(
        a: (PeerId, String),
        b: (PeerId, String),
        depth: usize,
    ) -> (MemoryConnection, MemoryConnection) {
        let (a_tx, b_rx) = mpsc::channel(depth.max(1));
        let (b_tx, a_rx) = mpsc::channel(depth.max(1));
        let closed = CancellationToken::new();

        let a_end = MemoryConnection {
            peer_id: b.0,
            remote_addr: b.1,
            tx: a_tx,
            rx: AsyncMutex::new(a_rx),
            closed: closed.clone(),
        };
        let b_end = MemoryConnection {
            peer_id: a.0,
            remote_addr: a.1,
            tx: b_tx,
            rx: AsyncMutex::new(b_rx),
            closed,
        };
        (a_end, b_end)
    }

    /// An in-process node that dispatches connections to registered protocols.
    pub struct MemoryNode {
        id: PeerId,
        url: String,
        protocols: Mutex<HashMap<u16, Protocol>>,
    }

    impl fmt::Debug for MemoryNode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("MemoryNode")
                .field("id", &self.id)
                .field("url", &self.url)
                .finish()
        }
    }

    impl MemoryNode {
        /// Create a node with the given identity and address.
        pub fn new(id: impl Into<PeerId>, url: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                url: url.into(),
                protocols: Mutex::new(HashMap::new()),
            }
        }

        /// This node's identity.
        pub fn id(&self) -> &PeerId {
            &self.id
        }

        /// Connect to `other`, handing each end to the protocol registered
        /// under `protocol_id` on that side.
        ///
        /// Returns both ends so callers can close the link.
        pub fn connect(
            &self,
            other: &MemoryNode,
            protocol_id: u16,
        ) -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
            let (ours, theirs) = connection_pair(
                (self.id.clone(), self.url.clone()),
                (other.id.clone(), other.url.clone()),
                DEFAULT_CHANNEL_DEPTH,
            );
            let ours = Arc::new(ours);
            let theirs = Arc::new(theirs);

            self.dispatch(protocol_id, ours.clone());
            other.dispatch(protocol_id, theirs.clone());
            (ours, theirs)
        }

        fn dispatch(&self, protocol_id: u16, conn: Arc<MemoryConnection>) {
            let handler = self
                .protocols
                .lock()
                .get(&protocol_id)
                .map(|p| p.handler.clone());
            match handler {
                Some(handler) => handler.on_connection(conn),
                None => {
                    tracing::warn!(protocol_id, node = %self.id, "No protocol registered");
                    conn.close();
                }
            }
        }
    }

    impl NodeTransport for MemoryNode {
        fn local_url(&self) -> String {
            self.url.clone()
        }

        fn register_protocol(&self, protocol: Protocol) {
            self.protocols.lock().insert(protocol.id, protocol);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn ends(depth: usize) -> (MemoryConnection, MemoryConnection) {
            connection_pair(
                (PeerId::from("a"), "10.0.0.1:8483".to_string()),
                (PeerId::from("b"), "10.0.0.2:8483".to_string()),
                depth,
            )
        }

        #[tokio::test]
        async fn test_pair_round_trip() {
            let (a, b) = ends(4);
            assert_eq!(a.peer_id(), PeerId::from("b"));
            assert_eq!(b.peer_id(), PeerId::from("a"));

            let msg = Message::new(7, 1, Bytes::from_static(b"hello"));
            a.write_message(msg.clone()).await.unwrap();
            assert_eq!(b.read_message().await.unwrap(), msg);
        }

        #[tokio::test]
        async fn test_close_unblocks_reader() {
            let (a, b) = ends(4);
            let b = Arc::new(b);
            let reader = {
                let b = b.clone();
                tokio::spawn(async move { b.read_message().await })
            };

            a.close();
            assert_eq!(reader.await.unwrap(), Err(TransportError::Closed));
            assert!(b.is_closed());
            assert_eq!(
                a.write_message(Message::new(7, 1, Bytes::new())).await,
                Err(TransportError::Closed)
            );
        }

        #[tokio::test]
        async fn test_close_through_trait_object() {
            let (a, b) = ends(4);
            let a: Arc<dyn PeerConnection> = Arc::new(a);

            a.close().await;
            a.close().await;
            assert!(b.is_closed());
            assert_eq!(b.read_message().await, Err(TransportError::Closed));
        }

        #[tokio::test]
        async fn test_dropped_end_reports_closed() {
            let (a, b) = ends(4);
            drop(a);
            assert_eq!(b.read_message().await, Err(TransportError::Closed));
        }
    }
}
