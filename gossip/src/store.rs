// Copyright (c) 2024 Botho Foundation

//! Registry of currently connected peers.
//!
//! The `PeerRegistry` is the single source of truth for which peers are
//! reachable. Each entry holds a [`PeerHandle`], the sending side of that
//! peer's bounded outbound queue. Handles are registered when a connection is
//! handed to the service and removed when it closes or misbehaves.

use crate::{error::TransportError, transport::PeerId};
use bytes::Bytes;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;

/// Sending side of one connected peer.
///
/// Sends never block: a full queue drops the message for this peer only.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    remote_addr: String,
    outbound: mpsc::Sender<Bytes>,
}

impl PeerHandle {
    /// Create a handle around a peer's outbound queue.
    pub fn new(id: PeerId, remote_addr: String, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            remote_addr,
            outbound,
        }
    }

    /// The peer's identity.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// The peer's address, for logging.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Queue a wire message for this peer without waiting.
    pub fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.outbound.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Whether both handles refer to the same connection.
    pub fn same_connection(&self, other: &PeerHandle) -> bool {
        self.outbound.same_channel(&other.outbound)
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    handle: PeerHandle,
}

/// Thread-safe registry of connected peers, keyed by identity.
///
/// Iteration works on a copy of the membership taken under a read lock, so
/// callbacks may run while other tasks add or remove peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Entry>>,
    next_seq: AtomicU64,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer, replacing any existing handle with the same identity.
    ///
    /// Returns the replaced handle, if any. A re-registered peer moves to the
    /// end of the discovery order.
    pub fn add(&self, handle: PeerHandle) -> Option<PeerHandle> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = handle.id.clone();
        self.peers
            .write()
            .insert(id, Entry { seq, handle })
            .map(|entry| entry.handle)
    }

    /// Remove a peer. Removing an unknown peer is a no-op.
    pub fn remove(&self, id: &PeerId) -> Option<PeerHandle> {
        self.peers.write().remove(id).map(|entry| entry.handle)
    }

    /// Remove `handle` only if it is still the registered connection for its
    /// identity. Returns whether it was removed.
    ///
    /// A peer that reconnected has a newer handle under the same identity;
    /// the old connection's teardown must not evict it.
    pub fn remove_handle(&self, handle: &PeerHandle) -> bool {
        let mut peers = self.peers.write();
        match peers.get(&handle.id) {
            Some(entry) if entry.handle.same_connection(handle) => {
                peers.remove(&handle.id);
                true
            }
            _ => false,
        }
    }

    /// Identities of all registered peers in discovery order.
    pub fn snapshot(&self) -> Vec<PeerId> {
        self.handles().into_iter().map(|h| h.id).collect()
    }

    /// Handles of all registered peers in discovery order.
    pub fn handles(&self) -> Vec<PeerHandle> {
        let peers = self.peers.read();
        let mut entries: Vec<_> = peers
            .values()
            .map(|entry| (entry.seq, entry.handle.clone()))
            .collect();
        drop(peers);

        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Call `f` for every registered peer.
    pub fn for_each(&self, mut f: impl FnMut(&PeerHandle)) {
        for handle in self.handles() {
            f(&handle);
        }
    }

    /// Call `f` for every registered peer except `excluded`.
    pub fn for_each_except(&self, excluded: &PeerId, mut f: impl FnMut(&PeerHandle)) {
        for handle in self.handles() {
            if &handle.id != excluded {
                f(&handle);
            }
        }
    }

    /// Look up a peer's handle.
    pub fn get(&self, id: &PeerId) -> Option<PeerHandle> {
        self.peers.read().get(id).map(|entry| entry.handle.clone())
    }

    /// Whether a peer is registered.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A shared, reference-counted peer registry.
pub type SharedPeerRegistry = Arc<PeerRegistry>;

/// Create a new shared peer registry.
pub fn new_shared_registry() -> SharedPeerRegistry {
    Arc::new(PeerRegistry::new())
}
