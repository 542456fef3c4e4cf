// Copyright (c) 2024 Botho Foundation

//! Topology gossip for Botho nodes.
//!
//! Every node periodically tells its directly connected peers who its peers
//! are. Peers flood what they hear to everyone else, so any node can assemble
//! a picture of the wider network:
//!
//! - **Broadcast**: every few seconds the node sends a [`TopologySnapshot`]
//!   (its own address plus its current peers) to every connected peer
//! - **Flood relay**: novel snapshots are forwarded to every peer except the
//!   one they came from
//! - **Deduplication**: a bounded cuckoo filter of message digests stops
//!   snapshots from circulating forever in a cyclic topology
//! - **Reporting**: every snapshot seen is forwarded, best-effort, to an
//!   external sink
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TopoService                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │ PeerRegistry │  │ DedupFilter  │  │  ExternalSink    │  │
//! │  │ (peer queues)│  │  (digests)   │  │  (reports)       │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘  │
//! └────────────────────────────┬────────────────────────────────┘
//!                              │ NodeTransport / PeerConnection
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use bth_topo_gossip::{ExternalSink, TopoConfig, TopoService};
//!
//! let service = TopoService::with_sink(TopoConfig::default(), ExternalSink::disabled())?;
//!
//! // Registers the "Topo" protocol; the transport hands over connections.
//! service.start(node.clone())?;
//!
//! // ...
//!
//! service.stop().await;
//! ```
//!
//! # Wire format
//!
//! A message is a 32-byte BLAKE2b-256 digest of the payload followed by the
//! protobuf-encoded snapshot. Relays forward the bytes unchanged, so a
//! message keeps its digest across hops.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod config;
pub mod error;
pub mod filter;
pub mod messages;
pub mod metrics;
pub mod service;
pub mod sink;
pub mod store;
pub mod transport;

// Re-export main types for convenience
pub use config::{SinkConfig, TopoConfig, TopoConfigBuilder};
pub use error::{DecodeError, SinkError, TopoError, TopoResult, TransportError};
pub use filter::{DedupFilter, DEFAULT_FILTER_CAPACITY, MAX_FILTER_CAPACITY};
pub use messages::{
    digest, Digest, TopologySnapshot, WireMessage, DIGEST_LEN, PROTOCOL_NAME,
    STATUS_EVENT_TOPIC, TOPO_CMD, TOPO_CMD_SET,
};
pub use metrics::register_topo_metrics;
pub use service::{Received, ServiceState, TopoService};
pub use sink::{ExternalSink, Publisher, SinkConnector};
pub use store::{new_shared_registry, PeerHandle, PeerRegistry, SharedPeerRegistry};
pub use transport::{
    Message, NodeTransport, PeerConnection, PeerId, Protocol, ProtocolHandler,
};
