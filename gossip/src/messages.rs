// Copyright (c) 2024 Botho Foundation

//! Topology snapshot and its wire representation.
//!
//! A node periodically describes its directly-connected peers as a
//! [`TopologySnapshot`]. On the wire the snapshot travels as a protobuf
//! payload prefixed by its 32-byte BLAKE2b digest:
//!
//! ```text
//! message := digest (32 bytes) || payload
//! payload := protobuf { pivot: string = 1, peers: repeated string = 2, time: int64 = 3 }
//! digest  := BLAKE2b-256(payload)
//! ```
//!
//! The digest is a content fingerprint used for deduplication only; it does
//! not authenticate the sender.

use crate::error::DecodeError;
use blake2::{digest::consts::U32, Blake2b, Digest as _};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use prost::Message as _;
use serde::{Deserialize, Serialize};

/// Name under which the protocol registers with the transport.
pub const PROTOCOL_NAME: &str = "Topo";

/// Reserved command-set identifier for the topology protocol.
pub const TOPO_CMD_SET: u16 = 7;

/// Command identifier of a topology message within [`TOPO_CMD_SET`].
pub const TOPO_CMD: u16 = 1;

/// Sink topic that observed snapshots are reported to.
pub const STATUS_EVENT_TOPIC: &str = "p2p_status_event";

/// Length of the digest prefix of every wire message.
pub const DIGEST_LEN: usize = 32;

/// Content fingerprint of a topology payload.
pub type Digest = [u8; DIGEST_LEN];

/// Compute the BLAKE2b-256 digest of an encoded payload.
pub fn digest(payload: &[u8]) -> Digest {
    let hash = Blake2b::<U32>::digest(payload);
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hash);
    out
}

/// Protobuf schema of the topology payload.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct TopoProto {
    #[prost(string, tag = 1)]
    pub pivot: String,
    #[prost(string, repeated, tag = 2)]
    pub peers: Vec<String>,
    #[prost(int64, tag = 3)]
    pub time: i64,
}

/// A node's view of its directly-connected peers at one point in time.
///
/// Snapshots are immutable; a fresh one is built for every broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    /// Address of the node that produced the snapshot
    pivot: String,

    /// Peer identities in registry discovery order
    peers: Vec<String>,

    /// When the snapshot was taken
    #[serde(rename = "time")]
    observed_at: DateTime<Utc>,
}

impl TopologySnapshot {
    /// Create a snapshot observed at the given instant.
    pub fn new(pivot: String, peers: Vec<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            pivot,
            peers,
            observed_at,
        }
    }

    /// Create a snapshot observed now.
    pub fn now(pivot: String, peers: Vec<String>) -> Self {
        Self::new(pivot, peers, Utc::now())
    }

    /// Address of the node that produced this snapshot.
    pub fn pivot(&self) -> &str {
        &self.pivot
    }

    /// Peers of the pivot, in discovery order.
    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// When the snapshot was taken.
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Encode to the protobuf payload. Sub-second precision is dropped.
    pub fn encode(&self) -> Vec<u8> {
        TopoProto {
            pivot: self.pivot.clone(),
            peers: self.peers.clone(),
            time: self.observed_at.timestamp(),
        }
        .encode_to_vec()
    }

    /// Decode a protobuf payload.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let proto = TopoProto::decode(buf)?;
        let observed_at = Utc
            .timestamp_opt(proto.time, 0)
            .single()
            .ok_or_else(|| DecodeError::Malformed(format!("timestamp {} out of range", proto.time)))?;

        Ok(Self {
            pivot: proto.pivot,
            peers: proto.peers,
            observed_at,
        })
    }

    /// Build the wire message (digest-prefixed payload) for this snapshot.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage::from_payload(&self.encode())
    }

    /// Human-readable JSON form used for the reporting sink.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A digest-prefixed topology message as carried by the transport.
///
/// Relaying nodes forward the original bytes untouched so downstream nodes
/// see the same digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    bytes: Bytes,
}

impl WireMessage {
    /// Prefix an encoded payload with its digest.
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(DIGEST_LEN + payload.len());
        buf.put_slice(&digest(payload));
        buf.put_slice(payload);
        Self {
            bytes: buf.freeze(),
        }
    }

    /// Accept raw bytes received from a peer.
    ///
    /// Only the envelope is checked here; the payload is not decoded.
    pub fn parse(bytes: Bytes) -> Result<Self, DecodeError> {
        if bytes.len() < DIGEST_LEN {
            return Err(DecodeError::TooShort { len: bytes.len() });
        }
        Ok(Self { bytes })
    }

    /// The digest prefix.
    pub fn digest(&self) -> Digest {
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&self.bytes[..DIGEST_LEN]);
        out
    }

    /// The encoded payload following the digest.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[DIGEST_LEN..]
    }

    /// Decode the payload into a snapshot.
    pub fn decode_snapshot(&self) -> Result<TopologySnapshot, DecodeError> {
        TopologySnapshot::decode(self.payload())
    }

    /// The full message bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consume the message, returning its bytes.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false: a parsed message carries at least a digest.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
