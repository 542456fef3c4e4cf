// Copyright (c) 2024 Botho Foundation

//! Prometheus metrics for the topology gossip protocol.
//!
//! Register them with the node's registry at startup:
//!
//! ```ignore
//! use bth_topo_gossip::metrics::register_topo_metrics;
//!
//! register_topo_metrics(&registry);
//! ```

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};
use tracing::{info, warn};

lazy_static! {
    /// Topology snapshots broadcast by this node.
    pub static ref BROADCASTS: IntCounter = IntCounter::new(
        "botho_topo_broadcasts_total",
        "Total number of topology snapshots broadcast by this node"
    ).expect("Failed to create broadcasts metric");

    /// Well-formed topology messages received from peers.
    pub static ref MESSAGES_RECEIVED: IntCounter = IntCounter::new(
        "botho_topo_messages_received_total",
        "Total number of topology messages received from peers"
    ).expect("Failed to create messages_received metric");

    /// Received messages dropped as already seen.
    pub static ref DUPLICATES: IntCounter = IntCounter::new(
        "botho_topo_duplicates_total",
        "Total number of topology messages dropped as duplicates"
    ).expect("Failed to create duplicates metric");

    /// Per-peer copies queued while relaying received messages.
    pub static ref RELAYED: IntCounter = IntCounter::new(
        "botho_topo_relayed_total",
        "Total number of topology messages relayed to other peers"
    ).expect("Failed to create relayed metric");

    /// Snapshots published to the reporting sink.
    pub static ref REPORTS: IntCounter = IntCounter::new(
        "botho_topo_reports_total",
        "Total number of topology snapshots published to the reporting sink"
    ).expect("Failed to create reports metric");

    /// Reports dropped because the sink queue was full.
    pub static ref SINK_DROPPED: IntCounter = IntCounter::new(
        "botho_topo_sink_dropped_total",
        "Total number of reports dropped because the sink queue was full"
    ).expect("Failed to create sink_dropped metric");

    /// Reports the sink failed to accept.
    pub static ref SINK_FAILURES: IntCounter = IntCounter::new(
        "botho_topo_sink_failures_total",
        "Total number of reports the sink failed to publish"
    ).expect("Failed to create sink_failures metric");

    /// Outbound messages dropped because a peer queue was full.
    pub static ref PEER_QUEUE_DROPPED: IntCounter = IntCounter::new(
        "botho_topo_peer_queue_dropped_total",
        "Total number of outbound messages dropped because a peer queue was full"
    ).expect("Failed to create peer_queue_dropped metric");

    /// Connections terminated for protocol violations.
    pub static ref PROTOCOL_ERRORS: IntCounter = IntCounter::new(
        "botho_topo_protocol_errors_total",
        "Total number of peer connections terminated for protocol violations"
    ).expect("Failed to create protocol_errors metric");

    /// Currently registered peers.
    pub static ref PEERS: IntGauge = IntGauge::new(
        "botho_topo_peers",
        "Number of peers currently registered with the topology service"
    ).expect("Failed to create peers metric");
}

/// Register all topology metrics with a Prometheus registry.
///
/// Metrics already present in the registry are skipped with a warning.
pub fn register_topo_metrics(registry: &Registry) {
    let collectors: [Box<dyn prometheus::core::Collector>; 10] = [
        Box::new(BROADCASTS.clone()),
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(DUPLICATES.clone()),
        Box::new(RELAYED.clone()),
        Box::new(REPORTS.clone()),
        Box::new(SINK_DROPPED.clone()),
        Box::new(SINK_FAILURES.clone()),
        Box::new(PEER_QUEUE_DROPPED.clone()),
        Box::new(PROTOCOL_ERRORS.clone()),
        Box::new(PEERS.clone()),
    ];

    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            warn!(?e, "Failed to register topology metric");
        }
    }

    info!("Topology metrics registered with Prometheus");
}
