// Copyright (c) 2024 Botho Foundation

//! Best-effort forwarding of observed snapshots to an external reporting
//! sink (for example a message-queue producer).
//!
//! Publishing never blocks the caller. Reports go into a bounded queue that a
//! single drainer task feeds to the [`Publisher`]; when the queue is full the
//! newest report is dropped. Publish failures are logged and counted, never
//! returned to the protocol.

use crate::{
    config::SinkConfig,
    error::SinkError,
    messages::TopologySnapshot,
    metrics::{REPORTS, SINK_DROPPED, SINK_FAILURES},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Something reports can be published to.
#[async_trait]
pub trait Publisher: Send + Sync + fmt::Debug {
    /// Publish one payload to `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SinkError>;
}

/// Builds a [`Publisher`] from broker addresses.
pub trait SinkConnector {
    /// Connect to the given brokers. Called once, at service construction.
    fn connect(&self, brokers: &[String]) -> Result<Arc<dyn Publisher>, SinkError>;
}

#[derive(Debug)]
struct Report {
    topic: String,
    payload: Bytes,
}

/// Handle to the reporting sink. Cheap to clone; a disabled sink ignores
/// every report.
#[derive(Debug, Clone, Default)]
pub struct ExternalSink {
    queue: Option<mpsc::Sender<Report>>,
}

impl ExternalSink {
    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { queue: None }
    }

    /// Build the sink described by `config`.
    ///
    /// Blank broker entries are ignored and no broker at all yields a
    /// disabled sink. A connector failure is returned so the service is not
    /// constructed half-initialized. Must be called within a Tokio runtime
    /// when the sink is enabled.
    pub fn connect(config: &SinkConfig, connector: &dyn SinkConnector) -> Result<Self, SinkError> {
        let brokers = config.usable_brokers();
        if brokers.is_empty() {
            debug!("No sink brokers configured; topology reporting disabled");
            return Ok(Self::disabled());
        }

        let publisher = connector.connect(&brokers).map_err(|e| {
            error!(%e, "Failed to create topology sink producer");
            e
        })?;
        info!(brokers = brokers.len(), "Topology sink producer created");

        Ok(Self::spawn(publisher, config.queue_capacity))
    }

    /// Start a drainer task feeding `publisher` from a queue of `capacity`.
    ///
    /// The drainer is detached. It publishes whatever is still queued and
    /// exits once every clone of the returned handle is dropped.
    pub fn spawn(publisher: Arc<dyn Publisher>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(drain(publisher, rx));
        Self { queue: Some(tx) }
    }

    /// Whether reports go anywhere.
    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    /// Queue a payload for publishing. Returns whether it was queued.
    pub fn publish(&self, topic: &str, payload: Bytes) -> bool {
        let Some(queue) = &self.queue else {
            return false;
        };

        let report = Report {
            topic: topic.to_string(),
            payload,
        };
        match queue.try_send(report) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                SINK_DROPPED.inc();
                warn!(topic, "Topology sink queue full, dropping report");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                SINK_DROPPED.inc();
                warn!(topic, "Topology sink drainer gone, dropping report");
                false
            }
        }
    }

    /// Queue the JSON form of a snapshot for publishing.
    pub fn publish_snapshot(&self, topic: &str, snapshot: &TopologySnapshot) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.publish(topic, Bytes::from(snapshot.to_json()))
    }
}

async fn drain(publisher: Arc<dyn Publisher>, mut rx: mpsc::Receiver<Report>) {
    while let Some(report) = rx.recv().await {
        match publisher.publish(&report.topic, report.payload).await {
            Ok(()) => REPORTS.inc(),
            Err(e) => {
                SINK_FAILURES.inc();
                warn!(%e, topic = %report.topic, "Failed to publish topology report");
            }
        }
    }
    debug!("Topology sink drainer stopped");
}
