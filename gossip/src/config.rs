// Copyright (c) 2024 Botho Foundation

//! Configuration for the topology gossip service.

use crate::{
    error::{TopoError, TopoResult},
    filter::{DEFAULT_FILTER_CAPACITY, MAX_FILTER_CAPACITY},
    messages::STATUS_EVENT_TOPIC,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Configuration of the external reporting sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Broker addresses of the reporting sink. Blank entries are ignored;
    /// with no usable address the sink is disabled.
    pub brokers: Vec<String>,

    /// Topic observed snapshots are published to
    pub topic: String,

    /// Maximum number of reports waiting to be published
    pub queue_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            topic: STATUS_EVENT_TOPIC.to_string(),
            queue_capacity: 256,
        }
    }
}

impl SinkConfig {
    /// Broker addresses with blank entries removed.
    pub fn usable_brokers(&self) -> Vec<String> {
        self.brokers
            .iter()
            .map(|b| b.trim())
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Whether any usable broker is configured.
    pub fn is_enabled(&self) -> bool {
        !self.usable_brokers().is_empty()
    }
}

/// Configuration for the topology gossip service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopoConfig {
    /// How often to broadcast our topology snapshot (seconds)
    pub broadcast_interval_secs: u64,

    /// Number of recent message digests the deduplication filter is sized
    /// for, at most `MAX_FILTER_CAPACITY`. It must exceed the number of
    /// distinct snapshots the overlay produces while one crosses it, or old
    /// snapshots start circulating again.
    pub filter_capacity: usize,

    /// Outbound messages buffered per peer before new ones are dropped
    pub peer_queue_depth: usize,

    /// How long `stop()` waits for peer tasks to finish (milliseconds)
    pub shutdown_grace_ms: u64,

    /// Reporting sink configuration
    pub sink: SinkConfig,
}

impl Default for TopoConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_secs: 5,
            filter_capacity: DEFAULT_FILTER_CAPACITY,
            peer_queue_depth: 64,
            shutdown_grace_ms: 2_000,
            sink: SinkConfig::default(),
        }
    }
}

impl TopoConfig {
    /// Load a config from a TOML file.
    pub fn load(path: &Path) -> TopoResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            TopoError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate a config from TOML text.
    pub fn from_toml_str(contents: &str) -> TopoResult<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| TopoError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> TopoResult<()> {
        if self.broadcast_interval_secs == 0 {
            return Err(TopoError::Config(
                "broadcast_interval_secs must be positive".to_string(),
            ));
        }
        if self.filter_capacity == 0 {
            return Err(TopoError::Config(
                "filter_capacity must be positive".to_string(),
            ));
        }
        if self.filter_capacity > MAX_FILTER_CAPACITY {
            return Err(TopoError::Config(format!(
                "filter_capacity must not exceed {MAX_FILTER_CAPACITY}"
            )));
        }
        if self.peer_queue_depth == 0 {
            return Err(TopoError::Config(
                "peer_queue_depth must be positive".to_string(),
            ));
        }
        if self.sink.is_enabled() && self.sink.queue_capacity == 0 {
            return Err(TopoError::Config(
                "sink.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the broadcast interval as a Duration.
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    /// Get the shutdown grace period as a Duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Builder for TopoConfig.
#[derive(Debug, Default)]
pub struct TopoConfigBuilder {
    config: TopoConfig,
}

impl TopoConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broadcast interval in seconds.
    pub fn broadcast_interval_secs(mut self, secs: u64) -> Self {
        self.config.broadcast_interval_secs = secs;
        self
    }

    /// Set the deduplication filter capacity.
    pub fn filter_capacity(mut self, capacity: usize) -> Self {
        self.config.filter_capacity = capacity;
        self
    }

    /// Set the per-peer outbound queue depth.
    pub fn peer_queue_depth(mut self, depth: usize) -> Self {
        self.config.peer_queue_depth = depth;
        self
    }

    /// Set the shutdown grace period in milliseconds.
    pub fn shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.config.shutdown_grace_ms = ms;
        self
    }

    /// Add a sink broker address.
    pub fn add_sink_broker(mut self, broker: impl Into<String>) -> Self {
        self.config.sink.brokers.push(broker.into());
        self
    }

    /// Set the sink topic.
    pub fn sink_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.sink.topic = topic.into();
        self
    }

    /// Set the sink queue capacity.
    pub fn sink_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.sink.queue_capacity = capacity;
        self
    }

    /// Build the config.
    pub fn build(self) -> TopoConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TopoConfig::default();
        assert_eq!(config.broadcast_interval(), Duration::from_secs(5));
        assert_eq!(config.filter_capacity, 1000);
        assert_eq!(config.sink.topic, "p2p_status_event");
        assert!(!config.sink.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = TopoConfigBuilder::new()
            .broadcast_interval_secs(10)
            .filter_capacity(4096)
            .peer_queue_depth(8)
            .add_sink_broker("kafka-1:9092")
            .sink_topic("topology")
            .build();

        assert_eq!(config.broadcast_interval_secs, 10);
        assert_eq!(config.filter_capacity, 4096);
        assert_eq!(config.peer_queue_depth, 8);
        assert_eq!(config.sink.topic, "topology");
        assert!(config.sink.is_enabled());
    }

    #[test]
    fn test_blank_brokers_are_ignored() {
        let sink = SinkConfig {
            brokers: vec!["".into(), "  ".into(), "kafka-1:9092".into(), "".into()],
            ..Default::default()
        };
        assert_eq!(sink.usable_brokers(), vec!["kafka-1:9092".to_string()]);

        let blank = SinkConfig {
            brokers: vec!["".into(), " ".into()],
            ..Default::default()
        };
        assert!(!blank.is_enabled());
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let config = TopoConfigBuilder::new().broadcast_interval_secs(0).build();
        assert!(matches!(config.validate(), Err(TopoError::Config(_))));

        let config = TopoConfigBuilder::new().filter_capacity(0).build();
        assert!(matches!(config.validate(), Err(TopoError::Config(_))));

        let config = TopoConfigBuilder::new()
            .filter_capacity(usize::MAX / 2)
            .build();
        assert!(matches!(config.validate(), Err(TopoError::Config(_))));

        let config = TopoConfigBuilder::new()
            .filter_capacity(MAX_FILTER_CAPACITY)
            .build();
        assert!(config.validate().is_ok());

        let config = TopoConfigBuilder::new().peer_queue_depth(0).build();
        assert!(matches!(config.validate(), Err(TopoError::Config(_))));

        let config = TopoConfigBuilder::new()
            .add_sink_broker("kafka-1:9092")
            .sink_queue_capacity(0)
            .build();
        assert!(matches!(config.validate(), Err(TopoError::Config(_))));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = TopoConfig::from_toml_str(
            r#"
            broadcast_interval_secs = 30

            [sink]
            brokers = ["kafka-1:9092", ""]
            "#,
        )
        .unwrap();

        assert_eq!(config.broadcast_interval_secs, 30);
        assert_eq!(config.filter_capacity, 1000);
        assert_eq!(config.sink.topic, "p2p_status_event");
        assert_eq!(config.sink.usable_brokers().len(), 1);
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(matches!(
            TopoConfig::from_toml_str("broadcast_interval_secs = \"soon\""),
            Err(TopoError::Config(_))
        ));
        assert!(matches!(
            TopoConfig::from_toml_str("broadcast_interval_secs = 0"),
            Err(TopoError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "filter_capacity = 2048").unwrap();

        let config = TopoConfig::load(file.path()).unwrap();
        assert_eq!(config.filter_capacity, 2048);

        let missing = TopoConfig::load(Path::new("/nonexistent/topo.toml"));
        assert!(matches!(missing, Err(TopoError::Config(_))));
    }
}
