use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use crate::error::{FeedError, ErrorCode};
use crate::feedrelay::loader::FreshnessPolicy;
use crate::feedrelay::types::Channel;

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_max_request_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub id: String,
    pub addr: String,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Longest request line a connection may send, newline excluded
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    /// Directory of `<key>.json` files backing the durable store
    #[serde(default)]
    pub snapshot_dir: Option<String>,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

/// One statically configured live feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    /// Cache key holding the snapshot
    pub key: String,
    /// Expiry applied when a freshly loaded snapshot is written back
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub freshness: FreshnessPolicy,
    /// Whether a cache miss may fall back to the durable store
    #[serde(default)]
    pub backfill: bool,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            ttl_secs: None,
            freshness: FreshnessPolicy::Any,
            backfill: false,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_freshness(mut self, freshness: FreshnessPolicy) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_backfill(mut self) -> Self {
        self.backfill = true;
        self
    }

    pub fn channel(&self) -> Channel {
        Channel::for_key(&self.key)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

impl RelayConfig {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            idle_timeout_secs: default_idle_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_request_bytes: default_max_request_bytes(),
            snapshot_dir: None,
            topics: Vec::new(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, FeedError> {
        let content = fs::read_to_string(path)
            .map_err(|e| FeedError::new(ErrorCode::ConfigInvalid, format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, FeedError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| FeedError::new(ErrorCode::ConfigInvalid, format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.idle_timeout_secs == 0 {
            return Err(FeedError::new(ErrorCode::ConfigInvalid, "idle_timeout_secs must be positive"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(FeedError::new(ErrorCode::ConfigInvalid, "heartbeat_interval_secs must be positive"));
        }
        if self.max_request_bytes == 0 {
            return Err(FeedError::new(ErrorCode::ConfigInvalid, "max_request_bytes must be positive"));
        }

        let mut seen = HashSet::new();
        for topic in &self.topics {
            if topic.key.is_empty() {
                return Err(FeedError::new(
                    ErrorCode::ConfigInvalid,
                    format!("Topic {} has an empty cache key", topic.name),
                ));
            }
            if !seen.insert(topic.name.as_str()) {
                return Err(FeedError::new(
                    ErrorCode::ConfigInvalid,
                    format!("Topic {} is configured twice", topic.name),
                ));
            }
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        id = "relay-1"
        addr = "127.0.0.1:7070"
        heartbeat_interval_secs = 15

        [[topics]]
        name = "movers:sensex"
        key = "stock_movers:sensex"

        [[topics]]
        name = "signals:5"
        key = "active_signals_5"
        ttl_secs = 3600
        backfill = true

        [[topics]]
        name = "advance_decline"
        key = "advance_decline:latest"
        backfill = true
        freshness = { kind = "min_entries", fields = ["AD_sensex", "AD_nifty"], min = 100 }
    "#;

    #[test]
    fn parses_topics_and_defaults() {
        let config = RelayConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.id, "relay-1");
        assert_eq!(config.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.max_request_bytes, 64 * 1024);
        assert_eq!(config.snapshot_dir, None);
        assert_eq!(config.topics.len(), 3);

        let movers = &config.topics[0];
        assert_eq!(movers.channel().as_str(), "chan:stock_movers:sensex");
        assert_eq!(movers.ttl(), None);
        assert!(!movers.backfill);
        assert_eq!(movers.freshness, FreshnessPolicy::Any);

        assert_eq!(config.topics[1].ttl(), Some(Duration::from_secs(3600)));
        assert_eq!(
            config.topics[2].freshness,
            FreshnessPolicy::MinEntries {
                fields: vec!["AD_sensex".to_string(), "AD_nifty".to_string()],
                min: 100,
            }
        );
    }

    #[test]
    fn rejects_duplicate_topics() {
        let mut config = RelayConfig::new("relay", "127.0.0.1:0");
        config.topics.push(TopicConfig::new("a", "key_a"));
        config.topics.push(TopicConfig::new("a", "key_b"));
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConfigInvalid));
    }

    #[test]
    fn rejects_zero_intervals() {
        let mut config = RelayConfig::new("relay", "127.0.0.1:0");
        config.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::new("relay", "127.0.0.1:0");
        config.max_request_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_config_invalid() {
        let err = RelayConfig::from_toml_str("id = ").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConfigInvalid));
    }
}
