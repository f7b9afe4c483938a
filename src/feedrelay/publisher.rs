use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{debug, error, info};
use serde::Serialize;

use crate::error::{FeedError, Result};
use crate::feedrelay::config::TopicConfig;
use crate::feedrelay::store::{DurableStore, KeyValueStore};
use crate::feedrelay::types::Channel;

/// Write side of the relay: a cache write followed by a verbatim publish
/// on the key's channel, so live sessions never go stale.
pub struct Publisher {
    cache: Arc<dyn KeyValueStore>,
    source: Option<Arc<dyn DurableStore>>,
    topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub message: String,
    pub results: BTreeMap<String, bool>,
    pub refreshed_at_millis: u64,
}

impl RefreshReport {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|ok| **ok).count()
    }
}

impl Publisher {
    pub fn new(
        cache: Arc<dyn KeyValueStore>,
        source: Option<Arc<dyn DurableStore>>,
        topics: Vec<TopicConfig>,
    ) -> Self {
        Self { cache, source, topics }
    }

    /// Overwrite `key` and announce the new payload on `chan:<key>`
    pub async fn publish_snapshot(&self, key: &str, payload: Bytes, ttl: Option<Duration>) -> Result<usize> {
        self.cache.set(key, payload.clone(), ttl).await?;
        let channel = Channel::for_key(key);
        let receivers = self.cache.publish(channel.as_str(), payload).await?;
        debug!("Published refresh of {} to {} subscribers", key, receivers);
        Ok(receivers)
    }

    /// Recompute one topic from the durable store and publish it
    pub async fn refresh_topic(&self, topic: &TopicConfig) -> Result<usize> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| FeedError::source_unavailable("no durable store configured"))?;
        let snapshot = source
            .fetch(&topic.key)
            .await?
            .ok_or_else(|| FeedError::not_found(format!("No data found for {}", topic.name)))?;
        self.publish_snapshot(&topic.key, snapshot, topic.ttl()).await
    }

    /// Refresh every backfilled topic, continuing past individual failures
    pub async fn refresh_all(&self) -> RefreshReport {
        let mut results = BTreeMap::new();
        for topic in self.topics.iter().filter(|topic| topic.backfill) {
            let ok = match self.refresh_topic(topic).await {
                Ok(_) => true,
                Err(e) => {
                    error!("Error refreshing {}: {}", topic.name, e);
                    false
                }
            };
            results.insert(topic.name.clone(), ok);
        }

        let succeeded = results.values().filter(|ok| **ok).count();
        let message = format!("Refreshed {}/{} data sources", succeeded, results.len());
        info!("{}", message);
        RefreshReport {
            message,
            results,
            refreshed_at_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedrelay::store::memory::{MemorySource, MemoryStore};
    use crate::feedrelay::store::PubSubProvider;

    #[tokio::test]
    async fn publish_writes_cache_then_notifies() {
        let store = Arc::new(MemoryStore::new());
        let connection = store.connect().await.unwrap();
        let mut rx = connection.subscribe("chan:vwap_events").await.unwrap();
        let publisher = Publisher::new(store.clone(), None, Vec::new());

        let reached = publisher
            .publish_snapshot("vwap_events", Bytes::from_static(b"[1]"), None)
            .await
            .unwrap();

        assert_eq!(reached, 1);
        assert_eq!(store.get("vwap_events").await.unwrap(), Some(Bytes::from_static(b"[1]")));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"[1]"));
    }

    #[tokio::test]
    async fn refresh_all_reports_each_topic() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(MemorySource::new());
        source.insert("breakout_events", "[]");
        let topics = vec![
            TopicConfig::new("breakouts", "breakout_events").with_backfill(),
            TopicConfig::new("volume", "volume_events").with_backfill(),
            TopicConfig::new("movers:sensex", "stock_movers:sensex"),
        ];
        let durable: Arc<dyn DurableStore> = source.clone();
        let publisher = Publisher::new(store.clone(), Some(durable), topics);

        let report = publisher.refresh_all().await;
        assert_eq!(report.message, "Refreshed 1/2 data sources");
        assert_eq!(report.results.get("breakouts"), Some(&true));
        assert_eq!(report.results.get("volume"), Some(&false));
        assert!(!report.results.contains_key("movers:sensex"));
        assert_eq!(report.succeeded(), 1);
    }

    #[tokio::test]
    async fn refresh_without_source_is_source_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(store, None, Vec::new());
        let err = publisher
            .refresh_topic(&TopicConfig::new("t", "k"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::SourceUnavailable));
    }
}
