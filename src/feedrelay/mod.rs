pub mod config;
pub mod hub;
pub mod loader;
pub mod net;
pub mod publisher;
pub mod session;
pub mod store;
pub mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{error, info, warn};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{ErrorCode, FeedError, Result};
use config::{RelayConfig, TopicConfig};
use hub::TopicHub;
use loader::CacheAsideLoader;
use net::server::run_stream_server;
use publisher::Publisher;
use session::{EventSession, SessionEvent};
use store::memory::{MemorySource, MemoryStore};
use store::{DurableStore, KeyValueStore, PubSubProvider};
use types::Snapshot;

/// Result of a non-streaming snapshot fetch, shaped like an HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotResponse {
    pub status: u16,
    pub body: Bytes,
}

impl SnapshotResponse {
    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: Bytes::from(json!({ "error": message }).to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Read path of the relay: topic registry, cache-aside loads, fan-out hub
pub struct FeedRelay {
    hub: Arc<TopicHub>,
    cache: Arc<dyn KeyValueStore>,
    loader: CacheAsideLoader,
    source: Option<Arc<dyn DurableStore>>,
    topics: Vec<TopicConfig>,
    heartbeat_interval: Duration,
    max_request_bytes: usize,
}

impl FeedRelay {
    pub fn new(
        config: &RelayConfig,
        cache: Arc<dyn KeyValueStore>,
        provider: Arc<dyn PubSubProvider>,
        source: Option<Arc<dyn DurableStore>>,
    ) -> Self {
        Self {
            hub: TopicHub::new(provider, cache.clone(), config.idle_timeout()),
            loader: CacheAsideLoader::new(cache.clone()),
            cache,
            source,
            topics: config.topics.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            max_request_bytes: config.max_request_bytes,
        }
    }

    pub fn hub(&self) -> &Arc<TopicHub> {
        &self.hub
    }

    pub fn loader(&self) -> &CacheAsideLoader {
        &self.loader
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn max_request_bytes(&self) -> usize {
        self.max_request_bytes
    }

    pub fn topics(&self) -> &[TopicConfig] {
        &self.topics
    }

    pub fn topic(&self, name: &str) -> Result<&TopicConfig> {
        self.topics.iter().find(|topic| topic.name == name).ok_or_else(|| {
            let known: Vec<&str> = self.topics.iter().map(|topic| topic.name.as_str()).collect();
            FeedError::new(
                ErrorCode::UnknownTopic,
                format!("Invalid topic {}. Supported topics: {}", name, known.join(", ")),
            )
        })
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.cache.clone(), self.source.clone(), self.topics.clone())
    }

    /// Current snapshot of `topic`; `None` when there is nothing to show yet.
    ///
    /// Backfilled topics go through the cache-aside loader, the rest are a
    /// plain cache read.
    pub async fn initial_snapshot(&self, topic: &TopicConfig) -> Result<Option<Snapshot>> {
        match (&self.source, topic.backfill) {
            (Some(source), true) => match self.loader.load_topic(topic, source.as_ref()).await {
                Ok(snapshot) => Ok(Some(snapshot)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            },
            _ => self.hub.get_initial(&topic.key).await.map_err(|e| {
                FeedError::source_unavailable(format!("Failed to read {}: {}", topic.key, e))
            }),
        }
    }

    /// Open a live session on the named topics; repeated names are watched once
    pub async fn open_session(&self, names: &[&str]) -> Result<(EventSession, UnboundedReceiver<SessionEvent>)> {
        let topics = names
            .iter()
            .map(|name| self.topic(name).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(EventSession::open(self, &topics).await)
    }

    /// Single request/response fallback for viewers without a live stream
    pub async fn fetch(&self, name: &str) -> SnapshotResponse {
        let topic = match self.topic(name) {
            Ok(topic) => topic,
            Err(e) => return SnapshotResponse::error(e.http_status(), &e.message()),
        };

        match self.initial_snapshot(topic).await {
            Ok(Some(body)) => SnapshotResponse { status: 200, body },
            Ok(None) => SnapshotResponse::error(404, &format!("No data found for {}", topic.name)),
            Err(e) => {
                error!("Fetch of {} failed: {}", topic.name, e);
                SnapshotResponse::error(e.http_status(), "Internal Server Error")
            }
        }
    }
}

/// Starts the relay with in-process backends and serves viewers on `config.addr`
/// until interrupted
pub async fn init(config: RelayConfig) -> std::io::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(MemorySource::new());

    if config.topics.is_empty() {
        warn!("No topics configured, every request will be rejected");
    }
    if let Some(dir) = config.snapshot_dir.as_deref() {
        let keys: Vec<&str> = config
            .topics
            .iter()
            .filter(|topic| topic.backfill)
            .map(|topic| topic.key.as_str())
            .collect();
        source
            .load_dir(Path::new(dir), &keys)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    }

    let durable: Arc<dyn DurableStore> = source;
    let relay = Arc::new(FeedRelay::new(&config, store.clone(), store, Some(durable)));
    info!("Relay {} serving {} topics", config.id, relay.topics().len());

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Interrupted, shutting down");
    };
    run_stream_server(&config.addr, relay, interrupted).await
}
