#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use feedrelay::feedrelay::config::{RelayConfig, TopicConfig};
use feedrelay::feedrelay::loader::FreshnessPolicy;
use feedrelay::feedrelay::session::SessionEvent;
use feedrelay::feedrelay::store::memory::{MemorySource, MemoryStore};
use feedrelay::feedrelay::store::DurableStore;
use feedrelay::feedrelay::FeedRelay;
use tokio::sync::mpsc::UnboundedReceiver;

pub const IDLE: Duration = Duration::from_secs(60);
pub const HEARTBEAT: Duration = Duration::from_secs(15);

pub struct Harness {
    pub relay: Arc<FeedRelay>,
    pub store: Arc<MemoryStore>,
    pub source: Arc<MemorySource>,
}

pub fn config() -> RelayConfig {
    let mut config = RelayConfig::new("test-relay", "127.0.0.1:0");
    config.idle_timeout_secs = IDLE.as_secs();
    config.heartbeat_interval_secs = HEARTBEAT.as_secs();
    config.topics = vec![
        TopicConfig::new("movers:sensex", "stock_movers:sensex"),
        TopicConfig::new("signals:5", "active_signals_5")
            .with_ttl(Duration::from_secs(3600))
            .with_backfill(),
        TopicConfig::new("advance_decline", "advance_decline:latest")
            .with_backfill()
            .with_freshness(FreshnessPolicy::MinEntries {
                fields: vec!["AD_sensex".into()],
                min: 3,
            }),
    ];
    config
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(MemorySource::new());
    let durable: Arc<dyn DurableStore> = source.clone();
    let relay = Arc::new(FeedRelay::new(&config(), store.clone(), store.clone(), Some(durable)));
    Harness { relay, store, source }
}

/// Lets spawned pump and heartbeat tasks run
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Next non-heartbeat event
pub async fn next_data_event(rx: &mut UnboundedReceiver<SessionEvent>) -> Option<SessionEvent> {
    loop {
        match rx.recv().await {
            Some(SessionEvent::Ping { .. }) => continue,
            other => return other,
        }
    }
}

/// Drains whatever is queued without waiting, skipping heartbeats
pub fn drain_data_events(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if !matches!(event, SessionEvent::Ping { .. }) {
            events.push(event);
        }
    }
    events
}
