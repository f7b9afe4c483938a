use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::de::IgnoredAny;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

use crate::error::{ErrorCode, FeedError, Result};
use crate::feedrelay::store::{DurableStore, KeyValueStore, PubSubConnection, PubSubProvider};

struct CacheEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// In-process cache and pub/sub provider
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, CacheEntry>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
    connect_calls: AtomicUsize,
    subscribe_calls: Arc<AtomicUsize>,
    fail_reads: AtomicBool,
    fail_connect: AtomicBool,
    fail_subscribe: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `get` fail until switched off again
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `connect` fail until switched off again
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make upstream subscribes fail while connections stay open
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Simulate the provider dropping every open connection
    pub fn drop_connections(&self) {
        let connections: Vec<_> = self.lock_connections().drain(..).collect();
        info!("Dropping {} pub/sub connections", connections.len());
        for connection in connections {
            connection.close();
        }
    }

    /// Upstream subscriptions currently open for `channel`, across all connections
    pub fn active_subscriptions(&self, channel: &str) -> usize {
        self.lock_connections()
            .iter()
            .filter(|c| c.is_open() && c.channels.contains_key(channel))
            .count()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, Vec<Arc<MemoryConnection>>> {
        self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(FeedError::new(ErrorCode::CacheUnavailable, "cache read failed"));
        }

        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if value.is_none() {
            debug!("Cache entry {} expired", key);
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        let connections: Vec<_> = self.lock_connections().clone();
        let mut delivered = 0;
        for connection in connections {
            if connection.deliver(channel, &payload) {
                delivered += 1;
            }
        }
        debug!("Published {} bytes on {} to {} subscribers", payload.len(), channel, delivered);
        Ok(delivered)
    }
}

#[async_trait]
impl PubSubProvider for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn PubSubConnection>> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(FeedError::connection_lost("provider refused connection"));
        }

        let connection = Arc::new(MemoryConnection {
            channels: DashMap::new(),
            open: AtomicBool::new(true),
            subscribe_calls: self.subscribe_calls.clone(),
            fail_subscribe: self.fail_subscribe.clone(),
        });
        self.lock_connections().push(connection.clone());
        Ok(connection)
    }
}

/// One subscriber connection handed out by [`MemoryStore::connect`]
pub struct MemoryConnection {
    channels: DashMap<String, UnboundedSender<Bytes>>,
    open: AtomicBool,
    subscribe_calls: Arc<AtomicUsize>,
    fail_subscribe: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn deliver(&self, channel: &str, payload: &Bytes) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.channels.get(channel) {
            Some(sender) => sender.send(payload.clone()).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the senders ends every receiver handed out
        self.channels.clear();
    }
}

#[async_trait]
impl PubSubConnection for MemoryConnection {
    async fn subscribe(&self, channel: &str) -> Result<UnboundedReceiver<Bytes>> {
        if !self.is_open() {
            return Err(FeedError::connection_lost("connection is closed"));
        }
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(FeedError::new(
                ErrorCode::InternalServerError,
                format!("provider rejected subscribe to {}", channel),
            ));
        }
        let (tx, rx) = unbounded_channel();
        self.channels.insert(channel.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if !self.is_open() {
            return Err(FeedError::connection_lost("connection is closed"));
        }
        self.channels.remove(channel);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// In-process durable store keyed like the cache
#[derive(Default)]
pub struct MemorySource {
    rows: DashMap<String, Bytes>,
    fetch_calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, snapshot: impl Into<Bytes>) {
        self.rows.insert(key.to_string(), snapshot.into());
    }

    /// Reads `<key>.json` from `dir` for every key that has a file there.
    ///
    /// Files that are not valid JSON are skipped. Returns the number of
    /// snapshots loaded.
    pub fn load_dir(&self, dir: &Path, keys: &[&str]) -> Result<usize> {
        let mut loaded = 0;
        for key in keys {
            let path = dir.join(snapshot_file_name(key));
            let contents = match fs::read(&path) {
                Ok(contents) => contents,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("No snapshot file for {} at {}", key, path.display());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if let Err(e) = serde_json::from_slice::<IgnoredAny>(&contents) {
                warn!("Skipping {}: not JSON ({})", path.display(), e);
                continue;
            }
            self.insert(key, contents);
            loaded += 1;
        }
        info!("Loaded {} snapshots from {}", loaded, dir.display());
        Ok(loaded)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

/// File holding the snapshot for `key` inside a snapshot directory
pub fn snapshot_file_name(key: &str) -> String {
    format!("{}.json", key.replace(':', "_"))
}

#[async_trait]
impl DurableStore for MemorySource {
    async fn fetch(&self, key: &str) -> Result<Option<Bytes>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FeedError::source_unavailable(format!("durable store unreachable for {}", key)));
        }
        Ok(self.rows.get(key).map(|row| row.value().clone()))
    }
}
