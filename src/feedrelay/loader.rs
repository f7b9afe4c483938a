//! Cache-aside reads.
//!
//! [`CacheAsideLoader::get_or_load`] serves a cached snapshot when it passes
//! the caller's freshness check and otherwise consults the durable store and
//! writes the result back. Reads never publish.
//!
//! Concurrent misses on the same key are not coalesced: each caller queries
//! the source and overwrites the cache, last writer wins.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, FeedError, Result};
use crate::feedrelay::config::TopicConfig;
use crate::feedrelay::store::{DurableStore, KeyValueStore};
use crate::feedrelay::types::Snapshot;

/// Decides whether a cached snapshot is good enough to serve as-is
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FreshnessPolicy {
    /// Any cached value is served
    #[default]
    Any,
    /// Every named field must hold a JSON array of at least `min` entries
    MinEntries { fields: Vec<String>, min: usize },
}

impl FreshnessPolicy {
    pub fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        match self {
            Self::Any => true,
            Self::MinEntries { fields, min } => {
                let value: Value = match serde_json::from_slice(snapshot) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!("Cached snapshot is not JSON, treating as stale: {}", e);
                        return false;
                    }
                };
                fields.iter().all(|field| {
                    value
                        .get(field)
                        .and_then(Value::as_array)
                        .map_or(false, |entries| entries.len() >= *min)
                })
            }
        }
    }
}

pub struct CacheAsideLoader {
    cache: Arc<dyn KeyValueStore>,
}

impl CacheAsideLoader {
    pub fn new(cache: Arc<dyn KeyValueStore>) -> Self {
        Self { cache }
    }

    /// Serve `key` from the cache, or load it from the source and repopulate.
    ///
    /// `load` returns `Ok(None)` when the source has no rows, which surfaces as
    /// `NotFound`. A load failure surfaces as `SourceUnavailable` even when a
    /// stale cached value exists. A failed write-back is logged and the loaded
    /// snapshot is still returned.
    pub async fn get_or_load<F, L, Fut>(
        &self,
        key: &str,
        is_fresh: F,
        load: L,
        ttl: Option<Duration>,
    ) -> Result<Snapshot>
    where
        F: FnOnce(&Snapshot) -> bool,
        L: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Snapshot>>>,
    {
        let cache_error = match self.cache.get(key).await {
            Ok(Some(cached)) => {
                if is_fresh(&cached) {
                    debug!("Cache hit for {}", key);
                    return Ok(cached);
                }
                info!("Cached value for {} failed freshness check, reloading", key);
                None
            }
            Ok(None) => {
                debug!("Cache miss for {}", key);
                None
            }
            Err(e) => {
                warn!("Cache read for {} failed, falling back to source: {}", key, e);
                Some(e)
            }
        };

        let snapshot = match load().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                return Err(FeedError::not_found(format!("No data found for {}", key)));
            }
            Err(e) => {
                let message = match cache_error {
                    Some(cache_error) => format!("cache: {}; source: {}", cache_error, e),
                    None => format!("source: {}", e),
                };
                return Err(FeedError::new(
                    ErrorCode::SourceUnavailable,
                    format!("Failed to load {} ({})", key, message),
                ));
            }
        };

        if let Err(e) = self.cache.set(key, snapshot.clone(), ttl).await {
            warn!("Failed to repopulate cache for {}: {}", key, e);
        } else {
            debug!("Repopulated cache for {} (ttl: {:?})", key, ttl);
        }

        Ok(snapshot)
    }

    /// `get_or_load` using a configured topic's policy, TTL and the durable store
    pub async fn load_topic(&self, topic: &TopicConfig, source: &dyn DurableStore) -> Result<Snapshot> {
        self.get_or_load(
            &topic.key,
            |cached| topic.freshness.is_fresh(cached),
            || source.fetch(&topic.key),
            topic.ttl(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedrelay::store::memory::{MemorySource, MemoryStore};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loader_with_store() -> (CacheAsideLoader, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (CacheAsideLoader::new(store.clone()), store)
    }

    #[tokio::test]
    async fn fresh_cache_hit_never_invokes_loader() {
        let (loader, store) = loader_with_store();
        store.set("k", Bytes::from_static(b"cached"), None).await.unwrap();
        let calls = AtomicUsize::new(0);

        let value = loader
            .get_or_load(
                "k",
                |_| true,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(Bytes::from_static(b"loaded")))
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(value, Bytes::from_static(b"cached"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_cache_entry_is_reloaded_and_overwritten() {
        let (loader, store) = loader_with_store();
        store.set("k", Bytes::from_static(b"stale"), None).await.unwrap();
        let calls = AtomicUsize::new(0);

        let value = loader
            .get_or_load(
                "k",
                |_| false,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(Bytes::from_static(b"fresh")))
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(value, Bytes::from_static(b"fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_is_applied_on_write_back() {
        let (loader, store) = loader_with_store();
        loader
            .get_or_load("k", |_| true, || async { Ok(Some(Bytes::from_static(b"v"))) }, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_source_is_not_found() {
        let (loader, store) = loader_with_store();
        let err = loader
            .get_or_load("k", |_| true, || async { Ok(None) }, None)
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cache_and_source_failure_is_source_unavailable() {
        let (loader, store) = loader_with_store();
        store.set_fail_reads(true);
        let err = loader
            .get_or_load(
                "k",
                |_| true,
                || async { Err(FeedError::source_unavailable("db down")) },
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some(ErrorCode::SourceUnavailable));
        assert!(err.message().contains("cache"));
    }

    #[tokio::test]
    async fn cache_failure_falls_back_to_source() {
        let (loader, store) = loader_with_store();
        store.set_fail_reads(true);
        let value = loader
            .get_or_load("k", |_| true, || async { Ok(Some(Bytes::from_static(b"v"))) }, None)
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn concurrent_misses_both_query_the_source() {
        let (loader, store) = loader_with_store();
        let counter = AtomicUsize::new(0);
        let gate = tokio::sync::Barrier::new(2);
        let (calls, barrier) = (&counter, &gate);
        let load = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            // Hold both loads open so neither sees the other's write-back
            barrier.wait().await;
            Ok(Some(Bytes::from_static(b"v")))
        };

        let (a, b) = tokio::join!(
            loader.get_or_load("k", |_| true, load, None),
            loader.get_or_load("k", |_| true, load, None)
        );
        assert_eq!(a.unwrap(), Bytes::from_static(b"v"));
        assert_eq!(b.unwrap(), Bytes::from_static(b"v"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn load_topic_uses_the_durable_store() {
        let (loader, store) = loader_with_store();
        let source = MemorySource::new();
        source.insert("active_signals_5", r#"[{"symbol":"X"}]"#);
        let topic = TopicConfig::new("signals:5", "active_signals_5").with_backfill();

        let first = loader.load_topic(&topic, &source).await.unwrap();
        let second = loader.load_topic(&topic, &source).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.fetch_calls(), 1);
        assert!(store.get("active_signals_5").await.unwrap().is_some());
    }

    #[test]
    fn min_entries_policy_checks_every_field() {
        let policy = FreshnessPolicy::MinEntries {
            fields: vec!["AD_sensex".into(), "AD_nifty".into()],
            min: 2,
        };
        let enough = Bytes::from(r#"{"AD_sensex":[1,2,3],"AD_nifty":[1,2]}"#);
        let short = Bytes::from(r#"{"AD_sensex":[1,2,3],"AD_nifty":[1]}"#);
        let missing = Bytes::from(r#"{"AD_sensex":[1,2,3]}"#);

        assert!(policy.is_fresh(&enough));
        assert!(!policy.is_fresh(&short));
        assert!(!policy.is_fresh(&missing));
        assert!(!policy.is_fresh(&Bytes::from_static(b"not json")));
        assert!(FreshnessPolicy::Any.is_fresh(&Bytes::from_static(b"not json")));
    }
}
