//! Interfaces to the external collaborators of the relay.
//!
//! The relay never talks to a concrete cache or database directly. It is
//! handed implementations of these traits:
//!
//! - [`KeyValueStore`]: low-latency cache holding one snapshot per key, plus
//!   the publish half of the pub/sub primitive.
//! - [`PubSubProvider`] / [`PubSubConnection`]: the subscribe half. One
//!   connection is shared by every channel the hub listens on.
//! - [`DurableStore`]: the slow system of record, consulted on cache misses.
//!
//! [`memory`] provides in-process implementations of all of them.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;
use crate::error::Result;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Plain overwrite; `ttl = None` means the value never expires
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Returns the number of upstream subscribers the payload reached
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize>;
}

#[async_trait]
pub trait PubSubProvider: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn PubSubConnection>>;
}

/// A live connection to the pub/sub provider.
///
/// The receiver returned by `subscribe` yields payloads in provider order and
/// ends when the connection is lost.
#[async_trait]
pub trait PubSubConnection: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<UnboundedReceiver<Bytes>>;

    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Compute the full snapshot for `key`; `None` when the source has no rows
    async fn fetch(&self, key: &str) -> Result<Option<Bytes>>;
}
