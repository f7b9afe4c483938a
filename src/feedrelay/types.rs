use std::fmt;
use std::sync::Arc;
use bytes::Bytes;

/// Topic = name of one logical live feed, e.g. `movers:sensex`
pub type Topic = String;

/// Snapshot = full current payload of a topic, stored verbatim
pub type Snapshot = Bytes;

/// Identity of one registered listener inside the hub
pub type ListenerId = u64;

/// Callback invoked with the raw payload of every message on a channel
pub type Listener = Arc<dyn Fn(&Bytes) + Send + Sync>;

/// Pub/sub channel carrying change notifications for one cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(String);

impl Channel {
    pub const PREFIX: &'static str = "chan:";

    /// Channel on which writers announce a refresh of `key`
    pub fn for_key(key: &str) -> Self {
        Self(format!("{}{}", Self::PREFIX, key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cache key this channel announces, if it follows the naming scheme
    pub fn key(&self) -> Option<&str> {
        self.0.strip_prefix(Self::PREFIX)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Upstream subscription state of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No upstream subscription
    Absent,
    /// Upstream subscribe issued, not yet confirmed
    Connecting,
    /// Upstream subscription open with at least one listener
    Active,
    /// Upstream subscription open with zero listeners, waiting out the idle window
    Draining,
}
