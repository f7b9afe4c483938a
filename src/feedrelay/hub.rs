//! Fan-out of upstream pub/sub channels to local listeners.
//!
//! The hub keeps at most one upstream subscription per channel no matter how
//! many listeners are registered for it. Every subscription is opened on the
//! single shared provider connection, which is created lazily and recreated
//! after it is lost.
//!
//! Per channel the hub tracks:
//!
//! ```text
//!  Absent ──subscribe──▶ Connecting ──upstream ok──▶ Active
//!    ▲                        │                      │  ▲
//!    │                  upstream failed     last     │  │ subscribe
//!    │◀───────────────────────┘             unsubscribe ▼  │
//!    └──────────── idle window elapsed ──────────── Draining
//! ```
//!
//! Listener sets live in a `DashMap` and are only locked for short
//! synchronous mutations; no shard lock is held across an `.await`. Upstream
//! subscribe/unsubscribe calls are serialized by the mutex guarding the
//! shared connection, so a close of channel X can never race a re-open of X.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use smallvec::SmallVec;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::feedrelay::store::{KeyValueStore, PubSubConnection, PubSubProvider};
use crate::feedrelay::types::{Channel, ChannelState, Listener, ListenerId, Snapshot};

struct ChannelEntry {
    listeners: Vec<(ListenerId, Listener)>,
    state: ChannelState,
    last_activity: Instant,
    /// Cancels the task pumping upstream messages into `dispatch`
    pump: Option<CancellationToken>,
    /// Connection epoch the upstream subscription was opened on
    epoch: u64,
    reaper_running: bool,
}

impl ChannelEntry {
    fn new() -> Self {
        Self {
            listeners: Vec::new(),
            state: ChannelState::Absent,
            last_activity: Instant::now(),
            pump: None,
            epoch: 0,
            reaper_running: false,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

#[derive(Default)]
struct UpstreamSlot {
    connection: Option<Arc<dyn PubSubConnection>>,
    epoch: u64,
}

enum ReapOutcome {
    Done,
    Wait(Instant),
}

pub struct TopicHub {
    provider: Arc<dyn PubSubProvider>,
    cache: Arc<dyn KeyValueStore>,
    upstream: Mutex<UpstreamSlot>,
    channels: DashMap<Channel, ChannelEntry>,
    idle_timeout: Duration,
    next_listener_id: AtomicU64,
}

impl TopicHub {
    pub fn new(
        provider: Arc<dyn PubSubProvider>,
        cache: Arc<dyn KeyValueStore>,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            cache,
            upstream: Mutex::new(UpstreamSlot::default()),
            channels: DashMap::new(),
            idle_timeout,
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Registers `listener` for `channel`, opening the upstream subscription
    /// if this is the first interest in the channel.
    ///
    /// An upstream failure does not fail the call: the listener stays
    /// registered, the channel stays `Absent`, and the next `subscribe` on any
    /// channel retries.
    pub async fn subscribe(self: &Arc<Self>, channel: Channel, listener: Listener) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);

        let needs_open = {
            let mut entry = self.channels.entry(channel.clone()).or_insert_with(ChannelEntry::new);
            entry.listeners.push((id, listener));
            entry.touch();
            let needs_open = match entry.state {
                ChannelState::Absent => {
                    entry.state = ChannelState::Connecting;
                    true
                }
                ChannelState::Draining => {
                    entry.state = ChannelState::Active;
                    false
                }
                ChannelState::Connecting | ChannelState::Active => false,
            };
            debug!("Listener {} added to {} ({} listeners)", id, channel, entry.listeners.len());
            needs_open
        };

        if needs_open || self.has_orphans() {
            self.open_upstream(&channel).await;
        }

        Subscription {
            hub: Arc::downgrade(self),
            channel,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Point read of the cached snapshot, independent of subscription state
    pub async fn get_initial(&self, key: &str) -> Result<Option<Snapshot>> {
        self.cache.get(key).await
    }

    pub fn listener_count(&self, channel: &Channel) -> usize {
        self.channels.get(channel).map_or(0, |entry| entry.listeners.len())
    }

    pub fn channel_state(&self, channel: &Channel) -> ChannelState {
        self.channels.get(channel).map_or(ChannelState::Absent, |entry| entry.state)
    }

    pub async fn is_connected(&self) -> bool {
        let slot = self.upstream.lock().await;
        slot.connection.as_ref().map_or(false, |c| c.is_open())
    }

    /// Closes every upstream subscription and forgets all listeners
    pub async fn shutdown(&self) {
        let mut slot = self.upstream.lock().await;
        let channels: Vec<Channel> = self.channels.iter().map(|entry| entry.key().clone()).collect();
        for channel in channels {
            let pump = self.channels.remove(&channel).and_then(|(_, mut entry)| entry.pump.take());
            if let Some(pump) = pump {
                pump.cancel();
                if let Some(connection) = slot.connection.as_ref() {
                    if let Err(e) = connection.unsubscribe(channel.as_str()).await {
                        warn!("Failed to unsubscribe {} during shutdown: {}", channel, e);
                    }
                }
            }
        }
        slot.connection = None;
        info!("Topic hub shut down");
    }

    async fn open_upstream(self: &Arc<Self>, channel: &Channel) {
        let mut slot = self.upstream.lock().await;

        let live = slot.connection.as_ref().filter(|c| c.is_open()).cloned();
        let connection = match live {
            Some(connection) => connection,
            None => match self.provider.connect().await {
                Ok(connection) => {
                    slot.epoch += 1;
                    slot.connection = Some(connection.clone());
                    info!("Connected to pub/sub provider (epoch {})", slot.epoch);
                    connection
                }
                Err(e) => {
                    warn!("Failed to connect to pub/sub provider for {}: {}", channel, e);
                    slot.connection = None;
                    self.mark_absent(channel);
                    return;
                }
            },
        };
        let epoch = slot.epoch;

        self.open_channel(&mut slot, &connection, epoch, channel).await;

        // Channels orphaned by a lost connection or a rejected subscribe
        for orphan in self.claim_orphans() {
            self.open_channel(&mut slot, &connection, epoch, &orphan).await;
        }
    }

    fn has_orphans(&self) -> bool {
        self.channels
            .iter()
            .any(|entry| entry.state == ChannelState::Absent && !entry.listeners.is_empty())
    }

    /// Moves every `Absent` channel that still has listeners to `Connecting`
    fn claim_orphans(&self) -> Vec<Channel> {
        let mut claimed = Vec::new();
        for mut entry in self.channels.iter_mut() {
            if entry.state == ChannelState::Absent && !entry.listeners.is_empty() {
                entry.state = ChannelState::Connecting;
                claimed.push(entry.key().clone());
            }
        }
        if !claimed.is_empty() {
            info!("Reopening {} orphaned channels", claimed.len());
        }
        claimed
    }

    async fn open_channel(
        self: &Arc<Self>,
        slot: &mut UpstreamSlot,
        connection: &Arc<dyn PubSubConnection>,
        epoch: u64,
        channel: &Channel,
    ) {
        // Another subscriber may have opened it while we waited for the slot
        let claimed = self
            .channels
            .get(channel)
            .map_or(false, |entry| entry.state == ChannelState::Connecting && entry.pump.is_none());
        if !claimed {
            return;
        }

        let rx = match connection.subscribe(channel.as_str()).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Upstream subscribe to {} failed: {}", channel, e);
                if !connection.is_open() {
                    slot.connection = None;
                }
                self.mark_absent(channel);
                return;
            }
        };

        let token = CancellationToken::new();
        if let Some(mut entry) = self.channels.get_mut(channel) {
            entry.state = if entry.listeners.is_empty() {
                ChannelState::Draining
            } else {
                ChannelState::Active
            };
            entry.pump = Some(token.clone());
            entry.epoch = epoch;
            entry.touch();
        }
        info!("Opened upstream subscription for {}", channel);

        self.spawn_pump(channel.clone(), epoch, rx, token);
    }

    fn mark_absent(&self, channel: &Channel) {
        if let Some(mut entry) = self.channels.get_mut(channel) {
            if entry.state == ChannelState::Connecting {
                entry.state = ChannelState::Absent;
            }
        }
    }

    fn spawn_pump(
        self: &Arc<Self>,
        channel: Channel,
        epoch: u64,
        mut rx: UnboundedReceiver<Bytes>,
        token: CancellationToken,
    ) {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    message = rx.recv() => match (message, hub.upgrade()) {
                        (Some(payload), Some(hub)) => hub.dispatch(&channel, payload),
                        (None, Some(hub)) => {
                            hub.handle_connection_lost(epoch).await;
                            break;
                        }
                        (_, None) => break,
                    },
                }
            }
            debug!("Pump for {} stopped", channel);
        });
    }

    /// Delivers `payload` to every listener registered at the moment of the
    /// call. A panicking listener is logged and skipped.
    pub(crate) fn dispatch(&self, channel: &Channel, payload: Bytes) {
        let listeners: SmallVec<[Listener; 8]> = match self.channels.get_mut(channel) {
            Some(mut entry) => {
                if !entry.listeners.is_empty() {
                    entry.touch();
                }
                entry.listeners.iter().map(|(_, listener)| listener.clone()).collect()
            }
            None => return,
        };
        debug!("Dispatching {} bytes on {} to {} listeners", payload.len(), channel, listeners.len());

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&payload))).is_err() {
                error!("Listener on {} panicked while handling a message", channel);
            }
        }
    }

    async fn handle_connection_lost(&self, epoch: u64) {
        let mut slot = self.upstream.lock().await;
        if slot.epoch == epoch && slot.connection.is_some() {
            warn!("Lost connection to pub/sub provider (epoch {})", epoch);
            slot.connection = None;
        }

        for mut entry in self.channels.iter_mut() {
            if entry.epoch == epoch && entry.pump.is_some() {
                if let Some(pump) = entry.pump.take() {
                    pump.cancel();
                }
                entry.state = ChannelState::Absent;
            }
        }
    }

    fn remove_listener(self: &Arc<Self>, channel: &Channel, id: ListenerId) {
        let start_reaper = match self.channels.get_mut(channel) {
            Some(mut entry) => {
                entry.listeners.retain(|(listener_id, _)| *listener_id != id);
                entry.touch();
                debug!("Listener {} removed from {} ({} listeners)", id, channel, entry.listeners.len());
                if entry.listeners.is_empty() {
                    if entry.state == ChannelState::Active {
                        entry.state = ChannelState::Draining;
                    }
                    !std::mem::replace(&mut entry.reaper_running, true)
                } else {
                    false
                }
            }
            None => false,
        };

        if start_reaper {
            self.spawn_reaper(channel.clone());
        }
    }

    fn spawn_reaper(self: &Arc<Self>, channel: Channel) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No runtime available to reap {}", channel);
                if let Some(mut entry) = self.channels.get_mut(&channel) {
                    entry.reaper_running = false;
                }
                return;
            }
        };

        let hub = Arc::downgrade(self);
        let first = Instant::now() + self.idle_timeout;
        runtime.spawn(async move {
            let mut deadline = first;
            loop {
                sleep_until(deadline).await;
                let Some(hub) = hub.upgrade() else { return };
                match hub.reap_if_idle(&channel).await {
                    ReapOutcome::Done => return,
                    ReapOutcome::Wait(next) => deadline = next,
                }
            }
        });
    }

    async fn reap_if_idle(&self, channel: &Channel) -> ReapOutcome {
        let slot = self.upstream.lock().await;
        let now = Instant::now();

        let pump = {
            let Some(mut entry) = self.channels.get_mut(channel) else {
                return ReapOutcome::Done;
            };
            if !entry.listeners.is_empty() {
                entry.reaper_running = false;
                return ReapOutcome::Done;
            }
            if entry.state == ChannelState::Connecting {
                return ReapOutcome::Wait(now + self.idle_timeout);
            }
            let idle_until = entry.last_activity + self.idle_timeout;
            if idle_until > now {
                return ReapOutcome::Wait(idle_until);
            }
            entry.state = ChannelState::Absent;
            entry.pump.take()
        };

        let removed = self
            .channels
            .remove_if(channel, |_, entry| entry.listeners.is_empty() && entry.state == ChannelState::Absent)
            .is_some();
        if !removed {
            // A subscriber arrived and will reopen once we release the slot
            if let Some(mut entry) = self.channels.get_mut(channel) {
                entry.reaper_running = false;
            }
        }

        if let Some(pump) = pump {
            pump.cancel();
            if let Some(connection) = slot.connection.as_ref() {
                match connection.unsubscribe(channel.as_str()).await {
                    Ok(()) => info!("Closed idle upstream subscription for {}", channel),
                    Err(e) => warn!("Failed to unsubscribe idle channel {}: {}", channel, e),
                }
            }
        }
        ReapOutcome::Done
    }
}

impl Drop for TopicHub {
    fn drop(&mut self) {
        for entry in self.channels.iter() {
            if let Some(pump) = entry.pump.as_ref() {
                pump.cancel();
            }
        }
    }
}

/// Handle returned by [`TopicHub::subscribe`]. Unsubscribes on drop.
pub struct Subscription {
    hub: Weak<TopicHub>,
    channel: Channel,
    id: ListenerId,
    active: AtomicBool,
}

impl Subscription {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Removes the listener; later calls are no-ops
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_listener(&self.channel, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
