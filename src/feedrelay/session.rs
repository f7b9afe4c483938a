//! Per-viewer event sessions.
//!
//! A session registers one listener per watched topic on the hub, seeds each
//! topic with its current snapshot, and forwards every well-formed update to
//! the viewer alongside a periodic heartbeat. Updates that arrive while the
//! session is still seeding are held back and delivered after the last
//! `init`/`empty` event, so a refresh landing between the snapshot read and
//! the subscription is not lost. Termination happens exactly
//! once, whichever of disconnect, transport failure or fetch error gets there
//! first; afterwards every emit is a no-op.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{debug, error, info, warn};
use serde::de::IgnoredAny;
use serde_json::json;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::FeedError;
use crate::feedrelay::config::TopicConfig;
use crate::feedrelay::hub::Subscription;
use crate::feedrelay::types::{Listener, Snapshot, Topic};
use crate::feedrelay::FeedRelay;

/// One frame of the viewer-facing event stream
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Cached snapshot at session start
    Init { topic: Topic, data: Snapshot },
    /// No snapshot exists yet for the topic
    Empty { topic: Topic, message: String },
    /// Snapshot published after the session started; replaces the previous one
    Update { topic: Topic, data: Snapshot },
    Ping { at_millis: u64 },
    /// Unrecoverable error; the stream ends after this frame
    Error { message: String, retryable: bool },
}

impl SessionEvent {
    pub fn error(error: &FeedError) -> Self {
        Self::Error {
            message: error.message(),
            retryable: error.code().map_or(false, |code| code.is_retryable()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Empty { .. } => "empty",
            Self::Update { .. } => "update",
            Self::Ping { .. } => "ping",
            Self::Error { .. } => "error",
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Init { topic, .. } | Self::Empty { topic, .. } | Self::Update { topic, .. } => Some(topic.as_str()),
            Self::Ping { .. } | Self::Error { .. } => None,
        }
    }

    /// Payload carried in the `data:` field
    pub fn data(&self) -> Bytes {
        match self {
            Self::Init { data, .. } | Self::Update { data, .. } => data.clone(),
            Self::Empty { message, .. } => Bytes::from(json!({ "message": message }).to_string()),
            Self::Ping { at_millis } => Bytes::from(at_millis.to_string()),
            Self::Error { message, retryable } => {
                Bytes::from(json!({ "error": message, "retryable": retryable }).to_string())
            }
        }
    }

    /// Encode as a text/event-stream frame
    pub fn to_frame(&self) -> String {
        let data = self.data();
        let text = String::from_utf8_lossy(&data);
        let mut frame = format!("event: {}\n", self.name());
        // Every line of a multi-line payload needs its own data field
        for line in text.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line.trim_end_matches('\r'));
            frame.push('\n');
        }
        frame.push('\n');
        frame
    }
}

/// How a session came to an end
#[derive(Debug, Clone, PartialEq)]
enum Termination {
    Disconnected,
    Failed(SessionEvent),
}

struct SessionInner {
    id: Uuid,
    tx: Mutex<Option<UnboundedSender<SessionEvent>>>,
    /// Updates held back until seeding finishes; `None` once it has
    held: Mutex<Option<Vec<SessionEvent>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SessionInner {
    /// Returns false once the session is closed or the viewer is gone
    fn emit(&self, event: SessionEvent) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let sent = {
            let tx = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match tx.as_ref() {
                Some(tx) => tx.send(event).is_ok(),
                None => false,
            }
        };
        if !sent {
            debug!("Viewer of session {} is gone", self.id);
            self.terminate(Termination::Disconnected);
        }
        sent
    }

    /// Live update path: queued while seeding, emitted directly afterwards
    fn deliver(&self, event: SessionEvent) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match held.as_mut() {
            Some(queue) => queue.push(event),
            None => {
                drop(held);
                self.emit(event);
            }
        }
    }

    /// Flushes held updates in arrival order and switches to direct delivery
    fn finish_seeding(&self) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Emitting under the lock keeps later updates behind the flushed ones
        for event in held.take().unwrap_or_default() {
            if !self.emit(event) {
                break;
            }
        }
    }

    fn terminate(&self, reason: Termination) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.cancel.cancel();
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }

        let tx = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        match reason {
            Termination::Disconnected => {
                info!("Session {} disconnected ({} subscriptions released)", self.id, subscriptions.len());
            }
            Termination::Failed(event) => {
                error!("Session {} failed: {:?}", self.id, event);
                if let Some(tx) = tx.as_ref() {
                    let _ = tx.send(event);
                }
            }
        }
        true
    }

    fn keep(&self, subscription: Subscription) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Checked under the lock so a concurrent terminate never misses it
        if self.closed.load(Ordering::SeqCst) {
            drop(subscriptions);
            subscription.unsubscribe();
        } else {
            subscriptions.push(subscription);
        }
    }
}

/// Handle to one viewer's session. Dropping it disconnects the session.
pub struct EventSession {
    inner: Arc<SessionInner>,
    topics: Vec<Topic>,
}

impl EventSession {
    /// Open a session watching `topics`. A topic listed more than once is
    /// watched once, at its first position.
    ///
    /// The returned receiver yields the session's events and ends once the
    /// session terminates. If seeding a topic fails, the receiver yields a
    /// single `Error` event and the session is already closed.
    pub async fn open(
        relay: &FeedRelay,
        topics: &[TopicConfig],
    ) -> (EventSession, UnboundedReceiver<SessionEvent>) {
        let mut seen = HashSet::new();
        let topics: Vec<&TopicConfig> = topics.iter().filter(|topic| seen.insert(topic.name.as_str())).collect();

        let (tx, rx) = unbounded_channel();
        let session = EventSession {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                tx: Mutex::new(Some(tx.clone())),
                held: Mutex::new(Some(Vec::new())),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                subscriptions: Mutex::new(Vec::new()),
            }),
            topics: topics.iter().map(|topic| topic.name.clone()).collect(),
        };
        info!("Opening session {} for {:?}", session.id(), session.topics);

        for topic in &topics {
            let listener = update_listener(Arc::downgrade(&session.inner), topic.name.clone());
            let subscription = relay.hub().subscribe(topic.channel(), listener).await;
            session.inner.keep(subscription);
        }

        for topic in &topics {
            let event = match relay.initial_snapshot(topic).await {
                Ok(Some(data)) => SessionEvent::Init { topic: topic.name.clone(), data },
                Ok(None) => SessionEvent::Empty {
                    topic: topic.name.clone(),
                    message: format!("No data found for {}", topic.name),
                },
                Err(e) => {
                    session.fail(&e);
                    return (session, rx);
                }
            };
            if !session.inner.emit(event) {
                return (session, rx);
            }
        }
        session.inner.finish_seeding();

        spawn_heartbeat(session.inner.clone(), tx, relay.heartbeat_interval());
        (session, rx)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Viewer disconnected; releases every subscription. Idempotent.
    pub fn close(&self) {
        self.inner.terminate(Termination::Disconnected);
    }

    /// Ends the session with a final `error` event, unless it already ended
    pub fn fail(&self, error: &FeedError) {
        self.inner.terminate(Termination::Failed(SessionEvent::error(error)));
    }
}

impl Drop for EventSession {
    fn drop(&mut self) {
        self.inner.terminate(Termination::Disconnected);
    }
}

fn update_listener(session: Weak<SessionInner>, topic: Topic) -> Listener {
    Arc::new(move |payload: &Bytes| {
        let Some(session) = session.upgrade() else { return };
        if let Err(e) = serde_json::from_slice::<IgnoredAny>(payload) {
            warn!("Dropping malformed message on {} for session {}: {}", topic, session.id, e);
            return;
        }
        session.deliver(SessionEvent::Update {
            topic: topic.clone(),
            data: payload.clone(),
        });
    })
}

fn spawn_heartbeat(session: Arc<SessionInner>, tx: UnboundedSender<SessionEvent>, period: Duration) {
    let token = session.cancel.clone();
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tx.closed() => {
                    session.terminate(Termination::Disconnected);
                    break;
                }
                _ = ticker.tick() => {
                    if !session.emit(SessionEvent::Ping { at_millis: now_millis() }) {
                        break;
                    }
                }
            }
        }
        debug!("Heartbeat for session {} stopped", session.id);
    });
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn frames_follow_event_stream_format() {
        let init = SessionEvent::Init {
            topic: "movers:sensex".into(),
            data: Bytes::from(r#"{"pullers":[["X",1.2]],"draggers":[]}"#),
        };
        assert_eq!(
            init.to_frame(),
            "event: init\ndata: {\"pullers\":[[\"X\",1.2]],\"draggers\":[]}\n\n"
        );

        let ping = SessionEvent::Ping { at_millis: 1700000000000 };
        assert_eq!(ping.to_frame(), "event: ping\ndata: 1700000000000\n\n");

        let error = SessionEvent::Error { message: "db down".into(), retryable: false };
        assert_eq!(
            error.to_frame(),
            "event: error\ndata: {\"error\":\"db down\",\"retryable\":false}\n\n"
        );
    }

    #[test]
    fn source_failures_are_marked_retryable() {
        let unavailable = SessionEvent::error(&FeedError::source_unavailable("db down"));
        assert_eq!(
            unavailable,
            SessionEvent::Error { message: "db down".into(), retryable: true }
        );
        let unknown = SessionEvent::error(&FeedError::new(ErrorCode::UnknownTopic, "no such topic"));
        assert!(matches!(unknown, SessionEvent::Error { retryable: false, .. }));
    }

    fn bare_session() -> (SessionInner, UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = unbounded_channel();
        let inner = SessionInner {
            id: Uuid::new_v4(),
            tx: Mutex::new(Some(tx)),
            held: Mutex::new(Some(Vec::new())),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
        };
        (inner, rx)
    }

    #[test]
    fn updates_wait_until_seeding_finishes() {
        let (inner, mut rx) = bare_session();
        let early = SessionEvent::Update { topic: "t".into(), data: Bytes::from_static(b"[1]") };
        let init = SessionEvent::Init { topic: "t".into(), data: Bytes::from_static(b"[0]") };

        inner.deliver(early.clone());
        assert!(rx.try_recv().is_err());

        inner.emit(init.clone());
        inner.finish_seeding();
        assert_eq!(rx.try_recv().unwrap(), init);
        assert_eq!(rx.try_recv().unwrap(), early);

        let later = SessionEvent::Update { topic: "t".into(), data: Bytes::from_static(b"[2]") };
        inner.deliver(later.clone());
        assert_eq!(rx.try_recv().unwrap(), later);
    }

    #[test]
    fn empty_event_carries_message_body() {
        let empty = SessionEvent::Empty {
            topic: "signals:5".into(),
            message: "No data found for signals:5".into(),
        };
        assert_eq!(empty.name(), "empty");
        assert_eq!(empty.topic(), Some("signals:5"));
        let body: serde_json::Value = serde_json::from_slice(&empty.data()).unwrap();
        assert_eq!(body["message"], "No data found for signals:5");
    }

    #[test]
    fn multi_line_payloads_are_split_into_data_lines() {
        let update = SessionEvent::Update {
            topic: "t".into(),
            data: Bytes::from("{\n  \"a\": 1\n}"),
        };
        assert_eq!(update.to_frame(), "event: update\ndata: {\ndata:   \"a\": 1\ndata: }\n\n");
    }
}
