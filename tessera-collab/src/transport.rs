//! Pub/sub transport boundary.
//!
//! The session core needs exactly three things from a transport:
//! subscribe to a topic, publish bytes to it, and a best-effort view of
//! who else is on it. Delivery is assumed at-least-once and FIFO per
//! publisher; nothing more.
//!
//! ```text
//! SessionCoordinator ──publish──► Transport ──► every Subscription on the topic
//!         ▲                                              │
//!         └──────────── TransportEvent ◄─────────────────┘
//! ```
//!
//! [`LocalHub`] is an in-process implementation (one broadcast channel per
//! topic). [`WsTransport`](crate::ws::WsTransport) talks to a
//! [`RelayServer`](crate::relay::RelayServer) over WebSocket.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

use crate::clock::ReplicaId;
use crate::presence::PresenceMeta;
use crate::protocol::ProtocolError;

pub type SubscriptionId = u64;

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An encoded envelope published on the topic (possibly by us).
    Message(Arc<Vec<u8>>),
    /// Current members of the topic after a join/leave.
    PresenceSync(Vec<PresenceMeta>),
}

/// Receiving end of one topic subscription.
///
/// Returns `None` once the transport closes the topic, which the session
/// treats as a disconnect. Falling behind the channel capacity ends the
/// stream too: the dropped events are gone and nothing replays them.
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    receiver: broadcast::Receiver<TransportEvent>,
    lagged: Option<u64>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        topic: impl Into<String>,
        receiver: broadcast::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            receiver,
            lagged: None,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        if self.lagged.is_some() {
            return None;
        }
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Subscription {} on {} lagged by {n} events", self.id, self.topic);
                self.lagged = Some(n);
                None
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// How many events were lost if the stream ended by falling behind.
    pub fn lagged(&self) -> Option<u64> {
        self.lagged
    }
}

/// External pub/sub collaborator.
pub trait Transport: Send + Sync + 'static {
    /// Subscribe to `topic`. Resolves once the transport confirms.
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<Subscription, TransportError>>;

    /// Release a subscription.
    fn unsubscribe<'a>(
        &'a self,
        topic: &'a str,
        id: SubscriptionId,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Best-effort broadcast. Never waits for delivery.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Announce ourselves as a member of `topic`.
    fn track_presence<'a>(
        &'a self,
        topic: &'a str,
        meta: PresenceMeta,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Withdraw our membership of `topic`.
    fn untrack_presence<'a>(
        &'a self,
        topic: &'a str,
        replica: &'a ReplicaId,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("subscription to {topic} rejected: {reason}")]
    SubscriptionRejected { topic: String, reason: String },
    #[error("no subscription {id} on {topic}")]
    UnknownSubscription { topic: String, id: SubscriptionId },
    #[error("topic {0} has no subscribers")]
    NoSuchTopic(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for the transport")]
    Timeout,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

// ───────────────────────────────────────────────────────────────────
// In-process hub
// ───────────────────────────────────────────────────────────────────

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_published: u64,
    pub active_topics: usize,
    pub subscribers: usize,
}

struct Topic {
    sender: broadcast::Sender<TransportEvent>,
    subscribers: HashSet<SubscriptionId>,
    members: BTreeMap<ReplicaId, PresenceMeta>,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: HashSet::new(),
            members: BTreeMap::new(),
        }
    }

    fn sync_presence(&self) {
        let members = self.members.values().cloned().collect();
        let _ = self.sender.send(TransportEvent::PresenceSync(members));
    }
}

/// In-process pub/sub: one broadcast channel per topic.
///
/// Every subscriber, including the publisher's own, receives each message.
/// Cloning is cheap (`Arc` inside) so several coordinators can share a hub.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    topics: RwLock<HashMap<String, Topic>>,
    capacity: usize,
    next_id: AtomicU64,
    fail_subscriptions: AtomicBool,
    messages_published: AtomicU64,
}

impl LocalHub {
    /// `capacity` is how many events each subscriber may fall behind
    /// before it starts losing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                topics: RwLock::new(HashMap::new()),
                capacity,
                next_id: AtomicU64::new(1),
                fail_subscriptions: AtomicBool::new(false),
                messages_published: AtomicU64::new(0),
            }),
        }
    }

    /// Make every following `subscribe` fail (fault injection).
    pub fn set_fail_subscriptions(&self, fail: bool) {
        self.inner.fail_subscriptions.store(fail, Ordering::SeqCst);
    }

    /// Drop a topic: every subscriber's stream ends as if disconnected.
    pub fn close_topic(&self, topic: &str) -> bool {
        let mut topics = self.inner.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics.remove(topic).is_some()
    }

    /// Current members of a topic.
    pub fn members(&self, topic: &str) -> Vec<PresenceMeta> {
        let topics = self.inner.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics
            .get(topic)
            .map(|t| t.members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> HubStats {
        let topics = self.inner.topics.read().unwrap_or_else(PoisonError::into_inner);
        HubStats {
            messages_published: self.inner.messages_published.load(Ordering::Relaxed),
            active_topics: topics.len(),
            subscribers: topics.values().map(|t| t.subscribers.len()).sum(),
        }
    }

    fn subscribe_now(&self, topic: &str) -> Result<Subscription, TransportError> {
        if self.inner.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(TransportError::SubscriptionRejected {
                topic: topic.to_string(),
                reason: "subscriptions disabled".to_string(),
            });
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.inner.topics.write().unwrap_or_else(PoisonError::into_inner);
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(self.inner.capacity));
        entry.subscribers.insert(id);
        log::debug!("Hub: subscription {id} on {topic}");
        Ok(Subscription::new(id, topic, entry.sender.subscribe()))
    }

    fn unsubscribe_now(&self, topic: &str, id: SubscriptionId) -> Result<(), TransportError> {
        let mut topics = self.inner.topics.write().unwrap_or_else(PoisonError::into_inner);
        let entry = topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::NoSuchTopic(topic.to_string()))?;
        if !entry.subscribers.remove(&id) {
            return Err(TransportError::UnknownSubscription {
                topic: topic.to_string(),
                id,
            });
        }
        if entry.subscribers.is_empty() {
            topics.remove(topic);
            log::debug!("Hub: topic {topic} removed (empty)");
        }
        Ok(())
    }

    fn track_now(&self, topic: &str, meta: PresenceMeta) -> Result<(), TransportError> {
        let mut topics = self.inner.topics.write().unwrap_or_else(PoisonError::into_inner);
        let entry = topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::NoSuchTopic(topic.to_string()))?;
        entry.members.insert(meta.replica_id.clone(), meta);
        entry.sync_presence();
        Ok(())
    }

    fn untrack_now(&self, topic: &str, replica: &ReplicaId) -> Result<(), TransportError> {
        let mut topics = self.inner.topics.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = topics.get_mut(topic) {
            if entry.members.remove(replica).is_some() {
                entry.sync_presence();
            }
        }
        Ok(())
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Transport for LocalHub {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<Subscription, TransportError>> {
        async move { self.subscribe_now(topic) }.boxed()
    }

    fn unsubscribe<'a>(
        &'a self,
        topic: &'a str,
        id: SubscriptionId,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move { self.unsubscribe_now(topic, id) }.boxed()
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let topics = self.inner.topics.read().unwrap_or_else(PoisonError::into_inner);
        let entry = topics
            .get(topic)
            .ok_or_else(|| TransportError::NoSuchTopic(topic.to_string()))?;
        // zero receivers is fine: best effort
        let _ = entry.sender.send(TransportEvent::Message(Arc::new(payload)));
        self.inner.messages_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn track_presence<'a>(
        &'a self,
        topic: &'a str,
        meta: PresenceMeta,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move { self.track_now(topic, meta) }.boxed()
    }

    fn untrack_presence<'a>(
        &'a self,
        topic: &'a str,
        replica: &'a ReplicaId,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move { self.untrack_now(topic, replica) }.boxed()
    }
}
