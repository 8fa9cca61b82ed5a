//! Session lifecycle and wiring to the transport.
//!
//! Architecture:
//! ```text
//!                 ┌──────────────────── SessionCoordinator ───────────────────┐
//!  apply_local ──►│ Session ─► OperationLog ─► Envelope ─► Transport::publish │
//!                 │    │                                                      │
//!                 │    ├── PresenceTracker                                    │
//!                 │    └── ChatRelay                                          │
//!                 │                                                           │
//!  observers ◄────│ broadcast<SessionEvent> ◄── pump task ◄── Subscription    │
//!                 └───────────────────────────────────────────────────────────┘
//! ```
//!
//! State machine: `Idle → Joining → Active → Closed`. A closed coordinator
//! can be initialized again for another resource.
//!
//! Each coordinator owns exactly one [`Session`]; nothing is shared between
//! sessions. The session sits behind a `tokio::sync::Mutex`, which serializes
//! local edits against the inbound pump.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::chat::{ChatKind, ChatMessage, ChatRelay};
use crate::clock::{wall_clock_ms, ReplicaId, VectorClock};
use crate::config::CollabConfig;
use crate::operation::{CellValue, OpDraft, Operation, OperationError, OperationId};
use crate::oplog::OperationLog;
use crate::presence::{CursorPosition, PresenceMeta, PresenceTracker};
use crate::protocol::{Envelope, EnvelopeKind, ProtocolError};
use crate::resolver::{self, Resolution};
use crate::transport::{Subscription, SubscriptionId, Transport, TransportError, TransportEvent};

/// Session id, also used as the transport topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// `"{prefix}:{resource_id}"`
    pub fn derive(prefix: &str, resource_id: &str) -> Self {
        Self(format!("{prefix}:{resource_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Active,
    Closed,
}

/// Application events for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// A new remote operation was accepted into the log.
    RemoteOperation(Operation),
    CursorMoved(CursorPosition),
    ChatReceived(ChatMessage),
    PresenceSynced(Vec<PresenceMeta>),
    PeerLeft(ReplicaId),
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session already {0:?}")]
    AlreadyActive(SessionState),
    #[error("session is {0:?}, not active")]
    NotActive(SessionState),
    #[error("envelope for session {got} delivered to {expected}")]
    WrongSession { expected: String, got: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

/// All collaborative state for one open document.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    resource_id: String,
    replica_id: ReplicaId,
    log: OperationLog,
    presence: PresenceTracker,
    chat: ChatRelay,
}

impl Session {
    pub fn new(
        resource_id: impl Into<String>,
        replica_id: ReplicaId,
        display_name: impl Into<String>,
        config: &CollabConfig,
    ) -> Self {
        let resource_id = resource_id.into();
        let display_name = display_name.into();
        Self {
            id: SessionId::derive(&config.topic_prefix, &resource_id),
            resource_id,
            log: OperationLog::new(replica_id.clone()),
            presence: PresenceTracker::new(replica_id.clone(), display_name.clone()),
            chat: ChatRelay::new(replica_id.clone(), display_name, config.chat_history_limit),
            replica_id,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn chat(&self) -> &ChatRelay {
        &self.chat
    }

    pub fn apply_local(&mut self, draft: OpDraft) -> Result<Operation, OperationError> {
        self.log.apply_local(draft)
    }

    pub fn move_cursor(&mut self, target: impl Into<String>, position: u32) -> CursorPosition {
        self.presence.update_local(target, position)
    }

    pub fn send_chat(
        &mut self,
        text: impl Into<String>,
        target: Option<String>,
        kind: ChatKind,
    ) -> ChatMessage {
        self.chat.send(text, target, kind)
    }

    /// Apply one inbound transport event.
    ///
    /// Returns the application event to emit, if any. A corrupt message is
    /// logged and dropped; it never poisons the session.
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<SessionEvent> {
        match event {
            TransportEvent::Message(bytes) => match self.handle_envelope(&bytes) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("Dropping inbound message on {}: {e}", self.id);
                    None
                }
            },
            TransportEvent::PresenceSync(members) => {
                self.presence.seed(&members);
                Some(SessionEvent::PresenceSynced(members))
            }
        }
    }

    fn handle_envelope(&mut self, bytes: &[u8]) -> Result<Option<SessionEvent>, SessionError> {
        let envelope = Envelope::decode(bytes)?;
        if envelope.session_id != self.id.as_str() {
            return Err(SessionError::WrongSession {
                expected: self.id.to_string(),
                got: envelope.session_id,
            });
        }
        if envelope.sender == self.replica_id {
            return Ok(None);
        }

        let event = match envelope.kind {
            EnvelopeKind::Operation => {
                let op = envelope.to_operation()?;
                self.log
                    .apply_remote(op.clone())?
                    .then_some(SessionEvent::RemoteOperation(op))
            }
            EnvelopeKind::Cursor => {
                let cursor = envelope.to_cursor()?;
                self.presence
                    .observe_remote(cursor.clone())
                    .then_some(SessionEvent::CursorMoved(cursor))
            }
            EnvelopeKind::Chat => {
                let msg = envelope.to_chat()?;
                self.chat
                    .observe_remote(msg.clone())
                    .then_some(SessionEvent::ChatReceived(msg))
            }
            EnvelopeKind::Leave => {
                log::info!("Peer {} left {}", envelope.sender, self.id);
                self.presence.remove(&envelope.sender);
                Some(SessionEvent::PeerLeft(envelope.sender))
            }
        };
        Ok(event)
    }

    /// Current winner per target.
    pub fn resolve(&self) -> BTreeMap<String, Operation> {
        resolver::resolve(self.log.operations())
    }

    /// Current value of one target; `None` if untouched or deleted.
    pub fn current_value(&self, target: &str) -> Option<CellValue> {
        resolver::resolve_with_shadows(self.log.operations_for(target))
            .remove(target)
            .and_then(|r| r.value().cloned())
    }

    /// Targets whose current value hides concurrent edits.
    pub fn conflicts(&self) -> BTreeMap<String, Resolution> {
        resolver::conflicts(self.log.operations())
    }

    /// Drop remote cursors idle longer than `timeout_ms`.
    pub fn prune_idle_cursors(&mut self, timeout_ms: u64) -> Vec<ReplicaId> {
        self.presence.prune_idle(wall_clock_ms(), timeout_ms)
    }

    /// Forget everything: log, clock, cursors, chat.
    pub fn clear(&mut self) {
        self.log.clear();
        self.presence.clear();
        self.chat.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Coordinator
// ───────────────────────────────────────────────────────────────────

struct Inner {
    state: SessionState,
    session: Option<Session>,
    subscription: Option<SubscriptionId>,
    pump: Option<JoinHandle<()>>,
}

impl Inner {
    fn active_session_mut(&mut self) -> Result<&mut Session, SessionError> {
        match (self.state, self.session.as_mut()) {
            (SessionState::Active, Some(session)) => Ok(session),
            (state, _) => Err(SessionError::NotActive(state)),
        }
    }

    fn active_session(&self) -> Option<&Session> {
        match self.state {
            SessionState::Active => self.session.as_ref(),
            _ => None,
        }
    }
}

/// Owns one session and connects it to a transport.
pub struct SessionCoordinator<T: Transport> {
    transport: Arc<T>,
    config: CollabConfig,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<SessionEvent>,
}

impl<T: Transport> SessionCoordinator<T> {
    pub fn new(transport: Arc<T>, config: CollabConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            transport,
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Idle,
                session: None,
                subscription: None,
                pump: None,
            })),
            events,
        }
    }

    pub fn with_defaults(transport: Arc<T>) -> Self {
        Self::new(transport, CollabConfig::default())
    }

    /// Observe application events. Each call gets an independent receiver.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    fn emit(&self, event: SessionEvent) {
        // no observers is fine
        let _ = self.events.send(event);
    }

    /// Join the session for `resource_id`.
    ///
    /// Resolves once the transport confirms the subscription. On transport
    /// failure the coordinator returns to `Idle` and the error is returned.
    pub async fn initialize_session(
        &self,
        resource_id: &str,
        replica_id: impl Into<ReplicaId>,
        display_name: &str,
    ) -> Result<SessionId, SessionError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Joining | SessionState::Active => {
                    return Err(SessionError::AlreadyActive(inner.state));
                }
                SessionState::Idle | SessionState::Closed => inner.state = SessionState::Joining,
            }
        }
        self.emit(SessionEvent::StateChanged(SessionState::Joining));

        let session = Session::new(resource_id, replica_id.into(), display_name, &self.config);
        let topic = session.id().clone();

        let subscription = match self.transport.subscribe(topic.as_str()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                log::error!("Failed to subscribe to {topic}: {e}");
                self.inner.lock().await.state = SessionState::Idle;
                self.emit(SessionEvent::StateChanged(SessionState::Idle));
                return Err(e.into());
            }
        };

        let meta = session.presence().local_meta().clone();
        if let Err(e) = self.transport.track_presence(topic.as_str(), meta).await {
            log::warn!("Presence tracking failed on {topic}: {e}");
        }

        {
            let mut inner = self.inner.lock().await;
            inner.subscription = Some(subscription.id());
            inner.session = Some(session);
            inner.state = SessionState::Active;
            inner.pump = Some(tokio::spawn(pump(
                self.transport.clone(),
                subscription,
                self.inner.clone(),
                self.events.clone(),
            )));
        }
        log::info!("Session {topic} active");
        self.emit(SessionEvent::StateChanged(SessionState::Active));
        Ok(topic)
    }

    /// Leave the session and discard all its state.
    ///
    /// Idempotent: a no-op unless the session is active. Local teardown
    /// always completes; a transport error from unsubscribing is returned
    /// afterwards.
    pub async fn cleanup(&self) -> Result<(), SessionError> {
        let (session, subscription, pump) = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Active {
                return Ok(());
            }
            inner.state = SessionState::Closed;
            (inner.session.take(), inner.subscription.take(), inner.pump.take())
        };

        if let Some(pump) = pump {
            pump.abort();
        }

        let mut result = Ok(());
        if let Some(mut session) = session {
            let topic = session.id().clone();
            if let Err(e) = depart(self.transport.as_ref(), &mut session, subscription).await {
                log::error!("Failed to unsubscribe from {topic}: {e}");
                result = Err(e.into());
            }
            log::info!("Session {topic} closed");
        }

        self.emit(SessionEvent::StateChanged(SessionState::Closed));
        result
    }

    fn publish(&self, topic: &SessionId, envelope: Envelope) {
        if let Err(e) = publish_envelope(self.transport.as_ref(), topic, &envelope) {
            log::warn!("Publish of {:?} on {topic} failed: {e}", envelope.kind);
        }
    }

    /// Apply a local edit and publish it.
    pub async fn apply_local(&self, draft: OpDraft) -> Result<Operation, SessionError> {
        let mut inner = self.inner.lock().await;
        let session = inner.active_session_mut()?;
        let op = session.apply_local(draft)?;
        let envelope = Envelope::operation(session.id().as_str(), &op)?;
        let topic = session.id().clone();
        drop(inner);

        self.publish(&topic, envelope);
        Ok(op)
    }

    /// Move the local cursor and publish it.
    pub async fn move_cursor(
        &self,
        target: &str,
        position: u32,
    ) -> Result<CursorPosition, SessionError> {
        let mut inner = self.inner.lock().await;
        let session = inner.active_session_mut()?;
        let cursor = session.move_cursor(target, position);
        let envelope = Envelope::cursor(session.id().as_str(), &cursor)?;
        let topic = session.id().clone();
        drop(inner);

        self.publish(&topic, envelope);
        Ok(cursor)
    }

    /// Send a chat line or cell annotation.
    pub async fn send_chat(
        &self,
        text: &str,
        target: Option<&str>,
        kind: ChatKind,
    ) -> Result<ChatMessage, SessionError> {
        let mut inner = self.inner.lock().await;
        let session = inner.active_session_mut()?;
        let msg = session.send_chat(text, target.map(str::to_string), kind);
        let envelope = Envelope::chat(session.id().as_str(), &msg)?;
        let topic = session.id().clone();
        drop(inner);

        self.publish(&topic, envelope);
        Ok(msg)
    }

    /// Current winner per target. Empty when not active.
    pub async fn resolve(&self) -> BTreeMap<String, Operation> {
        let inner = self.inner.lock().await;
        inner.active_session().map(Session::resolve).unwrap_or_default()
    }

    /// Current value of `target`.
    pub async fn current_value(&self, target: &str) -> Option<CellValue> {
        let inner = self.inner.lock().await;
        inner.active_session().and_then(|s| s.current_value(target))
    }

    /// Concurrent edits hidden by resolution, per target.
    pub async fn conflicts(&self) -> BTreeMap<String, Resolution> {
        let inner = self.inner.lock().await;
        inner.active_session().map(Session::conflicts).unwrap_or_default()
    }

    pub async fn list_others(&self) -> Vec<CursorPosition> {
        let inner = self.inner.lock().await;
        inner
            .active_session()
            .map(|s| s.presence().list_others())
            .unwrap_or_default()
    }

    pub async fn chat_history(&self) -> Vec<ChatMessage> {
        let inner = self.inner.lock().await;
        inner
            .active_session()
            .map(|s| s.chat().messages().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn dependencies_for(&self, target: &str) -> Vec<OperationId> {
        let inner = self.inner.lock().await;
        inner
            .active_session()
            .map(|s| s.log().dependencies_for(target))
            .unwrap_or_default()
    }

    pub async fn clock(&self) -> VectorClock {
        let inner = self.inner.lock().await;
        inner
            .active_session()
            .map(|s| s.log().clock().clone())
            .unwrap_or_default()
    }

    pub async fn log_len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.active_session().map_or(0, |s| s.log().len())
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        let inner = self.inner.lock().await;
        inner.active_session().map(|s| s.id().clone())
    }

    /// Prune remote cursors using the configured idle timeout.
    pub async fn prune_idle_cursors(&self) -> Vec<ReplicaId> {
        let timeout = self.config.presence_idle_timeout_ms;
        let mut inner = self.inner.lock().await;
        match inner.active_session_mut() {
            Ok(session) => session.prune_idle_cursors(timeout),
            Err(_) => Vec::new(),
        }
    }
}

impl<T: Transport> Drop for SessionCoordinator<T> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            if inner.state != SessionState::Active {
                return;
            }
        }
        // leaving needs the transport; without a runtime only the pump stops
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = self.transport.clone();
        let inner = self.inner.clone();
        runtime.spawn(async move {
            let mut inner = inner.lock().await;
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            if inner.state != SessionState::Active {
                return;
            }
            inner.state = SessionState::Closed;
            let subscription = inner.subscription.take();
            if let Some(mut session) = inner.session.take() {
                log::info!("Coordinator for {} dropped; leaving session", session.id());
                if let Err(e) = depart(transport.as_ref(), &mut session, subscription).await {
                    log::debug!("Unsubscribe from {} failed: {e}", session.id());
                }
            }
        });
    }
}

fn publish_envelope<T: Transport>(
    transport: &T,
    topic: &SessionId,
    envelope: &Envelope,
) -> Result<(), TransportError> {
    let bytes = envelope.encode()?;
    transport.publish(topic.as_str(), bytes)
}

/// Announce the leave, drop presence and the subscription, then forget
/// the session's state.
///
/// Leave and untrack are best effort. The unsubscribe result is returned.
async fn depart<T: Transport>(
    transport: &T,
    session: &mut Session,
    subscription: Option<SubscriptionId>,
) -> Result<(), TransportError> {
    let topic = session.id().clone();
    let leave = Envelope::leave(topic.as_str(), session.replica_id().clone());
    if let Err(e) = publish_envelope(transport, &topic, &leave) {
        log::debug!("Leave on {topic} not sent: {e}");
    }
    if let Err(e) = transport.untrack_presence(topic.as_str(), session.replica_id()).await {
        log::warn!("Failed to untrack presence on {topic}: {e}");
    }
    let result = match subscription {
        Some(id) => transport.unsubscribe(topic.as_str(), id).await,
        None => Ok(()),
    };
    session.clear();
    result
}

/// Inbound loop: transport events → session → application events.
///
/// When the stream ends, because the transport closed the topic or because
/// this subscriber fell behind and lost events, the session leaves as if the
/// user had called `cleanup`. A session that missed operations never stays
/// active; the application can join again to rebuild it.
async fn pump<T: Transport>(
    transport: Arc<T>,
    mut subscription: Subscription,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<SessionEvent>,
) {
    while let Some(event) = subscription.recv().await {
        let mut guard = inner.lock().await;
        let Some(session) = guard.session.as_mut() else {
            return;
        };
        if let Some(app_event) = session.handle_event(event) {
            let _ = events.send(app_event);
        }
    }

    let mut guard = inner.lock().await;
    if guard.state != SessionState::Active {
        return;
    }
    match subscription.lagged() {
        Some(n) => log::warn!("Missed {n} events on {}; closing session", subscription.topic()),
        None => log::warn!("Transport closed {}; closing session", subscription.topic()),
    }
    guard.state = SessionState::Closed;
    guard.pump = None;
    let id = guard.subscription.take();
    if let Some(mut session) = guard.session.take() {
        // after a transport close these usually fail; that is expected
        if let Err(e) = depart(transport.as_ref(), &mut session, id).await {
            log::debug!("Unsubscribe from {} failed: {e}", subscription.topic());
        }
    }
    drop(guard);
    let _ = events.send(SessionEvent::StateChanged(SessionState::Closed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use crate::transport::LocalHub;
    use tokio::time::{timeout, Duration};

    fn session(replica: &str) -> Session {
        Session::new("sheet-1", replica.into(), replica.to_uppercase(), &CollabConfig::default())
    }

    fn message(envelope: &Envelope) -> TransportEvent {
        TransportEvent::Message(Arc::new(envelope.encode().unwrap()))
    }

    async fn wait_until_closed(events: &mut broadcast::Receiver<SessionEvent>) -> bool {
        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::StateChanged(SessionState::Closed)) => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await;
        matches!(closed, Ok(true))
    }

    #[test]
    fn test_session_id_derivation() {
        assert_eq!(SessionId::derive("collab", "sheet-1").as_str(), "collab:sheet-1");
        assert_eq!(session("a").id().as_str(), "collab:sheet-1");
    }

    #[test]
    fn test_handle_remote_operation() {
        let mut alice = session("alice");
        let mut bob = session("bob");
        let op = alice.apply_local(OpDraft::update("C1", "x")).unwrap();
        let event = message(&Envelope::operation(alice.id().as_str(), &op).unwrap());

        assert_eq!(bob.handle_event(event.clone()), Some(SessionEvent::RemoteOperation(op)));
        // redelivery: no event, no growth
        assert_eq!(bob.handle_event(event), None);
        assert_eq!(bob.log().len(), 1);
        assert_eq!(bob.current_value("C1"), Some(CellValue::Text("x".into())));
    }

    #[test]
    fn test_handle_ignores_own_echo() {
        let mut alice = session("alice");
        let op = alice.apply_local(OpDraft::update("C1", "x")).unwrap();
        let event = message(&Envelope::operation(alice.id().as_str(), &op).unwrap());
        assert_eq!(alice.handle_event(event), None);
        assert_eq!(alice.log().len(), 1);
    }

    #[test]
    fn test_handle_malformed_payload_dropped() {
        let mut bob = session("bob");
        assert_eq!(bob.handle_event(TransportEvent::Message(Arc::new(vec![1, 2, 3]))), None);

        let mut alice = session("alice");
        let mut op = alice.apply_local(OpDraft::update("C1", "x")).unwrap();
        op.target.clear();
        let event = message(&Envelope::operation(alice.id().as_str(), &op).unwrap());
        assert_eq!(bob.handle_event(event), None);
        assert!(bob.log().is_empty());
        assert!(bob.log().clock().is_empty());
    }

    #[test]
    fn test_handle_wrong_session_dropped() {
        let mut alice = session("alice");
        let mut bob = session("bob");
        let op = alice.apply_local(OpDraft::update("C1", "x")).unwrap();
        let event = message(&Envelope::operation("collab:other", &op).unwrap());
        assert_eq!(bob.handle_event(event), None);
        assert!(bob.log().is_empty());
    }

    #[test]
    fn test_handle_cursor_chat_leave() {
        let mut alice = session("alice");
        let mut bob = session("bob");
        let id = alice.id().as_str().to_string();

        let cursor = alice.move_cursor("B2", 3);
        assert_eq!(
            bob.handle_event(message(&Envelope::cursor(id.as_str(), &cursor).unwrap())),
            Some(SessionEvent::CursorMoved(cursor))
        );
        assert_eq!(bob.presence().list_others().len(), 1);

        let chat = alice.send_chat("hi", None, ChatKind::Message);
        assert_eq!(
            bob.handle_event(message(&Envelope::chat(id.as_str(), &chat).unwrap())),
            Some(SessionEvent::ChatReceived(chat))
        );

        assert_eq!(
            bob.handle_event(message(&Envelope::leave(id.as_str(), "alice".into()))),
            Some(SessionEvent::PeerLeft("alice".into()))
        );
        assert!(bob.presence().list_others().is_empty());
    }

    #[test]
    fn test_handle_presence_sync_seeds_tracker() {
        let mut bob = session("bob");
        let members = vec![PresenceMeta::new("alice".into(), "Alice")];
        assert_eq!(
            bob.handle_event(TransportEvent::PresenceSync(members.clone())),
            Some(SessionEvent::PresenceSynced(members))
        );
        assert_eq!(bob.presence().list_others().len(), 1);
    }

    #[tokio::test]
    async fn test_coordinator_lifecycle() {
        let hub = Arc::new(LocalHub::new(64));
        let coordinator = SessionCoordinator::with_defaults(hub.clone());
        assert_eq!(coordinator.state().await, SessionState::Idle);

        let id = coordinator.initialize_session("sheet-1", "alice", "Alice").await.unwrap();
        assert_eq!(id.as_str(), "collab:sheet-1");
        assert_eq!(coordinator.state().await, SessionState::Active);
        assert_eq!(hub.members("collab:sheet-1").len(), 1);

        coordinator.apply_local(OpDraft::update("C1", "x")).await.unwrap();
        assert_eq!(coordinator.log_len().await, 1);

        coordinator.cleanup().await.unwrap();
        assert_eq!(coordinator.state().await, SessionState::Closed);
        assert!(coordinator.dependencies_for("C1").await.is_empty());
        assert_eq!(coordinator.log_len().await, 0);
        assert_eq!(hub.topic_count(), 0);

        // second cleanup is a no-op
        coordinator.cleanup().await.unwrap();
        assert_eq!(coordinator.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_initialize_twice_rejected() {
        let hub = Arc::new(LocalHub::new(64));
        let coordinator = SessionCoordinator::with_defaults(hub);
        coordinator.initialize_session("sheet-1", "alice", "Alice").await.unwrap();
        assert_eq!(
            coordinator.initialize_session("sheet-2", "alice", "Alice").await,
            Err(SessionError::AlreadyActive(SessionState::Active))
        );
    }

    #[tokio::test]
    async fn test_subscription_failure_returns_to_idle() {
        let hub = Arc::new(LocalHub::new(64));
        hub.set_fail_subscriptions(true);
        let coordinator = SessionCoordinator::with_defaults(hub.clone());

        let result = coordinator.initialize_session("sheet-1", "alice", "Alice").await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
        assert_eq!(coordinator.state().await, SessionState::Idle);

        hub.set_fail_subscriptions(false);
        coordinator.initialize_session("sheet-1", "alice", "Alice").await.unwrap();
        assert_eq!(coordinator.state().await, SessionState::Active);
    }

    #[tokio::test]
    async fn test_local_api_requires_active() {
        let hub = Arc::new(LocalHub::new(64));
        let coordinator = SessionCoordinator::with_defaults(hub);
        assert_eq!(
            coordinator.apply_local(OpDraft::update("C1", "x")).await,
            Err(SessionError::NotActive(SessionState::Idle))
        );
        assert!(coordinator.move_cursor("C1", 0).await.is_err());
        assert!(coordinator.send_chat("hi", None, ChatKind::Message).await.is_err());
        assert!(coordinator.resolve().await.is_empty());
    }

    #[tokio::test]
    async fn test_reinitialize_after_cleanup() {
        let hub = Arc::new(LocalHub::new(64));
        let coordinator = SessionCoordinator::with_defaults(hub);
        coordinator.initialize_session("sheet-1", "alice", "Alice").await.unwrap();
        coordinator.apply_local(OpDraft::update("C1", "x")).await.unwrap();
        coordinator.cleanup().await.unwrap();

        let id = coordinator.initialize_session("sheet-2", "alice", "Alice").await.unwrap();
        assert_eq!(id.as_str(), "collab:sheet-2");
        assert_eq!(coordinator.log_len().await, 0);
        assert!(coordinator.clock().await.is_empty());
    }

    #[tokio::test]
    async fn test_transport_disconnect_closes_session() {
        let hub = Arc::new(LocalHub::new(64));
        let coordinator = SessionCoordinator::with_defaults(hub.clone());
        let mut events = coordinator.subscribe_events();
        coordinator.initialize_session("sheet-1", "alice", "Alice").await.unwrap();

        hub.close_topic("collab:sheet-1");

        assert!(wait_until_closed(&mut events).await);
        assert_eq!(coordinator.state().await, SessionState::Closed);
        // cleanup after a disconnect is a no-op
        coordinator.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_lagging_session_closes_instead_of_diverging() {
        let hub = Arc::new(LocalHub::new(4));
        let bob = SessionCoordinator::with_defaults(hub.clone());
        let mut events = bob.subscribe_events();
        bob.initialize_session("sheet-1", "bob", "Bob").await.unwrap();

        // no await in between: bob's pump cannot keep up
        let mut carol = session("carol");
        for i in 0..20i64 {
            let op = carol.apply_local(OpDraft::update("C1", i)).unwrap();
            let envelope = Envelope::operation(carol.id().as_str(), &op).unwrap();
            hub.publish("collab:sheet-1", envelope.encode().unwrap()).unwrap();
        }

        assert!(wait_until_closed(&mut events).await);
        assert_eq!(bob.state().await, SessionState::Closed);
        assert_eq!(bob.log_len().await, 0);
        assert!(hub.members("collab:sheet-1").is_empty());
        assert_eq!(hub.topic_count(), 0);

        // rejoining starts from a clean log
        bob.initialize_session("sheet-1", "bob", "Bob").await.unwrap();
        assert_eq!(bob.state().await, SessionState::Active);
        assert!(bob.clock().await.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_coordinator_leaves_session() {
        let hub = Arc::new(LocalHub::new(64));
        let watcher = hub.subscribe("collab:sheet-1").await.unwrap();
        let coordinator = SessionCoordinator::with_defaults(hub.clone());
        coordinator.initialize_session("sheet-1", "alice", "Alice").await.unwrap();
        assert_eq!(hub.stats().subscribers, 2);
        assert_eq!(hub.members("collab:sheet-1").len(), 1);

        drop(coordinator);

        let released = timeout(Duration::from_secs(2), async {
            while hub.stats().subscribers > 1 || !hub.members("collab:sheet-1").is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(released.is_ok());
        assert_eq!(hub.stats().subscribers, 1);
        drop(watcher);
    }

    #[test]
    fn test_dropping_coordinator_outside_runtime() {
        let hub = Arc::new(LocalHub::new(64));
        let coordinator = SessionCoordinator::with_defaults(hub);
        drop(coordinator);
    }
}
