//! WebSocket relay with topic-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── forwarder ──► Client A
//!            ├── Subscribe(topic) ──► Topic ── broadcast
//! Client B ──┘                         └── forwarder ──► Client B
//! ```
//!
//! The relay knows nothing about operations or clocks: it fans opaque
//! envelope bytes out to every subscriber of a topic (the publisher
//! included) and keeps a member list per topic for presence sync.
//!
//! Each connection has a read loop and a writer task. The read loop handles
//! client frames; the writer owns the socket's sending half and drains an
//! outbound queue, so a full queue only ever stalls the read loop until the
//! client reads again. Every subscribed topic gets a forwarder task that
//! drains the topic's broadcast channel into that queue.
//!
//! A forwarder that falls behind its topic sends [`RelayFrame::Lagged`] and
//! stops: the client must drop that topic and subscribe again.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::clock::ReplicaId;
use crate::presence::PresenceMeta;
use crate::protocol::{decode_payload, encode_payload, ProtocolError};
use crate::transport::TransportEvent;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per topic
    pub broadcast_capacity: usize,
    /// Topics one connection may subscribe to at once
    pub max_topics_per_connection: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_topics_per_connection: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_topics: usize,
}

/// Frames exchanged between [`WsTransport`](crate::ws::WsTransport) and
/// the relay, bincode-encoded in binary WebSocket messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    // client → relay
    Subscribe { request: u64, topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, payload: Vec<u8> },
    Track { topic: String, meta: PresenceMeta },
    Untrack { topic: String, replica: ReplicaId },

    // relay → client
    Subscribed { request: u64, topic: String },
    Rejected { request: u64, topic: String, reason: String },
    Message { topic: String, payload: Vec<u8> },
    PresenceSync { topic: String, members: Vec<PresenceMeta> },
    /// The connection fell behind `topic` and `skipped` messages were lost.
    /// Nothing more is forwarded for it.
    Lagged { topic: String, skipped: u64 },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }
}

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
}

impl AtomicRelayStats {
    fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_frames: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        }
    }
}

struct RelayTopic {
    sender: broadcast::Sender<TransportEvent>,
    subscribers: usize,
    members: BTreeMap<ReplicaId, PresenceMeta>,
}

impl RelayTopic {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: 0,
            members: BTreeMap::new(),
        }
    }

    fn sync_presence(&self) {
        let members = self.members.values().cloned().collect();
        let _ = self.sender.send(TransportEvent::PresenceSync(members));
    }
}

/// Per-connection bookkeeping, torn down on disconnect.
#[derive(Default)]
struct Connection {
    forwarders: HashMap<String, JoinHandle<()>>,
    tracked: HashSet<(String, ReplicaId)>,
}

/// The relay server. Cloning shares the same topics and stats.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    topics: Arc<RwLock<HashMap<String, RelayTopic>>>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            topics: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(AtomicRelayStats::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind `config.bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_frames: self.stats.total_frames.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_topics: self.topics.read().await.len(),
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (out_tx, out_rx) = mpsc::channel::<RelayFrame>(self.config.broadcast_capacity.max(1));
        let mut writer = tokio::spawn(write_frames(ws_sender, out_rx, addr));
        let mut conn = Connection::default();

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        self.stats.total_frames.fetch_add(1, Ordering::Relaxed);
                        self.stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                        match RelayFrame::decode(&data) {
                            Ok(frame) => self.handle_frame(frame, &mut conn, &out_tx).await,
                            Err(e) => log::warn!("Malformed frame from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(RelayError::from(e)),
                },
                written = &mut writer => {
                    break written.unwrap_or_else(|e| {
                        log::warn!("Writer for {addr} stopped: {e}");
                        Ok(())
                    });
                }
            }
        };

        writer.abort();
        self.disconnect(conn).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection from {addr} closed");
        result
    }

    async fn handle_frame(
        &self,
        frame: RelayFrame,
        conn: &mut Connection,
        out: &mpsc::Sender<RelayFrame>,
    ) {
        match frame {
            RelayFrame::Subscribe { request, topic } => {
                let reply = self.subscribe(request, topic, conn, out).await;
                // only waits for the writer, never for this loop
                let _ = out.send(reply).await;
            }
            RelayFrame::Unsubscribe { topic } => {
                if let Some(forwarder) = conn.forwarders.remove(&topic) {
                    forwarder.abort();
                    self.release(&topic).await;
                }
            }
            RelayFrame::Publish { topic, payload } => {
                let topics = self.topics.read().await;
                match topics.get(&topic) {
                    Some(entry) => {
                        let _ = entry.sender.send(TransportEvent::Message(Arc::new(payload)));
                    }
                    None => log::debug!("Publish to unknown topic {topic} dropped"),
                }
            }
            RelayFrame::Track { topic, meta } => {
                let mut topics = self.topics.write().await;
                if let Some(entry) = topics.get_mut(&topic) {
                    conn.tracked.insert((topic.clone(), meta.replica_id.clone()));
                    entry.members.insert(meta.replica_id.clone(), meta);
                    entry.sync_presence();
                }
            }
            RelayFrame::Untrack { topic, replica } => {
                conn.tracked.remove(&(topic.clone(), replica.clone()));
                self.untrack(&topic, &replica).await;
            }
            other => log::warn!("Unexpected client frame {other:?}"),
        }
    }

    async fn subscribe(
        &self,
        request: u64,
        topic: String,
        conn: &mut Connection,
        out: &mpsc::Sender<RelayFrame>,
    ) -> RelayFrame {
        match conn.forwarders.get(&topic) {
            Some(forwarder) if !forwarder.is_finished() => {
                return RelayFrame::Subscribed { request, topic };
            }
            Some(_) => {
                // forwarder gave up after lagging; start a fresh one
                conn.forwarders.remove(&topic);
                self.release(&topic).await;
            }
            None => {}
        }
        if conn.forwarders.len() >= self.config.max_topics_per_connection {
            log::warn!("Subscription to {topic} rejected: topic limit reached");
            return RelayFrame::Rejected {
                request,
                topic,
                reason: format!(
                    "at most {} topics per connection",
                    self.config.max_topics_per_connection
                ),
            };
        }

        let receiver = {
            let mut topics = self.topics.write().await;
            let entry = topics
                .entry(topic.clone())
                .or_insert_with(|| RelayTopic::new(self.config.broadcast_capacity));
            entry.subscribers += 1;
            entry.sender.subscribe()
        };
        let forwarder = tokio::spawn(forward(topic.clone(), receiver, out.clone()));
        conn.forwarders.insert(topic.clone(), forwarder);
        log::debug!("Subscribed to {topic}");
        RelayFrame::Subscribed { request, topic }
    }

    async fn untrack(&self, topic: &str, replica: &ReplicaId) {
        let mut topics = self.topics.write().await;
        if let Some(entry) = topics.get_mut(topic) {
            if entry.members.remove(replica).is_some() {
                entry.sync_presence();
            }
        }
    }

    async fn release(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(entry) = topics.get_mut(topic) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 {
                topics.remove(topic);
                log::debug!("Topic {topic} removed (empty)");
            }
        }
    }

    async fn disconnect(&self, conn: Connection) {
        for (topic, replica) in &conn.tracked {
            self.untrack(topic, replica).await;
        }
        for (topic, forwarder) in conn.forwarders {
            forwarder.abort();
            self.release(&topic).await;
        }
    }
}

/// Drain one topic into a connection's outbound queue.
///
/// Stops after reporting a lag; the client resubscribes.
async fn forward(
    topic: String,
    mut receiver: broadcast::Receiver<TransportEvent>,
    out: mpsc::Sender<RelayFrame>,
) {
    loop {
        let frame = match receiver.recv().await {
            Ok(TransportEvent::Message(payload)) => RelayFrame::Message {
                topic: topic.clone(),
                payload: payload.to_vec(),
            },
            Ok(TransportEvent::PresenceSync(members)) => RelayFrame::PresenceSync {
                topic: topic.clone(),
                members,
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Forwarder for {topic} lagged by {skipped} messages; dropping topic");
                let _ = out.send(RelayFrame::Lagged { topic, skipped }).await;
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if out.send(frame).await.is_err() {
            return;
        }
    }
}

/// Writer task: outbound queue → socket.
async fn write_frames(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut out_rx: mpsc::Receiver<RelayFrame>,
    addr: SocketAddr,
) -> Result<(), RelayError> {
    while let Some(frame) = out_rx.recv().await {
        match frame.encode() {
            Ok(bytes) => ws_sender.send(Message::Binary(bytes.into())).await?,
            Err(e) => log::warn!("Dropping unencodable frame for {addr}: {e}"),
        }
    }
    Ok(())
}
