//! WebSocket client transport for a [`RelayServer`](crate::relay::RelayServer).
//!
//! One socket carries every topic. A writer task drains an outgoing queue
//! into the socket; a reader task routes relay frames to the per-topic
//! broadcast channels that back each [`Subscription`].
//!
//! When the socket closes, every topic channel is dropped, so every
//! subscription stream ends and each session closes itself. The same happens
//! to a single topic when the relay reports that it fell behind on it.
//!
//! All local subscribers of a topic share one relay subscription and wait
//! on the same acknowledgement.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::clock::ReplicaId;
use crate::presence::PresenceMeta;
use crate::relay::RelayFrame;
use crate::transport::{Subscription, SubscriptionId, Transport, TransportError, TransportEvent};

/// How long `subscribe` waits for the relay's acknowledgement.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

const TOPIC_CAPACITY: usize = 256;

/// Relay's answer to a `Subscribe`; `None` while it is outstanding.
type Ack = Option<Result<(), TransportError>>;

struct TopicChannel {
    sender: broadcast::Sender<TransportEvent>,
    subscriptions: HashSet<SubscriptionId>,
    request: u64,
    ack: watch::Receiver<Ack>,
}

impl TopicChannel {
    fn refused(&self) -> bool {
        matches!(*self.ack.borrow(), Some(Err(_)))
    }
}

struct Shared {
    topics: Mutex<HashMap<String, TopicChannel>>,
    pending: Mutex<HashMap<u64, watch::Sender<Ack>>>,
    connected: AtomicBool,
}

impl Shared {
    fn route(&self, topic: &str, event: TransportEvent) {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        match topics.get(topic) {
            Some(channel) => {
                let _ = channel.sender.send(event);
            }
            None => log::debug!("Frame for unsubscribed topic {topic} dropped"),
        }
    }

    fn acknowledge(&self, request: u64, result: Result<(), TransportError>) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request);
        if let Some(waiter) = waiter {
            waiter.send_replace(Some(result));
        }
    }

    /// The relay stopped forwarding `topic`: end its local streams and
    /// release the relay side.
    fn overrun(&self, topic: &str, outgoing: &mpsc::WeakUnboundedSender<RelayFrame>) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if topics.remove(topic).is_none() {
            return;
        }
        // under the lock, so a new Subscribe cannot overtake it
        if let Some(outgoing) = outgoing.upgrade() {
            let _ = outgoing.send(RelayFrame::Unsubscribe {
                topic: topic.to_string(),
            });
        }
    }

    fn disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.topics.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// [`Transport`] over a WebSocket connection to a relay.
pub struct WsTransport {
    url: String,
    outgoing: mpsc::UnboundedSender<RelayFrame>,
    shared: Arc<Shared>,
    next_request: AtomicU64,
    next_subscription: AtomicU64,
}

impl WsTransport {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9090`).
    ///
    /// Spawns the reader and writer tasks.
    pub async fn connect(url: impl Into<String>) -> Result<Self, TransportError> {
        let url = url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("Connected to relay at {url}");

        let shared = Arc::new(Shared {
            topics: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        });

        // Writer task: outgoing queue → socket. Ends when the transport is dropped.
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: socket → topic channels. A weak sender keeps the
        // writer's lifetime tied to the transport.
        let reader_shared = shared.clone();
        let replies = outgoing.downgrade();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match RelayFrame::decode(&data) {
                        Ok(frame) => handle_frame(&reader_shared, frame, &replies),
                        Err(e) => log::warn!("Malformed relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            log::warn!("Relay connection lost");
            reader_shared.disconnected();
        });

        Ok(Self {
            url,
            outgoing,
            shared,
            next_request: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: RelayFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        self.outgoing
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn subscribe_remote(&self, topic: &str) -> Result<Subscription, TransportError> {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);

        // Attach the receiver before asking, so nothing published after the
        // relay's ack can be missed. Later subscribers join the pending ack.
        let (receiver, request, ack, first) = {
            let mut topics = self.shared.topics.lock().unwrap_or_else(PoisonError::into_inner);
            let joinable = topics.get(topic).is_some_and(|c| !c.refused());
            if !joinable {
                let request = self.next_request.fetch_add(1, Ordering::Relaxed);
                let (ack_tx, ack_rx) = watch::channel(None);
                self.shared
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(request, ack_tx);
                topics.insert(
                    topic.to_string(),
                    TopicChannel {
                        sender: broadcast::channel(TOPIC_CAPACITY).0,
                        subscriptions: HashSet::new(),
                        request,
                        ack: ack_rx,
                    },
                );
            }
            let Some(channel) = topics.get_mut(topic) else {
                return Err(TransportError::ConnectionClosed);
            };
            channel.subscriptions.insert(id);
            (channel.sender.subscribe(), channel.request, channel.ack.clone(), !joinable)
        };

        if first {
            let sent = self.send(RelayFrame::Subscribe {
                request,
                topic: topic.to_string(),
            });
            if let Err(e) = sent {
                self.shared.acknowledge(request, Err(e.clone()));
                self.forget(topic, id);
                return Err(e);
            }
        }

        if let Err(e) = self.await_ack(request, ack).await {
            self.forget(topic, id);
            return Err(e);
        }
        log::debug!("Subscription {id} on {topic} confirmed");
        Ok(Subscription::new(id, topic, receiver))
    }

    /// Wait for the relay to answer `request`. A timeout is shared with
    /// every other subscriber waiting on the same request.
    async fn await_ack(
        &self,
        request: u64,
        mut ack: watch::Receiver<Ack>,
    ) -> Result<(), TransportError> {
        let answer = tokio::time::timeout(SUBSCRIBE_TIMEOUT, async {
            ack.wait_for(Option::is_some).await.map(|answer| answer.clone())
        })
        .await;
        match answer {
            Ok(Ok(Some(result))) => result,
            Ok(Ok(None)) | Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.shared.acknowledge(request, Err(TransportError::Timeout));
                Err(TransportError::Timeout)
            }
        }
    }

    /// Drop one subscription; returns `true` if it was the topic's last.
    fn forget(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = self.shared.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(channel) = topics.get_mut(topic) else {
            return false;
        };
        if !channel.subscriptions.remove(&id) {
            return false;
        }
        if channel.subscriptions.is_empty() {
            topics.remove(topic);
            return true;
        }
        false
    }

    fn unsubscribe_now(&self, topic: &str, id: SubscriptionId) -> Result<(), TransportError> {
        let known = self
            .shared
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .is_some_and(|c| c.subscriptions.contains(&id));
        if !known {
            return Err(TransportError::UnknownSubscription {
                topic: topic.to_string(),
                id,
            });
        }
        if self.forget(topic, id) {
            self.send(RelayFrame::Unsubscribe {
                topic: topic.to_string(),
            })?;
        }
        Ok(())
    }
}

fn handle_frame(
    shared: &Shared,
    frame: RelayFrame,
    outgoing: &mpsc::WeakUnboundedSender<RelayFrame>,
) {
    match frame {
        RelayFrame::Subscribed { request, .. } => shared.acknowledge(request, Ok(())),
        RelayFrame::Rejected { request, topic, reason } => {
            shared.acknowledge(request, Err(TransportError::SubscriptionRejected { topic, reason }))
        }
        RelayFrame::Message { topic, payload } => {
            shared.route(&topic, TransportEvent::Message(Arc::new(payload)))
        }
        RelayFrame::PresenceSync { topic, members } => {
            shared.route(&topic, TransportEvent::PresenceSync(members))
        }
        RelayFrame::Lagged { topic, skipped } => {
            log::warn!("Relay dropped {skipped} messages on {topic}; ending its subscriptions");
            shared.overrun(&topic, outgoing);
        }
        other => log::warn!("Unexpected relay frame {other:?}"),
    }
}

impl Transport for WsTransport {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<Subscription, TransportError>> {
        self.subscribe_remote(topic).boxed()
    }

    fn unsubscribe<'a>(
        &'a self,
        topic: &'a str,
        id: SubscriptionId,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move { self.unsubscribe_now(topic, id) }.boxed()
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send(RelayFrame::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    fn track_presence<'a>(
        &'a self,
        topic: &'a str,
        meta: PresenceMeta,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            self.send(RelayFrame::Track {
                topic: topic.to_string(),
                meta,
            })
        }
        .boxed()
    }

    fn untrack_presence<'a>(
        &'a self,
        topic: &'a str,
        replica: &'a ReplicaId,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            self.send(RelayFrame::Untrack {
                topic: topic.to_string(),
                replica: replica.clone(),
            })
        }
        .boxed()
    }
}
