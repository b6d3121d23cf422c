use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broadcaster::{Broadcaster, Envelope};
use super::dedup::DedupCache;
use super::events::{BroadcastMessage, Payload, RoomId};
use super::registry::RoomRegistry;

/// Messages received on one broker channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = Payload> + Send>>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("broker channel closed")]
    Closed,
}

/// A shared pub/sub bus connecting server instances.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: Payload) -> Result<(), RelayError>;
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RelayError>;
}

/// Capacity of each in-memory channel; lagging subscribers skip ahead.
const IN_MEMORY_CHANNEL_CAPACITY: usize = 1024;

/// Process-local bus. Several hubs in one process can share it to behave like
/// separate instances behind one broker.
///
/// A channel exists only while it has subscribers; the last stream to be
/// dropped removes it.
#[derive(Default)]
pub struct InMemoryBroker {
    channels: Arc<DashMap<String, broadcast::Sender<Payload>>>,
}

/// Receiving end of one in-memory subscription.
struct Subscriber {
    rx: broadcast::Receiver<Payload>,
    channel: String,
    channels: Arc<DashMap<String, broadcast::Sender<Payload>>>,
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        // `self.rx` is still alive here, so a count of one means no one else listens.
        self.channels
            .remove_if(&self.channel, |_, tx| tx.receiver_count() <= 1);
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channels with at least one live subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: Payload) -> Result<(), RelayError> {
        // No subscribers is not an error on a pub/sub bus.
        let sender = self.channels.get(channel).map(|tx| tx.clone());
        if let Some(tx) = sender {
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RelayError> {
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(IN_MEMORY_CHANNEL_CAPACITY).0)
            .subscribe();
        let subscriber = Subscriber {
            rx,
            channel: channel.to_string(),
            channels: self.channels.clone(),
        };
        let stream = futures_util::stream::unfold(subscriber, |mut sub| async move {
            loop {
                match sub.rx.recv().await {
                    Ok(payload) => return Some((payload, sub)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %sub.channel, skipped, "relay subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Broker channel name for a room: `<prefix><room><suffix>`.
#[derive(Debug, Clone)]
pub struct ChannelNaming {
    pub prefix: String,
    pub suffix: String,
}

impl Default for ChannelNaming {
    fn default() -> Self {
        Self {
            prefix: "room:".into(),
            suffix: ":messages".into(),
        }
    }
}

impl ChannelNaming {
    pub fn channel_for(&self, room_id: &str) -> String {
        format!("{}{}{}", self.prefix, room_id, self.suffix)
    }
}

/// What happened to a message that came back through the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Delivered to this many local connections.
    Delivered(usize),
    /// Already authored or delivered here.
    Duplicate,
    /// Unparseable or addressed to another room.
    Rejected,
}

struct Subscription {
    id: u64,
    cancel: CancellationToken,
}

/// Mirrors room messages across instances through a [`Broker`].
pub struct DistributedRelay {
    broker: Arc<dyn Broker>,
    registry: Arc<RoomRegistry>,
    broadcaster: Arc<Broadcaster>,
    dedup: Arc<DedupCache>,
    naming: ChannelNaming,
    subscriptions: DashMap<RoomId, Subscription>,
    next_subscription: AtomicU64,
    shutdown: CancellationToken,
}

impl DistributedRelay {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<RoomRegistry>,
        broadcaster: Arc<Broadcaster>,
        dedup: Arc<DedupCache>,
        naming: ChannelNaming,
    ) -> Self {
        Self {
            broker,
            registry,
            broadcaster,
            dedup,
            naming,
            subscriptions: DashMap::new(),
            next_subscription: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn channel_for(&self, room_id: &str) -> String {
        self.naming.channel_for(room_id)
    }

    /// Publish a locally authored message. Its id is recorded first so the copy
    /// that comes back through the broker is discarded.
    pub async fn publish(&self, envelope: &Envelope) -> Result<(), RelayError> {
        self.dedup.record(&envelope.message.uid);
        let room_id = &envelope.message.room_id;
        let channel = self.channel_for(room_id);
        self.broker
            .publish(&channel, envelope.payload.clone())
            .await
            .inspect_err(|e| warn!(%room_id, error = %e, "relay publish failed"))
    }

    /// Start the inbound subscription for a room. Subscribing an already
    /// subscribed room is a no-op. Returns whether a new subscription started.
    pub async fn ensure_subscribed(self: &Arc<Self>, room_id: &str) -> bool {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let cancel = match self.subscriptions.entry(room_id.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(entry) => {
                let cancel = self.shutdown.child_token();
                entry.insert(Subscription {
                    id,
                    cancel: cancel.clone(),
                });
                cancel
            }
        };

        let channel = self.channel_for(room_id);
        let stream = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = self.broker.subscribe(&channel) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%room_id, error = %e, "relay subscribe failed");
                    self.forget(room_id, id);
                    return false;
                }
            }
        };

        debug!(%room_id, %channel, "relay subscribed");
        let relay = self.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            relay.pump_subscription(room_id, id, stream, cancel).await;
        });
        true
    }

    async fn pump_subscription(
        self: Arc<Self>,
        room_id: RoomId,
        id: u64,
        mut stream: MessageStream,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(payload) => {
                        self.on_relayed_message(&room_id, payload);
                    }
                    None => {
                        warn!(%room_id, "relay stream ended");
                        self.forget(&room_id, id);
                        break;
                    }
                }
            }
        }
        debug!(%room_id, "relay subscription stopped");
    }

    /// Drop the room's subscription if the room has no local occupants.
    /// Holds the subscription entry while checking, so a concurrent
    /// `ensure_subscribed` for a new occupant either sees the old entry or
    /// creates a fresh one after it is gone.
    pub fn release_if_empty(&self, room_id: &str) -> bool {
        match self
            .subscriptions
            .remove_if(room_id, |_, _| !self.registry.contains_room(room_id))
        {
            Some((_, sub)) => {
                sub.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn forget(&self, room_id: &str, id: u64) {
        self.subscriptions.remove_if(room_id, |_, sub| sub.id == id);
    }

    /// Handle one message from the broker.
    pub fn on_relayed_message(&self, room_id: &str, payload: Payload) -> RelayOutcome {
        let message = match BroadcastMessage::from_payload(&payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(%room_id, error = %e, "malformed relay payload");
                return RelayOutcome::Rejected;
            }
        };

        if message.room_id != room_id {
            warn!(%room_id, message_room = %message.room_id, "relay payload for another room");
            return RelayOutcome::Rejected;
        }

        if !self.dedup.check_and_record(&message.uid) {
            return RelayOutcome::Duplicate;
        }

        match self.broadcaster.fan_out(room_id, &payload) {
            Ok(delivered) => RelayOutcome::Delivered(delivered),
            Err(e) => {
                debug!(%room_id, error = %e, "relayed message not fully delivered");
                RelayOutcome::Delivered(0)
            }
        }
    }

    pub fn is_subscribed(&self, room_id: &str) -> bool {
        self.subscriptions.contains_key(room_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Stop every subscription.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.subscriptions.clear();
        info!("relay stopped");
    }
}
