use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::connection::EnqueueError;
use super::events::{BroadcastMessage, Payload, RoomId};
use super::registry::RoomRegistry;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Some recipients had a full queue; their copy was dropped, everyone else got it.
    #[error("{dropped} of {attempted} recipients in room {room_id} had a full queue")]
    Backpressure {
        room_id: RoomId,
        dropped: usize,
        attempted: usize,
    },
}

/// A built message together with its serialized form.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: BroadcastMessage,
    pub payload: Payload,
}

/// Local fan-out to every connection of a room on this instance.
pub struct Broadcaster {
    registry: Arc<RoomRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    /// Build and serialize a message with a fresh id and timestamp.
    pub fn envelope(
        room_id: &str,
        text: &str,
        sender_name: &str,
        sender_id: &str,
    ) -> Result<Envelope, BroadcastError> {
        let message = BroadcastMessage::new(room_id, text, sender_name, sender_id);
        let payload = message.to_payload()?;
        Ok(Envelope { message, payload })
    }

    /// Build a message and deliver it to everyone in the room.
    pub fn broadcast(
        &self,
        room_id: &str,
        text: &str,
        sender_name: &str,
        sender_id: &str,
    ) -> Result<Envelope, BroadcastError> {
        let envelope = Self::envelope(room_id, text, sender_name, sender_id)?;
        self.fan_out(room_id, &envelope.payload)?;
        Ok(envelope)
    }

    /// Deliver an already-serialized payload without re-wrapping it.
    /// Returns the number of recipients that accepted it.
    pub fn fan_out(&self, room_id: &str, payload: &Payload) -> Result<usize, BroadcastError> {
        let mut attempted = 0;
        let mut delivered = 0;
        let mut dropped = 0;

        self.registry.for_each(room_id, |conn| {
            attempted += 1;
            match conn.enqueue(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(EnqueueError::Full) => {
                    dropped += 1;
                    debug!(%room_id, client_id = %conn.client_id, "outbound queue full, message dropped");
                }
                // Already on its way out.
                Err(EnqueueError::Closed) => {}
            }
        });

        if dropped > 0 {
            return Err(BroadcastError::Backpressure {
                room_id: room_id.to_string(),
                dropped,
                attempted,
            });
        }
        Ok(delivered)
    }
}
