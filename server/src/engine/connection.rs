use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::events::{ClientId, CloseReason, Payload, RoomId};

/// Maximum queued outbound messages per connection (a slow client drops instead of stalling the room).
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

/// One client attached to one room.
///
/// The registry entry owns the `Arc`. The write pump never sees this struct, only
/// the receiving halves in [`Outlet`], so once every `Arc<Connection>` is dropped the
/// outbound queue closes and the pump exits.
#[derive(Debug)]
pub struct Connection {
    pub room_id: RoomId,
    pub client_id: ClientId,
    /// Authenticated user id (None for anonymous sessions).
    pub user_id: Option<String>,
    pub nickname: String,
    outbound: mpsc::Sender<Payload>,
    teardown: mpsc::Sender<CloseReason>,
    /// Monotonic base for `last_seen`.
    opened_at: Instant,
    /// Millis after `opened_at` of the last client-originated frame. Only moves forward.
    last_seen: AtomicU64,
    closed: AtomicBool,
}

/// Receiving side of a connection, consumed by its write pump.
#[derive(Debug)]
pub struct Outlet {
    pub outbound: mpsc::Receiver<Payload>,
    pub teardown: mpsc::Receiver<CloseReason>,
}

impl Connection {
    pub fn new(
        room_id: impl Into<RoomId>,
        client_id: impl Into<ClientId>,
        user_id: Option<String>,
        nickname: impl Into<String>,
        queue_capacity: usize,
    ) -> (Arc<Self>, Outlet) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        // Single slot: a pending teardown is never queued twice.
        let (teardown_tx, teardown_rx) = mpsc::channel(1);

        let conn = Arc::new(Self {
            room_id: room_id.into(),
            client_id: client_id.into(),
            user_id,
            nickname: nickname.into(),
            outbound: outbound_tx,
            teardown: teardown_tx,
            opened_at: Instant::now(),
            last_seen: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let outlet = Outlet {
            outbound: outbound_rx,
            teardown: teardown_rx,
        };

        (conn, outlet)
    }

    /// Queue a payload for this client without waiting.
    pub fn enqueue(&self, payload: Payload) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Record client activity now.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Record activity at `at`. An instant older than the current mark is ignored.
    pub fn touch_at(&self, at: Instant) {
        let offset = at.saturating_duration_since(self.opened_at).as_millis() as u64;
        self.last_seen.fetch_max(offset, Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> Instant {
        self.opened_at + Duration::from_millis(self.last_seen.load(Ordering::Relaxed))
    }

    /// Time since the last client frame as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen())
    }

    /// Ask the write pump to stop. Returns false when a signal is already pending
    /// or the pump is gone; never blocks.
    pub fn signal_teardown(&self, reason: CloseReason) -> bool {
        self.teardown.try_send(reason).is_ok()
    }

    /// Refuse further enqueues and tell the pump to stop.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.closed.store(true, Ordering::Release);
        self.signal_teardown(reason)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outbound.is_closed()
    }

    /// Whether this connection belongs to `user` (by session id or authenticated id).
    pub fn belongs_to(&self, user: &str) -> bool {
        self.client_id == user || self.user_id.as_deref() == Some(user)
    }
}
