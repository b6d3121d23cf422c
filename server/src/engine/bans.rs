use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::time::Instant;

use super::events::RoomId;

#[derive(Debug, Error)]
pub enum BanError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanStatus {
    NotBanned,
    /// `remaining` is `None` when the record carries no expiry.
    Banned { remaining: Option<Duration> },
}

impl BanStatus {
    pub fn is_banned(&self) -> bool {
        matches!(self, BanStatus::Banned { .. })
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self {
            BanStatus::Banned { remaining } => *remaining,
            BanStatus::NotBanned => None,
        }
    }
}

/// Time-limited (room, user) bans.
#[async_trait]
pub trait BanStore: Send + Sync {
    /// Record a ban unless one is already active. Returns whether a new record
    /// was written; an active ban is never extended.
    async fn ban(&self, room_id: &str, user_id: &str, ttl: Duration) -> Result<bool, BanError>;

    async fn status(&self, room_id: &str, user_id: &str) -> Result<BanStatus, BanError>;

    /// Drop expired records. Stores with native expiry have nothing to do.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Single-instance ban store. Records expire lazily on lookup and in bulk
/// through [`BanStore::purge_expired`].
#[derive(Default)]
pub struct InMemoryBanStore {
    bans: DashMap<(RoomId, String), Instant>,
}

impl InMemoryBanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}

#[async_trait]
impl BanStore for InMemoryBanStore {
    async fn ban(&self, room_id: &str, user_id: &str, ttl: Duration) -> Result<bool, BanError> {
        let now = Instant::now();
        match self.bans.entry((room_id.to_string(), user_id.to_string())) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    return Ok(false);
                }
                entry.insert(now + ttl);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(now + ttl);
                Ok(true)
            }
        }
    }

    async fn status(&self, room_id: &str, user_id: &str) -> Result<BanStatus, BanError> {
        let key = (room_id.to_string(), user_id.to_string());
        let now = Instant::now();

        let expires_at = match self.bans.get(&key) {
            Some(expiry) => *expiry,
            None => return Ok(BanStatus::NotBanned),
        };

        match expires_at.checked_duration_since(now) {
            Some(remaining) if !remaining.is_zero() => Ok(BanStatus::Banned {
                remaining: Some(remaining),
            }),
            _ => {
                self.bans.remove_if(&key, |_, expiry| *expiry <= now);
                Ok(BanStatus::NotBanned)
            }
        }
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.bans.len();
        self.bans.retain(|_, expiry| *expiry > now);
        before.saturating_sub(self.bans.len())
    }
}
