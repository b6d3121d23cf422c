use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::bans::{BanError, BanStatus, BanStore};
use super::broadcaster::{BroadcastError, Broadcaster, Envelope};
use super::connection::{Connection, DEFAULT_OUTBOUND_QUEUE, Outlet};
use super::dedup::DedupCache;
use super::events::{CloseReason, RoomId};
use super::presence::{DEFAULT_SYSTEM_NAME, PresenceNotifier};
use super::reaper::IdleReaper;
use super::registry::{AdmitError, RoomRegistry};
use super::relay::{Broker, ChannelNaming, DistributedRelay};

/// Tunables for the hub and its background tasks.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub queue_capacity: usize,
    pub idle_grace: Duration,
    pub sweep_interval: Duration,
    pub dedup_clear_interval: Duration,
    pub system_name: String,
    pub channels: ChannelNaming,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_OUTBOUND_QUEUE,
            idle_grace: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(30 * 60),
            dedup_clear_interval: Duration::from_secs(60 * 60),
            system_name: DEFAULT_SYSTEM_NAME.to_string(),
            channels: ChannelNaming::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("banned from room {room_id}")]
    Banned {
        room_id: RoomId,
        remaining: Option<Duration>,
    },
    #[error(transparent)]
    Duplicate(#[from] AdmitError),
    #[error("ban lookup failed: {0}")]
    BanLookup(#[from] BanError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KickError {
    #[error("room {0} has no connections")]
    RoomNotFound(RoomId),
    #[error("user {user_id} is not connected to room {room_id}")]
    UserNotFound { room_id: RoomId, user_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanOutcome {
    /// Connections closed by the accompanying kick.
    pub kicked: usize,
    /// False when an active ban already existed and was left as is.
    pub newly_banned: bool,
}

/// The chat service: owns the registry and wires the broadcaster, presence,
/// relay, reaper and ban store together. Built once at startup and shared
/// by every connection task.
pub struct ChatHub {
    settings: HubSettings,
    registry: Arc<RoomRegistry>,
    broadcaster: Arc<Broadcaster>,
    presence: PresenceNotifier,
    dedup: Arc<DedupCache>,
    relay: Arc<DistributedRelay>,
    bans: Arc<dyn BanStore>,
    reaper: Arc<IdleReaper>,
}

impl ChatHub {
    pub fn new(settings: HubSettings, broker: Arc<dyn Broker>, bans: Arc<dyn BanStore>) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let dedup = Arc::new(DedupCache::new());
        let presence = PresenceNotifier::new(
            registry.clone(),
            broadcaster.clone(),
            settings.system_name.clone(),
        );
        let relay = Arc::new(DistributedRelay::new(
            broker,
            registry.clone(),
            broadcaster.clone(),
            dedup.clone(),
            settings.channels.clone(),
        ));
        let reaper = Arc::new(IdleReaper::new(
            registry.clone(),
            bans.clone(),
            settings.idle_grace,
            settings.sweep_interval,
        ));

        Self {
            settings,
            registry,
            broadcaster,
            presence,
            dedup,
            relay,
            bans,
            reaper,
        }
    }

    /// Spawn the idle reaper and the dedup clear loop. Both stop when `cancel` fires.
    pub fn start(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let reaper = self.reaper.clone();
        let reaper_cancel = cancel.child_token();
        let dedup = self.dedup.clone();
        let dedup_cancel = cancel.child_token();
        let clear_every = self.settings.dedup_clear_interval;

        info!(
            idle_grace_secs = self.settings.idle_grace.as_secs(),
            sweep_interval_secs = self.settings.sweep_interval.as_secs(),
            "chat hub started"
        );

        vec![
            tokio::spawn(async move { reaper.run(reaper_cancel).await }),
            tokio::spawn(async move { dedup.run_clear_loop(clear_every, dedup_cancel).await }),
        ]
    }

    // ── Admission ───────────────────────────────────────────────────

    /// Reject the caller if any of its identities is banned from the room.
    pub async fn check_admission(
        &self,
        room_id: &str,
        subjects: &[&str],
    ) -> Result<(), AdmissionError> {
        for subject in subjects {
            if let BanStatus::Banned { remaining } = self.bans.status(room_id, subject).await? {
                return Err(AdmissionError::Banned {
                    room_id: room_id.to_string(),
                    remaining,
                });
            }
        }
        Ok(())
    }

    /// Register a connection, subscribe the room to the relay and announce the join.
    /// The returned [`Outlet`] belongs to the connection's write pump.
    pub async fn join(
        &self,
        room_id: &str,
        client_id: &str,
        user_id: Option<String>,
        nickname: &str,
    ) -> Result<(Arc<Connection>, Outlet), AdmissionError> {
        let (conn, outlet) = Connection::new(
            room_id,
            client_id,
            user_id,
            nickname,
            self.settings.queue_capacity,
        );

        let admitted = self.registry.admit(conn.clone())?;
        self.relay.ensure_subscribed(room_id).await;
        self.presence.announce_join(&conn);

        info!(
            %room_id,
            %client_id,
            occupants = admitted.occupants,
            "client joined room"
        );
        Ok((conn, outlet))
    }

    // ── Traffic ─────────────────────────────────────────────────────

    /// Broadcast a chat message from `conn` locally and to other instances.
    /// Backpressure refers to local recipients only.
    pub async fn send(&self, conn: &Connection, text: &str) -> Result<Envelope, BroadcastError> {
        conn.touch();
        let envelope =
            Broadcaster::envelope(&conn.room_id, text, &conn.nickname, &conn.client_id)?;
        let local = self.broadcaster.fan_out(&conn.room_id, &envelope.payload);

        // Failures are logged by the relay; local delivery already happened.
        let _ = self.relay.publish(&envelope).await;

        local.map(|_| envelope)
    }

    /// Liveness frame from the client.
    pub fn ping(&self, conn: &Connection) {
        conn.touch();
    }

    /// Remove a connection after its socket closed. Returns false if it had
    /// already been removed or replaced.
    pub fn leave(&self, conn: &Arc<Connection>) -> bool {
        let Some(removed) = self.registry.remove_exact(conn) else {
            return false;
        };

        self.presence
            .announce_leave(&conn.room_id, &conn.nickname, &conn.client_id);
        if removed.room_emptied {
            self.relay.release_if_empty(&conn.room_id);
        }

        info!(
            room_id = %conn.room_id,
            client_id = %conn.client_id,
            occupants = removed.occupants,
            "client left room"
        );
        true
    }

    // ── Moderation ──────────────────────────────────────────────────

    /// Close every connection of `user_id` in the room. Removal and the leave
    /// notice follow on each connection's own disconnect path.
    pub fn kick(&self, room_id: &str, user_id: &str) -> Result<usize, KickError> {
        if !self.registry.contains_room(room_id) {
            return Err(KickError::RoomNotFound(room_id.to_string()));
        }

        let mut kicked = 0;
        self.registry.for_each(room_id, |conn| {
            if conn.belongs_to(user_id) {
                conn.close(CloseReason::Kicked);
                kicked += 1;
            }
        });

        if kicked == 0 {
            return Err(KickError::UserNotFound {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        info!(%room_id, %user_id, kicked, "user kicked");
        Ok(kicked)
    }

    /// Kick the user if present, then record the ban either way.
    pub async fn ban(
        &self,
        room_id: &str,
        user_id: &str,
        duration: Duration,
    ) -> Result<BanOutcome, BanError> {
        let kicked = match self.kick(room_id, user_id) {
            Ok(n) => n,
            Err(e) => {
                debug!(%room_id, %user_id, reason = %e, "ban without kick");
                0
            }
        };

        let newly_banned = self.bans.ban(room_id, user_id, duration).await?;
        info!(
            %room_id,
            %user_id,
            minutes = duration.as_secs() / 60,
            newly_banned,
            "user banned"
        );
        Ok(BanOutcome {
            kicked,
            newly_banned,
        })
    }

    // ── Introspection / lifecycle ───────────────────────────────────

    pub fn occupancy(&self, room_id: &str) -> usize {
        self.registry.count_of(room_id)
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn reaper(&self) -> &IdleReaper {
        &self.reaper
    }

    pub fn relay(&self) -> &Arc<DistributedRelay> {
        &self.relay
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Stop relay subscriptions and ask every connection to close.
    pub fn shutdown(&self) {
        self.relay.shutdown();
        let mut closed = 0;
        for room_id in self.registry.room_ids() {
            self.registry.for_each(&room_id, |conn| {
                conn.close(CloseReason::Shutdown);
                closed += 1;
            });
        }
        info!(closed, "chat hub shut down");
    }
}
