use std::sync::Arc;

use tracing::debug;

use super::broadcaster::Broadcaster;
use super::connection::Connection;
use super::registry::RoomRegistry;

/// Sender name used for system messages when none is configured.
pub const DEFAULT_SYSTEM_NAME: &str = "roomchat";

pub fn count_message(room_id: &str, occupants: usize) -> String {
    format!("{room_id} ({occupants} connected)")
}

pub fn join_message(nickname: &str) -> String {
    format!("{nickname} joined the room.")
}

pub fn leave_message(nickname: &str) -> String {
    format!("{nickname} left the room.")
}

/// Best-effort join/leave and head-count announcements. Local to this instance.
pub struct PresenceNotifier {
    registry: Arc<RoomRegistry>,
    broadcaster: Arc<Broadcaster>,
    system_name: String,
}

impl PresenceNotifier {
    pub fn new(
        registry: Arc<RoomRegistry>,
        broadcaster: Arc<Broadcaster>,
        system_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            system_name: system_name.into(),
        }
    }

    /// Broadcast the current head count. Skipped for empty rooms.
    pub fn announce_count(&self, room_id: &str) -> usize {
        let occupants = self.registry.count_of(room_id);
        if occupants > 0 {
            let text = count_message(room_id, occupants);
            if let Err(e) = self
                .broadcaster
                .broadcast(room_id, &text, &self.system_name, "")
            {
                debug!(%room_id, error = %e, "presence count not fully delivered");
            }
        }
        occupants
    }

    /// Call after the connection was admitted.
    pub fn announce_join(&self, conn: &Connection) {
        if let Err(e) = self.broadcaster.broadcast(
            &conn.room_id,
            &join_message(&conn.nickname),
            &conn.nickname,
            &conn.client_id,
        ) {
            debug!(room_id = %conn.room_id, error = %e, "join notice not fully delivered");
        }
        self.announce_count(&conn.room_id);
    }

    /// Call after the connection was removed.
    pub fn announce_leave(&self, room_id: &str, nickname: &str, client_id: &str) {
        if self.registry.count_of(room_id) == 0 {
            return;
        }
        if let Err(e) =
            self.broadcaster
                .broadcast(room_id, &leave_message(nickname), nickname, client_id)
        {
            debug!(%room_id, error = %e, "leave notice not fully delivered");
        }
        self.announce_count(room_id);
    }
}
