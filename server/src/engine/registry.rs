use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use super::connection::Connection;
use super::events::{ClientId, RoomId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("client {client_id} is already connected to room {room_id}")]
    Duplicate { room_id: RoomId, client_id: ClientId },
}

/// Result of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    /// The room did not exist before this admission.
    pub first_in_room: bool,
    pub occupants: usize,
}

/// Result of removing a connection.
#[derive(Debug)]
pub struct Removed {
    pub connection: Arc<Connection>,
    /// The room entry was deleted because this was its last occupant.
    pub room_emptied: bool,
    pub occupants: usize,
}

/// Who is in which room, on this instance.
///
/// Rooms live in a sharded map and every mutation of one room happens under that
/// room's shard lock, so a room is present exactly when it has occupants and
/// unrelated rooms never wait on each other. Iteration clones the room's `Arc`s and
/// releases the lock before calling back.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomId, HashMap<ClientId, Arc<Connection>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Rejected if the same client id is already in the room.
    pub fn admit(&self, conn: Arc<Connection>) -> Result<Admitted, AdmitError> {
        match self.rooms.entry(conn.room_id.clone()) {
            Entry::Vacant(entry) => {
                let mut members = HashMap::new();
                members.insert(conn.client_id.clone(), conn);
                entry.insert(members);
                Ok(Admitted {
                    first_in_room: true,
                    occupants: 1,
                })
            }
            Entry::Occupied(mut entry) => {
                let members = entry.get_mut();
                if members.contains_key(&conn.client_id) {
                    return Err(AdmitError::Duplicate {
                        room_id: conn.room_id.clone(),
                        client_id: conn.client_id.clone(),
                    });
                }
                members.insert(conn.client_id.clone(), conn);
                Ok(Admitted {
                    first_in_room: false,
                    occupants: members.len(),
                })
            }
        }
    }

    /// Remove a client from a room, deleting the room when it empties.
    pub fn remove(&self, room_id: &str, client_id: &str) -> Option<Removed> {
        let Entry::Occupied(mut entry) = self.rooms.entry(room_id.to_string()) else {
            return None;
        };

        let connection = entry.get_mut().remove(client_id)?;
        let occupants = entry.get().len();
        let room_emptied = occupants == 0;
        if room_emptied {
            entry.remove();
        }

        Some(Removed {
            connection,
            room_emptied,
            occupants,
        })
    }

    /// Remove only if the registered connection is this exact one.
    /// A reconnect with the same client id must not be evicted by the old session's cleanup.
    pub fn remove_exact(&self, conn: &Arc<Connection>) -> Option<Removed> {
        let Entry::Occupied(mut entry) = self.rooms.entry(conn.room_id.clone()) else {
            return None;
        };

        match entry.get().get(&conn.client_id) {
            Some(current) if Arc::ptr_eq(current, conn) => {}
            _ => return None,
        }

        let connection = entry.get_mut().remove(&conn.client_id)?;
        let occupants = entry.get().len();
        let room_emptied = occupants == 0;
        if room_emptied {
            entry.remove();
        }

        Some(Removed {
            connection,
            room_emptied,
            occupants,
        })
    }

    pub fn get(&self, room_id: &str, client_id: &str) -> Option<Arc<Connection>> {
        self.rooms
            .get(room_id)
            .and_then(|members| members.get(client_id).cloned())
    }

    /// Snapshot of a room's connections.
    pub fn members(&self, room_id: &str) -> Vec<Arc<Connection>> {
        self.rooms
            .get(room_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Call `f` for every connection in the room. The room lock is not held during `f`.
    pub fn for_each<F>(&self, room_id: &str, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for conn in self.members(room_id) {
            f(&conn);
        }
    }

    pub fn count_of(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Ids of every room with at least one occupant.
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total connections across all rooms.
    pub fn connection_count(&self) -> usize {
        self.rooms.iter().map(|r| r.value().len()).sum()
    }
}
