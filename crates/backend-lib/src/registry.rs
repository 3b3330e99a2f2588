// ============================
// relay-backend-lib/src/registry.rs
// ============================
//! Room registry.
//!
//! Maps each room key to the connections currently streaming from it.
//! The registry holds non-owning handles: the sending half of each
//! connection's frame queue. The receiving half belongs to the streaming
//! endpoint, which must call `unregister` when the request ends.
//!
//! All operations are in-memory and never fail; unknown rooms behave as
//! empty rooms and removing an unknown connection is a no-op.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_common::User;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::Frame;

/// Identity of one physical streaming connection
pub type ConnectionId = Uuid;

/// Registry-side view of an open connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Internal identity, distinct per connection even for the same user
    pub id: ConnectionId,
    /// User the connection was opened for
    pub user: User,
    /// Time the stream was opened
    pub opened_at: DateTime<Utc>,
    /// Frame queue of the connection
    pub sink: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    pub fn new(user: User, sink: mpsc::Sender<Frame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            opened_at: Utc::now(),
            sink,
        }
    }
}

/// Outcome of `register`
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    /// False when the same connection was already registered
    pub inserted: bool,
    /// True when no other connection of this user was in the room
    pub first_for_user: bool,
    /// Distinct members after the registration
    pub members: Vec<User>,
}

/// Room as seen by a `register_with` callback, under the room lock
#[derive(Debug, Clone, Copy)]
pub struct Admitted<'a> {
    /// The connection just added
    pub conn: &'a ConnectionHandle,
    /// Distinct members, the new connection's user included
    pub members: &'a [User],
    pub first_for_user: bool,
    /// Every connection of the room, the new one last
    pub connections: &'a [ConnectionHandle],
}

/// Outcome of a successful `unregister`
#[derive(Debug, Clone, PartialEq)]
pub struct Unregistration {
    /// User the removed connection belonged to
    pub user: User,
    /// True when the user has no connection left in the room
    pub last_for_user: bool,
    /// True when the room has no connection left
    pub room_empty: bool,
}

#[derive(Debug, Default)]
struct RoomEntry {
    /// Kept in registration order
    connections: Vec<ConnectionHandle>,
}

impl RoomEntry {
    fn has_user(&self, user_id: &str) -> bool {
        self.connections.iter().any(|c| c.user.id == user_id)
    }

    fn members(&self) -> Vec<User> {
        let mut members: Vec<User> = Vec::with_capacity(self.connections.len());
        for conn in &self.connections {
            if !members.iter().any(|m| m.id == conn.user.id) {
                members.push(conn.user.clone());
            }
        }
        members
    }
}

/// In-memory room membership
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, RoomEntry>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room
    pub fn register(&self, room: &str, conn: ConnectionHandle) -> Registration {
        self.register_with(room, conn, |_| {})
    }

    /// Add a connection to a room and run `on_registered` before the room
    /// is released to other writers or to fan-out readers.
    ///
    /// Anything the callback pushes into a sink is therefore queued ahead
    /// of every frame produced by a later registration, removal or publish
    /// snapshot of the same room. It is not called when the connection was
    /// already registered.
    pub fn register_with<F>(&self, room: &str, conn: ConnectionHandle, on_registered: F) -> Registration
    where
        F: FnOnce(Admitted<'_>),
    {
        let mut entry = self.rooms.entry(room.to_string()).or_default();

        if entry.connections.iter().any(|c| c.id == conn.id) {
            return Registration {
                inserted: false,
                first_for_user: false,
                members: entry.members(),
            };
        }

        let first_for_user = !entry.has_user(&conn.user.id);
        entry.connections.push(conn);
        let members = entry.members();
        let entry = &*entry;
        if let Some(conn) = entry.connections.last() {
            on_registered(Admitted {
                conn,
                members: &members,
                first_for_user,
                connections: &entry.connections,
            });
        }

        Registration {
            inserted: true,
            first_for_user,
            members,
        }
    }

    /// Remove a connection; returns `None` if it was not registered
    pub fn unregister(&self, room: &str, id: ConnectionId) -> Option<Unregistration> {
        self.unregister_with(room, id, |_, _| {})
    }

    /// Remove a connection and run `on_removed` with the remaining
    /// connections while the room is still locked
    pub fn unregister_with<F>(&self, room: &str, id: ConnectionId, on_removed: F) -> Option<Unregistration>
    where
        F: FnOnce(&Unregistration, &[ConnectionHandle]),
    {
        let removed = {
            let mut entry = self.rooms.get_mut(room)?;
            let pos = entry.connections.iter().position(|c| c.id == id)?;
            let conn = entry.connections.remove(pos);
            let removed = Unregistration {
                last_for_user: !entry.has_user(&conn.user.id),
                room_empty: entry.connections.is_empty(),
                user: conn.user,
            };
            on_removed(&removed, &entry.connections);
            removed
        };

        if removed.room_empty {
            // A registration may have slipped in between the two locks
            self.rooms.remove_if(room, |_, entry| entry.connections.is_empty());
        }

        Some(removed)
    }

    /// Distinct users in a room, in order of first registration
    pub fn list_members(&self, room: &str) -> Vec<User> {
        self.rooms
            .get(room)
            .map(|entry| entry.members())
            .unwrap_or_default()
    }

    /// Snapshot of the connections to fan an event out to
    pub fn recipients(&self, room: &str) -> Vec<ConnectionHandle> {
        self.rooms
            .get(room)
            .map(|entry| entry.connections.clone())
            .unwrap_or_default()
    }

    /// Whether a given connection is registered in a room
    pub fn contains(&self, room: &str, id: ConnectionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|entry| entry.connections.iter().any(|c| c.id == id))
    }

    /// Open connections in one room
    pub fn connection_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |entry| entry.connections.len())
    }

    /// Rooms with at least one connection
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Open connections across all rooms
    pub fn total_connections(&self) -> usize {
        self.rooms.iter().map(|entry| entry.connections.len()).sum()
    }
}
