use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use medibridge_types::events::RelayEvent;

/// Identifies one live websocket. A user reconnecting gets a fresh id.
pub type ConnId = Uuid;

struct ConnectionEntry {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

/// Room registry: which live connections belong to which session.
///
/// Both maps sit behind std locks that are only held for the duration of a
/// map operation, never across an await. Outbound events go through
/// per-connection unbounded channels so a broadcast never waits on a slow
/// socket, and each connection sees events in the order they were queued.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// conn_id -> (user_id, sender)
    connections: RwLock<HashMap<ConnId, ConnectionEntry>>,

    /// session_id -> members. Rooms are created on first join and dropped
    /// when the last member leaves.
    rooms: RwLock<HashMap<Uuid, HashSet<ConnId>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a live connection. Returns (conn_id, receiver of events
    /// addressed to it).
    pub fn register_connection(&self, user_id: Uuid) -> (ConnId, mpsc::UnboundedReceiver<RelayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn_id, ConnectionEntry { user_id, tx });
        (conn_id, rx)
    }

    /// Forget a connection and remove it from every room it was in.
    pub fn unregister_connection(&self, conn_id: ConnId) {
        let removed = self
            .inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn_id);
        if let Some(entry) = removed {
            debug!("conn {} of {} unregistered", conn_id, entry.user_id);
        }

        let mut rooms = self.inner.rooms.write().unwrap_or_else(PoisonError::into_inner);
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    /// Add a connection to a session's room. Returns false if it was
    /// already a member, in which case nothing changes.
    pub fn join(&self, session_id: Uuid, conn_id: ConnId) -> bool {
        let added = self
            .inner
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id)
            .or_default()
            .insert(conn_id);
        debug!("conn {} join room {} (new: {})", conn_id, session_id, added);
        added
    }

    /// Remove a connection from a session's room. Returns false if it was
    /// not a member.
    pub fn leave(&self, session_id: Uuid, conn_id: ConnId) -> bool {
        let mut rooms = self.inner.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = rooms.get_mut(&session_id) else {
            return false;
        };
        let removed = members.remove(&conn_id);
        if members.is_empty() {
            rooms.remove(&session_id);
        }
        removed
    }

    pub fn room_size(&self, session_id: Uuid) -> usize {
        self.inner
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .map_or(0, HashSet::len)
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Queue an event for every member of a room. Returns how many
    /// connections it was queued for; an empty or missing room is a no-op.
    pub fn broadcast_to_room(&self, session_id: Uuid, event: RelayEvent) -> usize {
        self.fan_out(session_id, event, None)
    }

    /// Same as `broadcast_to_room`, skipping one connection.
    pub fn broadcast_to_room_except(&self, session_id: Uuid, event: RelayEvent, skip: ConnId) -> usize {
        self.fan_out(session_id, event, Some(skip))
    }

    fn fan_out(&self, session_id: Uuid, event: RelayEvent, skip: Option<ConnId>) -> usize {
        let rooms = self.inner.rooms.read().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = rooms.get(&session_id) else {
            return 0;
        };
        let connections = self.inner.connections.read().unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        for conn_id in members {
            if Some(*conn_id) == skip {
                continue;
            }
            if let Some(conn) = connections.get(conn_id) {
                if conn.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}
