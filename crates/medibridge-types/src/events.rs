use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessagePatch};

/// Events sent FROM the relay TO connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RelayEvent {
    /// Connection accepted and authenticated
    Ready { user_id: Uuid },

    /// Phase 1: a message was persisted, translation not yet applied
    NewMessage(Message),

    /// Phase 2: in-place enrichment of a message already delivered
    MessageUpdated(MessagePatch),

    /// Another participant joined the room
    UserJoined { session_id: Uuid, user_id: Uuid },
}

/// Commands sent FROM a client TO the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RelayCommand {
    JoinRoom { session_id: Uuid },
    LeaveRoom { session_id: Uuid },
}
