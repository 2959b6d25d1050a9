use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Role;

/// Page size used when the client does not ask for one.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
/// Larger requests are clamped to this.
pub const MAX_PAGE_LIMIT: u32 = 100;

// -- JWT Claims --

/// Claims issued by the external auth service and checked by both the REST
/// middleware and the websocket upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: usize,
}

// -- Messages --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub sender_language: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    /// Id of the last message already seen; only strictly newer messages are
    /// returned.
    #[serde(default)]
    pub cursor: Option<String>,
}

impl MessageQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
