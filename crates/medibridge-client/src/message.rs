use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use medibridge_types::models::{Message, TRANSLATION_UNAVAILABLE};

/// After this long without a translation the view stops showing the
/// "translating" indicator. Display only; the server call is not cancelled.
pub const TRANSLATION_DISPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix of optimistic ids when rendered as text.
pub const OPTIMISTIC_ID_PREFIX: &str = "temp-";

/// Either a server-assigned id or a temporary local one. The two can never
/// compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Server(Uuid),
    Optimistic(u64),
}

impl MessageId {
    pub fn is_optimistic(&self) -> bool {
        matches!(self, Self::Optimistic(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{}", id),
            Self::Optimistic(n) => write!(f, "{}{}", OPTIMISTIC_ID_PREFIX, n),
        }
    }
}

/// One entry of a session's message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    pub id: MessageId,
    pub session_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub translated_content: Option<String>,
    pub audio_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What the view should show in place of a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationState<'a> {
    /// Still within the display window, show a "translating" indicator
    Pending,
    Translated(&'a str),
    /// The worker gave up; show the original only, optionally flagged
    Failed,
    /// No translation arrived in time; show the original only
    Unavailable,
}

impl LocalMessage {
    pub fn optimistic(temp: u64, session_id: Uuid, sender_id: Uuid, content: String) -> Self {
        Self {
            id: MessageId::Optimistic(temp),
            session_id,
            sender_id,
            content,
            translated_content: None,
            audio_url: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.is_optimistic()
    }

    /// True for the optimistic placeholder a server copy of `msg` replaces.
    pub fn is_placeholder_for(&self, msg: &Message) -> bool {
        self.is_optimistic() && self.sender_id == msg.sender_id && self.content == msg.content
    }

    pub fn translation_state(&self, now: DateTime<Utc>) -> TranslationState<'_> {
        match self.translated_content.as_deref() {
            Some(TRANSLATION_UNAVAILABLE) => TranslationState::Failed,
            Some(text) => TranslationState::Translated(text),
            None => {
                let age = now.signed_duration_since(self.created_at);
                match age.to_std() {
                    Ok(age) if age >= TRANSLATION_DISPLAY_TIMEOUT => TranslationState::Unavailable,
                    _ => TranslationState::Pending,
                }
            }
        }
    }
}

impl From<Message> for LocalMessage {
    fn from(m: Message) -> Self {
        Self {
            id: MessageId::Server(m.id),
            session_id: m.session_id,
            sender_id: m.sender_id,
            content: m.content,
            translated_content: m.translated_content,
            audio_url: m.audio_url,
            created_at: m.created_at,
        }
    }
}
