use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stored in `translated_content` when the translation worker could not
/// produce a result. Clients render it as a failed translation.
pub const TRANSLATION_UNAVAILABLE: &str = "[Translation temporarily unavailable]";

/// Language assumed for a participant who never stated one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// A persisted chat message, exactly as the Message Store returns it.
///
/// `content` holds the transcript when the message came from audio
/// (`audio_url` is then set). Only `translated_content` changes after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub translated_content: Option<String>,
    pub audio_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Partial update of an already-delivered message. Fields left as `None`
/// are untouched by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub id: Uuid,
    #[serde(default)]
    pub translated_content: Option<String>,
}

impl MessagePatch {
    pub fn translation(id: Uuid, translated_content: impl Into<String>) -> Self {
        Self {
            id,
            translated_content: Some(translated_content.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Which side of a consultation a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
}

/// A doctor/patient consultation. The relay only uses it to authorise
/// participants and to pick translation languages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultationSession {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Option<Uuid>,
    pub status: SessionStatus,
    pub patient_language: Option<String>,
    pub doctor_language: Option<String>,
}

impl ConsultationSession {
    pub fn role_of(&self, user_id: Uuid) -> Option<Role> {
        if self.patient_id == user_id {
            Some(Role::Patient)
        } else if self.doctor_id == Some(user_id) {
            Some(Role::Doctor)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.role_of(user_id).is_some()
    }

    pub fn language_of(&self, role: Role) -> &str {
        let lang = match role {
            Role::Patient => self.patient_language.as_deref(),
            Role::Doctor => self.doctor_language.as_deref(),
        };
        lang.unwrap_or(DEFAULT_LANGUAGE)
    }

    /// Language a message from `role` is translated into: the other side's.
    pub fn target_language_for(&self, role: Role) -> &str {
        match role {
            Role::Patient => self.language_of(Role::Doctor),
            Role::Doctor => self.language_of(Role::Patient),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(patient_lang: Option<&str>, doctor_lang: Option<&str>) -> ConsultationSession {
        ConsultationSession {
            id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            doctor_id: Some(Uuid::new_v4()),
            status: SessionStatus::Active,
            patient_language: patient_lang.map(str::to_string),
            doctor_language: doctor_lang.map(str::to_string),
        }
    }

    #[test]
    fn target_language_is_the_other_participants() {
        let s = session(Some("es"), Some("fr"));
        assert_eq!(s.target_language_for(Role::Patient), "fr");
        assert_eq!(s.target_language_for(Role::Doctor), "es");
    }

    #[test]
    fn missing_language_defaults_to_english() {
        let s = session(Some("es"), None);
        assert_eq!(s.target_language_for(Role::Patient), "en");
    }

    #[test]
    fn role_lookup() {
        let s = session(None, None);
        assert_eq!(s.role_of(s.patient_id), Some(Role::Patient));
        assert_eq!(s.role_of(s.doctor_id.unwrap()), Some(Role::Doctor));
        assert!(!s.is_participant(Uuid::new_v4()));
    }

    #[test]
    fn patch_without_translation_deserializes() {
        let id = Uuid::new_v4();
        let patch: MessagePatch =
            serde_json::from_value(serde_json::json!({ "id": id })).unwrap();
        assert_eq!(patch.translated_content, None);
    }
}
