//! Database row types, mapped directly from SQLite rows.
//! Distinct from medibridge-types models to keep the DB layer independent.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use medibridge_types::models::{ConsultationSession, Message, SessionStatus};
use uuid::Uuid;

pub struct SessionRow {
    pub id: String,
    pub patient_id: String,
    pub doctor_id: Option<String>,
    pub status: String,
    pub patient_language: Option<String>,
    pub doctor_language: Option<String>,
}

pub struct MessageRow {
    pub id: String,
    pub session_id: String,
    pub sender_id: String,
    pub content: String,
    pub translated_content: Option<String>,
    pub audio_url: Option<String>,
    /// RFC 3339, UTC, fixed microsecond precision so text order is time order.
    pub created_at: String,
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_uuid(&self.id, "id")?,
            session_id: parse_uuid(&self.session_id, "session_id")?,
            sender_id: parse_uuid(&self.sender_id, "sender_id")?,
            created_at: parse_timestamp(&self.created_at)
                .with_context(|| format!("corrupt created_at on message '{}'", self.id))?,
            content: self.content,
            translated_content: self.translated_content,
            audio_url: self.audio_url,
        })
    }
}

impl SessionRow {
    pub fn into_session(self) -> Result<ConsultationSession> {
        let doctor_id = match self.doctor_id.as_deref() {
            Some(id) => Some(parse_uuid(id, "doctor_id")?),
            None => None,
        };
        Ok(ConsultationSession {
            id: parse_uuid(&self.id, "id")?,
            patient_id: parse_uuid(&self.patient_id, "patient_id")?,
            doctor_id,
            status: SessionStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown session status '{}'", self.status))?,
            patient_language: self.patient_language,
            doctor_language: self.doctor_language,
        })
    }
}

fn parse_uuid(raw: &str, column: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("corrupt {} '{}'", column, raw))
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
