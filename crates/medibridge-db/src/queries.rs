use crate::Database;
use crate::models::{MessageRow, SessionRow, format_timestamp};
use anyhow::Result;
use chrono::Utc;
use medibridge_types::models::{ConsultationSession, Message, Role, SessionStatus};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

/// Why a page of history could not be produced.
#[derive(Debug, thiserror::Error)]
pub enum PageError {
    /// The cursor does not name a message of this session.
    #[error("unknown cursor {0}")]
    UnknownCursor(Uuid),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for PageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.into())
    }
}

const MESSAGE_COLUMNS: &str =
    "id, session_id, sender_id, content, translated_content, audio_url, created_at";

impl Database {
    // -- Sessions --

    /// Creates a waiting consultation. Session lifecycle belongs to another
    /// service; this exists for tests.
    pub fn create_session(
        &self,
        patient_id: Uuid,
        patient_language: Option<&str>,
    ) -> Result<ConsultationSession> {
        let id = Uuid::new_v4();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, patient_id, status, patient_language) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    id.to_string(),
                    patient_id.to_string(),
                    SessionStatus::Waiting.as_str(),
                    patient_language
                ],
            )?;
            Ok(())
        })?;
        self.get_session(id)?
            .ok_or_else(|| anyhow::anyhow!("session {} vanished after insert", id))
    }

    pub fn assign_doctor(
        &self,
        session_id: Uuid,
        doctor_id: Uuid,
        doctor_language: Option<&str>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET doctor_id = ?2, doctor_language = ?3, status = ?4 WHERE id = ?1",
                rusqlite::params![
                    session_id.to_string(),
                    doctor_id.to_string(),
                    doctor_language,
                    SessionStatus::Active.as_str()
                ],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<ConsultationSession>> {
        let row = self.with_conn(|conn| query_session(conn, &id.to_string()))?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Records the language a participant says they speak.
    pub fn set_participant_language(&self, session_id: Uuid, role: Role, language: &str) -> Result<()> {
        let sql = match role {
            Role::Patient => "UPDATE sessions SET patient_language = ?2 WHERE id = ?1",
            Role::Doctor => "UPDATE sessions SET doctor_language = ?2 WHERE id = ?1",
        };
        self.with_conn(|conn| {
            conn.execute(sql, rusqlite::params![session_id.to_string(), language])?;
            Ok(())
        })
    }

    // -- Messages --

    /// Appends a message and returns it with its server-assigned id.
    ///
    /// `created_at` never goes backwards within a session: if the clock
    /// reads earlier than the newest stored message, that message's timestamp
    /// is reused and `seq` orders the two.
    pub fn insert_message(
        &self,
        session_id: Uuid,
        sender_id: Uuid,
        content: &str,
        translated_content: Option<&str>,
        audio_url: Option<&str>,
    ) -> Result<Message> {
        let id = Uuid::new_v4().to_string();
        let sid = session_id.to_string();

        let row = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let newest: Option<String> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE session_id = ?1",
                [&sid],
                |row| row.get(0),
            )?;
            let now = format_timestamp(Utc::now());
            let created_at = match newest {
                Some(newest) if newest > now => newest,
                _ => now,
            };

            tx.execute(
                "INSERT INTO messages (id, session_id, sender_id, content, translated_content, audio_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id,
                    sid,
                    sender_id.to_string(),
                    content,
                    translated_content,
                    audio_url,
                    created_at
                ],
            )?;
            tx.commit()?;

            Ok(MessageRow {
                id: id.clone(),
                session_id: sid.clone(),
                sender_id: sender_id.to_string(),
                content: content.to_string(),
                translated_content: translated_content.map(str::to_string),
                audio_url: audio_url.map(str::to_string),
                created_at,
            })
        })?;

        row.into_message()
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let row = self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
            Ok(conn
                .query_row(&sql, [id.to_string()], map_message_row)
                .optional()?)
        })?;
        row.map(MessageRow::into_message).transpose()
    }

    /// Ascending page of a session's history.
    ///
    /// Without a cursor the earliest page is returned. With one, only
    /// messages strictly after the cursor message are returned.
    pub fn get_messages_page(
        &self,
        session_id: Uuid,
        limit: u32,
        cursor: Option<Uuid>,
    ) -> Result<Vec<Message>, PageError> {
        let sid = session_id.to_string();

        let rows = self
            .with_conn(|conn| Ok(query_page(conn, &sid, limit, cursor)))
            .map_err(PageError::Storage)??;

        rows.into_iter()
            .map(|row| row.into_message().map_err(PageError::Storage))
            .collect()
    }

    /// Sets the translation of a message. Returns the message's session, or
    /// `None` if no such message exists. Writing the same value twice is a
    /// no-op.
    pub fn update_translation(&self, message_id: Uuid, translated: &str) -> Result<Option<Uuid>> {
        let session_id: Option<String> = self.with_conn(|conn| {
            let mid = message_id.to_string();
            let changed = conn.execute(
                "UPDATE messages SET translated_content = ?2 WHERE id = ?1",
                rusqlite::params![mid, translated],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            Ok(conn
                .query_row("SELECT session_id FROM messages WHERE id = ?1", [&mid], |row| row.get(0))
                .optional()?)
        })?;

        session_id
            .map(|s| s.parse::<Uuid>().map_err(anyhow::Error::from))
            .transpose()
    }
}

fn query_session(conn: &Connection, id: &str) -> Result<Option<SessionRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, doctor_id, status, patient_language, doctor_language
         FROM sessions WHERE id = ?1",
    )?;

    let row = stmt
        .query_row([id], |row| {
            Ok(SessionRow {
                id: row.get(0)?,
                patient_id: row.get(1)?,
                doctor_id: row.get(2)?,
                status: row.get(3)?,
                patient_language: row.get(4)?,
                doctor_language: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_page(
    conn: &Connection,
    session_id: &str,
    limit: u32,
    cursor: Option<Uuid>,
) -> Result<Vec<MessageRow>, PageError> {
    let rows = match cursor {
        None => {
            let sql = format!(
                "SELECT {} FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, seq ASC LIMIT ?2",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(rusqlite::params![session_id, limit], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        Some(cursor_id) => {
            let anchor: Option<(String, i64)> = conn
                .query_row(
                    "SELECT created_at, seq FROM messages WHERE id = ?1 AND session_id = ?2",
                    rusqlite::params![cursor_id.to_string(), session_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (created_at, seq) = anchor.ok_or(PageError::UnknownCursor(cursor_id))?;

            let sql = format!(
                "SELECT {} FROM messages
                 WHERE session_id = ?1
                   AND (created_at > ?2 OR (created_at = ?2 AND seq > ?3))
                 ORDER BY created_at ASC, seq ASC
                 LIMIT ?4",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(
                rusqlite::params![session_id, created_at, seq, limit],
                map_message_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(rows)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        translated_content: row.get(4)?,
        audio_url: row.get(5)?,
        created_at: row.get(6)?,
    })
}
