use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            id                TEXT PRIMARY KEY,
            patient_id        TEXT NOT NULL,
            doctor_id         TEXT,
            status            TEXT NOT NULL DEFAULT 'waiting',
            patient_language  TEXT,
            doctor_language   TEXT,
            created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        -- seq breaks created_at ties so cursor paging never skips a row
        CREATE TABLE IF NOT EXISTS messages (
            seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
            id                  TEXT NOT NULL UNIQUE,
            session_id          TEXT NOT NULL,
            sender_id           TEXT NOT NULL,
            content             TEXT NOT NULL,
            translated_content  TEXT,
            audio_url           TEXT,
            created_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, created_at, seq);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
