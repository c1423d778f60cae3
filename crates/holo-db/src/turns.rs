//! Session and turn history queries.

use holo_types::Turn;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Errors from the turn history store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to encode or decode turn: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("turn {turn_id} is not final and cannot be stored")]
    NotFinal { turn_id: u64 },
}

/// A row from the `sessions` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub companion_id: String,
    pub owner_id: String,
    pub participants: Vec<String>,
    pub created_at: String,
    pub closed_at: Option<String>,
}

/// Records a newly started session. Re-inserting an existing id is a no-op.
pub fn insert_session_record(
    conn: &Connection,
    session_id: &str,
    companion_id: &str,
    participants: &[String],
) -> Result<(), StoreError> {
    let owner = participants.first().map(String::as_str).unwrap_or_default();
    let participants_json = serde_json::to_string(participants)?;
    conn.execute(
        "INSERT OR IGNORE INTO sessions (session_id, companion_id, owner_id, participants_json)
         VALUES (?1, ?2, ?3, ?4)",
        params![session_id, companion_id, owner, participants_json],
    )?;
    Ok(())
}

/// Stamps `closed_at` on a session record. Returns false if the session is
/// unknown or already closed.
pub fn close_session_record(conn: &Connection, session_id: &str) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE sessions SET closed_at = datetime('now')
         WHERE session_id = ?1 AND closed_at IS NULL",
        [session_id],
    )?;
    Ok(changed > 0)
}

/// Loads one session record.
pub fn get_session_record(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<SessionRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT session_id, companion_id, owner_id, participants_json, created_at, closed_at
             FROM sessions WHERE session_id = ?1",
            [session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;

    row.map(
        |(session_id, companion_id, owner_id, participants_json, created_at, closed_at)| {
            Ok(SessionRecord {
                session_id,
                companion_id,
                owner_id,
                participants: serde_json::from_str(&participants_json)?,
                created_at,
                closed_at,
            })
        },
    )
    .transpose()
}

/// Persists a finalized turn. Saving the same `(session_id, turn.id)` twice
/// replaces the earlier row.
pub fn save_turn(conn: &Connection, session_id: &str, turn: &Turn) -> Result<(), StoreError> {
    if !turn.completion.is_final() {
        return Err(StoreError::NotFinal { turn_id: turn.id });
    }
    let turn_json = serde_json::to_string(turn)?;
    conn.execute(
        "INSERT OR REPLACE INTO turns
            (session_id, turn_id, speaker_id, completion, audio_ms, first_audio_latency_ms, turn_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            session_id,
            turn.id as i64,
            turn.speaker,
            turn.completion.as_str(),
            turn.audio_ms() as i64,
            turn.first_audio_latency_ms.map(|ms| ms as i64),
            turn_json,
        ],
    )?;
    tracing::debug!(session_id, turn_id = turn.id, completion = turn.completion.as_str(), "turn saved");
    Ok(())
}

/// All stored turns of a session, in turn order.
pub fn list_turns(conn: &Connection, session_id: &str) -> Result<Vec<Turn>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT turn_json FROM turns WHERE session_id = ?1 ORDER BY turn_id ASC")?;
    let rows = stmt.query_map([session_id], |row| row.get::<_, String>(0))?;

    let mut turns = Vec::new();
    for row in rows {
        turns.push(serde_json::from_str(&row?)?);
    }
    Ok(turns)
}

/// Number of stored turns for a session.
pub fn count_turns(conn: &Connection, session_id: &str) -> Result<u64, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM turns WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Deletes a session's turn history and returns how many turns were removed.
pub fn delete_session_turns(conn: &Connection, session_id: &str) -> Result<usize, StoreError> {
    let removed = conn.execute("DELETE FROM turns WHERE session_id = ?1", [session_id])?;
    tracing::info!(session_id, removed, "session turns deleted");
    Ok(removed)
}

/// JSON export of a session: its record (if any) and every stored turn.
pub fn export_session(
    conn: &Connection,
    session_id: &str,
) -> Result<serde_json::Value, StoreError> {
    let record = get_session_record(conn, session_id)?;
    let turns = list_turns(conn, session_id)?;

    Ok(serde_json::json!({
        "session_id": session_id,
        "companion_id": record.as_ref().map(|r| r.companion_id.clone()),
        "participants": record.as_ref().map(|r| r.participants.clone()).unwrap_or_default(),
        "created_at": record.as_ref().map(|r| r.created_at.clone()),
        "closed_at": record.and_then(|r| r.closed_at),
        "turns": turns,
    }))
}
