//! Where finalized turns go.

use crate::error::SessionError;
use async_trait::async_trait;
use holo_db::DbPool;
use holo_types::{ParticipantId, SessionId, Turn};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistence service for session history.
#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn session_started(
        &self,
        session_id: SessionId,
        companion_id: &str,
        participants: &[ParticipantId],
    ) -> Result<(), SessionError>;

    async fn session_closed(&self, session_id: SessionId) -> Result<(), SessionError>;

    /// Stores a finalized turn. Saving the same turn id again replaces it.
    async fn save_turn(&self, session_id: SessionId, turn: &Turn) -> Result<(), SessionError>;

    async fn list_turns(&self, session_id: SessionId) -> Result<Vec<Turn>, SessionError>;

    async fn export_session(&self, session_id: SessionId)
        -> Result<serde_json::Value, SessionError>;

    /// Deletes a session's turns and returns how many were removed.
    async fn delete_turns(&self, session_id: SessionId) -> Result<usize, SessionError>;
}

/// Process-local store, used in tests and when no database is configured.
#[derive(Debug, Clone, Default)]
pub struct MemoryTurnStore {
    turns: Arc<RwLock<HashMap<SessionId, Vec<Turn>>>>,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TurnStore for MemoryTurnStore {
    async fn session_started(
        &self,
        session_id: SessionId,
        _companion_id: &str,
        _participants: &[ParticipantId],
    ) -> Result<(), SessionError> {
        self.turns.write().await.entry(session_id).or_default();
        Ok(())
    }

    async fn session_closed(&self, _session_id: SessionId) -> Result<(), SessionError> {
        Ok(())
    }

    async fn save_turn(&self, session_id: SessionId, turn: &Turn) -> Result<(), SessionError> {
        if !turn.completion.is_final() {
            return Err(SessionError::Store(format!("turn {} is not final", turn.id)));
        }
        let mut turns = self.turns.write().await;
        let list = turns.entry(session_id).or_default();
        list.retain(|t| t.id != turn.id);
        list.push(turn.clone());
        list.sort_by_key(|t| t.id);
        Ok(())
    }

    async fn list_turns(&self, session_id: SessionId) -> Result<Vec<Turn>, SessionError> {
        Ok(self
            .turns
            .read()
            .await
            .get(&session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn export_session(
        &self,
        session_id: SessionId,
    ) -> Result<serde_json::Value, SessionError> {
        let turns = self.list_turns(session_id).await?;
        Ok(serde_json::json!({
            "session_id": session_id.to_string(),
            "turns": turns,
        }))
    }

    async fn delete_turns(&self, session_id: SessionId) -> Result<usize, SessionError> {
        Ok(self
            .turns
            .write()
            .await
            .get_mut(&session_id)
            .map(|list| std::mem::take(list).len())
            .unwrap_or(0))
    }
}

/// SQLite-backed store. Queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteTurnStore {
    pool: DbPool,
}

impl SqliteTurnStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, holo_db::StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| SessionError::Store(format!("db connection failed: {e}")))?;
            f(&conn).map_err(|e| SessionError::Store(e.to_string()))
        })
        .await
        .map_err(|e| SessionError::Store(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl TurnStore for SqliteTurnStore {
    async fn session_started(
        &self,
        session_id: SessionId,
        companion_id: &str,
        participants: &[ParticipantId],
    ) -> Result<(), SessionError> {
        let (companion_id, participants) = (companion_id.to_string(), participants.to_vec());
        self.with_conn(move |conn| {
            holo_db::insert_session_record(conn, &session_id.to_string(), &companion_id, &participants)
        })
        .await
    }

    async fn session_closed(&self, session_id: SessionId) -> Result<(), SessionError> {
        self.with_conn(move |conn| {
            holo_db::close_session_record(conn, &session_id.to_string()).map(|_| ())
        })
        .await
    }

    async fn save_turn(&self, session_id: SessionId, turn: &Turn) -> Result<(), SessionError> {
        let turn = turn.clone();
        self.with_conn(move |conn| holo_db::save_turn(conn, &session_id.to_string(), &turn))
            .await
    }

    async fn list_turns(&self, session_id: SessionId) -> Result<Vec<Turn>, SessionError> {
        self.with_conn(move |conn| holo_db::list_turns(conn, &session_id.to_string()))
            .await
    }

    async fn export_session(
        &self,
        session_id: SessionId,
    ) -> Result<serde_json::Value, SessionError> {
        self.with_conn(move |conn| holo_db::export_session(conn, &session_id.to_string()))
            .await
    }

    async fn delete_turns(&self, session_id: SessionId) -> Result<usize, SessionError> {
        self.with_conn(move |conn| holo_db::delete_session_turns(conn, &session_id.to_string()))
            .await
    }
}
