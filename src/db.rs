//! Checkpoint store
//!
//! Persists sessions and a bounded history of versioned state snapshots.

mod schema;

pub use schema::*;

use crate::retrieval::DocumentIndex;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Session already exists: {0}")]
    SessionExists(String),
    #[error("State serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Database lock poisoned")]
    Poisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Columns shared by session queries; phase and message count come from the
/// latest checkpoint
const SESSION_SELECT: &str = "
    SELECT s.id, s.created_at, s.updated_at, c.version,
           COALESCE(json_extract(c.state, '$.phase.type'), 'idle'),
           COALESCE(json_array_length(c.state, '$.messages'), 0)
    FROM sessions s
    LEFT JOIN checkpoints c
      ON c.session_id = s.id
     AND c.version = (SELECT MAX(version) FROM checkpoints WHERE session_id = s.id)";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    retention: usize,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        Self::setup(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        Self::setup(Connection::open_in_memory()?)
    }

    fn setup(conn: Connection) -> DbResult<Self> {
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retention: DEFAULT_RETENTION,
        })
    }

    /// Keep at most `retention` checkpoint versions per session (minimum 1)
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // ==================== Session Operations ====================

    pub fn create_session(&self, id: &str) -> DbResult<Session> {
        let conn = self.lock()?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO sessions (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![id, now.to_rfc3339()],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                DbError::SessionExists(id.to_string())
            }
            other => DbError::Sqlite(other),
        })?;

        Ok(Session {
            id: id.to_string(),
            created_at: now,
            updated_at: now,
            latest_version: None,
            phase: "idle".to_string(),
            message_count: 0,
        })
    }

    pub fn get_session(&self, id: &str) -> DbResult<Session> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{SESSION_SELECT} WHERE s.id = ?1"))?;
        stmt.query_row(params![id], parse_session_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::SessionNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })
    }

    /// All sessions, most recently active first
    pub fn list_sessions(&self) -> DbResult<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{SESSION_SELECT} ORDER BY s.updated_at DESC, s.id"
        ))?;
        let rows = stmt.query_map([], parse_session_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Delete a session and its checkpoints
    pub fn delete_session(&self, id: &str) -> DbResult<()> {
        let conn = self.lock()?;

        // Checkpoints are deleted by CASCADE
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;

        if deleted == 0 {
            return Err(DbError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    // ==================== Checkpoint Operations ====================

    /// Store `state` as the next version and prune versions beyond retention
    ///
    /// Index passages are written to `document_indexes` once per document
    /// version; the checkpoint row keeps only the index's source and
    /// fingerprint.
    pub fn put_checkpoint(&self, session_id: &str, state: &SessionState) -> DbResult<i64> {
        let mut state_value = serde_json::to_value(state)?;
        if let Some(retriever) = state_value.get_mut("retriever").and_then(Value::as_object_mut) {
            retriever.remove("passages");
        }
        let state_json = state_value.to_string();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let touched = tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![now, session_id],
        )?;
        if touched == 0 {
            return Err(DbError::SessionNotFound(session_id.to_string()));
        }

        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM checkpoints WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO checkpoints (session_id, version, state, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, version, state_json, now],
        )?;

        let keep = i64::try_from(self.retention).unwrap_or(i64::MAX);
        tx.execute(
            "DELETE FROM checkpoints WHERE session_id = ?1 AND version <= ?2",
            params![session_id, version - keep],
        )?;

        if let Some(index) = &state.retriever {
            let key = IndexKey::of(index);
            let stored = tx
                .query_row(
                    "SELECT 1 FROM document_indexes
                     WHERE session_id = ?1 AND source = ?2 AND len = ?3 AND modified_ms = ?4",
                    params![session_id, key.source, key.len, key.modified_ms],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !stored {
                tx.execute(
                    "INSERT INTO document_indexes
                         (session_id, source, len, modified_ms, passages, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        session_id,
                        key.source,
                        key.len,
                        key.modified_ms,
                        serde_json::to_string(index.passages())?,
                        now
                    ],
                )?;
            }
        }

        // Drop indexes no retained checkpoint refers to
        tx.execute(
            "DELETE FROM document_indexes
             WHERE session_id = ?1 AND NOT EXISTS (
                 SELECT 1 FROM checkpoints c
                 WHERE c.session_id = document_indexes.session_id
                   AND json_extract(c.state, '$.retriever.source') = document_indexes.source
                   AND json_extract(c.state, '$.retriever.fingerprint.len') = document_indexes.len
                   AND json_extract(c.state, '$.retriever.fingerprint.modified_ms')
                       = document_indexes.modified_ms)",
            params![session_id],
        )?;

        tx.commit()?;
        Ok(version)
    }

    pub fn latest_checkpoint(&self, session_id: &str) -> DbResult<Option<Checkpoint>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT version, state, created_at FROM checkpoints
                 WHERE session_id = ?1 ORDER BY version DESC LIMIT 1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(version, state_json, created_at)| -> DbResult<Checkpoint> {
            let mut state: Value = serde_json::from_str(&state_json)?;
            attach_passages(&conn, session_id, &mut state)?;
            Ok(Checkpoint {
                session_id: session_id.to_string(),
                version,
                state: serde_json::from_value(state)?,
                created_at: parse_datetime(&created_at),
            })
        })
        .transpose()
    }

    /// Retained checkpoint versions, newest first
    pub fn checkpoint_history(&self, session_id: &str) -> DbResult<Vec<CheckpointMeta>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT version,
                    COALESCE(json_extract(state, '$.phase.type'), 'idle'),
                    COALESCE(json_array_length(state, '$.messages'), 0),
                    created_at
             FROM checkpoints WHERE session_id = ?1
             ORDER BY version DESC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(CheckpointMeta {
                version: row.get(0)?,
                phase: row.get(1)?,
                message_count: row.get(2)?,
                created_at: parse_datetime(&row.get::<_, String>(3)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Sessions whose latest checkpoint is mid-turn
    pub fn interrupted_sessions(&self) -> DbResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.session_id FROM checkpoints c
             WHERE c.version = (SELECT MAX(version) FROM checkpoints WHERE session_id = c.session_id)
               AND json_extract(c.state, '$.phase.type') NOT IN ('idle', 'error')
             ORDER BY c.session_id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

/// Row key of a stored index
struct IndexKey {
    source: String,
    len: i64,
    modified_ms: i64,
}

impl IndexKey {
    fn of(index: &DocumentIndex) -> Self {
        Self {
            source: index.source.to_string_lossy().into_owned(),
            len: i64::try_from(index.fingerprint.len).unwrap_or(i64::MAX),
            modified_ms: i64::try_from(index.fingerprint.modified_ms).unwrap_or(i64::MAX),
        }
    }

    fn from_state(retriever: &Value) -> Option<Self> {
        Some(Self {
            source: retriever.get("source")?.as_str()?.to_string(),
            len: retriever.pointer("/fingerprint/len")?.as_i64()?,
            modified_ms: retriever.pointer("/fingerprint/modified_ms")?.as_i64()?,
        })
    }
}

/// Restore index passages into checkpoint state; an index whose passages are
/// gone is dropped so the next turn rebuilds it
fn attach_passages(conn: &Connection, session_id: &str, state: &mut Value) -> DbResult<()> {
    let Some(retriever) = state.get_mut("retriever").filter(|r| r.is_object()) else {
        return Ok(());
    };
    if retriever.get("passages").is_some() {
        return Ok(());
    }

    let passages: Option<String> = match IndexKey::from_state(retriever) {
        Some(key) => conn
            .query_row(
                "SELECT passages FROM document_indexes
                 WHERE session_id = ?1 AND source = ?2 AND len = ?3 AND modified_ms = ?4",
                params![session_id, key.source, key.len, key.modified_ms],
                |row| row.get(0),
            )
            .optional()?,
        None => None,
    };

    match passages {
        Some(json) => retriever["passages"] = serde_json::from_str(&json)?,
        None => *retriever = Value::Null,
    }
    Ok(())
}

fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        created_at: parse_datetime(&row.get::<_, String>(1)?),
        updated_at: parse_datetime(&row.get::<_, String>(2)?),
        latest_version: row.get(3)?,
        phase: row.get(4)?,
        message_count: row.get(5)?,
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
