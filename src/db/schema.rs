//! Database schema and types

pub use crate::state_machine::state::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SQL schema for initialization
pub const SCHEMA: &str = r"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);

CREATE TABLE IF NOT EXISTS checkpoints (
    session_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (session_id, version),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

-- Embedded passages, stored once per document version and referenced from
-- checkpoint state by source and fingerprint
CREATE TABLE IF NOT EXISTS document_indexes (
    session_id TEXT NOT NULL,
    source TEXT NOT NULL,
    len INTEGER NOT NULL,
    modified_ms INTEGER NOT NULL,
    passages TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (session_id, source, len, modified_ms),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);
";

/// Checkpoint versions kept per session unless configured otherwise
pub const DEFAULT_RETENTION: usize = 20;

/// Session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Latest checkpoint version, `None` before the first turn
    pub latest_version: Option<i64>,
    /// `type` tag of the latest phase
    pub phase: String,
    pub message_count: i64,
}

/// Durable snapshot of a session's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub version: i64,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint listing entry without the state body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub version: i64,
    pub phase: String,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
}
