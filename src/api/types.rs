//! API request and response types

use crate::db::{CheckpointMeta, Session};
use crate::state_machine::{ChatMessage, TurnPhase};
use serde::{Deserialize, Serialize};

/// Request to submit a turn
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    /// Omitted: the session's latest upload is used; empty: no document
    #[serde(default)]
    pub document_path: Option<String>,
}

/// Response with a list of sessions
#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
}

/// Response with a single session
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: Session,
}

/// Response with a session and its latest state
#[derive(Debug, Serialize)]
pub struct SessionWithStateResponse {
    pub session: Session,
    pub messages: Vec<ChatMessage>,
    pub phase: TurnPhase,
    pub agent_working: bool,
    pub search_performed: bool,
    pub rag_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_path: Option<String>,
}

/// Response with a session's checkpoint history
#[derive(Debug, Serialize)]
pub struct CheckpointListResponse {
    pub checkpoints: Vec<CheckpointMeta>,
}

/// Response for chat action
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub queued: bool,
    /// Document the turn will use, if any
    pub document_path: Option<String>,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
