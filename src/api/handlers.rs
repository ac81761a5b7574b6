//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    ChatRequest, ChatResponse, CheckpointListResponse, ErrorResponse, SessionListResponse,
    SessionResponse, SessionWithStateResponse, SuccessResponse,
};
use super::AppState;
use crate::db::DbError;
use crate::runtime::{RuntimeError, SseEvent};
use crate::state_machine::{Event, SessionState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use std::path::{Path as FsPath, PathBuf};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/new", post(create_session))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/checkpoints", get(list_checkpoints))
        .route("/api/sessions/:id/stream", get(stream_session))
        .route("/api/sessions/:id/chat", post(send_chat))
        .route("/api/sessions/:id/delete", post(delete_session))
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Sessions
// ============================================================

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<SessionListResponse>, AppError> {
    let sessions = state.runtime.db().list_sessions()?;
    Ok(Json(SessionListResponse { sessions }))
}

async fn create_session(
    State(state): State<AppState>,
) -> Result<Json<SessionResponse>, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let session = state.runtime.db().create_session(&id)?;
    tracing::info!(session_id = %id, "Session created");
    Ok(Json(SessionResponse { session }))
}

fn latest_state(state: &AppState, id: &str) -> Result<SessionState, AppError> {
    Ok(state
        .runtime
        .db()
        .latest_checkpoint(id)?
        .map(|cp| cp.state)
        .unwrap_or_default())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionWithStateResponse>, AppError> {
    let session = state.runtime.db().get_session(&id)?;
    let current = latest_state(&state, &id)?;

    Ok(Json(SessionWithStateResponse {
        session,
        agent_working: current.phase.is_working(),
        search_performed: current.search_performed,
        rag_used: current.rag_used,
        document_path: current
            .document_path
            .map(|p| p.to_string_lossy().into_owned()),
        messages: current.messages,
        phase: current.phase,
    }))
}

async fn list_checkpoints(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CheckpointListResponse>, AppError> {
    state.runtime.db().get_session(&id)?;
    let checkpoints = state.runtime.db().checkpoint_history(&id)?;
    Ok(Json(CheckpointListResponse { checkpoints }))
}

async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.runtime.db().get_session(&id)?;

    // Subscribe before reading state so no update falls between the two
    let broadcast_rx = state.runtime.subscribe(&id).await?;
    let current = latest_state(&state, &id)?;

    let init_event = SseEvent::Init {
        session: serde_json::to_value(&session).unwrap_or(Value::Null),
        state: current,
    };

    Ok(sse_stream(init_event, broadcast_rx))
}

// ============================================================
// Turns
// ============================================================

async fn send_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if req.text.trim().is_empty() {
        return Err(AppError::BadRequest("Message text is empty".to_string()));
    }
    state.runtime.db().get_session(&id)?;
    if latest_state(&state, &id)?.phase.is_working() {
        return Err(AppError::BadRequest(
            "Agent is busy, wait for the current turn to finish".to_string(),
        ));
    }

    let document_path = match req.document_path {
        Some(path) if path.is_empty() => Some(PathBuf::new()),
        Some(path) => Some(state.runtime.upload_document(&id, FsPath::new(&path)).await?),
        None => state.runtime.latest_document(&id).await,
    };
    let reported = document_path
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().into_owned());

    tracing::info!(
        session_id = %id,
        document = reported.as_deref().unwrap_or("none"),
        "Turn submitted"
    );

    state
        .runtime
        .send_event(
            &id,
            Event::UserMessage {
                text: req.text,
                document_path,
            },
        )
        .await?;

    Ok(Json(ChatResponse {
        queued: true,
        document_path: reported,
    }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.runtime.delete_session(&id).await?;
    tracing::info!(session_id = %id, "Session deleted");
    Ok(Json(SuccessResponse { success: true }))
}

async fn get_version() -> &'static str {
    concat!("medibot ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::SessionNotFound(_) => AppError::NotFound(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<RuntimeError> for AppError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::SessionNotFound(_) => AppError::NotFound(e.to_string()),
            RuntimeError::DocumentOutsideUploads(_) => AppError::BadRequest(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
