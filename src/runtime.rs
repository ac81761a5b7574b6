//! Runtime for executing sessions
//!
//! Each session gets one `ConversationRuntime` task that owns its state,
//! consumes user events in order and broadcasts progress to SSE clients.

mod executor;
mod recovery;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::ConversationRuntime;
pub use traits::*;

use crate::db::{Database, DbError};
use crate::llm::ServiceRegistry;
use crate::retrieval::RetrievalConfig;
use crate::state_machine::{ChatMessage, Event, SessionState};
use crate::tools::ToolRegistry;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};

/// Type alias for production runtime with concrete implementations
pub type ProductionRuntime = ConversationRuntime<
    DatabaseStorage,
    RegistryLlmClient,
    ToolRegistryExecutor,
    RegistryRetrieval,
>;

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Runtime settings
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub step_timeout: Duration,
    /// Root of the per-session upload directories
    pub upload_dir: PathBuf,
    pub retrieval: RetrievalConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
            upload_dir: PathBuf::from(".files"),
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            step_timeout: std::env::var("MEDIBOT_STEP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map_or(defaults.step_timeout, Duration::from_secs),
            upload_dir: std::env::var("MEDIBOT_UPLOAD_DIR")
                .map_or(defaults.upload_dir, PathBuf::from),
            retrieval: RetrievalConfig::from_env(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Session runtime stopped: {0}")]
    Closed(String),
    #[error("Document is outside the session's upload directory: {}", .0.display())]
    DocumentOutsideUploads(PathBuf),
}

impl From<DbError> for RuntimeError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::SessionNotFound(id) => RuntimeError::SessionNotFound(id),
            other => RuntimeError::Storage(other.to_string()),
        }
    }
}

/// Handle to interact with a running session
#[derive(Clone)]
pub struct ConversationHandle {
    pub event_tx: mpsc::Sender<Event>,
    pub broadcast_tx: broadcast::Sender<SseEvent>,
}

/// Events sent to SSE clients
#[derive(Debug, Clone)]
pub enum SseEvent {
    Init {
        session: serde_json::Value,
        state: SessionState,
    },
    Message {
        message: ChatMessage,
        /// Set on the message that completes the turn
        live: bool,
    },
    StateChange {
        /// Phase as JSON object (e.g., `{"type":"routing"}`)
        state: serde_json::Value,
    },
    TurnDone,
    Error {
        message: String,
    },
}

/// Manager for all session runtimes
pub struct RuntimeManager {
    db: Database,
    llm_client: Arc<RegistryLlmClient>,
    tool_executor: Arc<ToolRegistryExecutor>,
    retrieval: Arc<RegistryRetrieval>,
    config: RuntimeConfig,
    runtimes: RwLock<HashMap<String, ConversationHandle>>,
}

impl RuntimeManager {
    pub fn new(
        db: Database,
        services: ServiceRegistry,
        tools: ToolRegistry,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            retrieval: Arc::new(RegistryRetrieval::new(&services, config.retrieval)),
            llm_client: Arc::new(RegistryLlmClient::new(services)),
            tool_executor: Arc::new(ToolRegistryExecutor::new(tools)),
            db,
            config,
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a runtime for a session
    pub async fn get_or_create(&self, session_id: &str) -> Result<ConversationHandle, RuntimeError> {
        // Check if already running
        {
            let runtimes = self.runtimes.read().await;
            if let Some(handle) = runtimes.get(session_id) {
                return Ok(handle.clone());
            }
        }

        self.db.get_session(session_id)?;
        let state = self
            .db
            .latest_checkpoint(session_id)?
            .map(|cp| cp.state)
            .unwrap_or_default();

        let mut runtimes = self.runtimes.write().await;
        if let Some(handle) = runtimes.get(session_id) {
            return Ok(handle.clone());
        }

        let (event_tx, event_rx) = mpsc::channel(32);
        let (broadcast_tx, _) = broadcast::channel(128);

        let runtime: ProductionRuntime = ConversationRuntime::new(
            session_id,
            state,
            DatabaseStorage::new(self.db.clone()),
            self.llm_client.clone(),
            self.tool_executor.clone(),
            self.retrieval.clone(),
            event_rx,
            broadcast_tx.clone(),
            self.config.step_timeout,
        );

        // Start runtime in background
        let id = session_id.to_string();
        tokio::spawn(async move {
            runtime.run().await;
            tracing::info!(session_id = %id, "Session runtime finished");
        });

        let handle = ConversationHandle {
            event_tx,
            broadcast_tx,
        };
        runtimes.insert(session_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Send an event to a session
    pub async fn send_event(&self, session_id: &str, event: Event) -> Result<(), RuntimeError> {
        let handle = self.get_or_create(session_id).await?;
        handle
            .event_tx
            .send(event)
            .await
            .map_err(|e| RuntimeError::Closed(e.to_string()))
    }

    /// Subscribe to session updates
    pub async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<SseEvent>, RuntimeError> {
        let handle = self.get_or_create(session_id).await?;
        Ok(handle.broadcast_tx.subscribe())
    }

    /// Stop a session's runtime and delete its checkpoints
    pub async fn delete_session(&self, session_id: &str) -> Result<(), RuntimeError> {
        // Dropping the handle closes the event channel and ends the runtime loop
        self.runtimes.write().await.remove(session_id);
        self.db.delete_session(session_id)?;
        Ok(())
    }

    /// Start runtimes for every session interrupted mid-turn; each re-issues
    /// the step its checkpoint was waiting on
    pub async fn resume_interrupted(&self) -> Result<usize, RuntimeError> {
        let interrupted = self.db.interrupted_sessions()?;
        for session_id in &interrupted {
            tracing::info!(session_id = %session_id, "Resuming interrupted session");
            if let Err(e) = self.get_or_create(session_id).await {
                tracing::error!(session_id = %session_id, error = %e, "Failed to resume session");
            }
        }
        Ok(interrupted.len())
    }

    /// Most recently modified PDF uploaded for a session
    pub async fn latest_document(&self, session_id: &str) -> Option<PathBuf> {
        latest_pdf(&self.config.upload_dir.join(session_id)).await
    }

    /// Resolve a caller-supplied document path inside the session's upload
    /// directory
    ///
    /// Relative paths are taken from the upload directory. Existing files are
    /// compared after resolving symlinks; a missing file passes when it is
    /// lexically inside the directory so the turn can report it as not found.
    pub async fn upload_document(
        &self,
        session_id: &str,
        requested: &Path,
    ) -> Result<PathBuf, RuntimeError> {
        let root = self.config.upload_dir.join(session_id);
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            root.join(requested)
        };
        let canonical_root = tokio::fs::canonicalize(&root).await.ok();

        let confined = match tokio::fs::canonicalize(&candidate).await {
            Ok(resolved) => canonical_root
                .as_ref()
                .is_some_and(|r| resolved.starts_with(r))
                .then_some(resolved),
            Err(_) => {
                let climbs = candidate.components().any(|c| c == Component::ParentDir);
                let inside = candidate.starts_with(&root)
                    || canonical_root.as_ref().is_some_and(|r| candidate.starts_with(r));
                (!climbs && inside).then_some(candidate)
            }
        };

        confined.ok_or_else(|| {
            tracing::warn!(
                session_id = %session_id,
                path = %requested.display(),
                "Rejected document outside upload directory"
            );
            RuntimeError::DocumentOutsideUploads(requested.to_path_buf())
        })
    }

    /// Get the database handle
    pub fn db(&self) -> &Database {
        &self.db
    }
}

async fn latest_pdf(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if !is_pdf {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }

    newest.map(|(_, path)| path)
}
