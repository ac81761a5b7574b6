//! HTTP API for medibot
//!
//! Sessions, turn submission and an SSE stream of turn progress.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::db::Database;
use crate::llm::ServiceRegistry;
use crate::runtime::{RuntimeConfig, RuntimeManager};
use crate::tools::ToolRegistry;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeManager>,
}

impl AppState {
    pub fn new(
        db: Database,
        services: ServiceRegistry,
        tools: ToolRegistry,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            runtime: Arc::new(RuntimeManager::new(db, services, tools, config)),
        }
    }
}
