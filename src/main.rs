//! medibot - medical conversational agent
//!
//! Routes each question to document-grounded answering, a web search or a
//! general reply, driven by a checkpointed conversation state machine.

mod api;
mod db;
mod llm;
mod retrieval;
mod runtime;
mod state_machine;
mod system_prompt;
mod tools;

use api::{create_router, AppState};
use db::Database;
use llm::{LlmConfig, ServiceRegistry};
use runtime::RuntimeConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tools::{SearchConfig, TavilyProvider, ToolRegistry};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medibot=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("MEDIBOT_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.medibot/medibot.db")
    });

    let port: u16 = std::env::var("MEDIBOT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "Opening database");
    let mut db = Database::open(&db_path)?;
    if let Some(retention) = std::env::var("MEDIBOT_CHECKPOINT_RETENTION")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
    {
        db = db.with_retention(retention);
    }

    // Model services
    let llm_config = LlmConfig::from_env();
    let services = ServiceRegistry::new(&llm_config);
    if services.is_configured() {
        tracing::info!(
            model = %llm_config.model,
            embedding_model = %llm_config.embedding_model,
            "Model services initialized"
        );
    } else {
        tracing::warn!("No model services configured. Set OPENAI_API_KEY.");
    }

    // Web search
    let search_config = SearchConfig::from_env();
    let tools = match search_config.tavily_api_key.clone() {
        Some(key) => match TavilyProvider::new(key) {
            Ok(provider) => ToolRegistry::with_search(Arc::new(provider), search_config.max_results),
            Err(e) => {
                tracing::error!(error = %e, "Failed to create search provider");
                ToolRegistry::default()
            }
        },
        None => {
            tracing::warn!("No search provider configured. Set TAVILY_API_KEY.");
            ToolRegistry::default()
        }
    };

    let runtime_config = RuntimeConfig::from_env();
    tracing::info!(
        step_timeout_secs = runtime_config.step_timeout.as_secs(),
        upload_dir = %runtime_config.upload_dir.display(),
        "Runtime configured"
    );

    let state = AppState::new(db, services, tools, runtime_config);

    // Pick up turns interrupted by the last shutdown
    let resumed = state.runtime.resume_interrupted().await?;
    if resumed > 0 {
        tracing::info!(sessions = resumed, "Resumed interrupted sessions");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new().gzip(true).br(true);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(compression);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("medibot server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
