//! Construction of the process-wide model and embedding services

use super::openai::DEFAULT_BASE_URL;
use super::{Embedder, LlmService, LoggingEmbedder, LoggingService, OpenAIEmbeddings, OpenAIService};
use std::sync::Arc;

pub const DEFAULT_MODEL: &str = "gpt-4.1-nano-2025-04-14";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";

/// Configuration for LLM providers
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub openai_api_key: Option<String>,
    /// OpenAI-compatible gateway (e.g., `http://localhost:4000/v1`)
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            model: std::env::var("MEDIBOT_MODEL").unwrap_or(defaults.model),
            embedding_model: std::env::var("MEDIBOT_EMBEDDING_MODEL")
                .unwrap_or(defaults.embedding_model),
        }
    }
}

/// Chat model and embedder shared by every session
///
/// Built once at startup and injected into runtimes; nothing here is global.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    chat: Option<Arc<dyn LlmService>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl ServiceRegistry {
    pub fn new(config: &LlmConfig) -> Self {
        let Some(api_key) = config.openai_api_key.clone() else {
            return Self::default();
        };

        let chat = match OpenAIService::new(api_key.clone(), config.model.clone(), &config.base_url)
        {
            Ok(service) => Some(Arc::new(LoggingService::new(Arc::new(service))) as Arc<dyn LlmService>),
            Err(e) => {
                tracing::error!(error = %e, "Failed to create chat service");
                None
            }
        };

        let embedder = match OpenAIEmbeddings::new(
            api_key,
            config.embedding_model.clone(),
            &config.base_url,
        ) {
            Ok(service) => Some(Arc::new(LoggingEmbedder::new(Arc::new(service))) as Arc<dyn Embedder>),
            Err(e) => {
                tracing::error!(error = %e, "Failed to create embedding service");
                None
            }
        };

        Self { chat, embedder }
    }

    /// Registry with explicit services (tests, alternate backends)
    #[cfg(test)]
    pub fn with_services(chat: Arc<dyn LlmService>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            chat: Some(chat),
            embedder: Some(embedder),
        }
    }

    pub fn chat(&self) -> Option<Arc<dyn LlmService>> {
        self.chat.clone()
    }

    pub fn embedder(&self) -> Option<Arc<dyn Embedder>> {
        self.embedder.clone()
    }

    pub fn is_configured(&self) -> bool {
        self.chat.is_some() && self.embedder.is_some()
    }
}
