//! LLM provider abstraction
//!
//! Provides a common interface for chat completion and text embedding.

mod error;
mod openai;
mod registry;
mod types;

pub use error::LlmError;
pub use openai::{OpenAIEmbeddings, OpenAIService};
pub use registry::{LlmConfig, ServiceRegistry};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Common interface for chat model providers
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Make a completion request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Embedding vector
pub type Embedding = Vec<f32>;

/// Text embedding provider
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, preserving input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, LlmError>;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Embedding, LlmError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::unknown("No embedding in response"))
    }

    /// Model identifier
    fn model_id(&self) -> &str;
}

/// Logging wrapper for LLM services
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.complete(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(response) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    tool_calls = response.tool_uses().len(),
                    end_turn = response.end_turn,
                    "LLM request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    kind = e.kind.as_str(),
                    "LLM request failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Logging wrapper for embedding providers
pub struct LoggingEmbedder {
    inner: Arc<dyn Embedder>,
    model_id: String,
}

impl LoggingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl Embedder for LoggingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.embed_batch(texts).await;
        let duration = start.elapsed();

        match &result {
            Ok(_) => tracing::debug!(
                model = %self.model_id,
                duration_ms = %duration.as_millis(),
                inputs = texts.len(),
                "Embedding request completed"
            ),
            Err(e) => tracing::error!(
                model = %self.model_id,
                duration_ms = %duration.as_millis(),
                error = %e.message,
                kind = e.kind.as_str(),
                "Embedding request failed"
            ),
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
