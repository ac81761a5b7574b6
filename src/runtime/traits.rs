//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the executor with mock implementations.

use crate::llm::{LlmError, LlmRequest, LlmResponse, ToolDefinition};
use crate::retrieval::{BuiltIndex, DocumentIndex, RetrievalError};
use crate::state_machine::SessionState;
use crate::tools::{ToolContext, ToolOutput};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Versioned snapshots of session state
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `state` as the next version; returns the version written
    async fn put_checkpoint(&self, session_id: &str, state: &SessionState) -> Result<i64, String>;
}

/// Client for making LLM requests
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete an LLM request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Get the model ID
    #[allow(dead_code)] // API completeness
    fn model_id(&self) -> &str;
}

/// Executor for tools
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute a tool by name; `None` if the tool is unknown
    async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Option<ToolOutput>;

    /// Get tool definitions for LLM
    fn definitions(&self) -> Vec<ToolDefinition>;
}

/// Document indexing and passage lookup
#[async_trait]
pub trait DocumentRetrieval: Send + Sync {
    /// Load, chunk and embed the document at `path`
    async fn build_index(&self, path: &Path) -> Result<BuiltIndex, RetrievalError>;

    /// Top passages for `query`, best first
    async fn retrieve(&self, index: &DocumentIndex, query: &str)
        -> Result<Vec<String>, RetrievalError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn put_checkpoint(&self, session_id: &str, state: &SessionState) -> Result<i64, String> {
        (**self).put_checkpoint(session_id, state).await
    }
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for Arc<T> {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        (**self).complete(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

#[async_trait]
impl<T: ToolExecutor + ?Sized> ToolExecutor for Arc<T> {
    async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Option<ToolOutput> {
        (**self).execute(name, input, ctx).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        (**self).definitions()
    }
}

#[async_trait]
impl<T: DocumentRetrieval + ?Sized> DocumentRetrieval for Arc<T> {
    async fn build_index(&self, path: &Path) -> Result<BuiltIndex, RetrievalError> {
        (**self).build_index(path).await
    }

    async fn retrieve(
        &self,
        index: &DocumentIndex,
        query: &str,
    ) -> Result<Vec<String>, RetrievalError> {
        (**self).retrieve(index, query).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

use crate::db::Database;
use crate::llm::ServiceRegistry;
use crate::retrieval::{EmbeddingRetrieval, RetrievalConfig};
use crate::tools::ToolRegistry;

/// Adapter to use Database as a checkpoint store
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointStore for DatabaseStorage {
    async fn put_checkpoint(&self, session_id: &str, state: &SessionState) -> Result<i64, String> {
        self.db
            .put_checkpoint(session_id, state)
            .map_err(|e| e.to_string())
    }
}

/// Adapter to use the registry's chat model as `LlmClient`
pub struct RegistryLlmClient {
    registry: ServiceRegistry,
    model_id: String,
}

impl RegistryLlmClient {
    pub fn new(registry: ServiceRegistry) -> Self {
        let model_id = registry
            .chat()
            .map(|llm| llm.model_id().to_string())
            .unwrap_or_default();
        Self { registry, model_id }
    }
}

#[async_trait]
impl LlmClient for RegistryLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let llm = self
            .registry
            .chat()
            .ok_or_else(|| LlmError::auth("No chat model configured"))?;
        llm.complete(request).await
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Adapter to use `ToolRegistry` as `ToolExecutor`
pub struct ToolRegistryExecutor {
    registry: ToolRegistry,
}

impl ToolRegistryExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistryExecutor {
    async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Option<ToolOutput> {
        self.registry.execute(name, input, ctx).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }
}

/// Retrieval over the registry's embedder; fails every call when none is configured
pub struct RegistryRetrieval {
    inner: Option<EmbeddingRetrieval>,
}

impl RegistryRetrieval {
    pub fn new(registry: &ServiceRegistry, config: RetrievalConfig) -> Self {
        Self {
            inner: registry
                .embedder()
                .map(|embedder| EmbeddingRetrieval::new(embedder, config)),
        }
    }

    fn inner(&self) -> Result<&EmbeddingRetrieval, RetrievalError> {
        self.inner
            .as_ref()
            .ok_or_else(|| LlmError::auth("No embedding model configured").into())
    }
}

#[async_trait]
impl DocumentRetrieval for RegistryRetrieval {
    async fn build_index(&self, path: &Path) -> Result<BuiltIndex, RetrievalError> {
        self.inner()?.build_index(path).await
    }

    async fn retrieve(
        &self,
        index: &DocumentIndex,
        query: &str,
    ) -> Result<Vec<String>, RetrievalError> {
        self.inner()?.retrieve(index, query).await
    }
}
