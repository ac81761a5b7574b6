//! Retrieval indexer
//!
//! Loads an uploaded document, splits it into semantically coherent passages,
//! embeds them into a [`DocumentIndex`] and answers top-k passage queries.

mod chunker;
mod index;
mod loader;

pub use chunker::SemanticChunker;
pub use index::{DocumentFingerprint, DocumentIndex, Passage};
pub use loader::{load_document, DocumentSegment};

use crate::llm::{Embedder, LlmError};
use crate::runtime::DocumentRetrieval;
use async_trait::async_trait;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Separator placed between retrieved passages in a prompt context
pub const CONTEXT_SEPARATOR: &str = "\n\n";

/// Passages embedded per request while indexing
pub(crate) const EMBED_BATCH_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Document not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Failed to load {}: {message}", path.display())]
    Load { path: PathBuf, message: String },
    #[error("Document contains no extractable text: {}", .0.display())]
    Empty(PathBuf),
    #[error("Embedding failed: {0}")]
    Embedding(#[from] LlmError),
}

impl RetrievalError {
    pub fn load(path: &Path, e: impl Display) -> Self {
        Self::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }
}

/// Indexing and query parameters
#[derive(Debug, Clone, Copy)]
pub struct RetrievalConfig {
    /// Deviation multiplier for semantic breakpoints
    pub breakpoint_stddev: f32,
    /// Passages returned per query
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            breakpoint_stddev: 1.5,
            top_k: 4,
        }
    }
}

impl RetrievalConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            breakpoint_stddev: std::env::var("MEDIBOT_BREAKPOINT_STDDEV")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.breakpoint_stddev),
            top_k: std::env::var("MEDIBOT_TOP_K")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|k| *k > 0)
                .unwrap_or(defaults.top_k),
        }
    }
}

/// Result of indexing a document
#[derive(Debug, Clone)]
pub struct BuiltIndex {
    /// Raw page segments the index was built from
    pub documents: Vec<DocumentSegment>,
    pub index: DocumentIndex,
}

/// Production retrieval backed by an embedding service
pub struct EmbeddingRetrieval {
    embedder: Arc<dyn Embedder>,
    chunker: SemanticChunker,
    config: RetrievalConfig,
}

impl EmbeddingRetrieval {
    pub fn new(embedder: Arc<dyn Embedder>, config: RetrievalConfig) -> Self {
        Self {
            chunker: SemanticChunker::new(embedder.clone(), config.breakpoint_stddev),
            embedder,
            config,
        }
    }
}

#[async_trait]
impl DocumentRetrieval for EmbeddingRetrieval {
    async fn build_index(&self, path: &Path) -> Result<BuiltIndex, RetrievalError> {
        let fingerprint =
            DocumentFingerprint::of(path).map_err(|_| RetrievalError::NotFound(path.to_path_buf()))?;
        let documents = load_document(path).await?;
        let chunks = self.chunker.split_documents(&documents).await?;
        if chunks.is_empty() {
            return Err(RetrievalError::Empty(path.to_path_buf()));
        }

        let mut passages = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embeddings = self.embedder.embed_batch(&texts).await?;
            passages.extend(batch.iter().zip(embeddings).map(|(chunk, embedding)| Passage {
                text: chunk.text.clone(),
                page: chunk.page,
                embedding,
            }));
        }

        tracing::info!(
            path = %path.display(),
            pages = documents.len(),
            passages = passages.len(),
            "Document indexed"
        );

        Ok(BuiltIndex {
            documents,
            index: DocumentIndex::new(path.to_path_buf(), fingerprint, passages),
        })
    }

    async fn retrieve(
        &self,
        index: &DocumentIndex,
        query: &str,
    ) -> Result<Vec<String>, RetrievalError> {
        let query_embedding = self.embedder.embed(query).await?;
        Ok(index
            .search(&query_embedding, self.config.top_k)
            .into_iter()
            .map(|hit| hit.passage.text.clone())
            .collect())
    }
}

/// Join retrieved passages into a prompt context block
pub fn format_context(passages: &[String]) -> String {
    passages.join(CONTEXT_SEPARATOR)
}
