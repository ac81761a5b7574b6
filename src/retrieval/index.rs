//! In-memory vector index over document passages

use crate::llm::Embedding;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Identity of a document file at indexing time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub len: u64,
    pub modified_ms: u64,
}

impl DocumentFingerprint {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Ok(Self {
            len: metadata.len(),
            modified_ms,
        })
    }
}

/// An embedded passage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    /// 1-based page the passage came from
    pub page: u32,
    pub embedding: Embedding,
}

/// Queryable index built from one document
///
/// Only constructed once every passage carries its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentIndex {
    pub source: PathBuf,
    pub fingerprint: DocumentFingerprint,
    passages: Vec<Passage>,
}

/// Passage returned from a query with its similarity score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPassage<'a> {
    pub passage: &'a Passage,
    pub score: f32,
}

impl DocumentIndex {
    pub fn new(source: PathBuf, fingerprint: DocumentFingerprint, passages: Vec<Passage>) -> Self {
        Self {
            source,
            fingerprint,
            passages,
        }
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }

    /// Whether this index was built from the file currently at `path`
    pub fn is_current_for(&self, path: &Path) -> bool {
        self.source == path
            && DocumentFingerprint::of(path).is_ok_and(|fp| fp == self.fingerprint)
    }

    /// Top-k passages by cosine similarity, best first
    pub fn search(&self, query: &[f32], k: usize) -> Vec<ScoredPassage<'_>> {
        let mut scored: Vec<ScoredPassage<'_>> = self
            .passages
            .iter()
            .map(|passage| ScoredPassage {
                passage,
                score: cosine_similarity(query, &passage.embedding),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

/// Cosine similarity; 0.0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
