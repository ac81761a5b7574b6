//! Semantic chunking by embedding-distance breakpoints
//!
//! Sentences are embedded with their neighbours; a passage boundary is placed
//! wherever the cosine distance between consecutive windows exceeds
//! `mean + k * stddev` of all distances on the page.

use super::index::cosine_similarity;
use super::loader::DocumentSegment;
use super::EMBED_BATCH_SIZE;
use crate::llm::{Embedder, LlmError};
use regex::Regex;
use std::sync::{Arc, LazyLock};

/// Sentences on either side included in each embedding window
const BUFFER_SIZE: usize = 1;

static SENTENCE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.?!]\s+").expect("sentence boundary pattern is valid"));

/// Split text after `.`, `?` or `!` followed by whitespace
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_BOUNDARY.find_iter(text) {
        // The punctuation is a single ASCII byte
        let end = m.start() + 1;
        if let Some(sentence) = text.get(start..end) {
            sentences.push(sentence.to_string());
        }
        start = m.end();
    }
    if let Some(rest) = text.get(start..) {
        if !rest.is_empty() {
            sentences.push(rest.to_string());
        }
    }
    sentences
}

/// Each sentence joined with `BUFFER_SIZE` neighbours on both sides
fn combine_windows(sentences: &[String]) -> Vec<String> {
    (0..sentences.len())
        .map(|i| {
            let lo = i.saturating_sub(BUFFER_SIZE);
            let hi = (i + BUFFER_SIZE + 1).min(sentences.len());
            sentences[lo..hi].join(" ")
        })
        .collect()
}

/// Cosine distance between each consecutive pair of embeddings
pub fn consecutive_distances(embeddings: &[Vec<f32>]) -> Vec<f32> {
    embeddings
        .windows(2)
        .map(|pair| 1.0 - cosine_similarity(&pair[0], &pair[1]))
        .collect()
}

/// Indices `i` where the gap between sentence `i` and `i + 1` is a breakpoint
pub fn breakpoints(distances: &[f32], stddev_multiplier: f32) -> Vec<usize> {
    if distances.is_empty() {
        return Vec::new();
    }

    #[allow(clippy::cast_precision_loss)]
    let n = distances.len() as f32;
    let mean = distances.iter().sum::<f32>() / n;
    let variance = distances.iter().map(|d| (d - mean).powi(2)).sum::<f32>() / n;
    let threshold = mean + stddev_multiplier * variance.sqrt();

    distances
        .iter()
        .enumerate()
        .filter(|(_, d)| **d > threshold)
        .map(|(i, _)| i)
        .collect()
}

/// Group sentences into passages, cutting after each breakpoint index
pub fn group_sentences(sentences: &[String], cuts: &[usize]) -> Vec<String> {
    let mut passages = Vec::new();
    let mut start = 0;
    for &cut in cuts {
        if cut + 1 > start && cut < sentences.len() {
            passages.push(sentences[start..=cut].join(" "));
            start = cut + 1;
        }
    }
    if start < sentences.len() {
        passages.push(sentences[start..].join(" "));
    }
    passages
}

/// Splits loaded pages into semantically coherent passages
pub struct SemanticChunker {
    embedder: Arc<dyn Embedder>,
    stddev_multiplier: f32,
}

impl SemanticChunker {
    pub fn new(embedder: Arc<dyn Embedder>, stddev_multiplier: f32) -> Self {
        Self {
            embedder,
            stddev_multiplier,
        }
    }

    pub async fn split_documents(
        &self,
        segments: &[DocumentSegment],
    ) -> Result<Vec<DocumentSegment>, LlmError> {
        let mut passages = Vec::new();
        for segment in segments {
            for text in self.split_text(&segment.text).await? {
                passages.push(DocumentSegment {
                    text,
                    page: segment.page,
                });
            }
        }
        Ok(passages)
    }

    async fn split_text(&self, text: &str) -> Result<Vec<String>, LlmError> {
        let sentences = split_sentences(text);
        if sentences.len() <= 1 {
            return Ok(sentences);
        }

        let windows = combine_windows(&sentences);
        let mut embeddings = Vec::with_capacity(windows.len());
        for batch in windows.chunks(EMBED_BATCH_SIZE) {
            embeddings.extend(self.embedder.embed_batch(batch).await?);
        }
        let distances = consecutive_distances(&embeddings);
        let cuts = breakpoints(&distances, self.stddev_multiplier);

        Ok(group_sentences(&sentences, &cuts))
    }
}
