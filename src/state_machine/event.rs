//! Events that can occur in a session

use super::router::RouteDecision;
use super::state::{ChatMessage, ErrorKind, ToolCall};
use crate::retrieval::{DocumentIndex, DocumentSegment};
use std::path::PathBuf;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // User events
    UserMessage {
        text: String,
        /// `None` or an empty path means the turn has no document
        document_path: Option<PathBuf>,
    },

    // Indexer events
    IndexBuilt {
        index: DocumentIndex,
        documents: Vec<DocumentSegment>,
    },
    /// Existing index still matches the document on disk
    IndexReused,
    /// Document path does not resolve to a file
    DocumentMissing,

    // Router events
    RouteDecided {
        decision: RouteDecision,
    },

    // Capability events
    SearchRequested {
        content: String,
        tool_calls: Vec<ToolCall>,
    },
    SearchComplete {
        /// Tool-role messages, one per call on the request message
        results: Vec<ChatMessage>,
    },
    AnswerGenerated {
        content: String,
    },

    /// A suspend-capable step failed; the turn aborts
    StepFailed {
        message: String,
        error_kind: ErrorKind,
    },
}
