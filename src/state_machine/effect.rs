//! Effects produced by state transitions

use super::state::{ChatMessage, ToolCall};
use std::path::PathBuf;

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Persist the new state as the next checkpoint version
    Checkpoint,

    /// Build (or reuse) the retriever for a document
    BuildIndex { path: PathBuf },

    /// Ask the classifier for the next route
    Classify,

    /// Ask the model to emit a web search tool call
    RequestSearch,

    /// Run the first search call; the rest get synthetic skipped results
    ExecuteSearch {
        call: ToolCall,
        skipped: Vec<ToolCall>,
    },

    /// Retrieve passages and answer strictly from them
    AnswerFromDocument,

    /// Open-domain answer over the full history
    AnswerGeneral,

    /// Broadcast the current phase
    NotifyState,

    /// Broadcast an appended message
    NotifyMessage { message: ChatMessage, live: bool },

    /// Broadcast that the turn finished
    NotifyTurnDone,

    /// Broadcast a turn failure
    NotifyError { message: String },
}

impl Effect {
    pub fn notify_message(message: ChatMessage) -> Self {
        Effect::NotifyMessage {
            message,
            live: false,
        }
    }

    pub fn notify_live_message(message: ChatMessage) -> Self {
        Effect::NotifyMessage {
            message,
            live: true,
        }
    }

    /// Whether executing this effect suspends on remote I/O
    pub fn is_step(&self) -> bool {
        matches!(
            self,
            Effect::BuildIndex { .. }
                | Effect::Classify
                | Effect::RequestSearch
                | Effect::ExecuteSearch { .. }
                | Effect::AnswerFromDocument
                | Effect::AnswerGeneral
        )
    }
}
