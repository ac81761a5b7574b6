//! Routing policy
//!
//! The classifier only proposes a capability. Whether it runs is decided here
//! from the per-turn usage flags, so each capability fires at most once per
//! turn regardless of what the classifier keeps answering.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Field of the structured classifier reply holding the label
pub const ROUTE_FIELD: &str = "next_step";

/// Classifier output: exactly one of four labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    OutOfScope,
    Rag,
    Search,
    GeneralChat,
}

impl RouteDecision {
    pub const ALL: [RouteDecision; 4] = [
        RouteDecision::OutOfScope,
        RouteDecision::Rag,
        RouteDecision::Search,
        RouteDecision::GeneralChat,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RouteDecision::OutOfScope => "out_of_scope",
            RouteDecision::Rag => "rag",
            RouteDecision::Search => "search",
            RouteDecision::GeneralChat => "general_chat",
        }
    }

    pub fn from_label(label: &str) -> Result<Self, ClassificationError> {
        Self::ALL
            .into_iter()
            .find(|d| d.label() == label)
            .ok_or_else(|| ClassificationError::UnknownLabel(label.to_string()))
    }

    /// Parse the classifier's JSON reply `{"next_step": "<label>"}`
    pub fn parse(raw: &str) -> Result<Self, ClassificationError> {
        let value: Value = serde_json::from_str(raw.trim())
            .map_err(|e| ClassificationError::InvalidJson(e.to_string()))?;
        let label = value
            .get(ROUTE_FIELD)
            .and_then(Value::as_str)
            .ok_or(ClassificationError::MissingField)?;
        Self::from_label(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("Classifier reply is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("Classifier reply has no string `next_step` field")]
    MissingField,
    #[error("Classifier returned unknown route `{0}`")]
    UnknownLabel(String),
}

/// Usage flags the policy consults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteFlags {
    pub rag_used: bool,
    pub search_performed: bool,
    pub has_retriever: bool,
}

/// What the orchestrator does with a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Fixed refusal, turn ends
    Refuse,
    /// Run the document node and mark `rag_used`
    DispatchRag,
    /// No retriever: mark `rag_used` and classify again
    SkipRag,
    /// Ask the model for a search tool call and mark `search_performed`
    RequestSearch,
    /// Terminal open-domain answer
    GeneralChat,
}

/// Apply the once-per-turn policy to a classifier decision
pub fn route(decision: RouteDecision, flags: RouteFlags) -> RouteOutcome {
    match decision {
        RouteDecision::OutOfScope => RouteOutcome::Refuse,
        RouteDecision::Rag if flags.rag_used => RouteOutcome::GeneralChat,
        RouteDecision::Rag if flags.has_retriever => RouteOutcome::DispatchRag,
        RouteDecision::Rag => RouteOutcome::SkipRag,
        RouteDecision::Search if flags.search_performed => RouteOutcome::GeneralChat,
        RouteDecision::Search => RouteOutcome::RequestSearch,
        RouteDecision::GeneralChat => RouteOutcome::GeneralChat,
    }
}
