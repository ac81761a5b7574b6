//! Session state types

use crate::retrieval::{DocumentIndex, DocumentSegment};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

// ============================================================================
// Tool Input Types
// ============================================================================

/// Name the web search tool is exposed to the model under
pub const WEB_SEARCH_TOOL: &str = "web_search";

/// Input for the web search tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSearchInput {
    pub query: String,
}

/// Strongly typed tool input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tool", rename_all = "snake_case")]
pub enum ToolInput {
    WebSearch(WebSearchInput),
    /// Fallback for unknown tools or parsing failures
    Unknown { name: String, input: Value },
}

impl ToolInput {
    pub fn tool_name(&self) -> &str {
        match self {
            ToolInput::WebSearch(_) => WEB_SEARCH_TOOL,
            ToolInput::Unknown { name, .. } => name,
        }
    }

    /// Convert to JSON Value for tool execution
    pub fn to_value(&self) -> Value {
        match self {
            ToolInput::WebSearch(input) => serde_json::to_value(input).unwrap_or(Value::Null),
            ToolInput::Unknown { input, .. } => input.clone(),
        }
    }

    /// Parse from tool name and JSON value
    pub fn from_name_and_value(name: &str, value: Value) -> Self {
        match name {
            WEB_SEARCH_TOOL => serde_json::from_value(value.clone()).map_or_else(
                |_| ToolInput::Unknown {
                    name: name.to_string(),
                    input: value,
                },
                ToolInput::WebSearch,
            ),
            _ => ToolInput::Unknown {
                name: name.to_string(),
                input: value,
            },
        }
    }
}

/// A tool call from the model with typed input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub input: ToolInput,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, input: ToolInput) -> Self {
        Self {
            id: id.into(),
            input,
        }
    }

    pub fn name(&self) -> &str {
        self.input.tool_name()
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// Graph node that produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeName {
    Index,
    Router,
    Rag,
    Search,
    GeneralChat,
}

impl NodeName {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeName::Index => "index",
            NodeName::Router => "router",
            NodeName::Rag => "rag",
            NodeName::Search => "search",
            NodeName::GeneralChat => "general_chat",
        }
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Absent for user messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeName>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            node: None,
        }
    }

    pub fn assistant(content: impl Into<String>, node: NodeName) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            node: Some(node),
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        node: NodeName,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            node: Some(node),
        }
    }
}

// ============================================================================
// Turn Phase
// ============================================================================

/// Classification of a turn failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Router classifier call failed or returned an unknown label
    ClassificationFailure,
    /// Search provider or tool dispatch failed
    ToolInvocationFailure,
    /// Document could not be loaded, chunked or embedded
    IndexFailure,
    /// Answer or search-request generation failed
    GenerationFailure,
    TimedOut,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ClassificationFailure => "classification_failure",
            ErrorKind::ToolInvocationFailure => "tool_invocation_failure",
            ErrorKind::IndexFailure => "index_failure",
            ErrorKind::GenerationFailure => "generation_failure",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Storage => "storage",
        }
    }
}

/// Where the session currently is in its decision chain
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnPhase {
    /// Ready for a user message
    #[default]
    Idle,
    /// Building or validating the retriever for the turn's document
    Indexing,
    /// Classifier call in flight
    Routing,
    /// Model asked to produce a web search tool call
    RequestingSearch,
    /// Web search tool running
    Searching,
    AnsweringFromDocument,
    AnsweringGeneral,
    /// Turn aborted; a new user message starts a fresh turn
    Error {
        message: String,
        error_kind: ErrorKind,
    },
}

impl TurnPhase {
    /// Whether a turn is in flight
    pub fn is_working(&self) -> bool {
        !matches!(self, TurnPhase::Idle | TurnPhase::Error { .. })
    }

    /// Node executing in this phase, if any
    pub fn node(&self) -> Option<NodeName> {
        match self {
            TurnPhase::Idle | TurnPhase::Error { .. } => None,
            TurnPhase::Indexing => Some(NodeName::Index),
            TurnPhase::Routing => Some(NodeName::Router),
            TurnPhase::RequestingSearch | TurnPhase::Searching => Some(NodeName::Search),
            TurnPhase::AnsweringFromDocument => Some(NodeName::Rag),
            TurnPhase::AnsweringGeneral => Some(NodeName::GeneralChat),
        }
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Durable record of one conversation thread
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub document_path: Option<PathBuf>,
    /// Present only once every passage is embedded
    #[serde(default)]
    pub retriever: Option<DocumentIndex>,
    #[serde(default)]
    pub documents: Vec<DocumentSegment>,
    #[serde(default)]
    pub search_performed: bool,
    #[serde(default)]
    pub rag_used: bool,
    /// Router entries in the current turn
    #[serde(default)]
    pub router_visits: u32,
    #[serde(default)]
    pub phase: TurnPhase,
}

impl SessionState {
    /// Text of the most recent user message
    pub fn latest_question(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Tool calls on the last message when the model produced it
    pub fn pending_tool_calls(&self) -> &[ToolCall] {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map_or(&[], |m| m.tool_calls.as_slice())
    }
}
