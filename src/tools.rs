//! Tools the model can invoke
//!
//! Tools are stateless singletons; per-call context arrives via `ToolContext`.

mod web_search;

pub use web_search::{SearchConfig, SearchProvider, TavilyProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use web_search::WebSearchTool;

/// Result from tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
        }
    }
}

/// All context needed for a tool invocation
#[derive(Clone)]
pub struct ToolContext {
    /// Fired when the step times out
    pub cancel: CancellationToken,
    pub session_id: String,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken, session_id: impl Into<String>) -> Self {
        Self {
            cancel,
            session_id: session_id.into(),
        }
    }
}

/// Trait for tools that can be executed by the agent
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Tool description for LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Execute the tool; long-running work should watch `ctx.cancel`
    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// Collection of tools available to sessions
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Registry exposing web search over `provider`
    pub fn with_search(provider: Arc<dyn SearchProvider>, max_results: usize) -> Self {
        Self {
            tools: vec![Arc::new(WebSearchTool::new(provider, max_results))],
        }
    }

    /// Get all tool definitions for LLM
    pub fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        self.tools
            .iter()
            .map(|t| crate::llm::ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name; `None` if no such tool is registered
    pub async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Option<ToolOutput> {
        for tool in &self.tools {
            if tool.name() == name {
                return Some(tool.run(input, ctx).await);
            }
        }
        None
    }
}
