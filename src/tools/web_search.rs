//! Web search tool backed by a search provider
//!
//! The default provider is Tavily's search API with advanced depth. Results
//! are handed to the model as a JSON array of `{title, url, content, score}`.

use super::{Tool, ToolContext, ToolOutput};
use crate::state_machine::state::{WebSearchInput, WEB_SEARCH_TOOL};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const TAVILY_URL: &str = "https://api.tavily.com/search";

/// Hard upper bound on results per query
pub const MAX_RESULTS_LIMIT: usize = 5;

/// One ranked search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub content: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Search request failed: {0}")]
    Transport(String),
    #[error("Search provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed search response: {0}")]
    Decode(String),
    #[error("Search cancelled")]
    Cancelled,
}

/// Free-text web search
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize)
        -> Result<Vec<SearchResult>, SearchError>;
}

/// Search settings
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub tavily_api_key: Option<String>,
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            tavily_api_key: None,
            max_results: MAX_RESULTS_LIMIT,
        }
    }
}

impl SearchConfig {
    pub fn from_env() -> Self {
        Self {
            tavily_api_key: std::env::var("TAVILY_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            max_results: std::env::var("MEDIBOT_SEARCH_MAX_RESULTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(MAX_RESULTS_LIMIT, clamp_results),
        }
    }
}

fn clamp_results(n: usize) -> usize {
    n.clamp(1, MAX_RESULTS_LIMIT)
}

// ============================================================================
// Tavily
// ============================================================================

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: &'static str,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

/// Tavily search API client
pub struct TavilyProvider {
    client: Client,
    api_key: String,
    url: String,
}

impl TavilyProvider {
    pub fn new(api_key: String) -> Result<Self, SearchError> {
        Self::with_url(api_key, TAVILY_URL.to_string())
    }

    pub fn with_url(api_key: String, url: String) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SearchError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            url,
        })
    }
}

#[async_trait]
impl SearchProvider for TavilyProvider {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let request = TavilyRequest {
            api_key: &self.api_key,
            query,
            search_depth: "advanced",
            max_results: clamp_results(max_results),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(SearchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_tavily(&body, max_results)
    }
}

fn parse_tavily(body: &str, max_results: usize) -> Result<Vec<SearchResult>, SearchError> {
    let mut parsed: TavilyResponse =
        serde_json::from_str(body).map_err(|e| SearchError::Decode(e.to_string()))?;
    parsed.results.truncate(clamp_results(max_results));
    Ok(parsed.results)
}

// ============================================================================
// Tool
// ============================================================================

/// Exposes a search provider to the model
pub struct WebSearchTool {
    provider: Arc<dyn SearchProvider>,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(provider: Arc<dyn SearchProvider>, max_results: usize) -> Self {
        Self {
            provider,
            max_results: clamp_results(max_results),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        WEB_SEARCH_TOOL
    }

    fn description(&self) -> String {
        "Search the web for current medical information. Returns ranked results with title, \
         url, content snippet and relevance score. Use for questions that need up-to-date or \
         authoritative sources."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: WebSearchInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        tracing::info!(session_id = %ctx.session_id, query = %input.query, "Running web search");

        let outcome = tokio::select! {
            r = self.provider.search(&input.query, self.max_results) => r,
            () = ctx.cancel.cancelled() => Err(SearchError::Cancelled),
        };

        match outcome {
            Ok(mut results) => {
                results.truncate(self.max_results);
                match serde_json::to_string(&results) {
                    Ok(json) => ToolOutput::success(json),
                    Err(e) => ToolOutput::error(format!("Failed to encode results: {e}")),
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %ctx.session_id, error = %e, "Web search failed");
                ToolOutput::error(e.to_string())
            }
        }
    }
}
