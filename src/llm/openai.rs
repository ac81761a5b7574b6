//! `OpenAI`-compatible chat completion and embedding clients

use super::types::{
    ContentBlock, LlmMessage, LlmRequest, LlmResponse, MessageRole, Usage,
};
use super::{Embedder, Embedding, LlmError, LlmService};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

fn http_client() -> Result<Client, LlmError> {
    Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .map_err(|e| LlmError::unknown(format!("Failed to create HTTP client: {e}")))
}

/// Send a JSON body and classify failures; returns the raw success body
async fn post_json<B: Serialize + ?Sized>(
    client: &Client,
    url: &str,
    api_key: &str,
    body: &B,
) -> Result<String, LlmError> {
    let response = client
        .post(url)
        .header("Authorization", format!("Bearer {api_key}"))
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| LlmError::from_transport(&e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;

    if !status.is_success() {
        if let Ok(error_resp) = serde_json::from_str::<OpenAIErrorResponse>(&body) {
            return Err(LlmError::from_status(
                status.as_u16(),
                &error_resp.error.message,
            ));
        }
        return Err(LlmError::from_status(status.as_u16(), &body));
    }

    Ok(body)
}

/// Chat completions service for any OpenAI-compatible endpoint
pub struct OpenAIService {
    client: Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenAIService {
    pub fn new(api_key: String, model: String, base_url: &str) -> Result<Self, LlmError> {
        Ok(Self {
            client: http_client()?,
            api_key,
            model,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        })
    }

    fn translate_request(&self, request: &LlmRequest) -> OpenAIRequest {
        let mut messages = Vec::new();

        if !request.system.is_empty() {
            let system_text = request
                .system
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");

            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: Some(system_text),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for msg in &request.messages {
            messages.extend(Self::translate_message(msg));
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAITool {
                        r#type: "function".to_string(),
                        function: OpenAIFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        // tool_choice is only valid alongside tools
        let tool_choice = tools.as_ref().map(|_| "auto".to_string());

        let response_format = request.response_format.as_ref().map(|format| {
            json!({
                "type": "json_schema",
                "json_schema": {
                    "name": format.name,
                    "schema": format.schema,
                    "strict": true
                }
            })
        });

        OpenAIRequest {
            model: self.model.clone(),
            messages,
            tools,
            tool_choice,
            response_format,
            max_tokens: request.max_tokens,
            stream: false,
        }
    }

    /// Translate an LLM message to `OpenAI` format.
    /// Returns a Vec because tool results need separate messages with role "tool".
    fn translate_message(msg: &LlmMessage) -> Vec<OpenAIMessage> {
        let role = match msg.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();

        for block in &msg.content {
            match block {
                ContentBlock::Text { text } => {
                    text_parts.push(text.clone());
                }
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(OpenAIToolCall {
                        id: id.clone(),
                        r#type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: name.clone(),
                            arguments: serde_json::to_string(input)
                                .unwrap_or_else(|_| "{}".to_string()),
                        },
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    tool_results.push((tool_use_id.clone(), content.clone(), *is_error));
                }
            }
        }

        let mut messages = Vec::new();

        // Tool results answer the preceding assistant tool calls and must come first
        for (tool_use_id, content, is_error) in tool_results {
            messages.push(OpenAIMessage {
                role: "tool".to_string(),
                content: Some(if is_error {
                    format!("Error: {content}")
                } else {
                    content
                }),
                tool_calls: None,
                tool_call_id: Some(tool_use_id),
            });
        }

        if !text_parts.is_empty() || !tool_calls.is_empty() {
            let content = if text_parts.is_empty() {
                None
            } else {
                Some(text_parts.join("\n"))
            };

            messages.push(OpenAIMessage {
                role: role.to_string(),
                content,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            });
        }

        if messages.is_empty() {
            messages.push(OpenAIMessage {
                role: role.to_string(),
                content: Some(String::new()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        messages
    }

    fn normalize_response(resp: OpenAIResponse) -> Result<LlmResponse, LlmError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::unknown("No choices in response"))?;

        let mut content = Vec::new();

        if let Some(text) = choice.message.content {
            if !text.is_empty() {
                content.push(ContentBlock::Text { text });
            }
        }

        if let Some(tool_calls) = choice.message.tool_calls {
            for tc in tool_calls {
                if tc.function.name.is_empty() {
                    continue;
                }

                let input = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or_else(|_| json!({}));

                content.push(ContentBlock::ToolUse {
                    id: tc.id,
                    name: tc.function.name,
                    input,
                });
            }
        }

        let end_turn = choice.finish_reason.as_deref() == Some("stop");
        let usage = resp.usage.unwrap_or_default();

        Ok(LlmResponse {
            content,
            end_turn,
            usage: Usage {
                input_tokens: u64::from(usage.prompt_tokens),
                output_tokens: u64::from(usage.completion_tokens),
            },
        })
    }
}

#[async_trait]
impl LlmService for OpenAIService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let openai_request = self.translate_request(request);
        let body = post_json(&self.client, &self.url, &self.api_key, &openai_request).await?;

        let openai_response: OpenAIResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::unknown(format!("Failed to parse response: {e} - body: {body}"))
        })?;

        Self::normalize_response(openai_response)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Embeddings endpoint client
pub struct OpenAIEmbeddings {
    client: Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenAIEmbeddings {
    pub fn new(api_key: String, model: String, base_url: &str) -> Result<Self, LlmError> {
        Ok(Self {
            client: http_client()?,
            api_key,
            model,
            url: format!("{}/embeddings", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = json!({
            "model": self.model,
            "input": texts,
        });
        let body = post_json(&self.client, &self.url, &self.api_key, &request).await?;

        let response: EmbeddingResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::unknown(format!("Failed to parse embeddings: {e}")))?;

        if response.data.len() != texts.len() {
            return Err(LlmError::unknown(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                response.data.len()
            )));
        }

        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    r#type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    r#type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[allow(clippy::struct_field_names)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Embedding,
}
