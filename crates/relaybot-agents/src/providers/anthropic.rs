use std::time::Duration;

use async_trait::async_trait;
use relaybot_common::{ChatMessage, ChatRole, Result, ToolCall};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    FinishReason, LlmProvider, LlmRequest, LlmResponse, Usage, build_client, network_error,
    status_error,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: String,
    model: String,
    client: Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            client: Client::new(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    /// Override the full messages endpoint URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = build_client(timeout)?;
        Ok(self)
    }

    fn create_request_body(&self, request: &LlmRequest) -> Value {
        let (system, messages) = convert_messages(&request.messages);

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        if let Some(system) = system {
            body["system"] = json!(system);
        }

        if !request.tools.is_empty() {
            body["tools"] = json!(
                request
                    .tools
                    .iter()
                    .map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema
                    }))
                    .collect::<Vec<_>>()
            );
        }

        body
    }

    async fn post(&self, body: &Value) -> std::result::Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.create_request_body(request);

        let response = self
            .post(&body)
            .await
            .map_err(|e| network_error("anthropic", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error("anthropic", status, &error_text));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| network_error("anthropic", e))?;
        Ok(parse_response(&raw))
    }

    async fn health_check(&self) -> Result<bool> {
        let body = json!({
            "model": self.model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}]
        });

        match self.post(&body).await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

/// Split the history into the `system` field and Messages API turns.
///
/// Assistant tool calls become `tool_use` blocks and runs of tool results are
/// merged into a single user turn of `tool_result` blocks.
fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut converted: Vec<Value> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    for msg in messages {
        if msg.role != ChatRole::Tool && !pending_results.is_empty() {
            converted.push(json!({
                "role": "user",
                "content": std::mem::take(&mut pending_results),
            }));
        }

        match msg.role {
            ChatRole::System => system_parts.push(msg.content.clone()),
            ChatRole::User => converted.push(json!({
                "role": "user",
                "content": msg.content,
            })),
            ChatRole::Assistant => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": msg.content}));
                }
                for call in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                // The API rejects empty assistant turns.
                if !blocks.is_empty() {
                    converted.push(json!({"role": "assistant", "content": blocks}));
                }
            }
            ChatRole::Tool => pending_results.push(json!({
                "type": "tool_result",
                "tool_use_id": msg.tool_call_id.as_deref().unwrap_or_default(),
                "content": msg.content,
            })),
        }
    }

    if !pending_results.is_empty() {
        converted.push(json!({"role": "user", "content": pending_results}));
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    (system, converted)
}

fn parse_response(raw: &str) -> LlmResponse {
    let raw_response: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => return LlmResponse::malformed(format!("invalid JSON from anthropic: {e}")),
    };

    let Some(blocks) = raw_response["content"].as_array() else {
        return LlmResponse::malformed("anthropic response is missing `content`");
    };

    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block["type"].as_str().unwrap_or_default() {
            "text" => {
                if let Some(text) = block["text"].as_str() {
                    text_parts.push(text);
                }
            }
            "tool_use" => {
                let id = block["id"].as_str().unwrap_or_default();
                let name = block["name"].as_str().unwrap_or_default();
                if id.is_empty() || name.is_empty() {
                    return LlmResponse::malformed("anthropic tool_use block without id or name");
                }
                tool_calls.push(ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: match &block["input"] {
                        Value::Null => json!({}),
                        input => input.clone(),
                    },
                });
            }
            other => debug!("skipping anthropic content block of type {other}"),
        }
    }

    let finish_reason = match raw_response["stop_reason"].as_str() {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("max_tokens") => FinishReason::Length,
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    };

    let usage = raw_response["usage"].as_object().map(|u| Usage {
        input_tokens: u["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: u["output_tokens"].as_u64().unwrap_or(0) as u32,
    });

    LlmResponse {
        text: text_parts.join("\n"),
        tool_calls,
        finish_reason,
        usage,
    }
}
