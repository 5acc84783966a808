use std::time::Duration;

use async_trait::async_trait;
use relaybot_common::{ChatMessage, ChatRole, Result, ToolCall};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    FinishReason, LlmProvider, LlmRequest, LlmResponse, Usage, build_client, network_error,
    status_error,
};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Chat Completions client, used both for OpenAI itself and for any
/// OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    provider_id: &'static str,
    supports_tools: bool,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| OPENAI_API_URL.to_string()),
            provider_id: "openai",
            supports_tools: true,
        }
    }

    /// A third-party endpoint speaking the Chat Completions protocol.
    pub fn compatible(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        supports_tools: bool,
    ) -> Self {
        Self {
            provider_id: "openai-compatible",
            supports_tools,
            ..Self::new(api_key, model, Some(base_url.into()))
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = build_client(timeout)?;
        Ok(self)
    }

    fn convert_request(&self, request: &LlmRequest) -> OpenAiRequest {
        let messages = request.messages.iter().map(convert_message).collect();

        let tools = if request.tools.is_empty() || !self.supports_tools {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAiTool {
                        kind: "function".to_string(),
                        function: OpenAiFunctionDefinition {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        OpenAiRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        self.provider_id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn supports_tool_calling(&self) -> bool {
        self.supports_tools
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let openai_request = self.convert_request(request);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&openai_request)
            .send()
            .await
            .map_err(|e| network_error(self.provider_id, e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(self.provider_id, status, &error_text));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| network_error(self.provider_id, e))?;

        Ok(match serde_json::from_str::<OpenAiResponse>(&raw) {
            Ok(parsed) => convert_response(parsed),
            Err(e) => LlmResponse::malformed(format!(
                "failed to parse {} response: {e}",
                self.provider_id
            )),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

fn convert_message(msg: &ChatMessage) -> OpenAiMessage {
    match msg.role {
        ChatRole::System => OpenAiMessage::System {
            content: msg.content.clone(),
        },
        ChatRole::User => OpenAiMessage::User {
            content: msg.content.clone(),
        },
        ChatRole::Assistant => {
            let tool_calls: Vec<OpenAiToolCall> = msg
                .tool_calls
                .iter()
                .map(|call| OpenAiToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect();
            OpenAiMessage::Assistant {
                content: (!msg.content.is_empty() || tool_calls.is_empty())
                    .then(|| msg.content.clone()),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            }
        }
        ChatRole::Tool => OpenAiMessage::Tool {
            tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
            content: msg.content.clone(),
        },
    }
}

fn convert_response(response: OpenAiResponse) -> LlmResponse {
    let Some(choice) = response.choices.into_iter().next() else {
        return LlmResponse::malformed("no choices in response");
    };
    let message = choice.message;

    let mut tool_calls = Vec::new();
    for tc in message.tool_calls.unwrap_or_default() {
        let arguments = if tc.function.arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(&tc.function.arguments) {
                Ok(value) => value,
                Err(e) => {
                    return LlmResponse::malformed(format!(
                        "tool call {} has unparseable arguments: {e}",
                        tc.id
                    ));
                }
            }
        };
        tool_calls.push(ToolCall {
            id: tc.id,
            name: tc.function.name,
            arguments,
        });
    }

    let finish_reason = match choice.finish_reason.as_deref() {
        Some("stop") => FinishReason::Stop,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    };

    LlmResponse {
        text: message.content.unwrap_or_default(),
        tool_calls,
        finish_reason,
        usage: response.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
    }
}

// Request Types
#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: OpenAiFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionDefinition,
}

#[derive(Serialize)]
struct OpenAiFunctionDefinition {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response Types
#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ToolDefinition;

    fn request_with_tools() -> LlmRequest {
        LlmRequest {
            messages: vec![ChatMessage::user("hi")],
            tools: vec![ToolDefinition {
                name: "search_web".into(),
                description: "Search".into(),
                input_schema: json!({"type": "object"}),
            }],
            max_tokens: 64,
            temperature: 0.2,
        }
    }

    #[test]
    fn assistant_tool_calls_serialize_arguments_as_strings() {
        let msg = ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: "call_1".into(),
                name: "search_web".into(),
                arguments: json!({"query": "rust"}),
            }],
        );
        let value = serde_json::to_value(convert_message(&msg)).unwrap();
        assert_eq!(value["role"], "assistant");
        assert!(value.get("content").is_none());
        assert_eq!(value["tool_calls"][0]["type"], "function");
        assert_eq!(
            value["tool_calls"][0]["function"]["arguments"],
            r#"{"query":"rust"}"#
        );
    }

    #[test]
    fn tool_messages_carry_their_call_id() {
        let msg = ChatMessage::tool_result("call_1", "search_web", "results");
        let value = serde_json::to_value(convert_message(&msg)).unwrap();
        assert_eq!(
            value,
            json!({"role": "tool", "tool_call_id": "call_1", "content": "results"})
        );
    }

    #[test]
    fn tools_are_omitted_when_unsupported() {
        let provider = OpenAiProvider::compatible("k", "llama", "https://api.groq.com/openai/v1/", false);
        assert_eq!(provider.base_url, "https://api.groq.com/openai/v1");
        assert_eq!(provider.provider_id(), "openai-compatible");
        let body = serde_json::to_value(provider.convert_request(&request_with_tools())).unwrap();
        assert!(body.get("tools").is_none());

        let provider = OpenAiProvider::new("k", "gpt-4o", None);
        let body = serde_json::to_value(provider.convert_request(&request_with_tools())).unwrap();
        assert_eq!(body["tools"][0]["function"]["name"], "search_web");
        assert_eq!(body["model"], "gpt-4o");
    }

    #[test]
    fn bad_tool_arguments_make_the_response_malformed() {
        let response: OpenAiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "search_web", "arguments": "{not json"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();
        assert_eq!(convert_response(response).finish_reason, FinishReason::Error);
    }

    #[test]
    fn empty_choices_are_malformed() {
        let response: OpenAiResponse =
            serde_json::from_value(json!({"choices": [], "usage": null})).unwrap();
        assert_eq!(convert_response(response).finish_reason, FinishReason::Error);
    }
}
