use async_trait::async_trait;
use relaybot_common::{ChatMessage, Error, Result, ToolCall};
use serde::{Deserialize, Serialize};

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

/// Trait for LLM provider integrations (Anthropic, OpenAI, OpenAI-compatible).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g. "anthropic", "openai").
    fn provider_id(&self) -> &str;

    /// Model id sent with every request.
    fn model(&self) -> &str;

    /// Whether tool schemas should be advertised to this backend.
    fn supports_tool_calling(&self) -> bool {
        true
    }

    /// Send one generation request. The history in `request` is never mutated.
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Check if the provider is reachable and accepts our credentials.
    async fn health_check(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: None,
        }
    }

    pub fn tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: text.into(),
            tool_calls,
            finish_reason: FinishReason::ToolCalls,
            usage: None,
        }
    }

    /// A 2xx body we could not make sense of. `detail` ends up in the error
    /// the loop reports.
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            text: detail.into(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Error,
            usage: None,
        }
    }

    pub fn wants_tools(&self) -> bool {
        self.finish_reason != FinishReason::Stop && !self.tool_calls.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Map a non-success HTTP status to the error taxonomy.
pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let detail = format!("{provider} API error (status={}): {}", status.as_u16(), body.trim());
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Error::ProviderAuth(detail)
    } else {
        Error::Provider(detail)
    }
}

pub(crate) fn network_error(provider: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Provider(format!("{provider} request timed out: {e}"))
    } else {
        Error::Provider(format!("{provider} network error: {e}"))
    }
}

pub(crate) fn build_client(timeout: std::time::Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}
