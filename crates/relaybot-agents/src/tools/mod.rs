use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use relaybot_common::ToolCall;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::{debug, warn};

use crate::providers::ToolDefinition;

pub mod video_transcript;
pub mod web_fetch;
pub mod web_search;

pub use video_transcript::VideoTranscriptTool;
pub use web_fetch::{HttpRenderer, PageRenderer, WebFetchTool};
pub use web_search::{
    BraveBackend, DuckDuckGoBackend, SearchBackend, SearchResult, TavilyBackend, WebSearchTool,
};

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

/// A capability the model can invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn input_schema(&self) -> Value;

    /// Run the tool. Failures are reported in the result, never raised.
    async fn execute(&self, input: &Value) -> ToolResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    UnknownTool,
    InvalidArguments,
    Timeout,
    Network,
    NotFound,
    NoContent,
    Internal,
}

impl ToolErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolErrorKind::UnknownTool => "unknown_tool",
            ToolErrorKind::InvalidArguments => "invalid_arguments",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::Network => "network",
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::NoContent => "no_content",
            ToolErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one tool invocation. Always becomes exactly one tool message.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success(String),
    Failure { kind: ToolErrorKind, message: String },
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        ToolResult::Success(content.into())
    }

    pub fn failure(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        ToolResult::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success(_))
    }

    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        match self {
            ToolResult::Success(_) => None,
            ToolResult::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Text placed in the tool message the model sees.
    pub fn into_content(self) -> String {
        match self {
            ToolResult::Success(content) => content,
            ToolResult::Failure { kind, message } => format!("Error ({kind}): {message}"),
        }
    }
}

/// Internal failure type for tool implementations.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no usable content: {0}")]
    NoContent(String),

    #[error("{0}")]
    Internal(String),
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::InvalidArguments(_) => ToolErrorKind::InvalidArguments,
            ToolError::Timeout => ToolErrorKind::Timeout,
            ToolError::Network(_) => ToolErrorKind::Network,
            ToolError::NotFound(_) => ToolErrorKind::NotFound,
            ToolError::NoContent(_) => ToolErrorKind::NoContent,
            ToolError::Internal(_) => ToolErrorKind::Internal,
        }
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ToolError::Timeout
        } else if e.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            ToolError::NotFound(e.to_string())
        } else {
            ToolError::Network(e.to_string())
        }
    }
}

impl From<ToolError> for ToolResult {
    fn from(e: ToolError) -> Self {
        ToolResult::failure(e.kind(), e.to_string())
    }
}

impl From<Result<String, ToolError>> for ToolResult {
    fn from(result: Result<String, ToolError>) -> Self {
        match result {
            Ok(content) => ToolResult::Success(content),
            Err(e) => e.into(),
        }
    }
}

/// Fetch a required, non-blank string argument.
pub(crate) fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required parameter: {key}")))
}

/// Cut `text` to at most `max` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, max: usize) -> Option<&str> {
    text.char_indices().nth(max).map(|(idx, _)| &text[..idx])
}

/// HTTP client that looks like a desktop browser to the sites it visits.
pub(crate) fn build_browser_client(timeout: Duration) -> Result<Client, ToolError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

    Client::builder()
        .timeout(timeout)
        .user_agent(BROWSER_USER_AGENT)
        .default_headers(headers)
        .build()
        .map_err(|e| ToolError::Internal(format!("failed to build HTTP client: {e}")))
}

/// Named tools plus the containment rules around running them.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: Vec::new(),
            timeout,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        if self.get(tool.name()).is_some() {
            warn!("replacing already registered tool: {}", tool.name());
            self.tools.retain(|t| t.name() != tool.name());
        } else {
            debug!("registered tool: {}", tool.name());
        }
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas advertised to providers.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        self.execute_within(call, self.timeout).await
    }

    /// Run one call with the registry timeout capped at `budget`.
    pub async fn execute_within(&self, call: &ToolCall, budget: Duration) -> ToolResult {
        let Some(tool) = self.get(&call.name) else {
            return ToolResult::failure(
                ToolErrorKind::UnknownTool,
                format!("unknown tool: {}", call.name),
            );
        };

        if !call.arguments.is_object() {
            return ToolResult::failure(
                ToolErrorKind::InvalidArguments,
                "arguments must be a JSON object",
            );
        }

        let limit = self.timeout.min(budget);
        let run = AssertUnwindSafe(tool.execute(&call.arguments)).catch_unwind();
        match tokio::time::timeout(limit, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!(tool = %call.name, "tool panicked");
                ToolResult::failure(ToolErrorKind::Internal, format!("{} crashed", call.name))
            }
            Err(_) => {
                warn!(tool = %call.name, ?limit, "tool timed out");
                ToolResult::failure(
                    ToolErrorKind::Timeout,
                    format!("{} did not finish within {}s", call.name, limit.as_secs_f32()),
                )
            }
        }
    }
}
