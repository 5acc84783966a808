use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use relaybot_common::Error;
use serde::Serialize;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant in a Telegram chat. \
You can search the web, fetch web pages, and analyze YouTube videos. \
When asked to verify claims, provide context, suggest alternatives, or explain simply, \
use the available tools to gather accurate information. \
Be concise but thorough in your responses.";

/// Fully resolved process configuration. Built once at startup by
/// [`crate::ConfigLoader`] and never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    #[serde(skip_serializing)]
    pub telegram_token: Option<String>,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub search: SearchConfig,
    pub fetch: FetchConfig,
    pub access: AccessConfig,
    pub log_format: LogFormat,
}

impl AppConfig {
    /// The bot token, which only the `run` command needs.
    pub fn require_telegram_token(&self) -> Result<&str, Error> {
        self.telegram_token
            .as_deref()
            .ok_or_else(|| Error::Config("TELEGRAM_TOKEN is required".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    OpenAiCompatible,
}

impl ProviderKind {
    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "claude-3-5-sonnet-20241022",
            ProviderKind::OpenAi | ProviderKind::OpenAiCompatible => "gpt-4o",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::OpenAiCompatible => "openai-compatible",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAi),
            "openai-compatible" | "openai_compatible" | "compatible" => {
                Ok(ProviderKind::OpenAiCompatible)
            }
            other => Err(Error::Config(format!(
                "unknown LLM_PROVIDER '{other}' (expected anthropic, openai or openai-compatible)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub supports_tools: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

/// Limits and prompt for the orchestration loop.
#[derive(Debug, Clone, Serialize)]
pub struct AgentConfig {
    pub system_prompt: Option<String>,
    pub max_history_messages: usize,
    pub max_tool_iterations: usize,
    pub turn_timeout: Duration,
    pub tool_timeout: Duration,
    pub auto_video_context: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    DuckDuckGo,
    Brave,
    Tavily,
}

impl FromStr for SearchEngine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "duckduckgo" | "ddg" => Ok(SearchEngine::DuckDuckGo),
            "brave" => Ok(SearchEngine::Brave),
            "tavily" => Ok(SearchEngine::Tavily),
            other => Err(Error::Config(format!(
                "unknown SEARCH_ENGINE '{other}' (expected duckduckgo, brave or tavily)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchConfig {
    pub engine: SearchEngine,
    pub max_results: usize,
    #[serde(skip_serializing)]
    pub brave_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub tavily_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_chars: usize,
    pub render_endpoint: Option<String>,
}

/// Static allowlists of Telegram ids. Both empty means the bot is public.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccessConfig {
    pub allowed_users: Vec<i64>,
    pub allowed_groups: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::Config(format!(
                "unknown LOG_FORMAT '{other}' (expected text or json)"
            ))),
        }
    }
}
