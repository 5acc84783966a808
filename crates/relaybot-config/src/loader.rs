use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use relaybot_common::{Error, Result};

use crate::model::{
    AccessConfig, AgentConfig, AppConfig, DEFAULT_SYSTEM_PROMPT, FetchConfig, LlmConfig,
    LogFormat, ProviderKind, SearchConfig, SearchEngine,
};

/// Resolves [`AppConfig`] from flat `KEY=value` settings.
///
/// Settings normally come from the process environment after an optional
/// `.env` file has been loaded into it. Tests build the loader from a map.
pub struct ConfigLoader {
    vars: HashMap<String, String>,
    env_file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load `.env` (or `env_file` when given) into the environment, then
    /// snapshot the environment. Runs before logging is set up, so the file
    /// that was read is kept for [`env_file`](Self::env_file) instead of
    /// being logged here.
    pub fn from_env(env_file: Option<&Path>) -> Result<Self> {
        let loaded = match env_file {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| {
                    Error::Config(format!("failed to load env file {}: {e}", path.display()))
                })?;
                Some(path.to_path_buf())
            }
            None => match dotenvy::dotenv() {
                Ok(path) => Some(path),
                Err(e) if e.not_found() => None,
                Err(e) => return Err(Error::Config(format!("failed to parse .env: {e}"))),
            },
        };

        Ok(Self {
            env_file: loaded,
            ..Self::from_map(std::env::vars().collect())
        })
    }

    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            vars,
            env_file: None,
        }
    }

    /// The env file that was loaded, if any.
    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }

    /// Validate every setting and build the configuration.
    pub fn load(&self) -> Result<AppConfig> {
        let llm = self.llm_config()?;
        let agent = self.agent_config()?;
        let search = self.search_config()?;
        let fetch = self.fetch_config()?;
        let access = AccessConfig {
            allowed_users: self.id_list("ALLOWED_USERS")?,
            allowed_groups: self.id_list("ALLOWED_GROUPS")?,
        };
        let log_format = self.parsed_or("LOG_FORMAT", LogFormat::Text)?;

        Ok(AppConfig {
            telegram_token: self.get("TELEGRAM_TOKEN").map(str::to_string),
            llm,
            agent,
            search,
            fetch,
            access,
            log_format,
        })
    }

    fn llm_config(&self) -> Result<LlmConfig> {
        let provider = self.parsed_or("LLM_PROVIDER", ProviderKind::Anthropic)?;
        let api_key = self
            .get("LLM_API_KEY")
            .ok_or_else(|| Error::Config("LLM_API_KEY is required".into()))?
            .to_string();
        let model = self
            .get("LLM_MODEL")
            .unwrap_or(provider.default_model())
            .to_string();

        let base_url = self.url("LLM_BASE_URL")?;
        if provider == ProviderKind::OpenAiCompatible && base_url.is_none() {
            return Err(Error::Config(
                "LLM_BASE_URL is required for the openai-compatible provider".into(),
            ));
        }

        // groq.com accepts tool schemas but answers them unreliably.
        let tools_by_default = !base_url
            .as_deref()
            .is_some_and(|url| url.contains("groq.com"));
        let supports_tools = self.bool_or("LLM_SUPPORTS_TOOLS", tools_by_default)?;

        let temperature: f32 = self.parsed_or("LLM_TEMPERATURE", 0.7)?;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(Error::Config(format!(
                "LLM_TEMPERATURE must be between 0.0 and 2.0, got {temperature}"
            )));
        }

        Ok(LlmConfig {
            provider,
            api_key,
            model,
            base_url,
            supports_tools,
            max_tokens: self.positive_or("LLM_MAX_TOKENS", 4096)?,
            temperature,
            timeout: self.seconds_or("LLM_TIMEOUT_SECS", 60)?,
        })
    }

    fn agent_config(&self) -> Result<AgentConfig> {
        let max_history_messages: usize = self.parsed_or("MAX_HISTORY_MESSAGES", 20)?;
        if max_history_messages < 2 {
            return Err(Error::Config(
                "MAX_HISTORY_MESSAGES must be at least 2".into(),
            ));
        }

        let system_prompt = match self.vars.get("SYSTEM_PROMPT") {
            // Explicitly blank disables the system message.
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(value.clone()),
            None => Some(DEFAULT_SYSTEM_PROMPT.to_string()),
        };

        Ok(AgentConfig {
            system_prompt,
            max_history_messages,
            max_tool_iterations: self.positive_or("MAX_TOOL_ITERATIONS", 5)?,
            turn_timeout: self.seconds_or("TURN_TIMEOUT_SECS", 120)?,
            tool_timeout: self.seconds_or("TOOL_TIMEOUT_SECS", 30)?,
            auto_video_context: self.bool_or("AUTO_VIDEO_CONTEXT", true)?,
        })
    }

    fn search_config(&self) -> Result<SearchConfig> {
        let engine = self.parsed_or("SEARCH_ENGINE", SearchEngine::DuckDuckGo)?;
        let brave_api_key = self.get("BRAVE_API_KEY").map(str::to_string);
        let tavily_api_key = self.get("TAVILY_API_KEY").map(str::to_string);

        match engine {
            SearchEngine::Brave if brave_api_key.is_none() => {
                return Err(Error::Config(
                    "BRAVE_API_KEY is required when SEARCH_ENGINE=brave".into(),
                ));
            }
            SearchEngine::Tavily if tavily_api_key.is_none() => {
                return Err(Error::Config(
                    "TAVILY_API_KEY is required when SEARCH_ENGINE=tavily".into(),
                ));
            }
            _ => {}
        }

        Ok(SearchConfig {
            engine,
            max_results: self.positive_or("SEARCH_MAX_RESULTS", 5)?,
            brave_api_key,
            tavily_api_key,
        })
    }

    fn fetch_config(&self) -> Result<FetchConfig> {
        Ok(FetchConfig {
            timeout: self.seconds_or("FETCH_TIMEOUT_SECS", 10)?,
            max_chars: self.positive_or("FETCH_MAX_CHARS", 8000)?,
            render_endpoint: self.url("RENDER_ENDPOINT")?,
        })
    }

    /// Non-blank value for `key`.
    fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn parsed_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::Config(format!("invalid {key} '{raw}': {e}"))),
            None => Ok(default),
        }
    }

    fn positive_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr + PartialOrd + Default,
        T::Err: std::fmt::Display,
    {
        let value = self.parsed_or(key, default)?;
        if value <= T::default() {
            return Err(Error::Config(format!("{key} must be greater than zero")));
        }
        Ok(value)
    }

    fn seconds_or(&self, key: &str, default: u64) -> Result<Duration> {
        self.positive_or(key, default).map(Duration::from_secs)
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key).map(str::to_ascii_lowercase).as_deref() {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(Error::Config(format!(
                "invalid {key} '{other}': expected true or false"
            ))),
        }
    }

    fn url(&self, key: &str) -> Result<Option<String>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        let parsed = url::Url::parse(raw)
            .map_err(|e| Error::Config(format!("invalid {key} '{raw}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!("{key} must be an http(s) URL")));
        }
        Ok(Some(raw.trim_end_matches('/').to_string()))
    }

    fn id_list(&self, key: &str) -> Result<Vec<i64>> {
        let Some(raw) = self.get(key) else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| {
                id.parse()
                    .map_err(|_| Error::Config(format!("invalid id '{id}' in {key}")))
            })
            .collect()
    }
}
