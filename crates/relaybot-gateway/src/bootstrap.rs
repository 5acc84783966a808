use std::sync::Arc;

use relaybot_agents::tools::{
    BraveBackend, DuckDuckGoBackend, HttpRenderer, SearchBackend, TavilyBackend,
    VideoTranscriptTool, WebFetchTool, WebSearchTool,
};
use relaybot_agents::{
    AgentRuntime, AnthropicProvider, LlmProvider, OpenAiProvider, RuntimeLimits, ToolRegistry,
};
use relaybot_common::{Error, Result};
use relaybot_config::{AppConfig, LlmConfig, ProviderKind, SearchEngine};
use relaybot_store::HistoryStore;
use tracing::info;

/// Build the configured LLM provider.
pub fn build_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.provider {
        ProviderKind::Anthropic => {
            let mut provider = AnthropicProvider::new(&config.api_key, &config.model)
                .with_timeout(config.timeout)?;
            if let Some(base) = &config.base_url {
                provider = provider.with_base_url(anthropic_endpoint(base));
            }
            Arc::new(provider)
        }
        ProviderKind::OpenAi => Arc::new(
            OpenAiProvider::new(&config.api_key, &config.model, config.base_url.clone())
                .with_timeout(config.timeout)?,
        ),
        ProviderKind::OpenAiCompatible => {
            let base = config.base_url.as_deref().ok_or_else(|| {
                Error::Config("LLM_BASE_URL is required for openai-compatible".into())
            })?;
            Arc::new(
                OpenAiProvider::compatible(
                    &config.api_key,
                    &config.model,
                    base,
                    config.supports_tools,
                )
                .with_timeout(config.timeout)?,
            )
        }
    };

    info!(
        "using {} provider with model {}",
        provider.provider_id(),
        provider.model()
    );
    Ok(provider)
}

/// `LLM_BASE_URL` for Anthropic may be the API origin or the full messages
/// endpoint.
fn anthropic_endpoint(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/messages") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/messages")
    } else {
        format!("{base}/v1/messages")
    }
}

fn tool_setup_error(e: impl std::fmt::Display) -> Error {
    Error::Config(format!("failed to set up tools: {e}"))
}

/// Register search, fetch and video tools.
pub fn build_tools(config: &AppConfig) -> Result<ToolRegistry> {
    let fetch_timeout = config.fetch.timeout;

    let backend: Arc<dyn SearchBackend> = match config.search.engine {
        SearchEngine::DuckDuckGo => {
            Arc::new(DuckDuckGoBackend::new(fetch_timeout).map_err(tool_setup_error)?)
        }
        SearchEngine::Brave => {
            let key = config
                .search
                .brave_api_key
                .as_deref()
                .ok_or_else(|| Error::Config("BRAVE_API_KEY is required for brave search".into()))?;
            Arc::new(BraveBackend::new(key, fetch_timeout).map_err(tool_setup_error)?)
        }
        SearchEngine::Tavily => {
            let key = config.search.tavily_api_key.as_deref().ok_or_else(|| {
                Error::Config("TAVILY_API_KEY is required for tavily search".into())
            })?;
            Arc::new(TavilyBackend::new(key, fetch_timeout).map_err(tool_setup_error)?)
        }
    };

    let mut fetch =
        WebFetchTool::new(fetch_timeout, config.fetch.max_chars).map_err(tool_setup_error)?;
    if let Some(endpoint) = &config.fetch.render_endpoint {
        let renderer = HttpRenderer::new(endpoint, config.agent.tool_timeout)
            .map_err(tool_setup_error)?;
        fetch = fetch.with_renderer(Arc::new(renderer));
    }

    let mut registry = ToolRegistry::new(config.agent.tool_timeout);
    registry.register(Arc::new(WebSearchTool::new(backend, config.search.max_results)));
    registry.register(Arc::new(fetch));
    registry.register(Arc::new(
        VideoTranscriptTool::new(fetch_timeout).map_err(tool_setup_error)?,
    ));
    Ok(registry)
}

/// Assemble the agent runtime with a fresh history store.
pub fn build_runtime(config: &AppConfig, provider: Arc<dyn LlmProvider>) -> Result<AgentRuntime> {
    let tools = build_tools(config)?;
    let history = Arc::new(HistoryStore::new(config.agent.max_history_messages));
    let limits = RuntimeLimits {
        max_iterations: config.agent.max_tool_iterations,
        turn_timeout: config.agent.turn_timeout,
        max_tokens: config.llm.max_tokens,
        temperature: config.llm.temperature,
    };

    Ok(AgentRuntime::new(provider, tools, history)
        .with_limits(limits)
        .with_system_prompt(config.agent.system_prompt.clone())
        .with_auto_video_context(config.agent.auto_video_context))
}
