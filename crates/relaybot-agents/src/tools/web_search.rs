use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    Tool, ToolError, ToolResult, build_browser_client, required_str, truncate_chars,
};

const DUCKDUCKGO_LITE_URL: &str = "https://lite.duckduckgo.com/lite/";
const BRAVE_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";
const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";
const SNIPPET_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Engine name shown in the formatted results.
    fn name(&self) -> &'static str;

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, ToolError>;
}

// DuckDuckGo (HTML lite endpoint, no key)

pub struct DuckDuckGoBackend {
    client: Client,
    base_url: String,
}

impl DuckDuckGoBackend {
    pub fn new(timeout: Duration) -> Result<Self, ToolError> {
        Ok(Self {
            client: build_browser_client(timeout)?,
            base_url: DUCKDUCKGO_LITE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

static RESULT_LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.result-link").expect("valid selector"));
static RESULT_SNIPPET: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("td.result-snippet").expect("valid selector"));

/// Parse the lite results table. Links and snippets appear in document
/// order, one snippet row per result.
fn parse_duckduckgo_lite(html: &str, max_results: usize) -> Vec<SearchResult> {
    let document = Html::parse_document(html);
    let snippets: Vec<String> = document
        .select(&RESULT_SNIPPET)
        .map(|td| collapse_whitespace(&td.text().collect::<String>()))
        .collect();

    document
        .select(&RESULT_LINK)
        .enumerate()
        .filter_map(|(idx, link)| {
            let href = link.value().attr("href")?;
            let title = collapse_whitespace(&link.text().collect::<String>());
            let url = resolve_duckduckgo_href(href)?;
            if title.is_empty() {
                return None;
            }
            Some(SearchResult {
                title,
                url,
                snippet: snippets.get(idx).cloned().unwrap_or_default(),
            })
        })
        .take(max_results)
        .collect()
}

/// Unwrap `//duckduckgo.com/l/?uddg=<target>` redirect links.
fn resolve_duckduckgo_href(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let parsed = url::Url::parse(&absolute).ok()?;
    if parsed.path().starts_with("/l/") {
        return parsed
            .query_pairs()
            .find(|(key, _)| key == "uddg")
            .map(|(_, target)| target.into_owned());
    }
    Some(absolute)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl SearchBackend for DuckDuckGoBackend {
    fn name(&self) -> &'static str {
        "duckduckgo"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, ToolError> {
        let html = self
            .client
            .get(&self.base_url)
            .query(&[("q", query)])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(parse_duckduckgo_lite(&html, max_results))
    }
}

// Brave Search API

pub struct BraveBackend {
    client: Client,
    api_key: String,
    base_url: String,
}

impl BraveBackend {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ToolError> {
        Ok(Self {
            client: build_browser_client(timeout)?,
            api_key: api_key.into(),
            base_url: BRAVE_SEARCH_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl SearchBackend for BraveBackend {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, ToolError> {
        let data: Value = self
            .client
            .get(&self.base_url)
            .query(&[("q", query), ("count", &max_results.to_string())])
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(collect_results(&data["web"]["results"], "description", max_results))
    }
}

// Tavily API

pub struct TavilyBackend {
    client: Client,
    api_key: String,
    base_url: String,
}

impl TavilyBackend {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ToolError> {
        Ok(Self {
            client: build_browser_client(timeout)?,
            api_key: api_key.into(),
            base_url: TAVILY_SEARCH_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl SearchBackend for TavilyBackend {
    fn name(&self) -> &'static str {
        "tavily"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, ToolError> {
        let data: Value = self
            .client
            .post(&self.base_url)
            .json(&json!({
                "api_key": self.api_key,
                "query": query,
                "max_results": max_results,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(collect_results(&data["results"], "content", max_results))
    }
}

fn collect_results(items: &Value, snippet_key: &str, max_results: usize) -> Vec<SearchResult> {
    items
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|r| {
                    Some(SearchResult {
                        title: r["title"].as_str()?.to_string(),
                        url: r["url"].as_str()?.to_string(),
                        snippet: r[snippet_key].as_str().unwrap_or_default().to_string(),
                    })
                })
                .take(max_results)
                .collect()
        })
        .unwrap_or_default()
}

/// Render results as the text block handed back to the model.
pub fn format_results(query: &str, engine: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return format!("No results found for: {query}");
    }

    let mut out = format!("**Search results for: {query}** (via {engine})\n");
    for (i, result) in results.iter().enumerate() {
        out.push_str(&format!("\n{}. **{}**\n   {}\n", i + 1, result.title, result.url));
        if !result.snippet.is_empty() {
            match truncate_chars(&result.snippet, SNIPPET_MAX_CHARS) {
                Some(cut) => out.push_str(&format!("   {cut}...\n")),
                None => out.push_str(&format!("   {}\n", result.snippet)),
            }
        }
    }
    out.truncate(out.trim_end().len());
    out
}

pub struct WebSearchTool {
    backend: Arc<dyn SearchBackend>,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(backend: Arc<dyn SearchBackend>, max_results: usize) -> Self {
        Self {
            backend,
            max_results,
        }
    }

    async fn run(&self, input: &Value) -> Result<String, ToolError> {
        let query = required_str(input, "query")?;
        info!(engine = self.backend.name(), "searching the web");
        let results = self.backend.search(query, self.max_results).await?;
        debug!(count = results.len(), "search finished");
        Ok(format_results(query, self.backend.name(), &results))
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "search_web"
    }

    fn description(&self) -> &'static str {
        "Search the web for information. Use this when you need to find current information, \
         verify facts, or answer questions that require up-to-date knowledge."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: &Value) -> ToolResult {
        self.run(input).await.into()
    }
}
