use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{Tool, ToolError, ToolResult, build_browser_client, required_str, truncate_chars};

/// Below this many characters a static extraction counts as empty.
pub const MIN_USABLE_CHARS: usize = 50;

const SKIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "noscript", "template", "svg",
];
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "li", "tr", "section", "article", "main", "h1", "h2", "h3", "h4", "h5",
    "h6", "pre", "blockquote", "table", "ul", "ol",
];

static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid selector"));
static CONTENT_CANDIDATES: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    ["main", "article", "div[class]", "body"]
        .iter()
        .map(|s| Selector::parse(s).expect("valid selector"))
        .collect()
});
static CONTENT_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)content|article|post").expect("valid regex"));

/// Headless-browser service that turns a URL into rendered HTML.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<String, ToolError>;
}

/// Renderer reached over HTTP: `POST {"url": ...}` answered with HTML.
pub struct HttpRenderer {
    client: Client,
    endpoint: String,
}

impl HttpRenderer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ToolError> {
        Ok(Self {
            client: build_browser_client(timeout)?,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    async fn render(&self, url: &str) -> Result<String, ToolError> {
        Ok(self
            .client
            .post(&self.endpoint)
            .json(&json!({ "url": url }))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }
}

/// Readable text pulled out of an HTML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPage {
    pub title: String,
    pub content: String,
}

impl ExtractedPage {
    pub fn is_usable(&self) -> bool {
        self.content.chars().count() >= MIN_USABLE_CHARS
    }
}

/// Extract the title and main text of `html`, skipping page chrome.
pub fn extract_page(html: &str) -> ExtractedPage {
    let document = Html::parse_document(html);

    let title = document
        .select(&TITLE)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "No title".to_string());

    let root = main_content(&document).unwrap_or_else(|| document.root_element());
    let mut raw = String::new();
    collect_text(root, &mut raw);

    ExtractedPage {
        title,
        content: normalize_lines(&raw),
    }
}

/// `main`, then `article`, then a content-ish `div`, then `body`.
fn main_content(document: &Html) -> Option<ElementRef<'_>> {
    CONTENT_CANDIDATES.iter().find_map(|selector| {
        document.select(selector).find(|el| {
            el.value().name() != "div"
                || el
                    .value()
                    .attr("class")
                    .is_some_and(|class| CONTENT_CLASS.is_match(class))
        })
    })
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_el) = ElementRef::wrap(child) {
            let name = child_el.value().name();
            if SKIPPED_ELEMENTS.contains(&name) {
                continue;
            }
            let block = BLOCK_ELEMENTS.contains(&name);
            if block {
                out.push('\n');
            }
            collect_text(child_el, out);
            if block {
                out.push('\n');
            }
        }
    }
}

fn normalize_lines(raw: &str) -> String {
    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn validate_url(raw: &str) -> Result<url::Url, ToolError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ToolError::InvalidArguments(format!("invalid URL '{raw}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ToolError::InvalidArguments(format!(
            "unsupported URL scheme '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ToolError::InvalidArguments(format!("URL '{raw}' has no host")));
    }
    Ok(parsed)
}

pub struct WebFetchTool {
    client: Client,
    max_chars: usize,
    renderer: Option<Arc<dyn PageRenderer>>,
}

impl WebFetchTool {
    pub fn new(timeout: Duration, max_chars: usize) -> Result<Self, ToolError> {
        Ok(Self {
            client: build_browser_client(timeout)?,
            max_chars,
            renderer: None,
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    async fn fetch_page(&self, url: &url::Url) -> Result<ExtractedPage, ToolError> {
        let response = self.client.get(url.clone()).send().await?.error_for_status()?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_ascii_lowercase();
        let body = response.text().await?;

        if content_type.contains("html") {
            return Ok(extract_page(&body));
        }
        if content_type.starts_with("text/") || content_type.contains("json") {
            return Ok(ExtractedPage {
                title: url.to_string(),
                content: body.trim().to_string(),
            });
        }
        Err(ToolError::NoContent(format!(
            "unsupported content type '{content_type}'"
        )))
    }

    async fn run(&self, input: &Value) -> Result<String, ToolError> {
        let raw_url = required_str(input, "url")?;
        let url = validate_url(raw_url)?;
        info!(host = url.host_str().unwrap_or_default(), "fetching URL");

        let mut page = self.fetch_page(&url).await?;
        if !page.is_usable() {
            let Some(renderer) = &self.renderer else {
                return Err(ToolError::NoContent(format!(
                    "{raw_url} returned no readable text (the page may need JavaScript)"
                )));
            };
            debug!("static extraction came up short, rendering {raw_url}");
            page = extract_page(&renderer.render(url.as_str()).await?);
            if !page.is_usable() {
                return Err(ToolError::NoContent(format!(
                    "{raw_url} returned no readable text even after rendering"
                )));
            }
        }

        let content = match truncate_chars(&page.content, self.max_chars) {
            Some(cut) => format!("{cut}\n\n[Content truncated...]"),
            None => page.content,
        };
        Ok(format!("**{}**\n\nURL: {}\n\n{}", page.title, raw_url, content))
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &'static str {
        "fetch_url"
    }

    fn description(&self) -> &'static str {
        "Fetch and extract content from a web page URL. Use this to read articles, \
         documentation, or any web page content."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: &Value) -> ToolResult {
        self.run(input).await.into()
    }
}
