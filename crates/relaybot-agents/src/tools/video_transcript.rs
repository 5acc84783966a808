use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Tool, ToolError, ToolResult, build_browser_client, required_str, truncate_chars};

pub const VIDEO_TOOL_NAME: &str = "get_youtube_info";

const YOUTUBE_BASE_URL: &str = "https://www.youtube.com";
const PLAYER_RESPONSE_MARKER: &str = "ytInitialPlayerResponse = ";
const DESCRIPTION_MAX_CHARS: usize = 300;
const TRANSCRIPT_MAX_CHARS: usize = 2000;

static VIDEO_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"youtube\.com/shorts/([A-Za-z0-9_-]{11})",
        r"(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/embed/)([A-Za-z0-9_-]{11})",
        r"youtube\.com/watch\?.*?v=([A-Za-z0-9_-]{11})",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid video id regex"))
    .collect()
});
static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("valid url regex"));
static CAPTION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<text[^>]*>(.*?)</text>").expect("valid caption regex"));

/// The 11-character id of a YouTube video link, if `url` is one.
pub fn extract_video_id(url: &str) -> Option<String> {
    VIDEO_ID_PATTERNS
        .iter()
        .find_map(|re| re.captures(url))
        .map(|caps| caps[1].to_string())
}

/// Video links in free text, in order of appearance, without duplicates.
pub fn find_video_urls(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    let mut urls = Vec::new();
    for m in URL_PATTERN.find_iter(text) {
        let url = m.as_str().trim_end_matches(['.', ',', ')', '!', '?']);
        if let Some(id) = extract_video_id(url) {
            if !seen.contains(&id) {
                seen.push(id);
                urls.push(url.to_string());
            }
        }
    }
    urls
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoInfo {
    pub video_id: String,
    pub title: Option<String>,
    pub channel: Option<String>,
    pub duration_secs: Option<u64>,
    pub description: Option<String>,
    pub transcript: Option<String>,
}

impl VideoInfo {
    fn apply_player_response(&mut self, player: &Value) {
        let details = &player["videoDetails"];
        self.title = non_empty(details["title"].as_str());
        self.channel = non_empty(details["author"].as_str());
        self.description = non_empty(details["shortDescription"].as_str());
        self.duration_secs = details["lengthSeconds"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| details["lengthSeconds"].as_u64());
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Render video details as the text handed back to the model.
pub fn format_video_info(info: &VideoInfo) -> String {
    let title = info
        .title
        .clone()
        .unwrap_or_else(|| format!("YouTube Video {}", info.video_id));
    let mut lines = vec![
        format!("**YouTube Video: {title}**"),
        format!("Video ID: {}", info.video_id),
    ];

    if let Some(channel) = &info.channel {
        lines.push(format!("Channel: {channel}"));
    }
    if let Some(duration) = info.duration_secs.filter(|d| *d > 0) {
        lines.push(format!("Duration: {}m {}s", duration / 60, duration % 60));
    }
    if let Some(description) = &info.description {
        let description = match truncate_chars(description, DESCRIPTION_MAX_CHARS) {
            Some(cut) => format!("{cut}..."),
            None => description.clone(),
        };
        lines.push(format!("\nDescription:\n{description}"));
    }
    match &info.transcript {
        Some(transcript) => {
            let transcript = match truncate_chars(transcript, TRANSCRIPT_MAX_CHARS) {
                Some(cut) => format!("{cut}\n\n[Transcript truncated...]"),
                None => transcript.clone(),
            };
            lines.push(format!("\nTranscript:\n{transcript}"));
        }
        None => lines.push("\nTranscript: Not available".to_string()),
    }

    lines.join("\n")
}

/// Pull the JSON object assigned to `ytInitialPlayerResponse` out of a watch
/// page. The object is followed by more script, so only the first value is read.
fn parse_player_response(html: &str) -> Option<Value> {
    let start = html.find(PLAYER_RESPONSE_MARKER)? + PLAYER_RESPONSE_MARKER.len();
    serde_json::Deserializer::from_str(&html[start..])
        .into_iter::<Value>()
        .next()?
        .ok()
}

/// English manual captions, then English auto captions, then anything.
fn preferred_caption_url(player: &Value) -> Option<String> {
    let tracks = player["captions"]["playerCaptionsTracklistRenderer"]["captionTracks"].as_array()?;
    let is_english = |t: &&Value| {
        t["languageCode"]
            .as_str()
            .is_some_and(|code| code.starts_with("en"))
    };
    let is_auto = |t: &&Value| t["kind"].as_str() == Some("asr");

    tracks
        .iter()
        .find(|t| is_english(t) && !is_auto(t))
        .or_else(|| tracks.iter().find(|t| is_english(t)))
        .or_else(|| tracks.first())
        .and_then(|t| t["baseUrl"].as_str())
        .map(str::to_string)
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
}

/// Join the cues of a timedtext XML document into one paragraph.
fn parse_timedtext(xml: &str) -> String {
    CAPTION_LINE
        .captures_iter(xml)
        .map(|caps| decode_entities(&decode_entities(&caps[1])))
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct VideoTranscriptTool {
    client: Client,
    base_url: String,
}

impl VideoTranscriptTool {
    pub fn new(timeout: Duration) -> Result<Self, ToolError> {
        Ok(Self {
            client: build_browser_client(timeout)?,
            base_url: YOUTUBE_BASE_URL.to_string(),
        })
    }

    /// Serve watch pages, captions and oEmbed from another origin.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn player_response(&self, video_id: &str) -> Result<Option<Value>, ToolError> {
        let html = self
            .client
            .get(format!("{}/watch", self.base_url))
            .query(&[("v", video_id)])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(parse_player_response(&html))
    }

    async fn oembed(&self, video_id: &str) -> Result<(Option<String>, Option<String>), ToolError> {
        let watch_url = format!("{YOUTUBE_BASE_URL}/watch?v={video_id}");
        let data: Value = self
            .client
            .get(format!("{}/oembed", self.base_url))
            .query(&[("url", watch_url.as_str()), ("format", "json")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok((
            non_empty(data["title"].as_str()),
            non_empty(data["author_name"].as_str()),
        ))
    }

    async fn transcript(&self, caption_url: &str) -> Result<String, ToolError> {
        let url = if caption_url.starts_with('/') {
            format!("{}{caption_url}", self.base_url)
        } else {
            caption_url.to_string()
        };
        let xml = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(parse_timedtext(&xml))
    }

    /// Collect what can be found about one video. A missing transcript is a
    /// partial result; failing to learn anything at all is an error.
    pub async fn fetch_info(&self, video_id: &str) -> Result<VideoInfo, ToolError> {
        let mut info = VideoInfo {
            video_id: video_id.to_string(),
            ..VideoInfo::default()
        };
        let mut first_error = None;

        let player = match self.player_response(video_id).await {
            Ok(player) => player,
            Err(e) => {
                warn!(video_id, "watch page unavailable: {e}");
                first_error = Some(e);
                None
            }
        };
        if let Some(player) = &player {
            info.apply_player_response(player);
        }

        if info.title.is_none() {
            match self.oembed(video_id).await {
                Ok((title, channel)) => {
                    info.title = title;
                    info.channel = info.channel.or(channel);
                }
                Err(e) => {
                    debug!(video_id, "oembed lookup failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(caption_url) = player.as_ref().and_then(preferred_caption_url) {
            match self.transcript(&caption_url).await {
                Ok(text) if !text.is_empty() => info.transcript = Some(text),
                Ok(_) => debug!(video_id, "caption track was empty"),
                Err(e) => debug!(video_id, "transcript download failed: {e}"),
            }
        }

        if info.title.is_none() && info.transcript.is_none() {
            return Err(first_error.unwrap_or_else(|| {
                ToolError::NotFound(format!("no details available for video {video_id}"))
            }));
        }
        Ok(info)
    }

    async fn run(&self, input: &Value) -> Result<String, ToolError> {
        let url = required_str(input, "url")?;
        let video_id = extract_video_id(url).ok_or_else(|| {
            ToolError::InvalidArguments(format!("could not extract a video id from '{url}'"))
        })?;
        info!(video_id = %video_id, "looking up video");
        let info = self.fetch_info(&video_id).await?;
        Ok(format_video_info(&info))
    }
}

#[async_trait]
impl Tool for VideoTranscriptTool {
    fn name(&self) -> &'static str {
        VIDEO_TOOL_NAME
    }

    fn description(&self) -> &'static str {
        "Get information and transcript from a YouTube video. Use this when the user shares \
         a YouTube link or asks about a video."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The YouTube video URL"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ids_from_all_link_shapes() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://m.youtube.com/watch?feature=share&v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ?t=42",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://youtube.com/shorts/dQw4w9WgXcQ",
        ] {
            assert_eq!(extract_video_id(url).as_deref(), Some("dQw4w9WgXcQ"), "{url}");
        }
        assert_eq!(extract_video_id("https://example.com/watch?v=abc"), None);
    }

    #[test]
    fn finds_video_links_in_text_once() {
        let text = "watch https://youtu.be/dQw4w9WgXcQ, then \
                    https://www.youtube.com/watch?v=dQw4w9WgXcQ and https://example.com.";
        assert_eq!(find_video_urls(text), vec!["https://youtu.be/dQw4w9WgXcQ"]);
        assert!(find_video_urls("no links here").is_empty());
    }

    #[test]
    fn reads_player_response_followed_by_script() {
        let html = r#"<script>var ytInitialPlayerResponse = {"videoDetails":{"title":"Talk","author":"Chan","lengthSeconds":"125","shortDescription":"About things"}};var meta = {};</script>"#;
        let player = parse_player_response(html).unwrap();
        let mut info = VideoInfo::default();
        info.apply_player_response(&player);
        assert_eq!(info.title.as_deref(), Some("Talk"));
        assert_eq!(info.channel.as_deref(), Some("Chan"));
        assert_eq!(info.duration_secs, Some(125));
    }

    #[test]
    fn prefers_manual_english_captions() {
        let player = json!({"captions": {"playerCaptionsTracklistRenderer": {"captionTracks": [
            {"baseUrl": "https://c/de", "languageCode": "de"},
            {"baseUrl": "https://c/en-auto", "languageCode": "en", "kind": "asr"},
            {"baseUrl": "https://c/en", "languageCode": "en-GB"}
        ]}}});
        assert_eq!(preferred_caption_url(&player).as_deref(), Some("https://c/en"));

        let auto_only = json!({"captions": {"playerCaptionsTracklistRenderer": {"captionTracks": [
            {"baseUrl": "https://c/de", "languageCode": "de"},
            {"baseUrl": "https://c/en-auto", "languageCode": "en", "kind": "asr"}
        ]}}});
        assert_eq!(
            preferred_caption_url(&auto_only).as_deref(),
            Some("https://c/en-auto")
        );
        assert_eq!(preferred_caption_url(&json!({})), None);
    }

    #[test]
    fn timedtext_is_flattened_and_decoded() {
        let xml = r#"<?xml version="1.0"?><transcript><text start="0" dur="1">it&amp;#39;s
            here</text><text start="1" dur="2">rock &amp;amp; roll</text></transcript>"#;
        assert_eq!(parse_timedtext(xml), "it's here rock & roll");
    }

    #[test]
    fn formats_partial_info_without_transcript() {
        let info = VideoInfo {
            video_id: "dQw4w9WgXcQ".into(),
            title: Some("Song".into()),
            channel: Some("Artist".into()),
            duration_secs: Some(212),
            description: Some("d".repeat(310)),
            transcript: None,
        };
        let text = format_video_info(&info);
        assert!(text.starts_with("**YouTube Video: Song**\nVideo ID: dQw4w9WgXcQ\nChannel: Artist\nDuration: 3m 32s"));
        assert!(text.contains(&format!("\nDescription:\n{}...", "d".repeat(300))));
        assert!(text.ends_with("\nTranscript: Not available"));
    }

    #[test]
    fn long_transcripts_are_cut() {
        let info = VideoInfo {
            video_id: "dQw4w9WgXcQ".into(),
            transcript: Some("w".repeat(2500)),
            ..VideoInfo::default()
        };
        let text = format_video_info(&info);
        assert!(text.starts_with("**YouTube Video: YouTube Video dQw4w9WgXcQ**"));
        assert!(text.ends_with(&format!("{}\n\n[Transcript truncated...]", "w".repeat(2000))));
    }
}
