//! External collaborator contracts + concrete sources: video metadata, comment
//! threads, and the incrementally loading search listing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use tubelog_core::{CommentKey, FieldSet};
use tubelog_storage::{HttpError, HttpFetcher, RetryDisposition};

pub const CRATE_NAME: &str = "tubelog-adapters";

/// Upload date (last hour) + type (video) + sort (relevance).
pub const DEFAULT_SEARCH_FILTER: &str = "CAASBAgBEAE%253D";
pub const COMMENT_THREADS_URL: &str = "https://www.googleapis.com/youtube/v3/commentThreads";

const KST_OFFSET_SECS: i32 = 9 * 3600;
const KST_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("{tool} failed for {video_id}: {message}")]
    Tool {
        tool: String,
        video_id: String,
        message: String,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding payload for {video_id}: {source}")]
    Decode {
        video_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid page token {0:?}")]
    PageToken(String),
}

impl FetchError {
    /// Whether a later attempt at the same fetch could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(err) => err.disposition() == RetryDisposition::Retryable,
            Self::Tool { .. } => true,
            Self::Io { .. } | Self::Decode { .. } | Self::PageToken(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedVideo {
    pub video_id: String,
    pub fields: FieldSet,
    pub raw_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedComment {
    pub key: CommentKey,
    pub fields: FieldSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentPage {
    pub comments: Vec<FetchedComment>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, video_id: &str) -> Result<FetchedVideo, FetchError>;
}

#[async_trait]
pub trait CommentSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_page(
        &self,
        video_id: &str,
        page_token: Option<&str>,
    ) -> Result<CommentPage, FetchError>;
}

/// Reads the identifiers currently visible in a listing. May repeat earlier ones.
#[async_trait]
pub trait IdentifierExtractor: Send + Sync {
    async fn extract(&self) -> Result<Vec<String>, AdapterError>;
}

/// Drives an incrementally loading view.
#[async_trait]
pub trait ViewScroller: Send + Sync {
    type Fingerprint: PartialEq + std::fmt::Debug + Send;

    async fn advance(&self) -> Result<(), AdapterError>;

    async fn measure(&self) -> Result<Self::Fingerprint, AdapterError>;
}

pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(KST_OFFSET_SECS).expect("KST offset is in range")
}

pub fn format_kst(at: DateTime<Utc>) -> String {
    at.with_timezone(&kst()).format(KST_FORMAT).to_string()
}

/// RFC 3339 timestamp (as returned by the Data API) rendered in KST; "" when unparseable.
pub fn iso8601_to_kst(value: &str) -> String {
    if value.trim().is_empty() {
        return String::new();
    }
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| format_kst(dt.with_timezone(&Utc)))
        .unwrap_or_default()
}

fn json_truthy(value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(JsonValue::Array(a)) => !a.is_empty(),
        Some(JsonValue::Object(o)) => !o.is_empty(),
        Some(JsonValue::Null) | None => false,
    }
}

fn json_seconds(info: &JsonValue, key: &str) -> Option<i64> {
    let value = info.get(key)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.trunc() as i64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn json_text(info: &JsonValue, key: &str) -> String {
    info.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Publish time in KST from `timestamp`/`release_timestamp`, falling back to `upload_date`.
pub fn publish_time_kst(info: &JsonValue) -> String {
    let from_timestamp = ["timestamp", "release_timestamp"]
        .iter()
        .filter_map(|key| json_seconds(info, key))
        .find(|secs| *secs != 0)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    let published = from_timestamp.or_else(|| {
        let upload_date = info.get("upload_date")?.as_str()?;
        NaiveDate::parse_from_str(upload_date, "%Y%m%d")
            .ok()?
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
    });

    published.map(format_kst).unwrap_or_default()
}

pub fn classify_video_type(info: &JsonValue) -> &'static str {
    let live_status = info
        .get("live_status")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    if json_truthy(info.get("is_live")) || live_status == "is_live" {
        return "live";
    }
    if matches!(live_status, "is_upcoming" | "upcoming") {
        return "upcoming_live";
    }
    if json_truthy(info.get("was_live")) || matches!(live_status, "was_live" | "post_live") {
        return "live_archive";
    }
    if json_seconds(info, "duration").unwrap_or(0) < 60 {
        return "short";
    }
    "vod"
}

pub fn format_duration(total_secs: i64) -> String {
    let total = total_secs.max(0);
    format!("{}m {}s", total / 60, total % 60)
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

pub fn video_fields_from_info(video_id: &str, info: &JsonValue) -> FieldSet {
    FieldSet::new()
        .with("title", json_text(info, "title"))
        .with("channel", json_text(info, "channel"))
        .with("publish_time", publish_time_kst(info))
        .with("description", json_text(info, "description"))
        .with(
            "duration",
            format_duration(json_seconds(info, "duration").unwrap_or(0)),
        )
        .with("status", classify_video_type(info))
        .with("url", watch_url(video_id))
}

/// Decode an info document. `raw_json` keeps the fetched text as-is, minus
/// trailing whitespace such as the newline `yt-dlp` prints.
pub fn fetched_video_from_bytes(video_id: &str, bytes: &[u8]) -> Result<FetchedVideo, FetchError> {
    let info: JsonValue = serde_json::from_slice(bytes).map_err(|source| FetchError::Decode {
        video_id: video_id.to_string(),
        source,
    })?;
    Ok(FetchedVideo {
        video_id: video_id.to_string(),
        fields: video_fields_from_info(video_id, &info),
        raw_json: String::from_utf8_lossy(bytes).trim_end().to_string(),
    })
}

/// Metadata via the `yt-dlp` executable, without downloading media.
#[derive(Debug, Clone)]
pub struct YtDlpMetadataSource {
    binary: PathBuf,
}

impl YtDlpMetadataSource {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl MetadataSource for YtDlpMetadataSource {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch(&self, video_id: &str) -> Result<FetchedVideo, FetchError> {
        let url = watch_url(video_id);
        debug!(video_id, binary = %self.binary.display(), "running yt-dlp");
        let output = Command::new(&self.binary)
            .args(["--dump-single-json", "--skip-download", "--no-warnings", "--quiet"])
            .arg(&url)
            .output()
            .await
            .map_err(|err| FetchError::Tool {
                tool: self.binary.display().to_string(),
                video_id: video_id.to_string(),
                message: err.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Tool {
                tool: self.binary.display().to_string(),
                video_id: video_id.to_string(),
                message: format!(
                    "{}: {}",
                    output.status,
                    stderr.trim().chars().take(300).collect::<String>()
                ),
            });
        }

        fetched_video_from_bytes(video_id, &output.stdout)
    }
}

/// Metadata served from `<dir>/<video_id>.json` info documents.
#[derive(Debug, Clone)]
pub struct FixtureMetadataSource {
    dir: PathBuf,
}

impl FixtureMetadataSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl MetadataSource for FixtureMetadataSource {
    fn name(&self) -> &'static str {
        "fixture-metadata"
    }

    async fn fetch(&self, video_id: &str) -> Result<FetchedVideo, FetchError> {
        let path = self.dir.join(format!("{video_id}.json"));
        let bytes = tokio::fs::read(&path).await.map_err(|source| FetchError::Io {
            path: path.display().to_string(),
            source,
        })?;
        fetched_video_from_bytes(video_id, &bytes)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadList {
    #[serde(default)]
    items: Vec<CommentThread>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommentThread {
    snippet: Option<ThreadSnippet>,
    replies: Option<ThreadReplies>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadSnippet {
    top_level_comment: Option<CommentResource>,
}

#[derive(Debug, Deserialize)]
struct ThreadReplies {
    #[serde(default)]
    comments: Vec<CommentResource>,
}

#[derive(Debug, Deserialize)]
struct CommentResource {
    snippet: Option<CommentSnippet>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentSnippet {
    text_display: Option<String>,
    text_original: Option<String>,
    author_display_name: Option<String>,
    author_channel_id: Option<JsonValue>,
    published_at: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn comment_from_snippet(video_id: &str, snippet: CommentSnippet) -> FetchedComment {
    let text = non_empty(snippet.text_display)
        .or_else(|| non_empty(snippet.text_original))
        .unwrap_or_default();
    let channel_id = snippet
        .author_channel_id
        .as_ref()
        .and_then(|v| v.get("value"))
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    let channel_url = if channel_id.is_empty() {
        String::new()
    } else {
        format!("https://www.youtube.com/channel/{channel_id}")
    };
    let time = iso8601_to_kst(snippet.published_at.as_deref().unwrap_or_default());

    FetchedComment {
        key: CommentKey::new(video_id, Some(&channel_id), Some(&time)),
        fields: FieldSet::new()
            .with("comment", text)
            .with("author_name", snippet.author_display_name.unwrap_or_default())
            .with("author_channel_url", channel_url)
            .with("comment_time_kst", time),
    }
}

/// Flatten one `commentThreads` response: each thread's top-level comment, then its replies.
/// Threads without a top-level snippet are skipped.
pub fn parse_comment_threads(video_id: &str, body: JsonValue) -> Result<CommentPage, FetchError> {
    let list: CommentThreadList =
        serde_json::from_value(body).map_err(|source| FetchError::Decode {
            video_id: video_id.to_string(),
            source,
        })?;

    let mut comments = Vec::new();
    for thread in list.items {
        let Some(top) = thread
            .snippet
            .and_then(|s| s.top_level_comment)
            .and_then(|c| c.snippet)
        else {
            continue;
        };
        comments.push(comment_from_snippet(video_id, top));

        let replies = thread.replies.map(|r| r.comments).unwrap_or_default();
        for reply in replies {
            comments.push(comment_from_snippet(
                video_id,
                reply.snippet.unwrap_or_default(),
            ));
        }
    }

    Ok(CommentPage {
        comments,
        next_page_token: non_empty(list.next_page_token),
    })
}

/// YouTube Data API v3 `commentThreads`, newest first, 100 threads per page.
#[derive(Debug, Clone)]
pub struct YoutubeCommentSource {
    http: HttpFetcher,
    api_key: String,
    endpoint: String,
}

impl YoutubeCommentSource {
    pub fn new(http: HttpFetcher, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            endpoint: COMMENT_THREADS_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl CommentSource for YoutubeCommentSource {
    fn name(&self) -> &'static str {
        "youtube-data-api"
    }

    async fn fetch_page(
        &self,
        video_id: &str,
        page_token: Option<&str>,
    ) -> Result<CommentPage, FetchError> {
        let mut query = vec![
            ("key", self.api_key.as_str()),
            ("part", "snippet,replies"),
            ("videoId", video_id),
            ("maxResults", "100"),
            ("textFormat", "plainText"),
            ("order", "time"),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        let body = self.http.get_json(&self.endpoint, &query).await?;
        parse_comment_threads(video_id, body)
    }
}

/// Comment pages served from `<dir>/<video_id>.json`, a JSON array of
/// `commentThreads` responses. Page tokens are array indices; a missing file
/// means the video has no comments.
#[derive(Debug, Clone)]
pub struct FixtureCommentSource {
    dir: PathBuf,
}

impl FixtureCommentSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl CommentSource for FixtureCommentSource {
    fn name(&self) -> &'static str {
        "fixture-comments"
    }

    async fn fetch_page(
        &self,
        video_id: &str,
        page_token: Option<&str>,
    ) -> Result<CommentPage, FetchError> {
        let path = self.dir.join(format!("{video_id}.json"));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CommentPage::default())
            }
            Err(source) => {
                return Err(FetchError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let pages: Vec<JsonValue> =
            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                video_id: video_id.to_string(),
                source,
            })?;
        let index = match page_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| FetchError::PageToken(token.to_string()))?,
        };
        let Some(body) = pages.get(index).cloned() else {
            return Err(FetchError::PageToken(index.to_string()));
        };

        let mut page = parse_comment_threads(video_id, body)?;
        page.next_page_token = (index + 1 < pages.len()).then(|| (index + 1).to_string());
        Ok(page)
    }
}

pub fn search_url(query: &str, filter: &str) -> String {
    let query = query.split_whitespace().collect::<Vec<_>>().join("+");
    format!("https://www.youtube.com/results?search_query={query}&sp={filter}")
}

/// Video id from a `/watch?v=<id>&...` link.
pub fn video_id_from_href(href: &str) -> Option<String> {
    if !href.contains("/watch?v=") {
        return None;
    }
    let id = href.split("watch?v=").nth(1)?.split('&').next()?.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Ids of every `a#video-title` result link in a rendered search page, in document order.
pub fn extract_video_ids(html: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let sel = Selector::parse("a#video-title").map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(video_id_from_href)
        .collect())
}

/// Recorded search-page renders, one per scroll depth, replayed as a live view.
///
/// `advance` moves to the next render and stays on the last one once the
/// recording runs out; `measure` is the current document length, standing in
/// for the page's scroll height.
#[derive(Debug)]
pub struct ReplayFeed {
    increments: Vec<String>,
    cursor: AtomicUsize,
}

impl ReplayFeed {
    pub fn new(increments: Vec<String>) -> Self {
        Self {
            increments,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Load every `*.html` file in `dir`, ordered by file name.
    pub fn from_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("reading feed directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "html"))
            .collect::<Vec<_>>();
        paths.sort();

        let increments = paths
            .iter()
            .map(|path| {
                fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(increments))
    }

    pub fn len(&self) -> usize {
        self.increments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.increments.is_empty()
    }

    fn current(&self) -> &str {
        let index = self.cursor.load(Ordering::SeqCst);
        self.increments
            .get(index)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[async_trait]
impl IdentifierExtractor for ReplayFeed {
    async fn extract(&self) -> Result<Vec<String>, AdapterError> {
        extract_video_ids(self.current())
    }
}

#[async_trait]
impl ViewScroller for ReplayFeed {
    type Fingerprint = usize;

    async fn advance(&self) -> Result<(), AdapterError> {
        let last = self.increments.len().saturating_sub(1);
        let _ = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| Some((i + 1).min(last)));
        Ok(())
    }

    async fn measure(&self) -> Result<usize, AdapterError> {
        Ok(self.current().len())
    }
}
