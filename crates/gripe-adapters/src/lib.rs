//! Source connector contract + provider connectors (YouTube comments, CPSC recalls).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use gripe_core::{Manifest, RawItem};
use gripe_storage::{FetchError, HttpFetcher};
use scraper::Html;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gripe-adapters";

pub const YOUTUBE_SOURCE_ID: &str = "youtube";
pub const CPSC_SOURCE_ID: &str = "cpsc";

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const CPSC_RECALL_API: &str = "https://www.saferproducts.gov/RestWebServices/Recall";

pub const DEFAULT_MAX_PAGES: usize = 20;

/// Provider page-size ceilings.
const YOUTUBE_MAX_SEARCH_RESULTS: usize = 50;
const YOUTUBE_COMMENT_PAGE_SIZE: usize = 100;

const MIN_RECALL_TEXT_CHARS: usize = 30;

/// Per-run values shared by every connector call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestContext {
    pub run_id: Uuid,
    pub published_after: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicLimits {
    pub search_results: usize,
    pub detail_items: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no connector registered for source {0:?}")]
    UnknownSource(String),
    #[error("source {source_id} requires {variable} to be set")]
    MissingCredential {
        source_id: &'static str,
        variable: &'static str,
    },
}

/// Paginated search/list access to one provider.
///
/// Neither operation fails: non-success responses are logged and yield whatever was
/// collected so far. The shared [`HttpFetcher`] inserts the courtesy delay after each call.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Language tag stamped on every item from this source.
    fn lang(&self) -> &str;

    fn limits(&self, manifest: &Manifest) -> TopicLimits;

    async fn search(
        &self,
        http: &HttpFetcher,
        ctx: &HarvestContext,
        term: &str,
        max_results: usize,
    ) -> Vec<String>;

    async fn list_details(
        &self,
        http: &HttpFetcher,
        ctx: &HarvestContext,
        id: &str,
        max_items: usize,
    ) -> Vec<RawItem>;
}

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub youtube_api_key: Option<String>,
    pub youtube_region: String,
    pub youtube_language: String,
    pub max_pages: usize,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            youtube_api_key: None,
            youtube_region: "US".to_string(),
            youtube_language: "en".to_string(),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

pub fn connector_for_source(
    source_id: &str,
    settings: &ConnectorSettings,
) -> Result<Box<dyn SourceConnector>, AdapterError> {
    match source_id {
        YOUTUBE_SOURCE_ID => {
            let api_key = settings
                .youtube_api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .ok_or(AdapterError::MissingCredential {
                    source_id: YOUTUBE_SOURCE_ID,
                    variable: "YT_API_KEY",
                })?;
            Ok(Box::new(
                YouTubeConnector::new(api_key)
                    .with_region(&settings.youtube_region)
                    .with_language(&settings.youtube_language)
                    .with_max_pages(settings.max_pages),
            ))
        }
        CPSC_SOURCE_ID => Ok(Box::new(CpscConnector::new())),
        other => Err(AdapterError::UnknownSource(other.to_string())),
    }
}

/// Strip markup, decode entities and collapse whitespace.
pub fn sanitize_text(raw: &str) -> String {
    let text = if raw.contains('<') || raw.contains('&') {
        let with_breaks = raw
            .replace("<br>", " ")
            .replace("<br/>", " ")
            .replace("<br />", " ");
        Html::parse_fragment(&with_breaks)
            .root_element()
            .text()
            .collect::<String>()
    } else {
        raw.to_string()
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM:SS` (read as UTC) and bare dates.
pub fn parse_provider_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    let date = NaiveDate::parse_from_str(value.get(..10)?, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn limit_to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn log_fetch_failure(source_id: &str, operation: &str, err: &FetchError) {
    match err {
        FetchError::HttpStatus {
            status,
            endpoint,
            body,
        } => warn!(
            source = source_id,
            operation,
            status = *status,
            endpoint = %endpoint,
            body = %body,
            "provider call failed"
        ),
        other => warn!(source = source_id, operation, error = %other, "provider call failed"),
    }
}

#[derive(Debug, Clone)]
pub struct YouTubeConnector {
    api_key: String,
    region: String,
    language: String,
    base_url: String,
    max_pages: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: Option<SearchItemId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadsResponse {
    #[serde(default)]
    items: Vec<CommentThread>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommentThread {
    id: String,
    snippet: Option<ThreadSnippet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadSnippet {
    top_level_comment: Option<TopLevelComment>,
}

#[derive(Debug, Deserialize)]
struct TopLevelComment {
    snippet: Option<CommentSnippet>,
}

// No author or channel fields: snapshots are published as-is.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentSnippet {
    #[serde(default)]
    text_display: String,
    like_count: Option<i64>,
    published_at: Option<String>,
}

impl YouTubeConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            region: "US".to_string(),
            language: "en".to_string(),
            base_url: YOUTUBE_API_BASE.to_string(),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }
}

#[async_trait]
impl SourceConnector for YouTubeConnector {
    fn source_id(&self) -> &'static str {
        YOUTUBE_SOURCE_ID
    }

    fn lang(&self) -> &str {
        &self.language
    }

    fn limits(&self, manifest: &Manifest) -> TopicLimits {
        TopicLimits {
            search_results: limit_to_usize(manifest.limit_or("videos_per_query", 6)),
            detail_items: limit_to_usize(manifest.limit_or("comments_per_video", 150)),
        }
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        ctx: &HarvestContext,
        term: &str,
        max_results: usize,
    ) -> Vec<String> {
        if max_results == 0 {
            return Vec::new();
        }
        let url = format!("{}/search", self.base_url);
        let query = [
            ("part", "id".to_string()),
            ("type", "video".to_string()),
            ("q", term.to_string()),
            (
                "publishedAfter",
                ctx.published_after.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            (
                "maxResults",
                max_results.min(YOUTUBE_MAX_SEARCH_RESULTS).to_string(),
            ),
            ("order", "date".to_string()),
            ("regionCode", self.region.clone()),
            ("relevanceLanguage", self.language.clone()),
            ("key", self.api_key.clone()),
        ];

        let response: SearchResponse =
            match http.get_json(ctx.run_id, YOUTUBE_SOURCE_ID, &url, &query).await {
                Ok(response) => response,
                Err(err) => {
                    log_fetch_failure(YOUTUBE_SOURCE_ID, "search", &err);
                    return Vec::new();
                }
            };

        response
            .items
            .into_iter()
            .filter_map(|item| item.id.and_then(|id| id.video_id))
            .filter(|id| !id.is_empty())
            .take(max_results)
            .collect()
    }

    async fn list_details(
        &self,
        http: &HttpFetcher,
        ctx: &HarvestContext,
        id: &str,
        max_items: usize,
    ) -> Vec<RawItem> {
        let url = format!("{}/commentThreads", self.base_url);
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        while items.len() < max_items {
            if pages >= self.max_pages {
                debug!(video_id = id, pages, "comment pagination stopped at page ceiling");
                break;
            }
            pages += 1;
            let mut query = vec![
                ("part", "snippet".to_string()),
                ("videoId", id.to_string()),
                ("maxResults", YOUTUBE_COMMENT_PAGE_SIZE.to_string()),
                ("key", self.api_key.clone()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let page: CommentThreadsResponse =
                match http.get_json(ctx.run_id, YOUTUBE_SOURCE_ID, &url, &query).await {
                    Ok(page) => page,
                    Err(err) => {
                        log_fetch_failure(YOUTUBE_SOURCE_ID, "comment_threads", &err);
                        break;
                    }
                };

            for thread in page.items {
                let Some(comment) = thread
                    .snippet
                    .and_then(|s| s.top_level_comment)
                    .and_then(|c| c.snippet)
                else {
                    continue;
                };
                items.push(RawItem {
                    external_id: format!("{id}:{}", thread.id),
                    text: comment.text_display,
                    likes: Some(comment.like_count.unwrap_or(0)),
                    published_at: comment.published_at,
                    extra: BTreeMap::new(),
                });
                if items.len() >= max_items {
                    break;
                }
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        items
    }
}

/// Recall search keyed by description and title. The recall list is a single page, so
/// records found by `search` are cached until `list_details` takes them out.
#[derive(Debug)]
pub struct CpscConnector {
    base_url: String,
    records: Mutex<HashMap<String, RawItem>>,
}

impl Default for CpscConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value
        .get(key)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn json_scalar_string(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First `Name` of a list field such as `Products`, or a plain string field.
fn json_first_name(value: &JsonValue, list_key: &str, plain_key: &str) -> Option<String> {
    value
        .get(list_key)
        .and_then(JsonValue::as_array)
        .and_then(|arr| arr.first())
        .and_then(|first| json_str(first, "Name"))
        .or_else(|| json_str(value, plain_key))
        .map(ToString::to_string)
}

fn optional_json_string(value: Option<String>) -> JsonValue {
    value.map(JsonValue::String).unwrap_or(JsonValue::Null)
}

impl CpscConnector {
    pub fn new() -> Self {
        Self {
            base_url: CPSC_RECALL_API.to_string(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    fn recall_to_item(record: &JsonValue, published_after: DateTime<Utc>) -> Option<RawItem> {
        let title = json_str(record, "Title");
        let id = json_scalar_string(record, "RecallID")
            .or_else(|| json_scalar_string(record, "RecallNumber"))
            .unwrap_or_else(|| {
                format!(
                    "{}-{}",
                    json_str(record, "RecallDate").unwrap_or_default(),
                    title.unwrap_or_default()
                )
            });

        let date = json_str(record, "RecallDate")
            .or_else(|| json_str(record, "LastPublishDate"))
            .or_else(|| json_str(record, "PostedDate"));
        if let Some(date) = date {
            match parse_provider_timestamp(date) {
                Some(dt) if dt >= published_after => {}
                _ => return None,
            }
        }

        let description = json_str(record, "Description")
            .or_else(|| json_str(record, "RecallDescription"))
            .map(|d| d.split_whitespace().collect::<Vec<_>>().join(" "));
        let text = [title.map(ToString::to_string), description]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" — ");
        if text.chars().count() < MIN_RECALL_TEXT_CHARS {
            return None;
        }

        let mut extra = BTreeMap::new();
        extra.insert(
            "hazard".to_string(),
            optional_json_string(json_first_name(record, "Hazards", "Hazard")),
        );
        extra.insert(
            "remedy".to_string(),
            optional_json_string(json_first_name(record, "Remedies", "Remedy")),
        );
        extra.insert(
            "product".to_string(),
            optional_json_string(json_first_name(record, "Products", "ProductName")),
        );

        Some(RawItem {
            external_id: id,
            text,
            likes: None,
            published_at: date.map(ToString::to_string),
            extra,
        })
    }
}

#[async_trait]
impl SourceConnector for CpscConnector {
    fn source_id(&self) -> &'static str {
        CPSC_SOURCE_ID
    }

    fn lang(&self) -> &str {
        "en"
    }

    fn limits(&self, manifest: &Manifest) -> TopicLimits {
        TopicLimits {
            search_results: limit_to_usize(manifest.limit_or("recalls_per_query", 500)),
            detail_items: 1,
        }
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        ctx: &HarvestContext,
        term: &str,
        max_results: usize,
    ) -> Vec<String> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();

        for field in ["RecallDescription", "Title"] {
            if ids.len() >= max_results {
                break;
            }
            let query = [("format", "json".to_string()), (field, term.to_string())];
            let records: Vec<JsonValue> = match http
                .get_json(ctx.run_id, CPSC_SOURCE_ID, &self.base_url, &query)
                .await
            {
                Ok(records) => records,
                Err(err) => {
                    log_fetch_failure(CPSC_SOURCE_ID, "recall_search", &err);
                    continue;
                }
            };

            let mut cache = self.records.lock().unwrap_or_else(|p| p.into_inner());
            for record in &records {
                let Some(item) = Self::recall_to_item(record, ctx.published_after) else {
                    continue;
                };
                if !seen.insert(item.external_id.clone()) {
                    continue;
                }
                ids.push(item.external_id.clone());
                cache.insert(item.external_id.clone(), item);
                if ids.len() >= max_results {
                    break;
                }
            }
        }
        ids
    }

    async fn list_details(
        &self,
        _http: &HttpFetcher,
        _ctx: &HarvestContext,
        id: &str,
        max_items: usize,
    ) -> Vec<RawItem> {
        if max_items == 0 {
            return Vec::new();
        }
        let mut cache = self.records.lock().unwrap_or_else(|p| p.into_inner());
        cache.remove(id).into_iter().collect()
    }
}
