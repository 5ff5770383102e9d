//! YouTube Data API v3 provider.
//!
//! A fetch is exactly one `search.list` call ordered by date, so each check
//! costs one unit of the shared quota budget. Lookups use `search.list` with
//! `type=channel` and `channels.list`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use herald_common::error::FetchError;
use herald_common::types::{ChannelIdentity, FeedItem, LiveStatus};

use crate::{ChannelDirectory, FeedFetcher, sort_newest_first};

/// Public watch URL for a video id.
pub fn permalink(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// Error reasons the API uses for throttling.
const RATE_LIMIT_REASONS: &[&str] = &[
    "quotaExceeded",
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
];

/// HTTP client for the YouTube Data API.
pub struct YouTubeClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    page_size: u32,
}

impl YouTubeClient {
    pub fn new(api_key: String, base_url: String, page_size: u32) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: page_size.clamp(1, 50),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        subject: &str,
        mut query: Vec<(&str, String)>,
    ) -> Result<T, FetchError> {
        query.push(("key", self.api_key.clone()));
        let url = format!("{}/{}", self.base_url, endpoint);

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(format!("request to {} failed: {}", endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let err = classify_error(status.as_u16(), &body, retry_after, subject);
            tracing::debug!(
                endpoint,
                subject,
                status = status.as_u16(),
                error = %err,
                "YouTube API request failed"
            );
            return Err(err);
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Unavailable(format!("malformed {} response: {}", endpoint, e)))
    }
}

#[async_trait]
impl FeedFetcher for YouTubeClient {
    async fn fetch(&self, channel_id: &str) -> Result<Vec<FeedItem>, FetchError> {
        let response: SearchResponse = self
            .get_json(
                "search",
                channel_id,
                vec![
                    ("part", "snippet".to_string()),
                    ("channelId", channel_id.to_string()),
                    ("order", "date".to_string()),
                    ("type", "video".to_string()),
                    ("maxResults", self.page_size.to_string()),
                ],
            )
            .await?;

        let items = normalize_search(response);
        tracing::debug!(channel_id, items = items.len(), "Fetched channel feed");
        Ok(items)
    }
}

#[async_trait]
impl ChannelDirectory for YouTubeClient {
    async fn find_channel_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ChannelIdentity>, FetchError> {
        let response: SearchResponse = self
            .get_json(
                "search",
                handle,
                vec![
                    ("part", "snippet".to_string()),
                    ("q", handle.to_string()),
                    ("type", "channel".to_string()),
                    ("maxResults", "1".to_string()),
                ],
            )
            .await?;

        Ok(response.items.into_iter().find_map(|item| {
            let channel_id = item.id.channel_id?;
            Some(ChannelIdentity {
                channel_id,
                title: unescape_html(&item.snippet.title),
                thumbnail_url: item.snippet.thumbnails.and_then(|t| t.default).map(|t| t.url),
            })
        }))
    }

    async fn describe_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelIdentity>, FetchError> {
        let response: ChannelsResponse = self
            .get_json(
                "channels",
                channel_id,
                vec![
                    ("part", "snippet".to_string()),
                    ("id", channel_id.to_string()),
                ],
            )
            .await?;

        Ok(response.items.into_iter().next().map(|channel| ChannelIdentity {
            channel_id: channel.id,
            title: channel.snippet.title,
            thumbnail_url: channel.snippet.thumbnails.and_then(|t| t.default).map(|t| t.url),
        }))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
    snippet: SearchSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    video_id: Option<String>,
    channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchSnippet {
    published_at: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    channel_title: String,
    live_broadcast_content: Option<String>,
    thumbnails: Option<Thumbnails>,
}

#[derive(Debug, Deserialize)]
struct Thumbnails {
    default: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    #[serde(default)]
    items: Vec<ChannelResource>,
}

#[derive(Debug, Deserialize)]
struct ChannelResource {
    id: String,
    snippet: ChannelSnippet,
}

#[derive(Debug, Deserialize)]
struct ChannelSnippet {
    title: String,
    thumbnails: Option<Thumbnails>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Turn a `search.list` page into feed items, newest first.
///
/// Entries without a video id or with an unparseable timestamp are dropped.
fn normalize_search(response: SearchResponse) -> Vec<FeedItem> {
    let mut items: Vec<FeedItem> = response
        .items
        .into_iter()
        .filter_map(|item| {
            let video_id = item.id.video_id?;
            let published_at = item
                .snippet
                .published_at
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?
                .with_timezone(&Utc);

            Some(FeedItem {
                permalink: permalink(&video_id),
                item_id: video_id,
                published_at,
                title: unescape_html(&item.snippet.title),
                channel_title: unescape_html(&item.snippet.channel_title),
                live_status: item
                    .snippet
                    .live_broadcast_content
                    .as_deref()
                    .map(LiveStatus::from_provider)
                    .unwrap_or_default(),
            })
        })
        .collect();

    sort_newest_first(&mut items);
    items
}

/// Map a non-success response onto the fetch error taxonomy.
fn classify_error(
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
    subject: &str,
) -> FetchError {
    let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let reasons: Vec<&str> = envelope
        .as_ref()
        .map(|e| e.error.errors.iter().map(|d| d.reason.as_str()).collect())
        .unwrap_or_default();

    if status == 429
        || (status == 403 && reasons.iter().any(|r| RATE_LIMIT_REASONS.contains(r)))
    {
        return FetchError::RateLimited { retry_after };
    }

    if status == 404 || reasons.contains(&"channelNotFound") {
        return FetchError::ChannelNotFound(subject.to_string());
    }

    let message = envelope
        .map(|e| e.error.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status));
    FetchError::Unavailable(message)
}

/// Parse a delta-seconds `Retry-After` header. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// The search endpoint returns HTML-escaped snippet text.
fn unescape_html(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
