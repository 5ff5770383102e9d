use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broadcast state the provider reports for an item.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LiveStatus {
    #[default]
    None,
    Upcoming,
    Live,
}

impl LiveStatus {
    /// Map the provider's `liveBroadcastContent` marker. Unknown values are
    /// treated as a regular upload.
    pub fn from_provider(marker: &str) -> Self {
        match marker {
            "live" => LiveStatus::Live,
            "upcoming" => LiveStatus::Upcoming,
            _ => LiveStatus::None,
        }
    }
}

impl std::fmt::Display for LiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveStatus::None => write!(f, "none"),
            LiveStatus::Upcoming => write!(f, "upcoming"),
            LiveStatus::Live => write!(f, "live"),
        }
    }
}

/// Identity of one watch: a guild watching one external channel.
///
/// This is the unit the scheduler checks and the key of a [`Cursor`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchKey {
    pub guild_id: String,
    pub channel_id: String,
}

impl WatchKey {
    pub fn new(guild_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl std::fmt::Display for WatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.guild_id, self.channel_id)
    }
}

/// An external channel watched by a guild, with where and whom to notify.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WatchedChannel {
    pub guild_id: String,
    /// External (provider) channel id.
    pub channel_id: String,
    /// Display name captured when the watch was added.
    pub channel_name: Option<String>,
    /// Messaging destination (Discord text channel id).
    pub destination_id: String,
    /// Role to mention, if any.
    pub role_id: Option<String>,
    /// Per-watch override of the default check interval.
    pub check_interval_secs: Option<i64>,
    /// Set when the provider reported the channel as missing.
    pub suspended: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WatchedChannel {
    pub fn key(&self) -> WatchKey {
        WatchKey::new(self.guild_id.clone(), self.channel_id.clone())
    }

    /// The override interval, ignoring non-positive values.
    pub fn check_interval(&self) -> Option<Duration> {
        self.check_interval_secs
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
    }
}

/// Result of resolving a channel through the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub channel_id: String,
    pub title: String,
    pub thumbnail_url: Option<String>,
}

/// One published item as returned by a fetch, normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub item_id: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub permalink: String,
    /// Display title of the publishing channel.
    pub channel_title: String,
    pub live_status: LiveStatus,
}

/// Where a cursor points: the last dispatched item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub item_id: String,
    pub published_at: DateTime<Utc>,
}

impl From<&FeedItem> for CursorPosition {
    fn from(item: &FeedItem) -> Self {
        Self {
            item_id: item.item_id.clone(),
            published_at: item.published_at,
        }
    }
}

/// Durable "last notified item" marker for a watch.
///
/// `generation` increases by one on every successful advance and is the
/// compare-and-swap token for concurrent writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Cursor {
    pub guild_id: String,
    pub channel_id: String,
    pub item_id: String,
    pub published_at: DateTime<Utc>,
    pub generation: i64,
    pub updated_at: DateTime<Utc>,
}

impl Cursor {
    pub fn key(&self) -> WatchKey {
        WatchKey::new(self.guild_id.clone(), self.channel_id.clone())
    }

    pub fn position(&self) -> CursorPosition {
        CursorPosition {
            item_id: self.item_id.clone(),
            published_at: self.published_at,
        }
    }
}

/// How a check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Success,
    ProviderError,
    RateLimited,
    ChannelNotFound,
    Cancelled,
}

impl std::fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckOutcome::Success => write!(f, "success"),
            CheckOutcome::ProviderError => write!(f, "provider_error"),
            CheckOutcome::RateLimited => write!(f, "rate_limited"),
            CheckOutcome::ChannelNotFound => write!(f, "channel_not_found"),
            CheckOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Ephemeral record of one fetch → dedup → dispatch cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckAttempt {
    pub id: Uuid,
    pub guild_id: String,
    pub channel_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: CheckOutcome,
    pub dispatched: u32,
    /// Error or halt reason, when there was one.
    pub detail: Option<String>,
    /// True for `checkNow` requests.
    pub manual: bool,
}

impl CheckAttempt {
    pub fn start(key: &WatchKey, manual: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            guild_id: key.guild_id.clone(),
            channel_id: key.channel_id.clone(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: CheckOutcome::Success,
            dispatched: 0,
            detail: None,
            manual,
        }
    }

    pub fn finish(mut self, outcome: CheckOutcome, dispatched: u32, detail: Option<String>) -> Self {
        self.finished_at = Some(Utc::now());
        self.outcome = outcome;
        self.dispatched = dispatched;
        self.detail = detail;
        self
    }
}

/// Journal row written after every acknowledged dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationLog {
    pub id: i64,
    pub guild_id: String,
    pub channel_id: String,
    pub channel_name: Option<String>,
    pub item_id: String,
    pub item_title: String,
    pub live_status: LiveStatus,
    pub permalink: String,
    pub destination_id: String,
    pub role_id: Option<String>,
    pub notified_at: DateTime<Utc>,
}
