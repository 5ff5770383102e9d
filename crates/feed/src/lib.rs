//! Feed providers: read the recent window of items for a channel and resolve
//! channel identities.
//!
//! Every provider normalizes into [`FeedItem`], newest first, and maps its own
//! failure modes onto [`FetchError`]. Only one bounded page is ever read; items
//! older than the provider's window are out of reach.

pub mod youtube;

use async_trait::async_trait;

use herald_common::error::FetchError;
use herald_common::types::{ChannelIdentity, FeedItem};

/// Reads the current recent items of one channel.
///
/// Implementations must be safe to call concurrently for different channels.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Returns the provider's recent window, newest first.
    async fn fetch(&self, channel_id: &str) -> Result<Vec<FeedItem>, FetchError>;
}

/// Pure lookups against the provider's channel catalogue.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Best match for a free-form name or `@handle`.
    async fn find_channel_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ChannelIdentity>, FetchError>;

    /// Exact lookup by channel id.
    async fn describe_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelIdentity>, FetchError>;
}

/// Order items newest first. Stable, so provider order breaks ties.
pub fn sort_newest_first(items: &mut [FeedItem]) {
    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
}

/// Whether `id` looks like a YouTube channel id: `UC` + 22 URL-safe base64 chars.
pub fn is_valid_channel_id(id: &str) -> bool {
    id.len() == 24
        && id.starts_with("UC")
        && id[2..]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
