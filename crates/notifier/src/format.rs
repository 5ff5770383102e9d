//! Plain-text rendering of a notification. Rich embeds are left to the target.

use serde::Serialize;

use herald_common::types::{FeedItem, LiveStatus, WatchedChannel};

/// A rendered message plus the role it is allowed to ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationMessage {
    pub content: String,
    pub mention_role: Option<String>,
}

/// Render `Hey <mention>! **<channel>** <activity>:` followed by the link.
pub fn render(watch: &WatchedChannel, item: &FeedItem) -> NotificationMessage {
    let greeting = match &watch.role_id {
        Some(role) => format!("Hey <@&{}>!", role),
        None => "Hey!".to_string(),
    };

    let channel = if !item.channel_title.is_empty() {
        item.channel_title.as_str()
    } else {
        watch
            .channel_name
            .as_deref()
            .unwrap_or(watch.channel_id.as_str())
    };

    NotificationMessage {
        content: format!(
            "{} **{}** {}:\n\n{}",
            greeting,
            channel,
            activity_line(item.live_status),
            item.permalink
        ),
        mention_role: watch.role_id.clone(),
    }
}

fn activity_line(status: LiveStatus) -> &'static str {
    match status {
        LiveStatus::Live => "is now LIVE",
        LiveStatus::Upcoming => "has scheduled a new Premiere",
        LiveStatus::None => "just uploaded a new video",
    }
}
