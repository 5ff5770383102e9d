//! Notifier: formats a new item for a watch and hands it to a
//! [`DispatchTarget`], tracking whether each attempt was acknowledged.
//!
//! A failed dispatch is not retried here. It is reported as a `warn` event on
//! the `herald::dispatch` target and returned to the caller, which leaves the
//! cursor where it was so the next check picks the item up again.

pub mod format;
pub mod target;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use herald_common::types::{FeedItem, WatchedChannel};

pub use format::{NotificationMessage, render};
pub use target::{DeliveryError, DiscordTarget, DispatchTarget};

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acknowledged,
    Failed(String),
}

/// Attempt counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub acknowledged: u64,
    pub failed: u64,
}

pub struct Notifier {
    target: Arc<dyn DispatchTarget>,
    acknowledged: AtomicU64,
    failed: AtomicU64,
}

impl Notifier {
    pub fn new(target: Arc<dyn DispatchTarget>) -> Self {
        Self {
            target,
            acknowledged: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub async fn dispatch(&self, watch: &WatchedChannel, item: &FeedItem) -> DispatchOutcome {
        let message = render(watch, item);

        match self.target.deliver(&watch.destination_id, &message).await {
            Ok(()) => {
                self.acknowledged.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    guild_id = %watch.guild_id,
                    channel_id = %watch.channel_id,
                    item_id = %item.item_id,
                    destination_id = %watch.destination_id,
                    "Notification delivered"
                );
                DispatchOutcome::Acknowledged
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: "herald::dispatch",
                    guild_id = %watch.guild_id,
                    channel_id = %watch.channel_id,
                    item_id = %item.item_id,
                    destination_id = %watch.destination_id,
                    error = %e,
                    "Notification dispatch failed"
                );
                DispatchOutcome::Failed(e.to_string())
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
