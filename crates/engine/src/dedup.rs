//! Dedup engine: turns one fetched window into at-most-once dispatches.
//!
//! A pass:
//! 1. Reads the cursor for the watch.
//! 2. Cold start (no cursor): records the newest item as the baseline and
//!    dispatches nothing. An empty first window records an empty baseline at
//!    the time the watch was added, so the channel's first upload is new.
//! 3. Otherwise collects the items strictly newer than the cursor, walking
//!    newest-first and stopping at the first item that is not newer.
//! 4. Dispatches them oldest-first. Before each dispatch the stored
//!    generation is re-checked; after each acknowledged dispatch the cursor
//!    advances, using the generation read in step 1 and then the one returned
//!    by each advance.
//!
//! A conflict, a failed dispatch or a shutdown request ends the pass. The
//! cursor then covers exactly the prefix that was delivered.

use std::sync::Arc;

use serde::Serialize;

use herald_common::error::AppError;
use chrono::{DateTime, Utc};

use herald_common::types::{Cursor, CursorPosition, FeedItem, WatchedChannel};
use herald_notifier::{DispatchOutcome, Notifier};

use crate::cursor::{Advance, CursorStore};
use crate::journal::NotificationJournal;

/// Shutdown flag shared with every running pass; `true` means stop.
pub type Shutdown = tokio::sync::watch::Receiver<bool>;

/// What a pass should do with a fetched window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupPlan {
    /// Nothing fetched, or nothing newer than the cursor.
    Idle,
    /// First check of the watch: adopt this position as the baseline.
    ColdStart(CursorPosition),
    /// New items in dispatch order (oldest first).
    Dispatch(Vec<FeedItem>),
}

/// Diff a newest-first window against the cursor.
///
/// Items out of order and older than the cursor are never returned: the walk
/// stops at the first item that is not strictly newer. `watched_since` is the
/// baseline when the first window is empty.
pub fn plan(
    items: &[FeedItem],
    cursor: Option<&Cursor>,
    watched_since: DateTime<Utc>,
) -> DedupPlan {
    let Some(cursor) = cursor else {
        let baseline = match items.first() {
            Some(newest) => CursorPosition::from(newest),
            None => CursorPosition {
                item_id: String::new(),
                published_at: watched_since,
            },
        };
        return DedupPlan::ColdStart(baseline);
    };

    let mut fresh: Vec<FeedItem> = items
        .iter()
        .take_while(|item| {
            item.published_at > cursor.published_at && item.item_id != cursor.item_id
        })
        .cloned()
        .collect();

    if fresh.is_empty() {
        return DedupPlan::Idle;
    }

    fresh.reverse();
    DedupPlan::Dispatch(fresh)
}

/// Why a pass stopped before dispatching everything it planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    /// Another pass advanced the cursor concurrently.
    Conflict,
    /// The target did not acknowledge this item; it will be retried next check.
    DispatchFailed { item_id: String, error: String },
    /// Shutdown was requested before the next dispatch.
    Cancelled,
}

/// Outcome of one dedup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    /// Items delivered in this pass, in delivery order.
    pub dispatched: Vec<FeedItem>,
    pub cold_start: bool,
    pub halted: Option<HaltReason>,
    /// Cursor position after the pass, if one exists.
    pub cursor: Option<CursorPosition>,
}

pub struct DedupEngine {
    cursors: Arc<dyn CursorStore>,
    notifier: Arc<Notifier>,
    journal: Arc<dyn NotificationJournal>,
}

impl DedupEngine {
    pub fn new(
        cursors: Arc<dyn CursorStore>,
        notifier: Arc<Notifier>,
        journal: Arc<dyn NotificationJournal>,
    ) -> Self {
        Self {
            cursors,
            notifier,
            journal,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Run one pass for `watch` over a freshly fetched, newest-first window.
    ///
    /// `shutdown` is checked before every dispatch. Once a dispatch has been
    /// acknowledged its cursor advance always runs to completion, even if
    /// this future is dropped.
    pub async fn run_pass(
        &self,
        watch: &WatchedChannel,
        items: &[FeedItem],
        shutdown: &Shutdown,
    ) -> Result<PassReport, AppError> {
        let key = watch.key();
        let cursor = self.cursors.read(&key).await?;

        let mut report = PassReport {
            cursor: cursor.as_ref().map(Cursor::position),
            ..Default::default()
        };

        match plan(items, cursor.as_ref(), watch.created_at) {
            DedupPlan::Idle => Ok(report),

            DedupPlan::ColdStart(baseline) => {
                report.cold_start = true;
                match self.advance(watch, None, baseline).await? {
                    Advance::Advanced(created) => {
                        tracing::info!(
                            watch = %key,
                            item_id = %created.item_id,
                            "Cold start: baseline recorded, nothing dispatched"
                        );
                        report.cursor = Some(created.position());
                    }
                    Advance::Conflict => {
                        tracing::info!(watch = %key, "Cold start raced another pass, abandoning");
                        report.halted = Some(HaltReason::Conflict);
                    }
                }
                Ok(report)
            }

            DedupPlan::Dispatch(fresh) => {
                // A Dispatch plan is only produced when a cursor exists.
                let mut generation = cursor.as_ref().map(|c| c.generation);

                for item in fresh {
                    if *shutdown.borrow() {
                        report.halted = Some(HaltReason::Cancelled);
                        break;
                    }

                    // Catch an external advance before sending, not after.
                    let current = self.cursors.read(&key).await?.map(|c| c.generation);
                    if current != generation {
                        tracing::warn!(
                            watch = %key,
                            expected_generation = ?generation,
                            current_generation = ?current,
                            "Cursor moved under the pass, abandoning"
                        );
                        report.halted = Some(HaltReason::Conflict);
                        break;
                    }

                    if let DispatchOutcome::Failed(error) =
                        self.notifier.dispatch(watch, &item).await
                    {
                        report.halted = Some(HaltReason::DispatchFailed {
                            item_id: item.item_id.clone(),
                            error,
                        });
                        break;
                    }

                    let advanced = self
                        .advance(watch, generation, CursorPosition::from(&item))
                        .await?;

                    if let Err(e) = self.journal.record(watch, &item).await {
                        tracing::warn!(
                            watch = %key,
                            item_id = %item.item_id,
                            error = %e,
                            "Failed to journal notification"
                        );
                    }

                    match advanced {
                        Advance::Advanced(moved) => {
                            generation = Some(moved.generation);
                            report.cursor = Some(moved.position());
                            report.dispatched.push(item);
                        }
                        Advance::Conflict => {
                            // The item went out but another pass owns the cursor now;
                            // continuing could re-send what it already sent.
                            tracing::warn!(
                                watch = %key,
                                item_id = %item.item_id,
                                expected_generation = ?generation,
                                "Cursor conflict after dispatch, abandoning pass"
                            );
                            report.dispatched.push(item);
                            report.halted = Some(HaltReason::Conflict);
                            break;
                        }
                    }
                }

                if !report.dispatched.is_empty() {
                    tracing::info!(
                        watch = %key,
                        dispatched = report.dispatched.len(),
                        halted = ?report.halted,
                        "Dedup pass dispatched new items"
                    );
                }
                Ok(report)
            }
        }
    }

    /// Advance on a spawned task so cancelling the pass cannot drop the write
    /// between an acknowledged dispatch and its cursor update.
    async fn advance(
        &self,
        watch: &WatchedChannel,
        expected_generation: Option<i64>,
        position: CursorPosition,
    ) -> Result<Advance, AppError> {
        let store = Arc::clone(&self.cursors);
        let key = watch.key();

        let handle = tokio::spawn(async move {
            store.advance(&key, expected_generation, &position).await
        });

        let outcome = handle
            .await
            .map_err(|e| AppError::Internal(format!("cursor advance task failed: {}", e)))??;

        Ok(outcome)
    }
}
