//! End-to-end checks of the fetch → dedup → dispatch → advance path with
//! in-memory stores and scripted providers. No external services needed.
//!
//! ```bash
//! cargo test -p herald-monitor --test scheduler
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::watch;
use tokio::time::Instant;

use herald_common::error::{CheckError, FetchError};
use herald_common::types::{
    CheckOutcome, Cursor, CursorPosition, FeedItem, LiveStatus, WatchKey,
};
use herald_engine::cursor::{Advance, CursorStore, InMemoryCursorStore};
use herald_engine::dedup::{DedupEngine, HaltReason};
use herald_engine::journal::InMemoryJournal;
use herald_engine::watch::{AddWatchParams, InMemoryWatchStore, WatchStore};
use herald_feed::FeedFetcher;
use herald_monitor::{Checker, LocalQuota, Scheduler, SchedulerConfig};
use herald_notifier::{DeliveryError, DispatchTarget, NotificationMessage, Notifier};

const GUILD: &str = "123456789012345678";
const CHANNEL_A: &str = "UCaaaaaaaaaaaaaaaaaaaaaa";
const CHANNEL_B: &str = "UCbbbbbbbbbbbbbbbbbbbbbb";

// ============================================================
// Fakes
// ============================================================

#[derive(Default)]
struct ScriptedFetcher {
    windows: Mutex<HashMap<String, Result<Vec<FeedItem>, FetchError>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl ScriptedFetcher {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn set(&self, channel_id: &str, window: Result<Vec<FeedItem>, FetchError>) {
        self.windows
            .lock()
            .unwrap()
            .insert(channel_id.to_string(), window);
    }

    fn calls(&self, channel_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(channel_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl FeedFetcher for ScriptedFetcher {
    async fn fetch(&self, channel_id: &str) -> Result<Vec<FeedItem>, FetchError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(channel_id.to_string())
            .or_default() += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.windows
            .lock()
            .unwrap()
            .get(channel_id)
            .cloned()
            .unwrap_or(Ok(vec![]))
    }
}

/// Records the item id of every delivered message. Can be told to reject an
/// item once.
#[derive(Default)]
struct RecordingTarget {
    sent: Mutex<Vec<String>>,
    reject_once: Mutex<HashSet<String>>,
}

impl RecordingTarget {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn reject_once(&self, item_id: &str) {
        self.reject_once
            .lock()
            .unwrap()
            .insert(item_id.to_string());
    }
}

fn item_id_of(message: &NotificationMessage) -> String {
    message
        .content
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl DispatchTarget for RecordingTarget {
    async fn deliver(
        &self,
        _destination_id: &str,
        message: &NotificationMessage,
    ) -> Result<(), DeliveryError> {
        let id = item_id_of(message);
        if self.reject_once.lock().unwrap().remove(&id) {
            return Err(DeliveryError::Rejected {
                status: 403,
                body: "Missing Access".to_string(),
            });
        }
        self.sent.lock().unwrap().push(id);
        Ok(())
    }
}

/// After its first delivery, moves the cursor as if another pass got there.
struct AdvancingTarget {
    inner: RecordingTarget,
    cursors: Arc<InMemoryCursorStore>,
    key: WatchKey,
    jump_to: CursorPosition,
    fired: AtomicBool,
}

#[async_trait]
impl DispatchTarget for AdvancingTarget {
    async fn deliver(
        &self,
        destination_id: &str,
        message: &NotificationMessage,
    ) -> Result<(), DeliveryError> {
        self.inner.deliver(destination_id, message).await?;
        if !self.fired.swap(true, Ordering::SeqCst) {
            let current = self.cursors.read(&self.key).await.unwrap().unwrap();
            let moved = self
                .cursors
                .advance(&self.key, Some(current.generation), &self.jump_to)
                .await
                .unwrap();
            assert!(matches!(moved, Advance::Advanced(_)));
        }
        Ok(())
    }
}

/// Advances the cursor externally right after the first read returns.
struct RacingCursorStore {
    inner: InMemoryCursorStore,
    external: Mutex<Option<CursorPosition>>,
}

#[async_trait]
impl CursorStore for RacingCursorStore {
    async fn read(&self, key: &WatchKey) -> Result<Option<Cursor>, herald_common::error::AppError> {
        let cursor = self.inner.read(key).await?;
        let external = self.external.lock().unwrap().take();
        if let Some(position) = external {
            let generation = cursor.as_ref().map(|c| c.generation);
            self.inner.advance(key, generation, &position).await?;
        }
        Ok(cursor)
    }

    async fn advance(
        &self,
        key: &WatchKey,
        expected_generation: Option<i64>,
        position: &CursorPosition,
    ) -> Result<Advance, herald_common::error::AppError> {
        self.inner.advance(key, expected_generation, position).await
    }

    async fn remove(&self, key: &WatchKey) -> Result<bool, herald_common::error::AppError> {
        self.inner.remove(key).await
    }
}

/// Raises the shutdown flag after its first delivery.
struct StoppingTarget {
    inner: RecordingTarget,
    stop: watch::Sender<bool>,
}

#[async_trait]
impl DispatchTarget for StoppingTarget {
    async fn deliver(
        &self,
        destination_id: &str,
        message: &NotificationMessage,
    ) -> Result<(), DeliveryError> {
        self.inner.deliver(destination_id, message).await?;
        let _ = self.stop.send(true);
        Ok(())
    }
}

// ============================================================
// Harness
// ============================================================

fn item(id: &str, ts: i64) -> FeedItem {
    FeedItem {
        item_id: id.to_string(),
        published_at: Utc.timestamp_opt(ts, 0).unwrap(),
        title: format!("Video {}", id),
        permalink: format!("https://example.test/{}", id),
        channel_title: "Creator".to_string(),
        live_status: LiveStatus::None,
    }
}

fn position(id: &str, ts: i64) -> CursorPosition {
    CursorPosition::from(&item(id, ts))
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        default_interval: Duration::from_secs(60),
        max_concurrent: 2,
        rate_limit_backoff: Duration::from_secs(300),
        max_backoff: Duration::from_secs(3600),
        refresh_every: Duration::from_secs(30),
    }
}

struct Harness {
    scheduler: Scheduler,
    fetcher: Arc<ScriptedFetcher>,
    watches: Arc<InMemoryWatchStore>,
    cursors: Arc<dyn CursorStore>,
    journal: Arc<InMemoryJournal>,
    shutdown_tx: watch::Sender<bool>,
}

fn build(
    fetcher: Arc<ScriptedFetcher>,
    cursors: Arc<dyn CursorStore>,
    target: Arc<dyn DispatchTarget>,
) -> Harness {
    let watches = Arc::new(InMemoryWatchStore::new());
    let journal = Arc::new(InMemoryJournal::new());
    let notifier = Arc::new(Notifier::new(target));
    let engine = Arc::new(DedupEngine::new(
        Arc::clone(&cursors),
        notifier,
        journal.clone(),
    ));
    let checker = Checker::new(fetcher.clone(), engine);
    let quota = Arc::new(LocalQuota::new(100, Duration::from_secs(3600)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(watches.clone(), checker, quota, config(), shutdown_rx);

    Harness {
        scheduler,
        fetcher,
        watches,
        cursors,
        journal,
        shutdown_tx,
    }
}

fn harness(target: Arc<dyn DispatchTarget>) -> Harness {
    build(
        Arc::new(ScriptedFetcher::default()),
        Arc::new(InMemoryCursorStore::new()),
        target,
    )
}

async fn add_watch(h: &Harness, channel_id: &str) -> WatchKey {
    let params = AddWatchParams {
        channel_id: channel_id.to_string(),
        destination_id: "223456789012345678".to_string(),
        role_id: None,
        check_interval_secs: None,
    };
    h.watches
        .upsert(GUILD, &params, Some("Creator"))
        .await
        .unwrap()
        .key()
}

async fn seed_cursor(cursors: &dyn CursorStore, key: &WatchKey, id: &str, ts: i64) {
    let created = cursors.advance(key, None, &position(id, ts)).await.unwrap();
    assert!(matches!(created, Advance::Advanced(_)));
}

fn dispatched_ids(report: &herald_engine::dedup::PassReport) -> Vec<&str> {
    report
        .dispatched
        .iter()
        .map(|i| i.item_id.as_str())
        .collect()
}

// ============================================================
// Dedup path
// ============================================================

#[tokio::test]
async fn test_cold_start_dispatches_nothing() {
    let target = Arc::new(RecordingTarget::default());
    let h = harness(target.clone());
    let key = add_watch(&h, CHANNEL_A).await;
    h.fetcher.set(
        CHANNEL_A,
        Ok(vec![item("3", 300), item("2", 200), item("1", 100)]),
    );

    let report = h.scheduler.check_now(&key).await.unwrap();

    assert!(report.cold_start);
    assert!(report.dispatched.is_empty());
    assert!(target.sent().is_empty());
    let cursor = h.cursors.read(&key).await.unwrap().unwrap();
    assert_eq!(cursor.item_id, "3");
    assert_eq!(cursor.generation, 1);
}

#[tokio::test]
async fn test_first_upload_after_empty_cold_start_is_dispatched() {
    let target = Arc::new(RecordingTarget::default());
    let h = harness(target.clone());
    let key = add_watch(&h, CHANNEL_A).await;
    h.fetcher.set(CHANNEL_A, Ok(vec![]));

    let first = h.scheduler.check_now(&key).await.unwrap();
    assert!(first.cold_start);
    assert!(first.dispatched.is_empty());
    let baseline = h.cursors.read(&key).await.unwrap().unwrap();
    assert_eq!(baseline.item_id, "");

    let uploaded_at = Utc::now().timestamp() + 3600;
    h.fetcher.set(CHANNEL_A, Ok(vec![item("1", uploaded_at)]));

    let second = h.scheduler.check_now(&key).await.unwrap();
    assert!(!second.cold_start);
    assert_eq!(dispatched_ids(&second), vec!["1"]);
    assert_eq!(target.sent(), vec!["1"]);
    assert_eq!(h.cursors.read(&key).await.unwrap().unwrap().item_id, "1");
}

#[tokio::test]
async fn test_new_items_dispatched_in_publish_order() {
    let target = Arc::new(RecordingTarget::default());
    let h = harness(target.clone());
    let key = add_watch(&h, CHANNEL_A).await;
    seed_cursor(h.cursors.as_ref(), &key, "5", 100).await;
    h.fetcher.set(
        CHANNEL_A,
        Ok(vec![
            item("8", 130),
            item("7", 120),
            item("6", 110),
            item("5", 100),
        ]),
    );

    let report = h.scheduler.check_now(&key).await.unwrap();

    assert_eq!(dispatched_ids(&report), vec!["6", "7", "8"]);
    assert_eq!(target.sent(), vec!["6", "7", "8"]);
    assert!(report.halted.is_none());

    let cursor = h.cursors.read(&key).await.unwrap().unwrap();
    assert_eq!(cursor.item_id, "8");
    assert_eq!(cursor.published_at, Utc.timestamp_opt(130, 0).unwrap());
    assert_eq!(h.journal.len(), 3);
}

#[tokio::test]
async fn test_immediate_recheck_dispatches_nothing() {
    let target = Arc::new(RecordingTarget::default());
    let h = harness(target.clone());
    let key = add_watch(&h, CHANNEL_A).await;
    seed_cursor(h.cursors.as_ref(), &key, "5", 100).await;
    h.fetcher
        .set(CHANNEL_A, Ok(vec![item("6", 110), item("5", 100)]));

    let first = h.scheduler.check_now(&key).await.unwrap();
    let second = h.scheduler.check_now(&key).await.unwrap();

    assert_eq!(dispatched_ids(&first), vec!["6"]);
    assert!(second.dispatched.is_empty());
    assert_eq!(target.sent(), vec!["6"]);
}

#[tokio::test]
async fn test_each_item_dispatched_at_most_once_across_cycles() {
    let target = Arc::new(RecordingTarget::default());
    let h = harness(target.clone());
    let key = add_watch(&h, CHANNEL_A).await;
    seed_cursor(h.cursors.as_ref(), &key, "0", 0).await;

    // The window slides forward and keeps its last few items.
    let mut published: Vec<FeedItem> = vec![item("0", 0)];
    for round in 1..=6i64 {
        for n in 0..round {
            let id = format!("{}-{}", round, n);
            published.insert(0, item(&id, round * 100 + n));
        }
        let window: Vec<FeedItem> = published.iter().take(5).cloned().collect();
        h.fetcher.set(CHANNEL_A, Ok(window));
        h.scheduler.check_now(&key).await.unwrap();
        h.scheduler.check_now(&key).await.unwrap();
    }

    let sent = target.sent();
    let unique: HashSet<&String> = sent.iter().collect();
    assert_eq!(unique.len(), sent.len(), "duplicate dispatch: {:?}", sent);
    assert_eq!(sent.first().map(String::as_str), Some("1-0"));
    assert_eq!(sent.last().map(String::as_str), Some("6-5"));
}

#[tokio::test]
async fn test_failed_dispatch_is_retried_next_check() {
    let target = Arc::new(RecordingTarget::default());
    target.reject_once("7");
    let h = harness(target.clone());
    let key = add_watch(&h, CHANNEL_A).await;
    seed_cursor(h.cursors.as_ref(), &key, "5", 100).await;
    h.fetcher.set(
        CHANNEL_A,
        Ok(vec![
            item("8", 130),
            item("7", 120),
            item("6", 110),
            item("5", 100),
        ]),
    );

    let first = h.scheduler.check_now(&key).await.unwrap();
    assert_eq!(dispatched_ids(&first), vec!["6"]);
    assert!(matches!(
        first.halted,
        Some(HaltReason::DispatchFailed { ref item_id, .. }) if item_id == "7"
    ));
    assert_eq!(h.cursors.read(&key).await.unwrap().unwrap().item_id, "6");

    let second = h.scheduler.check_now(&key).await.unwrap();
    assert_eq!(dispatched_ids(&second), vec!["7", "8"]);
    assert_eq!(target.sent(), vec!["6", "7", "8"]);
}

// ============================================================
// Conflict safety
// ============================================================

#[tokio::test]
async fn test_conflict_after_dispatch_abandons_pass() {
    let cursors = Arc::new(InMemoryCursorStore::new());
    let key = WatchKey::new(GUILD, CHANNEL_A);
    let target = Arc::new(AdvancingTarget {
        inner: RecordingTarget::default(),
        cursors: cursors.clone(),
        key: key.clone(),
        jump_to: position("8", 130),
        fired: AtomicBool::new(false),
    });
    let h = build(
        Arc::new(ScriptedFetcher::default()),
        cursors.clone(),
        target.clone(),
    );
    add_watch(&h, CHANNEL_A).await;
    seed_cursor(cursors.as_ref(), &key, "5", 100).await;
    h.fetcher.set(
        CHANNEL_A,
        Ok(vec![
            item("8", 130),
            item("7", 120),
            item("6", 110),
            item("5", 100),
        ]),
    );

    let report = h.scheduler.check_now(&key).await.unwrap();

    assert_eq!(report.halted, Some(HaltReason::Conflict));
    assert_eq!(target.inner.sent(), vec!["6"]);
    let cursor = cursors.read(&key).await.unwrap().unwrap();
    assert_eq!(cursor.item_id, "8");

    // Nothing left to send once the other pass owns the cursor.
    let again = h.scheduler.check_now(&key).await.unwrap();
    assert!(again.dispatched.is_empty());
    assert_eq!(target.inner.sent(), vec!["6"]);
}

#[tokio::test]
async fn test_conflict_before_dispatch_sends_nothing() {
    let key = WatchKey::new(GUILD, CHANNEL_A);
    let racing = Arc::new(RacingCursorStore {
        inner: InMemoryCursorStore::new(),
        external: Mutex::new(None),
    });
    seed_cursor(racing.as_ref(), &key, "5", 100).await;
    *racing.external.lock().unwrap() = Some(position("8", 130));

    let target = Arc::new(RecordingTarget::default());
    let h = build(
        Arc::new(ScriptedFetcher::default()),
        racing.clone(),
        target.clone(),
    );
    add_watch(&h, CHANNEL_A).await;
    h.fetcher.set(
        CHANNEL_A,
        Ok(vec![
            item("8", 130),
            item("7", 120),
            item("6", 110),
            item("5", 100),
        ]),
    );

    let report = h.scheduler.check_now(&key).await.unwrap();

    assert_eq!(report.halted, Some(HaltReason::Conflict));
    assert!(report.dispatched.is_empty());
    assert!(target.sent().is_empty());
    assert_eq!(racing.read(&key).await.unwrap().unwrap().item_id, "8");
}

// ============================================================
// Manual checks
// ============================================================

#[tokio::test]
async fn test_overlapping_check_now_is_busy() {
    let target = Arc::new(RecordingTarget::default());
    let h = build(
        Arc::new(ScriptedFetcher::with_delay(Duration::from_millis(50))),
        Arc::new(InMemoryCursorStore::new()),
        target,
    );
    let key = add_watch(&h, CHANNEL_A).await;
    h.fetcher.set(CHANNEL_A, Ok(vec![item("1", 100)]));

    let (first, second) = tokio::join!(
        h.scheduler.check_now(&key),
        h.scheduler.check_now(&key)
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(CheckError::Busy(_))));
    assert_eq!(h.fetcher.calls(CHANNEL_A), 1);
    assert!(!h.scheduler.is_in_flight(&key));
}

#[tokio::test]
async fn test_unknown_watch() {
    let h = harness(Arc::new(RecordingTarget::default()));
    let result = h
        .scheduler
        .check_now(&WatchKey::new(GUILD, CHANNEL_B))
        .await;
    assert!(matches!(result, Err(CheckError::UnknownWatch(_))));
}

#[tokio::test]
async fn test_rate_limit_pauses_watch_and_global_budget() {
    let h = harness(Arc::new(RecordingTarget::default()));
    let key_a = add_watch(&h, CHANNEL_A).await;
    let key_b = add_watch(&h, CHANNEL_B).await;
    h.scheduler.refresh().await;
    h.fetcher.set(
        CHANNEL_A,
        Err(FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        }),
    );

    let result = h.scheduler.check_now(&key_a).await;
    assert!(matches!(
        result,
        Err(CheckError::Fetch(FetchError::RateLimited { .. }))
    ));

    let due = h.scheduler.next_due_for(&key_a).unwrap();
    assert!(due >= Instant::now() + Duration::from_secs(59));

    // Every other watch waits for the same window.
    match h.scheduler.check_now(&key_b).await {
        Err(CheckError::QuotaExhausted { retry_in }) => {
            assert!(retry_in > Duration::from_secs(58));
            assert!(retry_in <= Duration::from_secs(60));
        }
        other => panic!("expected QuotaExhausted, got {:?}", other.map(|_| ())),
    }
    assert_eq!(h.fetcher.calls(CHANNEL_B), 0);

    let attempts = h.scheduler.recent_attempts(10);
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, CheckOutcome::RateLimited);
    assert!(attempts[0].manual);
}

#[tokio::test]
async fn test_unavailable_backs_off_watch_but_not_global_budget() {
    let h = harness(Arc::new(RecordingTarget::default()));
    let key_a = add_watch(&h, CHANNEL_A).await;
    let key_b = add_watch(&h, CHANNEL_B).await;
    h.scheduler.refresh().await;
    h.fetcher.set(
        CHANNEL_A,
        Err(FetchError::Unavailable("HTTP 503".to_string())),
    );
    h.fetcher.set(CHANNEL_B, Ok(vec![item("1", 100)]));

    let result = h.scheduler.check_now(&key_a).await;
    assert!(matches!(
        result,
        Err(CheckError::Fetch(FetchError::Unavailable(_)))
    ));

    // One failure doubles the 60s interval.
    let due = h.scheduler.next_due_for(&key_a).unwrap();
    assert!(due >= Instant::now() + Duration::from_secs(119));

    let report = h.scheduler.check_now(&key_b).await.unwrap();
    assert!(report.cold_start);
    assert_eq!(h.fetcher.calls(CHANNEL_B), 1);

    let attempts = h.scheduler.recent_attempts(10);
    assert_eq!(attempts[0].outcome, CheckOutcome::Success);
    assert_eq!(attempts[1].outcome, CheckOutcome::ProviderError);
}

#[tokio::test]
async fn test_stored_huge_interval_is_capped() {
    let h = harness(Arc::new(RecordingTarget::default()));
    let params = AddWatchParams {
        channel_id: CHANNEL_A.to_string(),
        destination_id: "223456789012345678".to_string(),
        role_id: None,
        check_interval_secs: Some(i64::MAX),
    };
    let key = h.watches.upsert(GUILD, &params, None).await.unwrap().key();
    h.scheduler.refresh().await;
    h.fetcher.set(CHANNEL_A, Ok(vec![item("1", 100)]));

    h.scheduler.check_now(&key).await.unwrap();

    let due = h.scheduler.next_due_for(&key).unwrap();
    assert!(due <= Instant::now() + herald_monitor::schedule::MAX_DELAY);
}

#[tokio::test]
async fn test_channel_not_found_suspends_watch() {
    let h = harness(Arc::new(RecordingTarget::default()));
    let key = add_watch(&h, CHANNEL_A).await;
    h.scheduler.refresh().await;
    h.fetcher.set(
        CHANNEL_A,
        Err(FetchError::ChannelNotFound(CHANNEL_A.to_string())),
    );

    let result = h.scheduler.check_now(&key).await;
    assert!(matches!(
        result,
        Err(CheckError::Fetch(FetchError::ChannelNotFound(_)))
    ));

    let watch = h.watches.get(&key).await.unwrap().unwrap();
    assert!(watch.suspended);
    assert!(h.watches.list_watched_channels().await.unwrap().is_empty());
    assert!(h.scheduler.next_due_for(&key).is_none());
}

// ============================================================
// Shutdown
// ============================================================

fn standalone_checker(
    cursors: Arc<dyn CursorStore>,
    target: Arc<dyn DispatchTarget>,
    fetcher: Arc<ScriptedFetcher>,
) -> Checker {
    let engine = Arc::new(DedupEngine::new(
        cursors,
        Arc::new(Notifier::new(target)),
        Arc::new(InMemoryJournal::new()),
    ));
    Checker::new(fetcher, engine)
}

async fn stored_watch(channel_id: &str) -> herald_common::types::WatchedChannel {
    let params = AddWatchParams {
        channel_id: channel_id.to_string(),
        destination_id: "223456789012345678".to_string(),
        role_id: None,
        check_interval_secs: None,
    };
    InMemoryWatchStore::new()
        .upsert(GUILD, &params, Some("Creator"))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_shutdown_before_dispatch_sends_nothing() {
    let cursors: Arc<dyn CursorStore> = Arc::new(InMemoryCursorStore::new());
    let target = Arc::new(RecordingTarget::default());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let checker = standalone_checker(Arc::clone(&cursors), target.clone(), fetcher.clone());

    let watch = stored_watch(CHANNEL_A).await;
    seed_cursor(cursors.as_ref(), &watch.key(), "5", 100).await;
    fetcher.set(CHANNEL_A, Ok(vec![item("6", 110), item("5", 100)]));

    let (_tx, rx) = watch::channel(true);
    let report = checker.check(&watch, &rx).await.unwrap();

    assert_eq!(report.halted, Some(HaltReason::Cancelled));
    assert!(report.dispatched.is_empty());
    assert!(target.sent().is_empty());
    assert_eq!(fetcher.calls(CHANNEL_A), 1);
    assert_eq!(cursors.read(&watch.key()).await.unwrap().unwrap().item_id, "5");
}

#[tokio::test]
async fn test_shutdown_mid_pass_keeps_dispatched_prefix() {
    let cursors: Arc<dyn CursorStore> = Arc::new(InMemoryCursorStore::new());
    let (tx, rx) = watch::channel(false);
    let target = Arc::new(StoppingTarget {
        inner: RecordingTarget::default(),
        stop: tx,
    });
    let fetcher = Arc::new(ScriptedFetcher::default());
    let checker = standalone_checker(Arc::clone(&cursors), target.clone(), fetcher.clone());

    let watch = stored_watch(CHANNEL_A).await;
    seed_cursor(cursors.as_ref(), &watch.key(), "5", 100).await;
    fetcher.set(
        CHANNEL_A,
        Ok(vec![item("8", 130), item("7", 120), item("6", 110), item("5", 100)]),
    );

    let report = checker.check(&watch, &rx).await.unwrap();

    // The acknowledged item is still committed to the cursor.
    assert_eq!(dispatched_ids(&report), vec!["6"]);
    assert_eq!(report.halted, Some(HaltReason::Cancelled));
    assert_eq!(target.inner.sent(), vec!["6"]);
    assert_eq!(cursors.read(&watch.key()).await.unwrap().unwrap().item_id, "6");
}

// ============================================================
// Scheduled loop (paused clock)
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_scheduled_loop_cold_start_then_dispatch() {
    let target = Arc::new(RecordingTarget::default());
    let h = harness(target.clone());
    let key = add_watch(&h, CHANNEL_A).await;
    h.fetcher.set(CHANNEL_A, Ok(vec![item("1", 100)]));

    let scheduler = h.scheduler.clone();
    let handle = tokio::spawn(async move { scheduler.run().await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.cursors.read(&key).await.unwrap().unwrap().item_id, "1");
    assert!(target.sent().is_empty());

    h.fetcher
        .set(CHANNEL_A, Ok(vec![item("2", 200), item("1", 100)]));
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(target.sent(), vec!["2"]);

    h.shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_loop_honors_rate_limit_backoff() {
    let h = harness(Arc::new(RecordingTarget::default()));
    add_watch(&h, CHANNEL_A).await;
    add_watch(&h, CHANNEL_B).await;
    h.fetcher.set(
        CHANNEL_A,
        Err(FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        }),
    );
    h.fetcher.set(CHANNEL_B, Ok(vec![item("1", 100)]));

    let scheduler = h.scheduler.clone();
    let handle = tokio::spawn(async move { scheduler.run().await });

    // A is due at once; B is staggered half an interval later.
    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(h.fetcher.calls(CHANNEL_A), 1);
    assert_eq!(h.fetcher.calls(CHANNEL_B), 0);

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(h.fetcher.calls(CHANNEL_A), 2);
    assert_eq!(h.fetcher.calls(CHANNEL_B), 1);

    h.shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_loop_backs_off_exponentially() {
    let h = harness(Arc::new(RecordingTarget::default()));
    add_watch(&h, CHANNEL_A).await;
    h.fetcher.set(
        CHANNEL_A,
        Err(FetchError::Unavailable("HTTP 503".to_string())),
    );

    let scheduler = h.scheduler.clone();
    let handle = tokio::spawn(async move { scheduler.run().await });

    // Checks at 0s, then 120s later, then 240s after that.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.fetcher.calls(CHANNEL_A), 1);

    tokio::time::sleep(Duration::from_secs(118)).await;
    assert_eq!(h.fetcher.calls(CHANNEL_A), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.fetcher.calls(CHANNEL_A), 2);

    tokio::time::sleep(Duration::from_secs(238)).await;
    assert_eq!(h.fetcher.calls(CHANNEL_A), 2);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.fetcher.calls(CHANNEL_A), 3);

    // Recovery resets the interval.
    h.fetcher.set(CHANNEL_A, Ok(vec![item("1", 100)]));
    tokio::time::sleep(Duration::from_secs(480)).await;
    assert_eq!(h.fetcher.calls(CHANNEL_A), 4);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.fetcher.calls(CHANNEL_A), 5);

    h.shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
