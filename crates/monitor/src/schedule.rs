//! Due-queue: next eligible check time per watch, plus the backoff rules that
//! move it.
//!
//! Entries live in a `BinaryHeap` ordered by due time. Rescheduling pushes a
//! fresh heap entry and bumps the watch's sequence number; stale heap entries
//! are skipped when they surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use herald_common::error::{CheckError, FetchError};
use herald_common::types::{WatchKey, WatchedChannel};
use herald_engine::dedup::PassReport;

/// Longest delay any reschedule or pause is allowed to take.
pub const MAX_DELAY: Duration = Duration::from_secs(7 * 24 * 3600);

/// `now + delay`, with the delay capped at [`MAX_DELAY`].
pub fn due_after(now: Instant, delay: Duration) -> Instant {
    let delay = delay.min(MAX_DELAY);
    now.checked_add(delay).unwrap_or(now)
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    pub default_interval: Duration,
    pub rate_limit_backoff: Duration,
    pub max_backoff: Duration,
}

/// How a check should move its watch's next due time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// Transient failure; exponential backoff.
    Unavailable,
    RateLimited { retry_after: Option<Duration> },
    /// The watch leaves the queue until it is re-added.
    NotFound,
}

impl From<&Result<PassReport, CheckError>> for Verdict {
    fn from(result: &Result<PassReport, CheckError>) -> Self {
        match result {
            Ok(_) => Verdict::Success,
            Err(CheckError::Fetch(FetchError::RateLimited { retry_after })) => {
                Verdict::RateLimited {
                    retry_after: *retry_after,
                }
            }
            Err(CheckError::Fetch(FetchError::ChannelNotFound(_))) => Verdict::NotFound,
            Err(_) => Verdict::Unavailable,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    watch: WatchedChannel,
    next_due: Instant,
    failures: u32,
    seq: u64,
}

/// Watches added and removed by a [`DueQueue::sync`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
}

pub struct DueQueue {
    config: ScheduleConfig,
    entries: HashMap<WatchKey, Entry>,
    heap: BinaryHeap<Reverse<(Instant, u64, WatchKey)>>,
    next_seq: u64,
    synced_once: bool,
}

impl DueQueue {
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            next_seq: 0,
            synced_once: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &WatchKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn next_due_for(&self, key: &WatchKey) -> Option<Instant> {
        self.entries.get(key).map(|e| e.next_due)
    }

    /// Replace the tracked set with `watches`.
    ///
    /// On the first sync due times are spread evenly over one interval. After
    /// that, new watches are due immediately. Known watches keep their due
    /// time and failure count but pick up configuration changes.
    pub fn sync(&mut self, watches: Vec<WatchedChannel>, now: Instant) -> SyncReport {
        let mut report = SyncReport::default();
        let keep: HashSet<WatchKey> = watches.iter().map(WatchedChannel::key).collect();

        let before = self.entries.len();
        self.entries.retain(|key, _| keep.contains(key));
        report.removed = before - self.entries.len();

        let fresh: Vec<WatchedChannel> = watches
            .into_iter()
            .filter(|w| {
                if let Some(entry) = self.entries.get_mut(&w.key()) {
                    entry.watch = w.clone();
                    false
                } else {
                    true
                }
            })
            .collect();

        let total = fresh.len() as u32;
        for (i, watch) in fresh.into_iter().enumerate() {
            let offset = if self.synced_once || total == 0 {
                Duration::ZERO
            } else {
                self.interval_for(&watch).saturating_mul(i as u32) / total
            };
            self.insert(watch, due_after(now, offset), 0);
            report.added += 1;
        }

        self.synced_once = true;
        report
    }

    /// Take the earliest watch due at `now`, if any.
    ///
    /// The watch stays tracked but has no due time until [`record`](Self::record)
    /// or [`defer`](Self::defer) is called for it.
    pub fn pop_due(&mut self, now: Instant) -> Option<WatchedChannel> {
        self.discard_stale();
        let Reverse((due, _, _)) = self.heap.peek()?;
        if *due > now {
            return None;
        }

        let Reverse((_, _, key)) = self.heap.pop()?;
        let seq = self.bump_seq();
        let entry = self.entries.get_mut(&key)?;
        entry.seq = seq;
        Some(entry.watch.clone())
    }

    /// Earliest due time among scheduled watches.
    pub fn next_wakeup(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((due, _, _))| *due)
    }

    /// Reschedule a popped watch at `until` without touching its failure count.
    pub fn defer(&mut self, key: &WatchKey, until: Instant) {
        self.reschedule(key, until);
    }

    /// Apply the outcome of a check. Unknown keys are ignored.
    pub fn record(&mut self, key: &WatchKey, verdict: Verdict, now: Instant) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };

        let interval = entry
            .watch
            .check_interval()
            .unwrap_or(self.config.default_interval)
            .min(MAX_DELAY);

        let next_due = match verdict {
            Verdict::Success => {
                entry.failures = 0;
                due_after(now, interval)
            }
            Verdict::Unavailable => {
                entry.failures = entry.failures.saturating_add(1);
                due_after(
                    now,
                    backoff(interval, entry.failures, self.config.max_backoff),
                )
            }
            Verdict::RateLimited { retry_after } => due_after(
                now,
                retry_after.unwrap_or(self.config.rate_limit_backoff),
            ),
            Verdict::NotFound => {
                self.entries.remove(key);
                return;
            }
        };

        self.reschedule(key, next_due);
    }

    fn interval_for(&self, watch: &WatchedChannel) -> Duration {
        watch
            .check_interval()
            .unwrap_or(self.config.default_interval)
            .min(MAX_DELAY)
    }

    fn insert(&mut self, watch: WatchedChannel, next_due: Instant, failures: u32) {
        let key = watch.key();
        let seq = self.bump_seq();
        self.heap.push(Reverse((next_due, seq, key.clone())));
        self.entries.insert(
            key,
            Entry {
                watch,
                next_due,
                failures,
                seq,
            },
        );
    }

    fn reschedule(&mut self, key: &WatchKey, next_due: Instant) {
        let seq = self.bump_seq();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.next_due = next_due;
            entry.seq = seq;
            self.heap.push(Reverse((next_due, seq, key.clone())));
        }
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, seq, key))) = self.heap.peek() {
            let live = self.entries.get(key).is_some_and(|e| e.seq == *seq);
            if live {
                break;
            }
            self.heap.pop();
        }
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// `min(interval * 2^failures, max)`.
pub fn backoff(interval: Duration, failures: u32, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(failures);
    interval.saturating_mul(factor).min(max)
}
