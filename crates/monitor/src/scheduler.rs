//! Scheduler: runs due checks on a bounded worker pool.
//!
//! The loop:
//! 1. Re-reads the watch list every `refresh_every` and syncs the due-queue.
//! 2. Pops due watches while a worker permit is free. Each one must claim its
//!    in-flight flag and one unit of the global quota before it is spawned.
//! 3. Sleeps until the next due time, the next refresh, a finished worker, a
//!    wake-up, or shutdown.
//!
//! A throttle response pauses the global quota for the provider's delay, so
//! every other due watch waits too. `ChannelNotFound` suspends the watch.
//! On shutdown no new checks start and the worker set is drained.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use herald_common::config::AppConfig;
use herald_common::error::{CheckError, FetchError};
use herald_common::types::{CheckAttempt, WatchKey, WatchedChannel};
use herald_engine::dedup::{PassReport, Shutdown};
use herald_engine::watch::WatchStore;

use crate::checker::{Checker, finish_attempt};
use crate::inflight::InFlight;
use crate::quota::{QuotaBudget, QuotaGrant};
use crate::schedule::{DueQueue, ScheduleConfig, Verdict, due_after};

/// Attempts kept for observability.
const ATTEMPT_HISTORY: usize = 256;

/// Delay before retrying when the quota backend itself fails.
const QUOTA_ERROR_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub default_interval: Duration,
    pub max_concurrent: usize,
    pub rate_limit_backoff: Duration,
    pub max_backoff: Duration,
    pub refresh_every: Duration,
}

impl SchedulerConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            default_interval: config.check_interval(),
            max_concurrent: config.max_concurrent_checks.max(1),
            rate_limit_backoff: config.rate_limit_backoff(),
            max_backoff: config.max_backoff(),
            refresh_every: config.watch_refresh(),
        }
    }

    fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            default_interval: self.default_interval,
            rate_limit_backoff: self.rate_limit_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

struct Inner {
    watches: Arc<dyn WatchStore>,
    checker: Checker,
    quota: Arc<dyn QuotaBudget>,
    config: SchedulerConfig,
    queue: Mutex<DueQueue>,
    in_flight: InFlight,
    attempts: Mutex<VecDeque<CheckAttempt>>,
    wake: Notify,
    shutdown: Shutdown,
}

/// Cheap to clone; all clones drive the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        watches: Arc<dyn WatchStore>,
        checker: Checker,
        quota: Arc<dyn QuotaBudget>,
        config: SchedulerConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                watches,
                checker,
                quota,
                queue: Mutex::new(DueQueue::new(config.schedule())),
                config,
                in_flight: InFlight::new(),
                attempts: Mutex::new(VecDeque::with_capacity(ATTEMPT_HISTORY)),
                wake: Notify::new(),
                shutdown,
            }),
        }
    }

    pub fn checker(&self) -> &Checker {
        &self.inner.checker
    }

    /// Run until the shutdown flag is set, then wait for in-flight checks.
    pub async fn run(&self) {
        let permits = Arc::new(Semaphore::new(self.inner.config.max_concurrent));
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut shutdown = self.inner.shutdown.clone();
        let mut next_refresh = Instant::now();

        tracing::info!(
            max_concurrent = self.inner.config.max_concurrent,
            default_interval_secs = self.inner.config.default_interval.as_secs(),
            "Scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Instant::now();
            if now >= next_refresh {
                self.refresh().await;
                next_refresh = now + self.inner.config.refresh_every;
            }

            let wakeup = self.launch_due(&permits, &mut workers).await;
            let deadline = wakeup.map_or(next_refresh, |at| at.min(next_refresh));

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    log_worker_exit(joined);
                }
            }
        }

        tracing::info!(in_flight = workers.len(), "Scheduler stopping, draining checks");
        while let Some(joined) = workers.join_next().await {
            log_worker_exit(joined);
        }
        tracing::info!("Scheduler stopped");
    }

    /// Re-read the watch list and sync the due-queue.
    pub async fn refresh(&self) {
        match self.inner.watches.list_watched_channels().await {
            Ok(watches) => {
                let total = watches.len();
                let report = self.lock_queue().sync(watches, Instant::now());
                if report.added > 0 || report.removed > 0 {
                    tracing::info!(
                        added = report.added,
                        removed = report.removed,
                        total,
                        "Watch list synced"
                    );
                }
                self.inner.wake.notify_one();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to refresh watch list");
            }
        }
    }

    /// Check one watch now, outside the due order.
    ///
    /// Still claims the in-flight flag and one quota unit. The outcome feeds
    /// back into the due-queue like a scheduled check.
    pub async fn check_now(&self, key: &WatchKey) -> Result<PassReport, CheckError> {
        let watch = self
            .inner
            .watches
            .get(key)
            .await?
            .ok_or_else(|| CheckError::UnknownWatch(key.to_string()))?;

        let _guard = self
            .inner
            .in_flight
            .try_claim(key)
            .ok_or_else(|| CheckError::Busy(key.to_string()))?;

        if let QuotaGrant::Exhausted { retry_in } = self.inner.quota.try_acquire().await? {
            return Err(CheckError::QuotaExhausted { retry_in });
        }

        let was_suspended = watch.suspended;
        let result = self.execute(&watch, true).await;

        if was_suspended && result.is_ok() {
            self.inner.watches.set_suspended(key, false).await?;
            tracing::info!(watch = %key, "Watch resumed after successful manual check");
            self.refresh().await;
        }

        result
    }

    /// Most recent attempts, newest first.
    pub fn recent_attempts(&self, limit: usize) -> Vec<CheckAttempt> {
        let attempts = self
            .inner
            .attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        attempts.iter().rev().take(limit).cloned().collect()
    }

    /// Watches currently tracked by the due-queue.
    pub fn scheduled(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn next_due_for(&self, key: &WatchKey) -> Option<Instant> {
        self.lock_queue().next_due_for(key)
    }

    pub fn is_in_flight(&self, key: &WatchKey) -> bool {
        self.inner.in_flight.contains(key)
    }

    /// Start every due check a permit allows. Returns when to look again.
    async fn launch_due(
        &self,
        permits: &Arc<Semaphore>,
        workers: &mut JoinSet<()>,
    ) -> Option<Instant> {
        loop {
            // No free permit: a finished worker wakes the loop.
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                return None;
            };

            let now = Instant::now();
            let popped = self.lock_queue().pop_due(now);
            let Some(watch) = popped else {
                return self.lock_queue().next_wakeup();
            };
            let key = watch.key();

            let Some(guard) = self.inner.in_flight.try_claim(&key) else {
                // A manual check holds it and will reschedule on completion.
                let interval = watch
                    .check_interval()
                    .unwrap_or(self.inner.config.default_interval);
                self.lock_queue().defer(&key, due_after(now, interval));
                continue;
            };

            match self.inner.quota.try_acquire().await {
                Ok(QuotaGrant::Granted) => {}
                Ok(QuotaGrant::Exhausted { retry_in }) => {
                    tracing::debug!(
                        watch = %key,
                        retry_in_secs = retry_in.as_secs(),
                        "Quota exhausted, holding due checks"
                    );
                    let until = due_after(now, retry_in);
                    self.lock_queue().defer(&key, until);
                    return Some(until);
                }
                Err(e) => {
                    tracing::warn!(watch = %key, error = %e, "Quota backend failed");
                    let until = now + QUOTA_ERROR_RETRY;
                    self.lock_queue().defer(&key, until);
                    return Some(until);
                }
            }

            let scheduler = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                let _ = scheduler.execute(&watch, false).await;
            });
        }
    }

    /// Run a claimed, quota-approved check and apply its consequences.
    async fn execute(
        &self,
        watch: &WatchedChannel,
        manual: bool,
    ) -> Result<PassReport, CheckError> {
        let key = watch.key();
        let attempt = CheckAttempt::start(&key, manual);

        let result = self
            .inner
            .checker
            .check(watch, &self.inner.shutdown)
            .await;

        match &result {
            Ok(report) => {
                tracing::debug!(
                    watch = %key,
                    manual,
                    dispatched = report.dispatched.len(),
                    halted = ?report.halted,
                    "Check finished"
                );
            }
            Err(CheckError::Fetch(FetchError::RateLimited { retry_after })) => {
                let pause = retry_after.unwrap_or(self.inner.config.rate_limit_backoff);
                tracing::warn!(
                    watch = %key,
                    pause_secs = pause.as_secs(),
                    "Provider rate limited, pausing quota budget"
                );
                if let Err(e) = self.inner.quota.pause(pause).await {
                    tracing::warn!(error = %e, "Failed to pause quota budget");
                }
            }
            Err(CheckError::Fetch(FetchError::ChannelNotFound(_))) => {
                tracing::warn!(watch = %key, "Channel not found at provider, suspending watch");
                if let Err(e) = self.inner.watches.set_suspended(&key, true).await {
                    tracing::warn!(watch = %key, error = %e, "Failed to suspend watch");
                }
            }
            Err(e) => {
                tracing::warn!(watch = %key, manual, error = %e, "Check failed");
            }
        }

        self.lock_queue()
            .record(&key, Verdict::from(&result), Instant::now());
        self.push_attempt(finish_attempt(attempt, &result));
        self.inner.wake.notify_one();

        result
    }

    fn push_attempt(&self, attempt: CheckAttempt) {
        let mut attempts = self
            .inner
            .attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if attempts.len() == ATTEMPT_HISTORY {
            attempts.pop_front();
        }
        attempts.push_back(attempt);
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, DueQueue> {
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn log_worker_exit(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Check worker panicked");
    }
}
