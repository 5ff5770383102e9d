//! Global quota budget: provider calls per fixed window, shared by every
//! watch and every worker.
//!
//! A throttle response from the provider pauses the whole budget until its
//! deadline, so other due watches do not pile onto the same limit.
//!
//! Two backends:
//! - [`LocalQuota`]: one mutex-guarded counter, for a single process.
//! - [`RedisQuota`]: `SET NX PX` + `INCR` on a window key and a pause key
//!   extended by a Lua script, for several processes sharing one provider key.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tokio::time::Instant;

use herald_common::error::AppError;

use crate::schedule::{MAX_DELAY, due_after};

/// Sets the pause key only if that lengthens the current pause.
/// Returns 1 when the pause was extended.
const EXTEND_PAUSE: &str = r#"
local current = redis.call('PTTL', KEYS[1])
local wanted = tonumber(ARGV[1])
if current >= wanted then
    return 0
end
redis.call('SET', KEYS[1], '1', 'PX', wanted)
return 1
"#;

/// Answer to a request for one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaGrant {
    Granted,
    Exhausted { retry_in: Duration },
}

#[async_trait]
pub trait QuotaBudget: Send + Sync {
    /// Consume one unit, unless the window is spent or the budget is paused.
    async fn try_acquire(&self) -> Result<QuotaGrant, AppError>;

    /// Refuse every request for `duration`. Never shortens an existing pause.
    async fn pause(&self, duration: Duration) -> Result<(), AppError>;
}

#[derive(Debug, Clone, Copy)]
struct QuotaWindow {
    started_at: Instant,
    used: u64,
    paused_until: Option<Instant>,
}

/// In-process budget.
pub struct LocalQuota {
    max_calls: u64,
    window: Duration,
    state: Mutex<QuotaWindow>,
}

impl LocalQuota {
    pub fn new(max_calls: u64, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            state: Mutex::new(QuotaWindow {
                started_at: Instant::now(),
                used: 0,
                paused_until: None,
            }),
        }
    }

    pub fn try_acquire_at(&self, now: Instant) -> QuotaGrant {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(until) = state.paused_until {
            if now < until {
                return QuotaGrant::Exhausted {
                    retry_in: until - now,
                };
            }
            state.paused_until = None;
        }

        if self.max_calls == 0 {
            return QuotaGrant::Exhausted {
                retry_in: self.window.max(Duration::from_secs(1)),
            };
        }

        let elapsed = now.saturating_duration_since(state.started_at);
        if elapsed >= self.window {
            state.started_at = now;
            state.used = 1;
            QuotaGrant::Granted
        } else if state.used < self.max_calls {
            state.used += 1;
            QuotaGrant::Granted
        } else {
            QuotaGrant::Exhausted {
                retry_in: self.window.saturating_sub(elapsed),
            }
        }
    }

    pub fn pause_at(&self, now: Instant, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let until = due_after(now, duration);
        if state.paused_until.is_none_or(|current| current < until) {
            state.paused_until = Some(until);
        }
    }
}

#[async_trait]
impl QuotaBudget for LocalQuota {
    async fn try_acquire(&self) -> Result<QuotaGrant, AppError> {
        Ok(self.try_acquire_at(Instant::now()))
    }

    async fn pause(&self, duration: Duration) -> Result<(), AppError> {
        self.pause_at(Instant::now(), duration);
        Ok(())
    }
}

/// Budget shared through Redis.
pub struct RedisQuota {
    redis: ConnectionManager,
    max_calls: u64,
    window: Duration,
    window_key: String,
    pause_key: String,
    extend_pause: Script,
}

impl RedisQuota {
    pub fn new(redis: ConnectionManager, max_calls: u64, window: Duration) -> Self {
        Self::with_prefix(redis, "herald:quota", max_calls, window)
    }

    /// Keys are `{prefix}:window` and `{prefix}:paused`.
    pub fn with_prefix(
        redis: ConnectionManager,
        prefix: &str,
        max_calls: u64,
        window: Duration,
    ) -> Self {
        Self {
            redis,
            max_calls,
            window,
            window_key: format!("{}:window", prefix),
            pause_key: format!("{}:paused", prefix),
            extend_pause: Script::new(EXTEND_PAUSE),
        }
    }
}

#[async_trait]
impl QuotaBudget for RedisQuota {
    async fn try_acquire(&self) -> Result<QuotaGrant, AppError> {
        let mut redis = self.redis.clone();

        // PTTL: -2 missing, -1 no expiry
        let paused_ms: i64 = redis::cmd("PTTL")
            .arg(&self.pause_key)
            .query_async(&mut redis)
            .await?;
        if paused_ms > 0 {
            return Ok(QuotaGrant::Exhausted {
                retry_in: Duration::from_millis(paused_ms as u64),
            });
        }

        let window_ms = self.window.as_millis().max(1) as u64;
        let (used, remaining_ms): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&self.window_key)
            .arg(0)
            .arg("NX")
            .arg("PX")
            .arg(window_ms)
            .ignore()
            .cmd("INCR")
            .arg(&self.window_key)
            .cmd("PTTL")
            .arg(&self.window_key)
            .query_async(&mut redis)
            .await?;

        if used <= self.max_calls {
            return Ok(QuotaGrant::Granted);
        }

        let retry_in = if remaining_ms > 0 {
            Duration::from_millis(remaining_ms as u64)
        } else {
            self.window
        };
        tracing::debug!(used, max_calls = self.max_calls, "Quota window exhausted");
        Ok(QuotaGrant::Exhausted { retry_in })
    }

    async fn pause(&self, duration: Duration) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        let pause_ms = duration
            .min(MAX_DELAY)
            .as_millis()
            .max(1) as u64;

        let extended: i64 = self
            .extend_pause
            .key(&self.pause_key)
            .arg(pause_ms)
            .invoke_async(&mut redis)
            .await?;

        if extended == 1 {
            tracing::debug!(pause_ms, "Quota budget paused");
        }
        Ok(())
    }
}
