//! Rate-limited scheduler: decides which watches are due, runs their checks on
//! a bounded worker pool and keeps every worker inside one shared provider
//! quota.

pub mod checker;
pub mod inflight;
pub mod quota;
pub mod schedule;
pub mod scheduler;

pub use checker::Checker;
pub use quota::{LocalQuota, QuotaBudget, QuotaGrant, RedisQuota};
pub use scheduler::{Scheduler, SchedulerConfig};
