//! One check: fetch the recent window, then run the dedup pass over it.

use std::sync::Arc;

use herald_common::error::{CheckError, FetchError};
use herald_common::types::{CheckAttempt, CheckOutcome, WatchedChannel};
use herald_engine::dedup::{DedupEngine, HaltReason, PassReport, Shutdown};
use herald_feed::FeedFetcher;

pub struct Checker {
    fetcher: Arc<dyn FeedFetcher>,
    engine: Arc<DedupEngine>,
}

impl Checker {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, engine: Arc<DedupEngine>) -> Self {
        Self { fetcher, engine }
    }

    pub fn engine(&self) -> &DedupEngine {
        &self.engine
    }

    /// Fetch and dedup one watch. Fetch errors fail the check; conflicts and
    /// failed dispatches end the pass and are reported on it.
    pub async fn check(
        &self,
        watch: &WatchedChannel,
        shutdown: &Shutdown,
    ) -> Result<PassReport, CheckError> {
        let items = self.fetcher.fetch(&watch.channel_id).await?;

        if *shutdown.borrow() {
            return Ok(PassReport {
                halted: Some(HaltReason::Cancelled),
                ..Default::default()
            });
        }

        Ok(self.engine.run_pass(watch, &items, shutdown).await?)
    }
}

/// Close a [`CheckAttempt`] from the result of its check.
pub fn finish_attempt(
    attempt: CheckAttempt,
    result: &Result<PassReport, CheckError>,
) -> CheckAttempt {
    match result {
        Ok(report) => {
            let dispatched = report.dispatched.len() as u32;
            match &report.halted {
                Some(HaltReason::Cancelled) => {
                    attempt.finish(CheckOutcome::Cancelled, dispatched, None)
                }
                Some(reason) => {
                    attempt.finish(CheckOutcome::Success, dispatched, Some(halt_detail(reason)))
                }
                None => attempt.finish(CheckOutcome::Success, dispatched, None),
            }
        }
        Err(CheckError::Fetch(FetchError::RateLimited { .. })) => {
            attempt.finish(CheckOutcome::RateLimited, 0, Some(error_detail(result)))
        }
        Err(CheckError::Fetch(FetchError::ChannelNotFound(_))) => {
            attempt.finish(CheckOutcome::ChannelNotFound, 0, Some(error_detail(result)))
        }
        Err(_) => attempt.finish(CheckOutcome::ProviderError, 0, Some(error_detail(result))),
    }
}

fn halt_detail(reason: &HaltReason) -> String {
    match reason {
        HaltReason::Conflict => "halted: cursor conflict".to_string(),
        HaltReason::DispatchFailed { item_id, error } => {
            format!("halted: dispatch of {} failed: {}", item_id, error)
        }
        HaltReason::Cancelled => "halted: cancelled".to_string(),
    }
}

fn error_detail(result: &Result<PassReport, CheckError>) -> String {
    match result {
        Ok(_) => String::new(),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::WatchKey;
    use std::time::Duration;

    #[test]
    fn test_finish_attempt_outcomes() {
        let key = WatchKey::new("1", "UCa");

        let ok: Result<PassReport, CheckError> = Ok(PassReport::default());
        let attempt = finish_attempt(CheckAttempt::start(&key, false), &ok);
        assert_eq!(attempt.outcome, CheckOutcome::Success);
        assert!(attempt.finished_at.is_some());

        let limited: Result<PassReport, CheckError> =
            Err(CheckError::Fetch(FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            }));
        let attempt = finish_attempt(CheckAttempt::start(&key, true), &limited);
        assert_eq!(attempt.outcome, CheckOutcome::RateLimited);
        assert!(attempt.manual);

        let conflict: Result<PassReport, CheckError> = Ok(PassReport {
            halted: Some(HaltReason::Conflict),
            ..Default::default()
        });
        let attempt = finish_attempt(CheckAttempt::start(&key, false), &conflict);
        assert_eq!(attempt.outcome, CheckOutcome::Success);
        assert_eq!(attempt.detail.as_deref(), Some("halted: cursor conflict"));
    }
}
