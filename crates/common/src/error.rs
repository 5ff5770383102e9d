use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// `retry_in` is `None` when the provider gave no hint.
    #[error("Rate limited")]
    RateLimited { retry_in: Option<Duration> },

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Redis(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::ProviderUnavailable(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::RateLimited { retry_in } => {
                let message = match retry_in {
                    Some(d) => format!("Rate limited, retry in {}s", d.as_secs().max(1)),
                    None => self.to_string(),
                };
                (StatusCode::TOO_MANY_REQUESTS, message)
            }
            AppError::Busy(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = json!({ "error": message });
        let mut response = (status, Json(body)).into_response();

        if let AppError::RateLimited {
            retry_in: Some(retry_in),
        } = &self
            && let Ok(value) = HeaderValue::from_str(&retry_in.as_secs().max(1).to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }

        response
    }
}

/// Failures of a single read against the feed provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Transient: network, 5xx, malformed payload.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider throttled us. `retry_after` is its hint, when it sent one.
    #[error("provider rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Permanent until the watch is reconfigured.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
}

/// Failures of one check (scheduled or manual) as a whole.
///
/// A store conflict or a failed dispatch does not fail a check; those end the
/// pass early and are reported on the pass itself.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("a check is already in flight for {0}")]
    Busy(String),

    #[error("quota budget exhausted, retry in {}s", .retry_in.as_secs())]
    QuotaExhausted { retry_in: Duration },

    #[error("watch not found: {0}")]
    UnknownWatch(String),

    #[error(transparent)]
    Internal(#[from] AppError),
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Unavailable(msg) => AppError::ProviderUnavailable(msg),
            FetchError::RateLimited { retry_after } => AppError::RateLimited {
                retry_in: retry_after,
            },
            FetchError::ChannelNotFound(id) => {
                AppError::NotFound(format!("Channel {} not found at provider", id))
            }
        }
    }
}

impl From<CheckError> for AppError {
    fn from(err: CheckError) -> Self {
        match err {
            CheckError::Fetch(e) => e.into(),
            CheckError::Busy(key) => {
                AppError::Busy(format!("A check is already running for {}", key))
            }
            CheckError::QuotaExhausted { retry_in } => AppError::RateLimited {
                retry_in: Some(retry_in),
            },
            CheckError::UnknownWatch(key) => AppError::NotFound(format!("Watch {} not found", key)),
            CheckError::Internal(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_conflict() {
        let response = AppError::from(CheckError::Busy("1/UCx".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_quota_exhausted_sets_retry_after() {
        let err = CheckError::QuotaExhausted {
            retry_in: Duration::from_secs(42),
        };
        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("42")
        );
    }

    #[test]
    fn test_provider_throttle_without_hint_omits_retry_after() {
        let err = FetchError::RateLimited { retry_after: None };
        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());

        let hinted = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        let response = AppError::from(hinted).into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("30")
        );
    }

    #[test]
    fn test_channel_not_found_maps_to_404() {
        let err = FetchError::ChannelNotFound("UCgone".to_string());
        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_provider_unavailable_maps_to_bad_gateway() {
        let err = CheckError::Fetch(FetchError::Unavailable("503".to_string()));
        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
