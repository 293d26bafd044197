//! Rendering of rejected and failed admission checks.

use axum::body::Body;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use http::header::RETRY_AFTER;
use http::{HeaderValue, Response, StatusCode};

use crate::error::StorageError;
use crate::ratelimit::remaining_block_time;

/// Body of the default rate limit rejection.
pub const RATE_LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Body of the default internal error response.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

/// Turns a non-allowed admission outcome into a response.
pub trait OutcomeResponder: Send + Sync {
    /// Render a request rejected because its caller is blocked until `until`.
    fn blocked(&self, until: DateTime<Utc>, now: DateTime<Utc>) -> Response<Body>;

    /// Render a request whose admission check failed.
    fn error(&self, error: &StorageError) -> Response<Body>;
}

/// Plain-text `429` and `500` responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResponder;

impl OutcomeResponder for DefaultResponder {
    fn blocked(&self, until: DateTime<Utc>, now: DateTime<Utc>) -> Response<Body> {
        let retry_after_secs = remaining_block_time(until, now).as_millis().div_ceil(1000);

        let mut response = (StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_MESSAGE).into_response();
        response.headers_mut().insert(
            RETRY_AFTER,
            HeaderValue::from(u64::try_from(retry_after_secs).unwrap_or(u64::MAX)),
        );
        response
    }

    fn error(&self, _error: &StorageError) -> Response<Body> {
        (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_blocked_response() {
        let now = Utc::now();
        let response = DefaultResponder.blocked(now + TimeDelta::milliseconds(1500), now);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "2");
    }

    #[test]
    fn test_blocked_response_after_block_ended() {
        let now = Utc::now();
        let response = DefaultResponder.blocked(now - TimeDelta::seconds(1), now);

        assert_eq!(response.headers()[RETRY_AFTER], "0");
    }

    #[test]
    fn test_error_response() {
        let response = DefaultResponder.error(&StorageError::Timeout(std::time::Duration::from_secs(1)));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
