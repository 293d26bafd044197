//! Core admission engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::config::{EffectiveConfig, RateConfig};
use crate::error::StorageError;

use super::backend::RateLimitStore;
use super::key::LimitKey;
use super::window::WINDOW_LENGTH_MILLIS;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed,
    /// The caller is blocked until the given instant.
    Blocked {
        /// When the block ends
        until: DateTime<Utc>,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// The end of the block, if the request was blocked.
    pub fn blocked_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Decision::Allowed => None,
            Decision::Blocked { until } => Some(*until),
        }
    }

    /// Time left on the block as seen from `now`, if the request was blocked.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.blocked_until()
            .map(|until| remaining_block_time(until, now))
    }
}

impl From<Option<DateTime<Utc>>> for Decision {
    fn from(blocked_until: Option<DateTime<Utc>>) -> Self {
        match blocked_until {
            Some(until) => Decision::Blocked { until },
            None => Decision::Allowed,
        }
    }
}

/// Time remaining until `until`, clamped at zero.
pub fn remaining_block_time(until: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    until
        .signed_duration_since(now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// The admission engine.
///
/// Holds no mutable state of its own: every check is a single atomic call
/// into the storage adapter, so the limiter is safe to share across tasks.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    debug: bool,
}

impl RateLimiter {
    /// Create a new rate limiter on top of a storage adapter.
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store, debug: false }
    }

    /// Create a rate limiter using the storage and debug flag of a resolved configuration.
    pub fn from_config(config: &EffectiveConfig) -> Self {
        Self::new(config.storage.clone()).with_debug(config.debug)
    }

    /// Log every decision at debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Get the storage adapter.
    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// Check one request for `key` against `config` at the current time.
    pub async fn check(&self, key: &LimitKey, config: &RateConfig) -> Result<Decision, StorageError> {
        self.check_at(key, config, Utc::now()).await
    }

    /// Check one request for `key` against `config` at `now`.
    ///
    /// Storage errors are returned as-is; nothing is retried here.
    pub async fn check_at(
        &self,
        key: &LimitKey,
        config: &RateConfig,
        now: DateTime<Utc>,
    ) -> Result<Decision, StorageError> {
        trace!(
            key = %key,
            max_requests = config.max_requests_per_second,
            block_millis = config.block_duration_millis,
            "Checking rate limit"
        );

        let decision: Decision = self
            .store
            .observe_and_maybe_block(
                key,
                now,
                WINDOW_LENGTH_MILLIS,
                config.max_requests_per_second,
                config.block_duration_millis,
            )
            .await?
            .into();

        if self.debug {
            match decision {
                Decision::Allowed => debug!(
                    scope = %key.scope,
                    identity = %key.identity,
                    "Request allowed"
                ),
                Decision::Blocked { until } => debug!(
                    scope = %key.scope,
                    identity = %key.identity,
                    blocked_until = %until,
                    remaining_secs = remaining_block_time(until, now).as_secs_f64(),
                    "Request blocked"
                ),
            }
        }

        Ok(decision)
    }
}
