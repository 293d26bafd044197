//! Storage adapter trait for abstracting in-process and shared implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::key::LimitKey;
use crate::error::StorageError;

/// Trait for rate limit state storage.
///
/// Implementations own the per-key [`WindowState`](super::WindowState) and
/// must serialize concurrent calls for the same key; calls for different
/// keys may run in parallel.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Record one request for `key` and apply the fixed-window-with-block
    /// transition atomically.
    ///
    /// Returns the instant the key is blocked until, or `None` when the
    /// request is allowed. Backend failures are returned as errors, never
    /// turned into an allow.
    async fn observe_and_maybe_block(
        &self,
        key: &LimitKey,
        now: DateTime<Utc>,
        window_millis: u64,
        max_requests: u64,
        block_millis: u64,
    ) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Forget all state for `key`.
    async fn clear(&self, key: &LimitKey) -> Result<(), StorageError>;

    /// Drop state that no longer affects any decision.
    ///
    /// Returns the number of evicted entries. Stores that expire entries on
    /// their own keep the default no-op.
    fn evict_expired(&self, _now: DateTime<Utc>, _window_millis: u64) -> usize {
        0
    }
}
