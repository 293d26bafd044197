//! In-process rate limit storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::StorageError;
use crate::ratelimit::{LimitKey, RateLimitStore, WindowState};

/// In-memory storage backed by a sharded concurrent map.
///
/// Each transition runs while holding the entry guard, which write-locks
/// only the shard owning the key. Same-key calls are therefore serialized
/// while keys on other shards proceed in parallel.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: DashMap<LimitKey, WindowState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of the state for a key, if any.
    pub fn get(&self, key: &LimitKey) -> Option<WindowState> {
        self.states.get(key).map(|state| *state)
    }

    /// Get the number of tracked keys.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn observe_and_maybe_block(
        &self,
        key: &LimitKey,
        now: DateTime<Utc>,
        window_millis: u64,
        max_requests: u64,
        block_millis: u64,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let mut state = self
            .states
            .entry(key.clone())
            .or_insert_with(|| {
                trace!(key = %key, "Creating rate limit state");
                WindowState::new(now)
            });

        Ok(state.observe(now, window_millis, max_requests, block_millis))
    }

    async fn clear(&self, key: &LimitKey) -> Result<(), StorageError> {
        self.states.remove(key);
        Ok(())
    }

    fn evict_expired(&self, now: DateTime<Utc>, window_millis: u64) -> usize {
        let before = self.states.len();
        self.states
            .retain(|_, state| !state.is_expired(now, window_millis));
        let evicted = before.saturating_sub(self.states.len());

        if evicted > 0 {
            debug!(evicted, remaining = self.states.len(), "Evicted expired rate limit state");
        }

        evicted
    }
}
