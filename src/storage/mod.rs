//! Storage backends for rate limit state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisSettings, RedisStore};

use crate::error::{Result, StorageError};
use crate::ratelimit::{LimitKey, RateLimitStore};

/// Which storage backend to build.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// State lives in this process only.
    #[default]
    Memory,
    /// State lives in a Redis server shared by every instance.
    Redis(RedisSettings),
}

/// Storage backend for rate limiting.
pub enum Storage {
    /// In-process storage
    Memory(MemoryStore),
    /// Shared Redis storage
    Redis(RedisStore),
}

impl Storage {
    /// Build the storage selected by `backend`.
    pub fn from_backend(backend: &StorageBackend) -> Result<Self> {
        Ok(match backend {
            StorageBackend::Memory => Storage::Memory(MemoryStore::new()),
            StorageBackend::Redis(settings) => Storage::Redis(RedisStore::new(settings)?),
        })
    }

    /// The in-process store, if this is one.
    pub fn as_memory(&self) -> Option<&MemoryStore> {
        match self {
            Storage::Memory(store) => Some(store),
            Storage::Redis(_) => None,
        }
    }

    /// Short backend name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Storage::Memory(_) => "memory",
            Storage::Redis(_) => "redis",
        }
    }
}

#[async_trait]
impl RateLimitStore for Storage {
    async fn observe_and_maybe_block(
        &self,
        key: &LimitKey,
        now: DateTime<Utc>,
        window_millis: u64,
        max_requests: u64,
        block_millis: u64,
    ) -> std::result::Result<Option<DateTime<Utc>>, StorageError> {
        match self {
            Storage::Memory(store) => {
                store
                    .observe_and_maybe_block(key, now, window_millis, max_requests, block_millis)
                    .await
            }
            Storage::Redis(store) => {
                store
                    .observe_and_maybe_block(key, now, window_millis, max_requests, block_millis)
                    .await
            }
        }
    }

    async fn clear(&self, key: &LimitKey) -> std::result::Result<(), StorageError> {
        match self {
            Storage::Memory(store) => store.clear(key).await,
            Storage::Redis(store) => store.clear(key).await,
        }
    }

    fn evict_expired(&self, now: DateTime<Utc>, window_millis: u64) -> usize {
        match self {
            Storage::Memory(store) => store.evict_expired(now, window_millis),
            Storage::Redis(store) => store.evict_expired(now, window_millis),
        }
    }
}
