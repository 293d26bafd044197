//! Redis-backed rate limit storage shared between server instances.
//!
//! The whole fixed-window-with-block transition runs inside one Lua script,
//! so Redis serializes concurrent updates for a key across every process
//! that shares the server.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, Script};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{StorageError, TollgateError};
use crate::ratelimit::{LimitKey, RateLimitStore};

/// Default prefix for all rate limit keys.
pub const DEFAULT_KEY_PREFIX: &str = "tollgate:rate_limit:";
/// Default bound on every Redis round trip.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_PORT: u16 = 6379;

/// Upper bound for durations handed to the script. Lua 5.1 prints numbers
/// with 14 significant digits, so `now + block` must stay below 1e14 to
/// round-trip through `HSET` and `PEXPIRE` as an integer.
const MAX_SCRIPT_MILLIS: u64 = 10_000_000_000_000;

/// KEYS[1] = state hash
/// ARGV = now_ms, window_ms, max_requests, block_ms, ttl_ms
/// Returns the blocked-until instant in epoch milliseconds, 0 when allowed.
const OBSERVE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max_requests = tonumber(ARGV[3])
local block = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'window_start', 'count', 'blocked_until')
local window_start = tonumber(state[1])
local count = tonumber(state[2]) or 0
local blocked_until = tonumber(state[3]) or 0

if blocked_until > 0 then
  if now < blocked_until then
    return blocked_until
  end
  blocked_until = 0
  window_start = now
  count = 0
elseif window_start == nil or now - window_start >= window then
  window_start = now
  count = 0
end

count = count + 1
if count > max_requests then
  blocked_until = now + block
end

redis.call('HSET', KEYS[1], 'window_start', window_start, 'count', count, 'blocked_until', blocked_until)
redis.call('PEXPIRE', KEYS[1], ttl)
return blocked_until
"#;

/// Connection settings for the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    /// `host:port`, `host`, or a full `redis://` / `rediss://` URL
    pub address: String,
    /// Optional password
    pub password: Option<String>,
    /// Optional database index
    pub db: Option<i64>,
}

/// Redis-based rate limit storage implementation.
pub struct RedisStore {
    client: Client,
    /// Created on first use so that building the store never touches the network.
    connection: OnceCell<ConnectionManager>,
    script: Script,
    key_prefix: String,
    response_timeout: Duration,
}

impl RedisStore {
    /// Create a new store from connection settings.
    ///
    /// Only validates the settings; the connection is opened lazily.
    pub fn new(settings: &RedisSettings) -> crate::error::Result<Self> {
        let mut info = if settings.address.contains("://") {
            settings.address.as_str().into_connection_info()
        } else {
            let (host, port) = split_address(&settings.address)?;
            (host, port).into_connection_info()
        }
        .map_err(|e| TollgateError::Config(format!("Invalid Redis address '{}': {e}", settings.address)))?;

        if let Some(password) = &settings.password {
            info.redis.password = Some(password.clone());
        }
        if let Some(db) = settings.db {
            if db < 0 {
                return Err(TollgateError::Config(format!("Invalid Redis database index {db}")));
            }
            info.redis.db = db;
        }

        let client = Client::open(info)
            .map_err(|e| TollgateError::Config(format!("Failed to create Redis client: {e}")))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(OBSERVE_SCRIPT),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        })
    }

    /// Set the prefix used for every key.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the bound applied to connecting and to every command.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// The Redis key holding the state of `key`.
    pub fn storage_key(&self, key: &LimitKey) -> String {
        format!("{}{}", self.key_prefix, key.to_string_key())
    }

    async fn connection(&self) -> Result<ConnectionManager, StorageError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                debug!("Opening Redis connection");
                self.bounded(ConnectionManager::new(self.client.clone()))
                    .await?
                    .map_err(|e| StorageError::Connection(e.to_string()))
            })
            .await?;

        Ok(connection.clone())
    }

    async fn bounded<F: Future>(&self, future: F) -> Result<F::Output, StorageError> {
        tokio::time::timeout(self.response_timeout, future)
            .await
            .map_err(|_| StorageError::Timeout(self.response_timeout))
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn observe_and_maybe_block(
        &self,
        key: &LimitKey,
        now: DateTime<Utc>,
        window_millis: u64,
        max_requests: u64,
        block_millis: u64,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let mut conn = self.connection().await?;
        let storage_key = self.storage_key(key);
        let (window_millis, block_millis, ttl_millis) = script_durations(window_millis, block_millis);

        let mut invocation = self.script.key(&storage_key);
        invocation
            .arg(now.timestamp_millis())
            .arg(window_millis)
            .arg(max_requests)
            .arg(block_millis)
            .arg(ttl_millis);

        let blocked_until: i64 = self
            .bounded(invocation.invoke_async(&mut conn))
            .await?
            .map_err(|e| {
                warn!(key = %storage_key, error = %e, "Redis rate limit script failed");
                StorageError::Query(e.to_string())
            })?;

        if blocked_until == 0 {
            return Ok(None);
        }

        DateTime::from_timestamp_millis(blocked_until)
            .map(Some)
            .ok_or_else(|| StorageError::Query(format!("Invalid blocked-until value {blocked_until}")))
    }

    async fn clear(&self, key: &LimitKey) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let storage_key = self.storage_key(key);

        self.bounded(redis::cmd("DEL").arg(&storage_key).query_async::<()>(&mut conn))
            .await?
            .map_err(|e| StorageError::Query(e.to_string()))
    }
}

/// Window, block and key expiry in milliseconds, clamped for the script.
fn script_durations(window_millis: u64, block_millis: u64) -> (u64, u64, u64) {
    let window_millis = window_millis.min(MAX_SCRIPT_MILLIS);
    let block_millis = block_millis.min(MAX_SCRIPT_MILLIS);
    (window_millis, block_millis, window_millis.max(block_millis).max(1))
}

/// Split `host[:port]`, `ip`, or `[ipv6]:port` into its parts.
fn split_address(address: &str) -> crate::error::Result<(String, u16)> {
    if let Ok(socket) = address.parse::<SocketAddr>() {
        return Ok((socket.ip().to_string(), socket.port()));
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok((ip.to_string(), DEFAULT_PORT));
    }

    match address.split_once(':') {
        None if !address.is_empty() => Ok((address.to_string(), DEFAULT_PORT)),
        Some((host, port)) if !host.is_empty() && !port.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| TollgateError::Config(format!("Invalid Redis port in address '{address}'")))?;
            Ok((host.to_string(), port))
        }
        _ => Err(TollgateError::Config(format!("Invalid Redis address '{address}'"))),
    }
}
