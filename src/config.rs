//! Configuration management for Tollgate.
//!
//! The effective configuration is built from three layers, later wins:
//! built-in defaults, a caller-supplied [`LimiterConfig`], and environment
//! variables captured in [`EnvOverrides`]. The result is immutable and is
//! shared read-only between all requests.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::env::EnvSnapshot;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{LimitKey, RateLimitStore, Scope};
use crate::storage::{RedisSettings, Storage, StorageBackend};

/// IP max requests per second.
pub const ENV_IP_MAX_REQUESTS: &str = "RATE_LIMITER_IP_MAX_REQUESTS";
/// IP block time in milliseconds.
pub const ENV_IP_BLOCK_TIME: &str = "RATE_LIMITER_IP_BLOCK_TIME";
/// Default token max requests per second.
pub const ENV_TOKEN_MAX_REQUESTS: &str = "RATE_LIMITER_TOKEN_MAX_REQUESTS";
/// Default token block time in milliseconds.
pub const ENV_TOKEN_BLOCK_TIME: &str = "RATE_LIMITER_TOKEN_BLOCK_TIME";
/// Debug decision logging.
pub const ENV_DEBUG: &str = "RATE_LIMITER_DEBUG";
/// Use Redis instead of in-process storage.
pub const ENV_USE_REDIS: &str = "RATE_LIMITER_USE_REDIS";
/// Redis address.
pub const ENV_REDIS_ADDRESS: &str = "RATE_LIMITER_REDIS_ADDRESS";
/// Redis password.
pub const ENV_REDIS_PASSWORD: &str = "RATE_LIMITER_REDIS_PASSWORD";
/// Redis database index.
pub const ENV_REDIS_DB: &str = "RATE_LIMITER_REDIS_DB";

/// Per-token variables are `RATE_LIMITER_TOKEN_<token>_MAX_REQUESTS` and
/// `RATE_LIMITER_TOKEN_<token>_BLOCK_TIME`.
const ENV_TOKEN_PREFIX: &str = "RATE_LIMITER_TOKEN_";
const ENV_TOKEN_MAX_REQUESTS_SUFFIX: &str = "_MAX_REQUESTS";
const ENV_TOKEN_BLOCK_TIME_SUFFIX: &str = "_BLOCK_TIME";

/// Built-in IP limits.
pub const DEFAULT_IP_CONFIG: RateConfig = RateConfig {
    max_requests_per_second: 10,
    block_duration_millis: 1000,
};

/// Built-in token limits.
pub const DEFAULT_TOKEN_CONFIG: RateConfig = RateConfig {
    max_requests_per_second: 100,
    block_duration_millis: 1000,
};

/// Rate parameters for one scope or token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Requests allowed per one-second window
    pub max_requests_per_second: u64,
    /// How long a caller stays blocked after exceeding the limit
    pub block_duration_millis: u64,
}

/// Rate parameters where each field may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartialRateConfig {
    /// Requests allowed per one-second window
    #[serde(default)]
    pub max_requests_per_second: Option<u64>,
    /// Block duration in milliseconds
    #[serde(default)]
    pub block_duration_millis: Option<u64>,
}

impl PartialRateConfig {
    /// Layer `other` on top of `self`; fields present in `other` win.
    pub fn overlay(self, other: &PartialRateConfig) -> Self {
        Self {
            max_requests_per_second: other.max_requests_per_second.or(self.max_requests_per_second),
            block_duration_millis: other.block_duration_millis.or(self.block_duration_millis),
        }
    }

    /// Fill every missing field from `base`.
    pub fn fill(&self, base: RateConfig) -> RateConfig {
        RateConfig {
            max_requests_per_second: self
                .max_requests_per_second
                .unwrap_or(base.max_requests_per_second),
            block_duration_millis: self.block_duration_millis.unwrap_or(base.block_duration_millis),
        }
    }
}

impl From<RateConfig> for PartialRateConfig {
    fn from(config: RateConfig) -> Self {
        Self {
            max_requests_per_second: Some(config.max_requests_per_second),
            block_duration_millis: Some(config.block_duration_millis),
        }
    }
}

/// Redis connection settings where each field may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    /// `host:port` or a `redis://` URL
    #[serde(default)]
    pub address: Option<String>,
    /// Password
    #[serde(default)]
    pub password: Option<String>,
    /// Database index
    #[serde(default)]
    pub db: Option<i64>,
}

impl RedisConfig {
    fn overlay(self, other: &RedisConfig) -> Self {
        Self {
            address: other.address.clone().or(self.address),
            password: other.password.clone().or(self.password),
            db: other.db.or(self.db),
        }
    }
}

/// Caller-supplied configuration. Every field is optional.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Limits applied per client IP
    #[serde(default)]
    pub ip: Option<PartialRateConfig>,

    /// Default limits applied per token
    #[serde(default)]
    pub token: Option<PartialRateConfig>,

    /// Per-token overrides; an empty entry inherits the token limits
    #[serde(default)]
    pub custom_tokens: HashMap<String, Option<PartialRateConfig>>,

    /// Enable debug decision logging
    #[serde(default)]
    pub debug: Option<bool>,

    /// Select the Redis backend
    #[serde(default)]
    pub use_redis: Option<bool>,

    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisConfig,

    /// A ready-made storage adapter, used instead of building one
    #[serde(skip)]
    pub storage: Option<Arc<dyn RateLimitStore>>,
}

impl fmt::Debug for LimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterConfig")
            .field("ip", &self.ip)
            .field("token", &self.token)
            .field("custom_tokens", &self.custom_tokens)
            .field("debug", &self.debug)
            .field("use_redis", &self.use_redis)
            .field("redis", &self.redis)
            .field("storage", &self.storage.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse rate limiter config: {e}")))
    }
}

/// Values found in the environment, before merging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// IP limits
    pub ip: PartialRateConfig,
    /// Default token limits
    pub token: PartialRateConfig,
    /// Per-token limits
    pub custom_tokens: HashMap<String, PartialRateConfig>,
    /// Debug flag
    pub debug: Option<bool>,
    /// Backend selector
    pub use_redis: Option<bool>,
    /// Redis connection settings
    pub redis: RedisConfig,
}

impl EnvOverrides {
    /// Read the overrides from the process environment.
    pub fn from_process() -> Self {
        Self::from_snapshot(&EnvSnapshot::from_process())
    }

    /// Read the overrides from an environment snapshot.
    pub fn from_snapshot(env: &EnvSnapshot) -> Self {
        let mut custom_tokens: HashMap<String, PartialRateConfig> = HashMap::new();

        for name in env.keys_with_prefix(ENV_TOKEN_PREFIX) {
            let rest = &name[ENV_TOKEN_PREFIX.len()..];

            if let Some(token) = rest.strip_suffix(ENV_TOKEN_MAX_REQUESTS_SUFFIX) {
                let Some(value) = unsigned(env, name).filter(|_| !token.is_empty()) else {
                    continue;
                };
                custom_tokens.entry(token.to_string()).or_default().max_requests_per_second = Some(value);
            } else if let Some(token) = rest.strip_suffix(ENV_TOKEN_BLOCK_TIME_SUFFIX) {
                let Some(value) = unsigned(env, name).filter(|_| !token.is_empty()) else {
                    continue;
                };
                custom_tokens.entry(token.to_string()).or_default().block_duration_millis = Some(value);
            }
        }

        Self {
            ip: PartialRateConfig {
                max_requests_per_second: unsigned(env, ENV_IP_MAX_REQUESTS),
                block_duration_millis: unsigned(env, ENV_IP_BLOCK_TIME),
            },
            token: PartialRateConfig {
                max_requests_per_second: unsigned(env, ENV_TOKEN_MAX_REQUESTS),
                block_duration_millis: unsigned(env, ENV_TOKEN_BLOCK_TIME),
            },
            custom_tokens,
            debug: env.bool(ENV_DEBUG),
            use_redis: env.bool(ENV_USE_REDIS),
            redis: RedisConfig {
                address: env.string(ENV_REDIS_ADDRESS),
                password: env.string(ENV_REDIS_PASSWORD),
                db: env.int(ENV_REDIS_DB),
            },
        }
    }

    /// Whether debug logging is on once these overrides are applied over `input`.
    pub fn debug_enabled(&self, input: Option<&LimiterConfig>) -> bool {
        self.debug.or(input.and_then(|c| c.debug)).unwrap_or(false)
    }
}

fn unsigned(env: &EnvSnapshot, key: &str) -> Option<u64> {
    let value = env.int(key)?;
    match u64::try_from(value) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = key, value, "Ignoring negative value");
            None
        }
    }
}

/// The resolved configuration shared by every request.
#[derive(Clone)]
pub struct EffectiveConfig {
    /// Limits applied per client IP
    pub ip: RateConfig,
    /// Default limits applied per token
    pub token: RateConfig,
    /// Fully populated per-token limits
    pub custom_tokens: HashMap<String, RateConfig>,
    /// Where the rate limit state lives
    pub storage: Arc<dyn RateLimitStore>,
    /// Whether each decision is logged
    pub debug: bool,
}

impl fmt::Debug for EffectiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectiveConfig")
            .field("ip", &self.ip)
            .field("token", &self.token)
            .field("custom_tokens", &self.custom_tokens)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl EffectiveConfig {
    /// Get the limits for a token and whether they come from an override.
    pub fn rate_config_for_token(&self, token: &str) -> (RateConfig, bool) {
        match self.custom_tokens.get(token) {
            Some(config) => (*config, true),
            None => (self.token, false),
        }
    }

    /// Get the limits that apply to a key.
    pub fn rate_config_for(&self, key: &LimitKey) -> (RateConfig, bool) {
        match key.scope {
            Scope::Ip => (self.ip, false),
            Scope::Token => self.rate_config_for_token(&key.identity),
        }
    }
}

/// Resolve the effective configuration using the process environment.
pub fn resolve(input: Option<LimiterConfig>) -> Result<EffectiveConfig> {
    resolve_with(input, &EnvOverrides::from_process())
}

/// Resolve the effective configuration against explicit environment values.
///
/// Fails only when Redis is selected without an address.
pub fn resolve_with(input: Option<LimiterConfig>, env: &EnvOverrides) -> Result<EffectiveConfig> {
    let debug = env.debug_enabled(input.as_ref());
    let input = input.unwrap_or_default();

    let ip = input.ip.unwrap_or_default().overlay(&env.ip).fill(DEFAULT_IP_CONFIG);
    let token = input
        .token
        .unwrap_or_default()
        .overlay(&env.token)
        .fill(DEFAULT_TOKEN_CONFIG);

    let mut custom_tokens: HashMap<String, RateConfig> = input
        .custom_tokens
        .iter()
        .map(|(name, partial)| {
            let merged = partial
                .unwrap_or_default()
                .overlay(&env.custom_tokens.get(name).copied().unwrap_or_default())
                .fill(token);
            (name.clone(), merged)
        })
        .collect();

    for (name, partial) in &env.custom_tokens {
        custom_tokens
            .entry(name.clone())
            .or_insert_with(|| partial.fill(token));
    }

    let use_redis = env.use_redis.or(input.use_redis).unwrap_or(false);

    let storage: Arc<dyn RateLimitStore> = match input.storage {
        Some(storage) if env.use_redis != Some(true) => storage,
        _ => {
            let backend = if use_redis {
                let redis = input.redis.overlay(&env.redis);
                let address = redis.address.ok_or_else(|| {
                    TollgateError::Config(format!(
                        "Redis storage requested but no address configured (set {ENV_REDIS_ADDRESS})"
                    ))
                })?;
                StorageBackend::Redis(RedisSettings {
                    address,
                    password: redis.password,
                    db: redis.db,
                })
            } else {
                StorageBackend::Memory
            };

            let storage = Storage::from_backend(&backend)?;
            info!(backend = storage.name(), "Rate limiter storage selected");
            Arc::new(storage)
        }
    };

    Ok(EffectiveConfig {
        ip,
        token,
        custom_tokens,
        storage,
        debug,
    })
}
