//! Tollgate - HTTP Request Admission Control
//!
//! This crate decides, per request, whether a caller identified by its IP
//! address or API token may proceed or has exceeded its configured rate.
//! Limits use a one-second fixed window with a sticky block, and state can
//! be kept in-process or shared between instances through Redis.

pub mod config;
pub mod env;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod storage;

pub use config::{resolve, resolve_with, EffectiveConfig, LimiterConfig, RateConfig};
pub use middleware::RateLimitLayer;
pub use ratelimit::{Decision, LimitKey, RateLimiter};
