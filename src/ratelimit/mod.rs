//! Rate limiting logic and state management.

mod backend;
mod key;
mod limiter;
mod window;

pub use backend::RateLimitStore;
pub use key::{LimitKey, Scope};
pub use limiter::{remaining_block_time, Decision, RateLimiter};
pub use window::{WindowState, WINDOW_LENGTH_MILLIS};
