//! HTTP integration: a tower middleware and the responses it renders.

mod layer;
mod response;

pub use layer::{extract_limit_key, RateLimitLayer, RateLimitService, API_KEY_HEADER, UNKNOWN_IDENTITY};
pub use response::{DefaultResponder, OutcomeResponder, INTERNAL_ERROR_MESSAGE, RATE_LIMITED_MESSAGE};
