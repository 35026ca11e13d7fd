//! Request middleware: bearer-token authentication and rate limiting.

pub mod bearer;
pub mod rate_limit;

pub use bearer::{BearerClaims, authenticate_bearer, require_scope};
pub use rate_limit::{RateLimiter, enforce_rate_limit};
