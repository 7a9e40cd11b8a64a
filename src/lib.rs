//! Ratewarden - rate limiting over shared key-value stores
//!
//! Limits are enforced with a fixed window, sliding window or token bucket
//! algorithm whose state lives in an atomic store (Redis, or in memory for
//! tests). A limiter can span several independent regions; their decisions
//! are aggregated and lagging counters are reconciled in the background.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod region;
pub mod store;

pub use error::{RatewardenError, Result};
pub use ratelimit::{LimitOptions, RateLimitResponse, RatelimitConfig, Ratelimiter};
