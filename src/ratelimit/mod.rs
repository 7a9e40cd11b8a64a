//! Rate limiting algorithms and the limiter built on them.

pub mod algorithm;
pub mod analytics;
mod cache;
pub mod duration;
pub(crate) mod fixed_window;
mod limiter;
mod response;
pub(crate) mod sliding_window;
pub(crate) mod token_bucket;

pub use algorithm::{fixed_window, sliding_window, token_bucket, Algorithm, Limiter};
pub use analytics::Geo;
pub use cache::EphemeralCache;
pub use fixed_window::FixedWindow;
pub use limiter::{EphemeralCacheSetting, LimitOptions, RatelimitConfig, Ratelimiter, DEFAULT_PREFIX};
pub use response::{Pending, RateLimitResponse, Reason};
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;
