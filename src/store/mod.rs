//! Backing store abstraction.
//!
//! Each method of [`AtomicStore`] is one indivisible read-decide-write unit.
//! Implementations must execute it atomically (a server-side script, a
//! transaction, or a single lock in the in-memory case); the limiter never
//! adds client-side locking on top.

mod memory;
#[cfg(feature = "redis-store")]
mod redis;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;

/// Reply of the sliding window unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowReply {
    /// Whether the current bucket was incremented.
    pub accepted: bool,
    /// Count of the current bucket, after the increment when accepted.
    pub current: i64,
    /// Previous bucket count already scaled by its overlap with the sliding frame.
    pub weighted_previous: i64,
}

/// Reply of the token bucket unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketReply {
    /// Tokens left after consuming, or -1 if the request was rejected.
    pub remaining: i64,
    /// Timestamp (ms) of the next refill.
    pub reset: u64,
}

/// Persisted token bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub tokens: i64,
    pub refilled_at: u64,
}

/// A key-value store offering atomic scripted updates and per-key expiry.
#[async_trait]
pub trait AtomicStore: Send + Sync + std::fmt::Debug {
    /// Add `increment` to `key`; set a `window_ms` expiry when the key is new.
    /// Returns the counter value after the increment.
    async fn fixed_window(&self, key: &str, window_ms: u64, increment: u64) -> Result<i64>;

    /// Weigh `previous_key` against `current_key` and increment the current
    /// bucket only if the weighted sum is still below `limit`.
    async fn sliding_window(
        &self,
        current_key: &str,
        previous_key: &str,
        limit: u64,
        now: u64,
        window_ms: u64,
        increment: u64,
    ) -> Result<SlidingWindowReply>;

    /// Lazily refill the bucket at `key`, then consume `increment` tokens if available.
    async fn token_bucket(
        &self,
        key: &str,
        max_tokens: u64,
        interval_ms: u64,
        refill_rate: u64,
        now: u64,
        increment: u64,
    ) -> Result<TokenBucketReply>;

    /// Read a counter; missing keys read as zero.
    async fn get_count(&self, key: &str) -> Result<i64>;

    /// Read a token bucket without refilling it.
    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>>;

    /// Raise the counter at `key` to `value` if it is lower. A key created
    /// this way expires after `ttl_ms`. Returns the resulting value.
    async fn raise_count(&self, key: &str, value: i64, ttl_ms: u64) -> Result<i64>;

    /// Remove keys. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Increment each hash field of `key` by one and refresh its expiry.
    async fn record_event(&self, key: &str, fields: &[String], ttl_ms: u64) -> Result<()>;
}
