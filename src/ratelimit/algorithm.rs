//! Algorithm capability shared by the fixed window, sliding window and token
//! bucket limiters.

use std::time::Duration;

use async_trait::async_trait;

use super::fixed_window::FixedWindow;
use super::sliding_window::SlidingWindow;
use super::token_bucket::TokenBucket;
use crate::error::Result;
use crate::region::RegionContext;

/// Raw counter an algorithm wrote during a decision.
///
/// The multi-region coordinator uses it to push the highest observed value
/// back into regions that lag behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Full store key of the counter
    pub key: String,
    /// Value of the counter after the decision
    pub value: i64,
    /// Expiry to apply if the counter has to be created in another region
    pub ttl_ms: u64,
}

/// Outcome of running an algorithm against a single region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDecision {
    pub success: bool,
    pub limit: u64,
    /// May be negative; clamped when turned into a response.
    pub remaining: i64,
    /// Unix milliseconds at which the limit resets.
    pub reset: u64,
    /// Usage the decision was based on.
    pub used: i64,
    pub counter: Option<CounterSnapshot>,
}

/// A rate limiting algorithm.
///
/// Implementations hold only immutable parameters; all mutable state lives in
/// the store, so one instance can serve any number of concurrent calls.
#[async_trait]
pub trait Algorithm: Send + Sync + std::fmt::Debug {
    /// Requests (or tokens) allowed per window.
    fn max_requests(&self) -> u64;

    /// Whether decisions can be aggregated across independent regions.
    fn supports_multi_region(&self) -> bool {
        true
    }

    /// Check the parameters once, before the algorithm is used.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Consume `rate` units for `key` and decide.
    async fn decide(
        &self,
        region: &RegionContext,
        key: &str,
        now: u64,
        rate: u64,
    ) -> Result<RegionDecision>;

    /// Units left for `key` without consuming any.
    async fn remaining(&self, region: &RegionContext, key: &str, now: u64) -> Result<i64>;

    /// Drop the stored state for `key`.
    async fn reset(&self, region: &RegionContext, key: &str, now: u64) -> Result<()>;
}

/// The built-in algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Limiter {
    FixedWindow(FixedWindow),
    SlidingWindow(SlidingWindow),
    TokenBucket(TokenBucket),
}

/// `tokens` requests per fixed `window`.
pub fn fixed_window(tokens: u64, window: Duration) -> Limiter {
    Limiter::FixedWindow(FixedWindow::new(tokens, window))
}

/// `tokens` requests per rolling `window`.
pub fn sliding_window(tokens: u64, window: Duration) -> Limiter {
    Limiter::SlidingWindow(SlidingWindow::new(tokens, window))
}

/// A bucket of `max_tokens` regaining `refill_rate` tokens every `interval`.
pub fn token_bucket(refill_rate: u64, interval: Duration, max_tokens: u64) -> Limiter {
    Limiter::TokenBucket(TokenBucket::new(refill_rate, interval, max_tokens))
}

impl Limiter {
    fn inner(&self) -> &dyn Algorithm {
        match self {
            Limiter::FixedWindow(a) => a,
            Limiter::SlidingWindow(a) => a,
            Limiter::TokenBucket(a) => a,
        }
    }
}

#[async_trait]
impl Algorithm for Limiter {
    fn max_requests(&self) -> u64 {
        self.inner().max_requests()
    }

    fn supports_multi_region(&self) -> bool {
        self.inner().supports_multi_region()
    }

    fn validate(&self) -> Result<()> {
        self.inner().validate()
    }

    async fn decide(
        &self,
        region: &RegionContext,
        key: &str,
        now: u64,
        rate: u64,
    ) -> Result<RegionDecision> {
        self.inner().decide(region, key, now, rate).await
    }

    async fn remaining(&self, region: &RegionContext, key: &str, now: u64) -> Result<i64> {
        self.inner().remaining(region, key, now).await
    }

    async fn reset(&self, region: &RegionContext, key: &str, now: u64) -> Result<()> {
        self.inner().reset(region, key, now).await
    }
}

/// Window length in whole milliseconds, saturating on absurd durations.
pub(crate) fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}
