//! Sliding window algorithm.
//!
//! Keeps two adjacent fixed buckets and weighs the previous one by the share of
//! it still covered by a frame of one window length ending now. Storage stays
//! at two integers per identifier while boundary bursts are smoothed out.

use std::time::Duration;

use async_trait::async_trait;

use super::algorithm::{window_millis, Algorithm, CounterSnapshot, RegionDecision};
use crate::error::{RatewardenError, Result};
use crate::region::RegionContext;
use crate::store::SlidingWindowReply;

/// Lua source of the sliding window unit.
pub(crate) const SCRIPT: &str = r#"
local currentKey  = KEYS[1]
local previousKey = KEYS[2]
local tokens      = tonumber(ARGV[1])
local now         = tonumber(ARGV[2])
local window      = tonumber(ARGV[3])
local incrementBy = tonumber(ARGV[4])

local current  = tonumber(redis.call("GET", currentKey) or "0")
local previous = tonumber(redis.call("GET", previousKey) or "0")

local elapsed  = (now % window) / window
local weighted = math.floor(previous * (1 - elapsed))
if weighted + current >= tokens then
  return {0, current, weighted}
end

local newValue = redis.call("INCRBY", currentKey, incrementBy)
if newValue == incrementBy then
  redis.call("PEXPIRE", currentKey, window * 2 + 1000)
end
return {1, newValue, weighted}
"#;

/// Expiry of a bucket: long enough to still be read as "previous" by the next window.
pub(crate) fn bucket_ttl(window_ms: u64) -> u64 {
    window_ms * 2 + 1000
}

/// Previous bucket count scaled by its overlap with the current sliding frame.
pub(crate) fn weighted_previous(previous: i64, now: u64, window_ms: u64) -> i64 {
    let elapsed = (now % window_ms) as f64 / window_ms as f64;
    (previous as f64 * (1.0 - elapsed)).floor() as i64
}

/// Decide from the two raw bucket counts. Rejection leaves `current` untouched.
pub(crate) fn evaluate(
    current: i64,
    previous: i64,
    limit: u64,
    now: u64,
    window_ms: u64,
    increment: u64,
) -> SlidingWindowReply {
    let weighted = weighted_previous(previous, now, window_ms);
    if weighted + current >= limit as i64 {
        return SlidingWindowReply {
            accepted: false,
            current,
            weighted_previous: weighted,
        };
    }

    SlidingWindowReply {
        accepted: true,
        current: current + increment as i64,
        weighted_previous: weighted,
    }
}

/// Sliding window limiter: `tokens` requests per rolling `window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindow {
    tokens: u64,
    window_ms: u64,
}

impl SlidingWindow {
    /// Create a sliding window limiter.
    pub fn new(tokens: u64, window: Duration) -> Self {
        Self {
            tokens,
            window_ms: window_millis(window),
        }
    }

    /// Length of one window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn bucket_keys(&self, key: &str, now: u64) -> (u64, String, String) {
        let bucket = now / self.window_ms;
        let current = format!("{}:{}", key, bucket);
        // Bucket 0 has no predecessor; `-1` names a key that is never written.
        let previous = match bucket.checked_sub(1) {
            Some(previous) => format!("{}:{}", key, previous),
            None => format!("{}:-1", key),
        };
        (bucket, current, previous)
    }
}

#[async_trait]
impl Algorithm for SlidingWindow {
    fn max_requests(&self) -> u64 {
        self.tokens
    }

    fn validate(&self) -> Result<()> {
        if self.tokens == 0 {
            return Err(RatewardenError::Config(
                "sliding window tokens must be greater than 0".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(RatewardenError::Config(
                "sliding window must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }

    async fn decide(
        &self,
        region: &RegionContext,
        key: &str,
        now: u64,
        rate: u64,
    ) -> Result<RegionDecision> {
        let (bucket, current_key, previous_key) = self.bucket_keys(key, now);
        let reply = region
            .store()
            .sliding_window(&current_key, &previous_key, self.tokens, now, self.window_ms, rate)
            .await?;

        let used = reply.current + reply.weighted_previous;
        Ok(RegionDecision {
            success: reply.accepted,
            limit: self.tokens,
            remaining: self.tokens as i64 - used,
            reset: (bucket + 1) * self.window_ms,
            used,
            counter: Some(CounterSnapshot {
                key: current_key,
                value: reply.current,
                ttl_ms: bucket_ttl(self.window_ms),
            }),
        })
    }

    async fn remaining(&self, region: &RegionContext, key: &str, now: u64) -> Result<i64> {
        let (_, current_key, previous_key) = self.bucket_keys(key, now);
        let store = region.store();
        let current = store.get_count(&current_key).await?;
        let previous = store.get_count(&previous_key).await?;
        let weighted = weighted_previous(previous, now, self.window_ms);
        Ok(self.tokens as i64 - (current + weighted))
    }

    async fn reset(&self, region: &RegionContext, key: &str, now: u64) -> Result<()> {
        let (_, current_key, previous_key) = self.bucket_keys(key, now);
        region.store().delete(&[current_key, previous_key]).await
    }
}
