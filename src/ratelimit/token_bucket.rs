//! Token bucket algorithm.
//!
//! A bucket starts with `max_tokens` and regains `refill_rate` tokens per
//! elapsed `interval`. Refills are computed lazily on access, so no timer runs
//! in the background. The key expires once the bucket would be full again.

use std::time::Duration;

use async_trait::async_trait;

use super::algorithm::{window_millis, Algorithm, RegionDecision};
use crate::error::{RatewardenError, Result};
use crate::region::RegionContext;
use crate::store::{BucketState, TokenBucketReply};

/// Lua source of the token bucket unit.
pub(crate) const SCRIPT: &str = r#"
local key         = KEYS[1]
local maxTokens   = tonumber(ARGV[1])
local interval    = tonumber(ARGV[2])
local refillRate  = tonumber(ARGV[3])
local now         = tonumber(ARGV[4])
local incrementBy = tonumber(ARGV[5])

local bucket = redis.call("HMGET", key, "refilledAt", "tokens")

local refilledAt
local tokens
if bucket[1] == false then
  refilledAt = now
  tokens = maxTokens
else
  refilledAt = tonumber(bucket[1])
  tokens = tonumber(bucket[2])
end

if now >= refilledAt + interval then
  local numRefills = math.floor((now - refilledAt) / interval)
  tokens = math.min(maxTokens, tokens + numRefills * refillRate)
  refilledAt = refilledAt + numRefills * interval
end

if tokens < incrementBy then
  return {-1, refilledAt + interval}
end

local remaining = tokens - incrementBy
local expireAt = math.ceil((maxTokens - remaining) / refillRate) * interval

redis.call("HSET", key, "refilledAt", refilledAt, "tokens", remaining)
redis.call("PEXPIRE", key, expireAt)
return {remaining, refilledAt + interval}
"#;

/// Bring a bucket up to date at `now`. A missing bucket starts full.
pub(crate) fn refill(
    state: Option<BucketState>,
    now: u64,
    max_tokens: u64,
    interval_ms: u64,
    refill_rate: u64,
) -> BucketState {
    let mut state = state.unwrap_or(BucketState {
        tokens: max_tokens as i64,
        refilled_at: now,
    });

    if now >= state.refilled_at + interval_ms {
        let refills = (now - state.refilled_at) / interval_ms;
        state.tokens = (state.tokens + (refills * refill_rate) as i64).min(max_tokens as i64);
        state.refilled_at += refills * interval_ms;
    }

    state
}

/// Time until a bucket holding `remaining` tokens is saturated again.
pub(crate) fn expire_after(max_tokens: u64, remaining: i64, refill_rate: u64, interval_ms: u64) -> u64 {
    let missing = (max_tokens as i64 - remaining).max(0) as u64;
    missing.div_ceil(refill_rate) * interval_ms
}

/// Outcome of one token bucket step: the reply plus the state to persist, if any.
pub(crate) struct Step {
    pub reply: TokenBucketReply,
    pub write: Option<(BucketState, u64)>,
}

/// Refill, then consume `increment` tokens if the bucket holds enough.
pub(crate) fn consume(
    state: Option<BucketState>,
    now: u64,
    max_tokens: u64,
    interval_ms: u64,
    refill_rate: u64,
    increment: u64,
) -> Step {
    let state = refill(state, now, max_tokens, interval_ms, refill_rate);
    let reset = state.refilled_at + interval_ms;

    if state.tokens < increment as i64 {
        return Step {
            reply: TokenBucketReply { remaining: -1, reset },
            write: None,
        };
    }

    let remaining = state.tokens - increment as i64;
    let ttl = expire_after(max_tokens, remaining, refill_rate, interval_ms);
    Step {
        reply: TokenBucketReply { remaining, reset },
        write: Some((
            BucketState {
                tokens: remaining,
                refilled_at: state.refilled_at,
            },
            ttl,
        )),
    }
}

/// Token bucket limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucket {
    refill_rate: u64,
    interval_ms: u64,
    max_tokens: u64,
}

impl TokenBucket {
    /// Create a token bucket that refills `refill_rate` tokens every
    /// `interval`, holding at most `max_tokens`.
    pub fn new(refill_rate: u64, interval: Duration, max_tokens: u64) -> Self {
        Self {
            refill_rate,
            interval_ms: window_millis(interval),
            max_tokens,
        }
    }

    /// Refill interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[async_trait]
impl Algorithm for TokenBucket {
    fn max_requests(&self) -> u64 {
        self.max_tokens
    }

    fn supports_multi_region(&self) -> bool {
        false
    }

    fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 || self.refill_rate == 0 {
            return Err(RatewardenError::Config(
                "token bucket max_tokens and refill_rate must be greater than 0".to_string(),
            ));
        }
        if self.interval_ms == 0 {
            return Err(RatewardenError::Config(
                "token bucket interval must be at least 1ms".to_string(),
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
        let reply = region
            .store()
            .token_bucket(key, self.max_tokens, self.interval_ms, self.refill_rate, now, rate)
            .await?;

        let success = reply.remaining >= 0;
        let remaining = reply.remaining.max(0);
        Ok(RegionDecision {
            success,
            limit: self.max_tokens,
            remaining,
            reset: reply.reset,
            used: self.max_tokens as i64 - remaining,
            counter: None,
        })
    }

    async fn remaining(&self, region: &RegionContext, key: &str, now: u64) -> Result<i64> {
        let state = region.store().get_bucket(key).await?;
        let state = refill(state, now, self.max_tokens, self.interval_ms, self.refill_rate);
        Ok(state.tokens)
    }

    async fn reset(&self, region: &RegionContext, key: &str, _now: u64) -> Result<()> {
        region.store().delete(&[key.to_string()]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn region_at(now: u64) -> (Arc<ManualClock>, RegionContext) {
        let clock = Arc::new(ManualClock::new(now));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (clock, RegionContext::new("test", store))
    }

    #[test]
    fn test_refill_is_capped_and_advances_in_whole_intervals() {
        let state = Some(BucketState {
            tokens: 2,
            refilled_at: 1_000,
        });

        // Not a full interval yet
        assert_eq!(refill(state, 10_999, 10, 10_000, 5), state.unwrap());

        let refilled = refill(state, 25_000, 10, 10_000, 5);
        assert_eq!(refilled.tokens, 10);
        assert_eq!(refilled.refilled_at, 21_000);

        let missing = refill(None, 7, 10, 10_000, 5);
        assert_eq!(missing, BucketState { tokens: 10, refilled_at: 7 });
    }

    #[test]
    fn test_expire_after_covers_return_to_saturation() {
        assert_eq!(expire_after(10, 9, 5, 10_000), 10_000);
        assert_eq!(expire_after(10, 5, 5, 10_000), 10_000);
        assert_eq!(expire_after(10, 4, 5, 10_000), 20_000);
        assert_eq!(expire_after(10, 0, 5, 10_000), 20_000);
    }

    #[test]
    fn test_consume_rejects_without_writing() {
        let empty = Some(BucketState {
            tokens: 0,
            refilled_at: 0,
        });
        let step = consume(empty, 5_000, 10, 10_000, 5, 1);
        assert_eq!(step.reply.remaining, -1);
        assert_eq!(step.reply.reset, 10_000);
        assert!(step.write.is_none());
    }

    #[tokio::test]
    async fn test_drain_then_refill() {
        let (clock, region) = region_at(100_000);
        let algorithm = TokenBucket::new(5, Duration::from_secs(10), 10);

        for expected in (0..10).rev() {
            let decision = algorithm.decide(&region, "k", 100_000, 1).await.unwrap();
            assert!(decision.success);
            assert_eq!(decision.remaining, expected);
        }

        let rejected = algorithm.decide(&region, "k", 100_000, 1).await.unwrap();
        assert!(!rejected.success);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.reset, 110_000);

        clock.set(110_000);
        let mut admitted = 0;
        for _ in 0..10 {
            if algorithm.decide(&region, "k", 110_000, 1).await.unwrap().success {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_remaining_reads_refilled_state() {
        let (_clock, region) = region_at(0);
        let algorithm = TokenBucket::new(5, Duration::from_secs(10), 10);

        assert_eq!(algorithm.remaining(&region, "k", 0).await.unwrap(), 10);
        algorithm.decide(&region, "k", 0, 8).await.unwrap();
        assert_eq!(algorithm.remaining(&region, "k", 0).await.unwrap(), 2);
        assert_eq!(algorithm.remaining(&region, "k", 10_000).await.unwrap(), 7);

        algorithm.reset(&region, "k", 10_000).await.unwrap();
        assert_eq!(algorithm.remaining(&region, "k", 10_000).await.unwrap(), 10);
    }

    #[test]
    fn test_not_multi_region_safe() {
        let algorithm = TokenBucket::new(5, Duration::from_secs(10), 10);
        assert!(!algorithm.supports_multi_region());
        assert!(algorithm.validate().is_ok());
        assert!(TokenBucket::new(0, Duration::from_secs(10), 10).validate().is_err());
    }
}
