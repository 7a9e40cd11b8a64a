//! Fixed window algorithm.
//!
//! Every request inside a window of fixed length increments one counter. Once
//! the counter passes the limit, further requests in that window are rejected.
//! A burst straddling two windows can admit up to twice the limit in a short
//! span; that is inherent to the algorithm.

use std::time::Duration;

use async_trait::async_trait;

use super::algorithm::{window_millis, Algorithm, CounterSnapshot, RegionDecision};
use crate::error::{RatewardenError, Result};
use crate::region::RegionContext;

/// Lua source of the fixed window unit.
pub(crate) const SCRIPT: &str = r#"
local key         = KEYS[1]
local window      = tonumber(ARGV[1])
local incrementBy = tonumber(ARGV[2])

local r = redis.call("INCRBY", key, incrementBy)
if r == incrementBy then
  redis.call("PEXPIRE", key, window)
end

return r
"#;

/// Counter value after adding `increment`, and whether this write created the key.
pub(crate) fn increment(current: Option<i64>, increment: u64) -> (i64, bool) {
    let increment = increment as i64;
    let next = current.unwrap_or(0) + increment;
    (next, next == increment)
}

/// Fixed window limiter: `tokens` requests per `window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindow {
    tokens: u64,
    window_ms: u64,
}

impl FixedWindow {
    /// Create a fixed window limiter.
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

    fn bucket_key(&self, key: &str, now: u64) -> (u64, String) {
        let bucket = now / self.window_ms;
        (bucket, format!("{}:{}", key, bucket))
    }
}

#[async_trait]
impl Algorithm for FixedWindow {
    fn max_requests(&self) -> u64 {
        self.tokens
    }

    fn validate(&self) -> Result<()> {
        if self.tokens == 0 {
            return Err(RatewardenError::Config(
                "fixed window tokens must be greater than 0".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(RatewardenError::Config(
                "fixed window must be at least 1ms".to_string(),
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
        let (bucket, bucket_key) = self.bucket_key(key, now);
        let count = region
            .store()
            .fixed_window(&bucket_key, self.window_ms, rate)
            .await?;

        Ok(RegionDecision {
            success: count <= self.tokens as i64,
            limit: self.tokens,
            remaining: self.tokens as i64 - count,
            reset: (bucket + 1) * self.window_ms,
            used: count,
            counter: Some(CounterSnapshot {
                key: bucket_key,
                value: count,
                ttl_ms: self.window_ms,
            }),
        })
    }

    async fn remaining(&self, region: &RegionContext, key: &str, now: u64) -> Result<i64> {
        let (_, bucket_key) = self.bucket_key(key, now);
        let used = region.store().get_count(&bucket_key).await?;
        Ok(self.tokens as i64 - used)
    }

    async fn reset(&self, region: &RegionContext, key: &str, now: u64) -> Result<()> {
        let (_, bucket_key) = self.bucket_key(key, now);
        region.store().delete(&[bucket_key]).await
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
    fn test_increment_marks_first_write() {
        assert_eq!(increment(None, 1), (1, true));
        assert_eq!(increment(Some(1), 1), (2, false));
        assert_eq!(increment(None, 5), (5, true));
        assert_eq!(increment(Some(5), 5), (10, false));
    }

    #[tokio::test]
    async fn test_first_limit_calls_succeed_then_reject() {
        let (_clock, region) = region_at(10_000);
        let algorithm = FixedWindow::new(5, Duration::from_secs(1));

        for expected_remaining in (0..5).rev() {
            let decision = algorithm.decide(&region, "rl:user", 10_000, 1).await.unwrap();
            assert!(decision.success);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.reset, 11_000);
        }

        for _ in 0..3 {
            let decision = algorithm.decide(&region, "rl:user", 10_500, 1).await.unwrap();
            assert!(!decision.success);
            assert!(decision.remaining < 0);
        }
    }

    #[tokio::test]
    async fn test_window_rollover_restores_capacity() {
        let (clock, region) = region_at(10_000);
        let algorithm = FixedWindow::new(1, Duration::from_secs(1));

        assert!(algorithm.decide(&region, "k", 10_000, 1).await.unwrap().success);
        assert!(!algorithm.decide(&region, "k", 10_999, 1).await.unwrap().success);

        clock.set(11_000);
        let decision = algorithm.decide(&region, "k", 11_000, 1).await.unwrap();
        assert!(decision.success);
        assert_eq!(decision.reset, 12_000);
    }

    #[tokio::test]
    async fn test_boundary_burst_admits_twice_the_limit() {
        let (clock, region) = region_at(10_990);
        let algorithm = FixedWindow::new(3, Duration::from_secs(1));

        let mut admitted = 0;
        for _ in 0..3 {
            if algorithm.decide(&region, "k", 10_990, 1).await.unwrap().success {
                admitted += 1;
            }
        }
        clock.set(11_010);
        for _ in 0..3 {
            if algorithm.decide(&region, "k", 11_010, 1).await.unwrap().success {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 6);
    }

    #[tokio::test]
    async fn test_remaining_and_reset() {
        let (_clock, region) = region_at(0);
        let algorithm = FixedWindow::new(10, Duration::from_secs(10));

        algorithm.decide(&region, "k", 0, 3).await.unwrap();
        assert_eq!(algorithm.remaining(&region, "k", 10).await.unwrap(), 7);

        algorithm.reset(&region, "k", 10).await.unwrap();
        assert_eq!(algorithm.remaining(&region, "k", 10).await.unwrap(), 10);
    }

    #[test]
    fn test_validate_rejects_zero_tokens() {
        assert!(FixedWindow::new(0, Duration::from_secs(1)).validate().is_err());
        assert!(FixedWindow::new(1, Duration::ZERO).validate().is_err());
        assert!(FixedWindow::new(1, Duration::from_millis(1)).validate().is_ok());
    }
}
