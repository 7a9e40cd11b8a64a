//! Fan-out over independent regions.
//!
//! Every region decides on its own; the caller gets one aggregated answer. A
//! region that errors or misses its deadline is left out of the aggregate.
//! Counters that lag behind the highest one observed are raised in the
//! background so regions converge.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use super::{MultiRegionContext, RegionContext};
use crate::error::{RatewardenError, Result};
use crate::ratelimit::algorithm::{window_millis, Algorithm, CounterSnapshot, RegionDecision};
use crate::ratelimit::Pending;

/// How long a region may take when the limiter has no timeout of its own.
pub const DEFAULT_REGION_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs one algorithm against every region of a [`MultiRegionContext`].
#[derive(Debug, Clone, Copy)]
pub struct MultiRegionCoordinator<'a> {
    context: &'a MultiRegionContext,
    algorithm: &'a dyn Algorithm,
    deadline: Duration,
}

impl<'a> MultiRegionCoordinator<'a> {
    pub fn new(context: &'a MultiRegionContext, algorithm: &'a dyn Algorithm) -> Self {
        Self {
            context,
            algorithm,
            deadline: DEFAULT_REGION_TIMEOUT,
        }
    }

    /// Give each region at most `deadline` per call.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Decide in every region concurrently and aggregate.
    ///
    /// The returned [`Pending`] holds the reconciliation writes.
    pub async fn limit(&self, key: &str, now: u64, rate: u64) -> Result<(RegionDecision, Pending)> {
        let results = join_all(self.context.regions.iter().map(|region| {
            self.within(region, self.algorithm.decide(region, key, now, rate))
        }))
        .await;

        let (regions, decisions) = self.successful(results)?;
        let decision = aggregate(&decisions);
        let pending = reconcile(&regions, &decisions);

        if !decision.success {
            debug!(key = %key, used = decision.used, limit = decision.limit, "Multi-region limit exceeded");
        }
        Ok((decision, pending))
    }

    /// Lowest remaining count across the regions that answered.
    pub async fn remaining(&self, key: &str, now: u64) -> Result<i64> {
        let results = join_all(self.context.regions.iter().map(|region| {
            self.within(region, self.algorithm.remaining(region, key, now))
        }))
        .await;

        let (_, remaining) = self.successful(results)?;
        remaining
            .into_iter()
            .min()
            .ok_or_else(|| self.all_failed(String::new()))
    }

    /// Reset `key` in every region. All regions are attempted; the first
    /// error, if any, is returned.
    pub async fn reset(&self, key: &str, now: u64) -> Result<()> {
        let results = join_all(self.context.regions.iter().map(|region| {
            self.within(region, self.algorithm.reset(region, key, now))
        }))
        .await;

        let mut first_error = None;
        for (region, result) in self.context.regions.iter().zip(results) {
            if let Err(e) = result {
                warn!(region = %region.name(), key = %key, error = %e, "Failed to reset region");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Run `call` against `region`, turning a missed deadline into an error.
    async fn within<T>(
        &self,
        region: &RegionContext,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(RatewardenError::RegionTimeout {
                region: region.name().to_string(),
                timeout_ms: window_millis(self.deadline),
            }),
        }
    }

    /// Split off the regions that answered, logging the ones that did not.
    fn successful<T>(&self, results: Vec<Result<T>>) -> Result<(Vec<&'a RegionContext>, Vec<T>)> {
        let mut regions = Vec::with_capacity(results.len());
        let mut values = Vec::with_capacity(results.len());
        let mut last_error = None;
        let mut only_timeouts = true;

        for (region, result) in self.context.regions.iter().zip(results) {
            match result {
                Ok(value) => {
                    regions.push(region);
                    values.push(value);
                }
                Err(e) => {
                    warn!(region = %region.name(), error = %e, "Region failed, excluding it");
                    only_timeouts &= matches!(e, RatewardenError::RegionTimeout { .. });
                    last_error = Some(e.to_string());
                }
            }
        }

        if values.is_empty() {
            if only_timeouts {
                return Err(RatewardenError::AllRegionsTimedOut {
                    regions: self.context.regions.len(),
                });
            }
            return Err(self.all_failed(last_error.unwrap_or_default()));
        }
        Ok((regions, values))
    }

    fn all_failed(&self, last_error: String) -> RatewardenError {
        RatewardenError::AllRegionsFailed {
            regions: self.context.regions.len(),
            last_error,
        }
    }
}

/// Merge per-region decisions: the request passes only if every region
/// accepted it and the highest usage is still within the limit.
fn aggregate(decisions: &[RegionDecision]) -> RegionDecision {
    let limit = decisions.iter().map(|d| d.limit).max().unwrap_or(0);
    let used = decisions.iter().map(|d| d.used).max().unwrap_or(0);
    let reset = decisions.iter().map(|d| d.reset).max().unwrap_or(0);
    let accepted = decisions.iter().all(|d| d.success);

    RegionDecision {
        success: accepted && used <= limit as i64,
        limit,
        remaining: (limit as i64 - used).max(0),
        reset,
        used,
        counter: highest(decisions).cloned(),
    }
}

fn highest(decisions: &[RegionDecision]) -> Option<&CounterSnapshot> {
    decisions
        .iter()
        .filter_map(|d| d.counter.as_ref())
        .max_by_key(|c| c.value)
}

/// Raise every lagging counter to the highest one, on detached tasks.
fn reconcile(regions: &[&RegionContext], decisions: &[RegionDecision]) -> Pending {
    let mut pending = Pending::none();
    let Some(target) = highest(decisions) else {
        return pending;
    };

    for (region, decision) in regions.iter().zip(decisions) {
        let Some(counter) = decision.counter.as_ref() else {
            continue;
        };
        if counter.value >= target.value {
            continue;
        }

        let store = region.store().clone();
        let name = region.name().to_string();
        let key = counter.key.clone();
        let (value, ttl_ms) = (target.value, target.ttl_ms);
        debug!(region = %name, key = %key, from = counter.value, to = value, "Reconciling region");

        pending.push(tokio::spawn(async move {
            if let Err(e) = store.raise_count(&key, value, ttl_ms).await {
                warn!(region = %name, key = %key, error = %e, "Failed to reconcile region");
            }
        }));
    }
    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::algorithm::fixed_window;
    use crate::store::testing::{FailingStore, StalledStore};
    use crate::store::{AtomicStore, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn decision(success: bool, used: i64, value: i64) -> RegionDecision {
        RegionDecision {
            success,
            limit: 10,
            remaining: 10 - used,
            reset: 1_000 + used as u64,
            used,
            counter: Some(CounterSnapshot {
                key: "k".to_string(),
                value,
                ttl_ms: 1_000,
            }),
        }
    }

    fn memory_regions(n: usize, clock: &Arc<ManualClock>) -> (Vec<Arc<MemoryStore>>, MultiRegionContext) {
        let stores: Vec<_> = (0..n)
            .map(|_| Arc::new(MemoryStore::with_clock(clock.clone())))
            .collect();
        let regions = stores
            .iter()
            .enumerate()
            .map(|(i, s)| RegionContext::new(format!("region-{}", i), s.clone()))
            .collect();
        (stores, MultiRegionContext::new(regions, None))
    }

    #[test]
    fn test_aggregate_takes_max_usage_and_reset() {
        let merged = aggregate(&[decision(true, 3, 3), decision(true, 7, 7), decision(true, 5, 5)]);
        assert!(merged.success);
        assert_eq!(merged.used, 7);
        assert_eq!(merged.remaining, 3);
        assert_eq!(merged.reset, 1_007);
        assert_eq!(merged.counter.map(|c| c.value), Some(7));
    }

    #[test]
    fn test_aggregate_rejects_if_any_region_rejects() {
        let merged = aggregate(&[decision(true, 3, 3), decision(false, 11, 11)]);
        assert!(!merged.success);
        assert_eq!(merged.remaining, 0);
    }

    #[tokio::test]
    async fn test_limit_reconciles_lagging_regions() {
        let clock = Arc::new(ManualClock::new(0));
        let (stores, context) = memory_regions(2, &clock);
        let limiter = fixed_window(10, Duration::from_secs(1));

        for _ in 0..4 {
            stores[0].fixed_window("id:0", 1_000, 1).await.unwrap();
        }

        let coordinator = MultiRegionCoordinator::new(&context, &limiter);
        let (decision, pending) = coordinator.limit("id", 0, 1).await.unwrap();
        assert!(decision.success);
        assert_eq!(decision.used, 5);
        assert_eq!(decision.remaining, 5);
        assert_eq!(pending.len(), 1);

        pending.wait().await;
        assert_eq!(stores[1].get_count("id:0").await.unwrap(), 5);
        assert_eq!(stores[0].get_count("id:0").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_failed_region_is_excluded() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock));
        let context = MultiRegionContext::new(
            vec![
                RegionContext::new("down", Arc::new(FailingStore)),
                RegionContext::new("up", store.clone()),
            ],
            None,
        );
        let limiter = fixed_window(10, Duration::from_secs(1));
        let coordinator = MultiRegionCoordinator::new(&context, &limiter);

        let (decision, _) = coordinator.limit("id", 0, 1).await.unwrap();
        assert!(decision.success);
        assert_eq!(decision.used, 1);
        assert_eq!(coordinator.remaining("id", 0).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_all_regions_failed() {
        let context = MultiRegionContext::new(
            vec![
                RegionContext::new("a", Arc::new(FailingStore)),
                RegionContext::new("b", Arc::new(FailingStore)),
            ],
            None,
        );
        let limiter = fixed_window(10, Duration::from_secs(1));
        let coordinator = MultiRegionCoordinator::new(&context, &limiter);

        let err = coordinator.limit("id", 0, 1).await.unwrap_err();
        assert!(matches!(err, RatewardenError::AllRegionsFailed { regions: 2, .. }));
    }

    #[tokio::test]
    async fn test_remaining_is_minimum_and_reset_clears_all() {
        let clock = Arc::new(ManualClock::new(0));
        let (stores, context) = memory_regions(3, &clock);
        let limiter = fixed_window(10, Duration::from_secs(1));
        stores[2].fixed_window("id:0", 1_000, 6).await.unwrap();
        stores[1].fixed_window("id:0", 1_000, 2).await.unwrap();

        let coordinator = MultiRegionCoordinator::new(&context, &limiter);
        assert_eq!(coordinator.remaining("id", 0).await.unwrap(), 4);

        coordinator.reset("id", 0).await.unwrap();
        for store in &stores {
            assert_eq!(store.get_count("id:0").await.unwrap(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_region_is_excluded() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock));
        let context = MultiRegionContext::new(
            vec![
                RegionContext::new("stalled", Arc::new(StalledStore)),
                RegionContext::new("up", store.clone()),
            ],
            None,
        );
        let limiter = fixed_window(1, Duration::from_secs(1));
        let coordinator =
            MultiRegionCoordinator::new(&context, &limiter).with_deadline(Duration::from_millis(100));

        let (first, _) = coordinator.limit("id", 0, 1).await.unwrap();
        assert!(first.success);

        let (second, _) = coordinator.limit("id", 0, 1).await.unwrap();
        assert!(!second.success);
        assert_eq!(second.used, 2);
        assert_eq!(store.get_count("id:0").await.unwrap(), 2);

        assert_eq!(coordinator.remaining("id", 0).await.unwrap(), -1);
        let err = coordinator.reset("id", 0).await.unwrap_err();
        assert!(matches!(err, RatewardenError::RegionTimeout { ref region, timeout_ms: 100 } if region == "stalled"));
        assert_eq!(store.get_count("id:0").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_regions_timed_out() {
        let context = MultiRegionContext::new(
            vec![
                RegionContext::new("a", Arc::new(StalledStore)),
                RegionContext::new("b", Arc::new(StalledStore)),
            ],
            None,
        );
        let limiter = fixed_window(10, Duration::from_secs(1));
        let coordinator = MultiRegionCoordinator::new(&context, &limiter);

        let err = coordinator.limit("id", 0, 1).await.unwrap_err();
        assert!(matches!(err, RatewardenError::AllRegionsTimedOut { regions: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_failures_report_all_failed() {
        let context = MultiRegionContext::new(
            vec![
                RegionContext::new("a", Arc::new(StalledStore)),
                RegionContext::new("b", Arc::new(FailingStore)),
            ],
            None,
        );
        let limiter = fixed_window(10, Duration::from_secs(1));
        let coordinator = MultiRegionCoordinator::new(&context, &limiter);

        let err = coordinator.limit("id", 0, 1).await.unwrap_err();
        assert!(matches!(err, RatewardenError::AllRegionsFailed { regions: 2, .. }));
    }
}
