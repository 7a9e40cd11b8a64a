//! The rate limiter callers talk to.
//!
//! [`Ratelimiter`] ties an [`Algorithm`] to one or more regions and layers the
//! ephemeral cache, the optional timeout and analytics on top of it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::algorithm::{window_millis, Algorithm, RegionDecision};
use super::analytics::{Analytics, AnalyticsEvent, Geo, Outcome};
use super::cache::EphemeralCache;
use super::response::{Pending, RateLimitResponse, Reason};
use crate::clock::{Clock, SystemClock};
use crate::error::{RatewardenError, Result};
use crate::region::{
    Context, MultiRegionContext, MultiRegionCoordinator, RegionContext, DEFAULT_REGION_TIMEOUT,
};

/// Prefix of every key the limiter writes.
pub const DEFAULT_PREFIX: &str = "@ratelimit";

/// How the limiter gets its ephemeral cache.
#[derive(Debug, Clone, Default)]
pub enum EphemeralCacheSetting {
    /// A fresh cache owned by this limiter
    #[default]
    Enabled,
    /// No cache; every call reaches the store
    Disabled,
    /// A cache shared with other limiters
    Shared(Arc<EphemeralCache>),
}

/// Construction parameters for a [`Ratelimiter`].
#[derive(Debug, Clone)]
pub struct RatelimitConfig {
    pub algorithm: Arc<dyn Algorithm>,
    pub regions: Vec<RegionContext>,
    pub prefix: String,
    pub ephemeral_cache: EphemeralCacheSetting,
    pub analytics: bool,
    /// Fail open if a decision takes longer than this. With several regions it
    /// is the deadline of each region; a region that misses it is left out.
    pub timeout: Option<Duration>,
    pub clock: Arc<dyn Clock>,
}

impl RatelimitConfig {
    /// Limit against a single region.
    pub fn new(algorithm: impl Algorithm + 'static, region: RegionContext) -> Self {
        Self::multi_region(algorithm, vec![region])
    }

    /// Limit against several independent regions.
    pub fn multi_region(algorithm: impl Algorithm + 'static, regions: Vec<RegionContext>) -> Self {
        Self {
            algorithm: Arc::new(algorithm),
            regions,
            prefix: DEFAULT_PREFIX.to_string(),
            ephemeral_cache: EphemeralCacheSetting::default(),
            analytics: true,
            timeout: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_ephemeral_cache(mut self, setting: EphemeralCacheSetting) -> Self {
        self.ephemeral_cache = setting;
        self
    }

    pub fn with_analytics(mut self, enabled: bool) -> Self {
        self.analytics = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Per-call options for [`Ratelimiter::limit_with`].
#[derive(Debug, Clone)]
pub struct LimitOptions {
    /// Units to consume; defaults to 1.
    pub rate: u64,
    /// Request metadata forwarded to analytics.
    pub geo: Option<Geo>,
}

impl Default for LimitOptions {
    fn default() -> Self {
        Self { rate: 1, geo: None }
    }
}

impl LimitOptions {
    pub fn rate(rate: u64) -> Self {
        Self {
            rate,
            ..Default::default()
        }
    }

    pub fn with_geo(mut self, geo: Geo) -> Self {
        self.geo = Some(geo);
        self
    }
}

/// Result of racing a decision against the timeout.
enum Attempt {
    Decided(RegionDecision, Pending),
    TimedOut,
}

/// A rate limiter. Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct Ratelimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    algorithm: Arc<dyn Algorithm>,
    context: Context,
    prefix: String,
    timeout: Option<Duration>,
    analytics: Option<Analytics>,
    clock: Arc<dyn Clock>,
}

impl Ratelimiter {
    /// Validate `config` and build the limiter.
    pub fn new(config: RatelimitConfig) -> Result<Self> {
        let RatelimitConfig {
            algorithm,
            mut regions,
            prefix,
            ephemeral_cache,
            analytics,
            timeout,
            clock,
        } = config;

        algorithm.validate()?;
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(RatewardenError::Config(
                "timeout must be greater than 0".to_string(),
            ));
        }

        let cache = match ephemeral_cache {
            EphemeralCacheSetting::Enabled => Some(Arc::new(EphemeralCache::new())),
            EphemeralCacheSetting::Disabled => None,
            EphemeralCacheSetting::Shared(cache) => Some(cache),
        };

        let context = match regions.len() {
            0 => {
                return Err(RatewardenError::Config(
                    "at least one region is required".to_string(),
                ))
            }
            1 => Context::Region {
                region: regions.remove(0),
                cache,
            },
            n => {
                if !algorithm.supports_multi_region() {
                    return Err(RatewardenError::Config(format!(
                        "algorithm does not support multiple regions, got {}",
                        n
                    )));
                }
                Context::MultiRegion(MultiRegionContext::new(regions, cache))
            }
        };

        let analytics = match (analytics, context.primary()) {
            (true, Some(region)) => Some(Analytics::new(region.store().clone(), &prefix)),
            _ => None,
        };

        info!(
            prefix = %prefix,
            regions = context.region_count(),
            limit = algorithm.max_requests(),
            cache = context.cache().is_some(),
            analytics = analytics.is_some(),
            timeout_ms = timeout.map(window_millis),
            "Rate limiter created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                algorithm,
                context,
                prefix,
                timeout,
                analytics,
                clock,
            }),
        })
    }

    /// Key prefix in use.
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// The ephemeral cache, if enabled.
    pub fn cache(&self) -> Option<&Arc<EphemeralCache>> {
        self.inner.context.cache()
    }

    /// Consume one unit for `identifier`.
    pub async fn limit(&self, identifier: &str) -> Result<RateLimitResponse> {
        self.limit_with(identifier, LimitOptions::default()).await
    }

    /// Consume `options.rate` units for `identifier`.
    ///
    /// Store errors propagate; only an elapsed timeout fails open.
    pub async fn limit_with(
        &self,
        identifier: &str,
        options: LimitOptions,
    ) -> Result<RateLimitResponse> {
        if options.rate == 0 {
            return Err(RatewardenError::InvalidArgument(
                "rate must be greater than 0".to_string(),
            ));
        }

        let inner = &self.inner;
        let now = inner.clock.now_millis();
        let cache = inner.context.cache();

        if let Some(reset) = cache.and_then(|c| c.is_blocked(identifier, now)) {
            debug!(identifier = %identifier, reset, "Blocked by ephemeral cache");
            return Ok(RateLimitResponse::blocked(inner.algorithm.max_requests(), reset));
        }

        let (decision, mut pending) = match self.attempt(inner.key(identifier), now, options.rate).await? {
            Attempt::Decided(decision, pending) => (decision, pending),
            Attempt::TimedOut => {
                warn!(identifier = %identifier, "Rate limit decision timed out, allowing request");
                return Ok(RateLimitResponse::timed_out());
            }
        };

        if !decision.success {
            if let Some(cache) = cache {
                cache.block_until(identifier, decision.reset);
            }
            debug!(
                identifier = %identifier,
                used = decision.used,
                limit = decision.limit,
                reset = decision.reset,
                "Rate limit exceeded"
            );
        }

        if let Some(analytics) = &inner.analytics {
            pending.push(analytics.record(AnalyticsEvent {
                identifier: identifier.to_string(),
                time: now,
                outcome: if decision.success {
                    Outcome::Success
                } else {
                    Outcome::Rejected
                },
                geo: options.geo,
            }));
        }

        trace!(identifier = %identifier, success = decision.success, remaining = decision.remaining, "Rate limit checked");

        Ok(RateLimitResponse {
            success: decision.success,
            limit: decision.limit,
            remaining: decision.remaining.clamp(0, decision.limit as i64) as u64,
            reset: decision.reset,
            reason: (!decision.success).then_some(Reason::RateLimit),
            pending,
        })
    }

    /// Retry [`limit`](Self::limit) until it succeeds or `timeout` elapses,
    /// sleeping until the reported reset in between.
    ///
    /// Returns the first success, or the last rejection once the deadline passed.
    pub async fn block_until_ready(
        &self,
        identifier: &str,
        timeout: Duration,
    ) -> Result<RateLimitResponse> {
        if timeout.is_zero() {
            return Err(RatewardenError::InvalidArgument(
                "timeout must be greater than 0".to_string(),
            ));
        }

        let clock = &self.inner.clock;
        let deadline = clock.now_millis().saturating_add(window_millis(timeout));

        loop {
            let response = self.limit(identifier).await?;
            if response.success {
                return Ok(response);
            }
            if response.reset == 0 {
                return Err(RatewardenError::Invariant(
                    "rejected response carried no reset".to_string(),
                ));
            }

            let wait = response.reset.min(deadline).saturating_sub(clock.now_millis());
            trace!(identifier = %identifier, wait_ms = wait, "Waiting for rate limit reset");
            tokio::time::sleep(Duration::from_millis(wait)).await;

            if clock.now_millis() >= deadline {
                return Ok(response);
            }
        }
    }

    /// Units `identifier` can still consume in the current window.
    pub async fn get_remaining(&self, identifier: &str) -> Result<u64> {
        let inner = &self.inner;
        let key = inner.key(identifier);
        let now = inner.clock.now_millis();

        let remaining = match &inner.context {
            Context::Region { region, .. } => inner.algorithm.remaining(region, &key, now).await?,
            Context::MultiRegion(ctx) => inner.coordinator(ctx).remaining(&key, now).await?,
        };
        Ok(remaining.clamp(0, inner.algorithm.max_requests() as i64) as u64)
    }

    /// Forget everything consumed by `identifier`, including a cached block.
    pub async fn reset_used_tokens(&self, identifier: &str) -> Result<()> {
        let inner = &self.inner;
        let key = inner.key(identifier);
        let now = inner.clock.now_millis();

        if let Some(cache) = inner.context.cache() {
            cache.pop(identifier);
        }

        match &inner.context {
            Context::Region { region, .. } => inner.algorithm.reset(region, &key, now).await?,
            Context::MultiRegion(ctx) => inner.coordinator(ctx).reset(&key, now).await?,
        }
        info!(identifier = %identifier, "Reset used tokens");
        Ok(())
    }

    async fn attempt(&self, key: String, now: u64, rate: u64) -> Result<Attempt> {
        let inner = &self.inner;
        let decided = match (inner.timeout, &inner.context) {
            (Some(timeout), Context::Region { .. }) => {
                // Detached so the store call still completes after the caller gave up.
                let inner = inner.clone();
                let task = tokio::spawn(async move { inner.decide(&key, now, rate).await });

                match tokio::time::timeout(timeout, task).await {
                    Ok(joined) => joined?,
                    Err(_) => return Ok(Attempt::TimedOut),
                }
            }
            _ => inner.decide(&key, now, rate).await,
        };

        match decided {
            Ok((decision, pending)) => Ok(Attempt::Decided(decision, pending)),
            Err(RatewardenError::AllRegionsTimedOut { .. }) if inner.timeout.is_some() => {
                Ok(Attempt::TimedOut)
            }
            Err(e) => Err(e),
        }
    }
}

impl Inner {
    fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.prefix, identifier)
    }

    fn coordinator<'a>(&'a self, ctx: &'a MultiRegionContext) -> MultiRegionCoordinator<'a> {
        MultiRegionCoordinator::new(ctx, self.algorithm.as_ref())
            .with_deadline(self.timeout.unwrap_or(DEFAULT_REGION_TIMEOUT))
    }

    async fn decide(&self, key: &str, now: u64, rate: u64) -> Result<(RegionDecision, Pending)> {
        match &self.context {
            Context::Region { region, .. } => {
                let decision = self.algorithm.decide(region, key, now, rate).await?;
                Ok((decision, Pending::none()))
            }
            Context::MultiRegion(ctx) => self.coordinator(ctx).limit(key, now, rate).await,
        }
    }
}
