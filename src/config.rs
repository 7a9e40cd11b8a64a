//! Configuration management for Ratewarden.
//!
//! Settings come from a YAML file, overridable through `RATEWARDEN__*`
//! environment variables (e.g. `RATEWARDEN__PREFIX=api`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RatewardenError, Result};
use crate::ratelimit::{
    fixed_window, sliding_window, token_bucket, EphemeralCacheSetting, Limiter, RatelimitConfig,
    DEFAULT_PREFIX,
};
use crate::region::RegionContext;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for a Ratewarden limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Algorithm and its parameters
    pub algorithm: AlgorithmSettings,

    /// Backing stores, in order; the first one also receives analytics
    pub regions: Vec<RegionSettings>,

    /// Key prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Keep a local cache of blocked identifiers
    #[serde(default = "default_true")]
    pub ephemeral_cache: bool,

    /// Record decisions into the primary region
    #[serde(default = "default_true")]
    pub analytics: bool,

    /// Fail open after this many milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Algorithm selection. Windows are duration strings such as `"10 s"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmSettings {
    FixedWindow {
        tokens: u64,
        #[serde(with = "humantime_serde")]
        window: Duration,
    },
    SlidingWindow {
        tokens: u64,
        #[serde(with = "humantime_serde")]
        window: Duration,
    },
    TokenBucket {
        refill_rate: u64,
        #[serde(with = "humantime_serde")]
        interval: Duration,
        max_tokens: u64,
    },
}

impl AlgorithmSettings {
    /// Build the configured algorithm.
    pub fn build(&self) -> Limiter {
        match *self {
            AlgorithmSettings::FixedWindow { tokens, window } => fixed_window(tokens, window),
            AlgorithmSettings::SlidingWindow { tokens, window } => sliding_window(tokens, window),
            AlgorithmSettings::TokenBucket {
                refill_rate,
                interval,
                max_tokens,
            } => token_bucket(refill_rate, interval, max_tokens),
        }
    }
}

/// One backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSettings {
    /// Name used in logs
    pub name: String,

    /// Connection URL, e.g. `redis://localhost:6379`
    pub url: String,

    /// Run scripts by SHA1 instead of shipping the source on every call
    #[serde(default = "default_true")]
    pub cache_scripts: bool,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load from a file, then apply environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| RatewardenError::Config(format!("failed to load {}: {}", path, e)))
    }

    /// Parse YAML directly, without environment overrides.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| RatewardenError::Config(e.to_string()))
    }

    /// Limiter configuration over already connected `regions`.
    pub fn limiter_config(&self, regions: Vec<RegionContext>) -> Result<RatelimitConfig> {
        if regions.len() != self.regions.len() {
            return Err(RatewardenError::Config(format!(
                "expected {} regions, got {}",
                self.regions.len(),
                regions.len()
            )));
        }

        let cache = if self.ephemeral_cache {
            EphemeralCacheSetting::Enabled
        } else {
            EphemeralCacheSetting::Disabled
        };
        let mut config = RatelimitConfig::multi_region(self.algorithm.build(), regions)
            .with_prefix(self.prefix.clone())
            .with_ephemeral_cache(cache)
            .with_analytics(self.analytics);
        if let Some(ms) = self.timeout_ms {
            config = config.with_timeout(Duration::from_millis(ms));
        }
        Ok(config)
    }
}
