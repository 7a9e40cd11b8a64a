//! Store contexts the limiter runs against.
//!
//! A [`RegionContext`] pairs a name with one store. A single-region limiter
//! talks to one of them directly; a multi-region limiter fans out over several
//! through the [`MultiRegionCoordinator`] and shares one ephemeral cache.

mod coordinator;

use std::sync::Arc;

use crate::ratelimit::EphemeralCache;
use crate::store::AtomicStore;

pub use coordinator::{MultiRegionCoordinator, DEFAULT_REGION_TIMEOUT};

/// One backing store and the name it is logged under.
///
/// Script identifiers are cached by the store itself (see
/// [`RedisStore`](crate::store::RedisStore)), so the context stays a cheap handle.
#[derive(Debug, Clone)]
pub struct RegionContext {
    name: String,
    store: Arc<dyn AtomicStore>,
}

impl RegionContext {
    /// Create a context for `store`.
    pub fn new(name: impl Into<String>, store: Arc<dyn AtomicStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn AtomicStore> {
        &self.store
    }
}

/// Ordered independent regions plus the cache they share.
#[derive(Debug, Clone)]
pub struct MultiRegionContext {
    regions: Vec<RegionContext>,
    cache: Option<Arc<EphemeralCache>>,
}

impl MultiRegionContext {
    pub fn new(regions: Vec<RegionContext>, cache: Option<Arc<EphemeralCache>>) -> Self {
        Self { regions, cache }
    }

    pub fn regions(&self) -> &[RegionContext] {
        &self.regions
    }
}

/// Everything a limiter needs to reach its state.
#[derive(Debug, Clone)]
pub enum Context {
    Region {
        region: RegionContext,
        cache: Option<Arc<EphemeralCache>>,
    },
    MultiRegion(MultiRegionContext),
}

impl Context {
    /// The ephemeral cache, if enabled.
    pub fn cache(&self) -> Option<&Arc<EphemeralCache>> {
        match self {
            Context::Region { cache, .. } => cache.as_ref(),
            Context::MultiRegion(ctx) => ctx.cache.as_ref(),
        }
    }

    /// The first region; analytics are written there.
    pub fn primary(&self) -> Option<&RegionContext> {
        match self {
            Context::Region { region, .. } => Some(region),
            Context::MultiRegion(ctx) => ctx.regions.first(),
        }
    }

    /// Number of regions.
    pub fn region_count(&self) -> usize {
        match self {
            Context::Region { .. } => 1,
            Context::MultiRegion(ctx) => ctx.regions.len(),
        }
    }
}
