//! Process-local cache of identifiers known to be blocked.

use dashmap::DashMap;

/// Maps identifiers to the timestamp (ms) until which they are blocked.
///
/// This only ever short-circuits requests that the store already rejected.
/// An entry is honoured while `now < reset` and is otherwise ignored; stale
/// entries are never swept, they just stop matching.
#[derive(Debug, Default)]
pub struct EphemeralCache {
    blocked: DashMap<String, u64>,
}

impl EphemeralCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored reset if `identifier` is blocked at `now`.
    pub fn is_blocked(&self, identifier: &str, now: u64) -> Option<u64> {
        self.blocked
            .get(identifier)
            .map(|reset| *reset)
            .filter(|reset| now < *reset)
    }

    /// Block `identifier` until exactly `reset`.
    pub fn block_until(&self, identifier: &str, reset: u64) {
        self.blocked.insert(identifier.to_string(), reset);
    }

    /// Forget one identifier.
    pub fn pop(&self, identifier: &str) {
        self.blocked.remove(identifier);
    }

    /// Forget everything.
    pub fn empty(&self) {
        self.blocked.clear();
    }

    /// Number of entries, stale ones included.
    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_until_reset_exclusive() {
        let cache = EphemeralCache::new();
        cache.block_until("id", 2_000);

        assert_eq!(cache.is_blocked("id", 1_000), Some(2_000));
        assert_eq!(cache.is_blocked("id", 1_999), Some(2_000));
        assert_eq!(cache.is_blocked("id", 2_000), None);
        assert_eq!(cache.is_blocked("other", 1_000), None);
    }

    #[test]
    fn test_stale_entries_are_ignored_not_purged() {
        let cache = EphemeralCache::new();
        cache.block_until("id", 100);

        assert_eq!(cache.is_blocked("id", 500), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_last_write_wins_and_pop() {
        let cache = EphemeralCache::new();
        cache.block_until("id", 100);
        cache.block_until("id", 300);
        assert_eq!(cache.is_blocked("id", 200), Some(300));

        cache.pop("id");
        assert!(cache.is_empty());

        cache.block_until("a", 1);
        cache.block_until("b", 1);
        cache.empty();
        assert_eq!(cache.len(), 0);
    }
}
