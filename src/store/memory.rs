//! In-process store.
//!
//! Every operation runs under a single lock, which gives the same
//! all-or-nothing behavior a scripted Redis call has. Expiry is lazy: a key
//! past its deadline is dropped the next time it is touched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{AtomicStore, BucketState, SlidingWindowReply, TokenBucketReply};
use crate::clock::{Clock, SystemClock};
use crate::error::{RatewardenError, Result};
use crate::ratelimit::{fixed_window, sliding_window, token_bucket};

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Bucket(BucketState),
    Hash(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn live(&mut self, key: &str, now: u64) -> Option<&mut Entry> {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= now
        );
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn counter(&mut self, key: &str, now: u64) -> Result<Option<i64>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Counter(v),
                ..
            }) => Ok(Some(*v)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn bucket(&mut self, key: &str, now: u64) -> Result<Option<BucketState>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Bucket(b),
                ..
            }) => Ok(Some(*b)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Write a counter, keeping the current expiry unless `ttl` is given.
    fn put_counter(&mut self, key: &str, value: i64, ttl: Option<u64>, now: u64) {
        let expires_at = match ttl {
            Some(ttl) => Some(now + ttl),
            None => self.entries.get(key).and_then(|e| e.expires_at),
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Counter(value),
                expires_at,
            },
        );
    }
}

fn wrong_type(key: &str) -> RatewardenError {
    RatewardenError::Store(format!("key {} holds the wrong kind of value", key))
}

/// Store that keeps all state in process memory.
///
/// Useful for tests, single-process deployments and simulations. An optional
/// artificial latency is applied before every operation to mimic a remote
/// round trip.
#[derive(Debug)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
    latency: Option<Duration>,
    calls: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store using the wall clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store expiring keys against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
            latency: None,
            calls: AtomicU64::new(0),
        }
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of operations served so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.keyspace.lock().entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> u64 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.clock.now_millis()
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn fixed_window(&self, key: &str, window_ms: u64, increment: u64) -> Result<i64> {
        let now = self.enter().await;
        let mut keyspace = self.keyspace.lock();

        let current = keyspace.counter(key, now)?;
        let (next, created) = fixed_window::increment(current, increment);
        keyspace.put_counter(key, next, created.then_some(window_ms), now);

        trace!(key = %key, value = next, "fixed window increment");
        Ok(next)
    }

    async fn sliding_window(
        &self,
        current_key: &str,
        previous_key: &str,
        limit: u64,
        now: u64,
        window_ms: u64,
        increment: u64,
    ) -> Result<SlidingWindowReply> {
        let store_now = self.enter().await;
        let mut keyspace = self.keyspace.lock();

        let current = keyspace.counter(current_key, store_now)?.unwrap_or(0);
        let previous = keyspace.counter(previous_key, store_now)?.unwrap_or(0);
        let reply = sliding_window::evaluate(current, previous, limit, now, window_ms, increment);

        if reply.accepted {
            let created = reply.current == increment as i64;
            keyspace.put_counter(
                current_key,
                reply.current,
                created.then(|| sliding_window::bucket_ttl(window_ms)),
                store_now,
            );
        }

        trace!(key = %current_key, accepted = reply.accepted, value = reply.current, "sliding window step");
        Ok(reply)
    }

    async fn token_bucket(
        &self,
        key: &str,
        max_tokens: u64,
        interval_ms: u64,
        refill_rate: u64,
        now: u64,
        increment: u64,
    ) -> Result<TokenBucketReply> {
        let store_now = self.enter().await;
        let mut keyspace = self.keyspace.lock();

        let state = keyspace.bucket(key, store_now)?;
        let step = token_bucket::consume(state, now, max_tokens, interval_ms, refill_rate, increment);

        if let Some((state, ttl)) = step.write {
            keyspace.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Bucket(state),
                    expires_at: Some(store_now + ttl),
                },
            );
        }

        trace!(key = %key, remaining = step.reply.remaining, "token bucket step");
        Ok(step.reply)
    }

    async fn get_count(&self, key: &str) -> Result<i64> {
        let now = self.enter().await;
        let mut keyspace = self.keyspace.lock();
        Ok(keyspace.counter(key, now)?.unwrap_or(0))
    }

    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>> {
        let now = self.enter().await;
        let mut keyspace = self.keyspace.lock();
        keyspace.bucket(key, now)
    }

    async fn raise_count(&self, key: &str, value: i64, ttl_ms: u64) -> Result<i64> {
        let now = self.enter().await;
        let mut keyspace = self.keyspace.lock();

        match keyspace.counter(key, now)? {
            Some(current) if current >= value => Ok(current),
            Some(_) => {
                keyspace.put_counter(key, value, None, now);
                Ok(value)
            }
            None => {
                keyspace.put_counter(key, value, Some(ttl_ms), now);
                Ok(value)
            }
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        self.enter().await;
        let mut keyspace = self.keyspace.lock();
        for key in keys {
            keyspace.entries.remove(key);
        }
        Ok(())
    }

    async fn record_event(&self, key: &str, fields: &[String], ttl_ms: u64) -> Result<()> {
        let now = self.enter().await;
        let mut keyspace = self.keyspace.lock();

        // Drop an expired hash before reusing the key
        keyspace.live(key, now);
        let entry = keyspace
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        for field in fields {
            *hash.entry(field.clone()).or_insert(0) += 1;
        }
        entry.expires_at = Some(now + ttl_ms);
        Ok(())
    }
}

impl MemoryStore {
    /// Read one analytics hash field; missing fields read as zero.
    pub fn event_count(&self, key: &str, field: &str) -> i64 {
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.lock();
        match keyspace.live(key, now) {
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => hash.get(field).copied().unwrap_or(0),
            _ => 0,
        }
    }
}
