//! Redis-backed store.
//!
//! Every unit runs as a Lua script so the read-decide-write sequence is
//! executed by the server in one step. With script caching enabled the
//! scripts go through `EVALSHA` and are uploaded on the first `NOSCRIPT`
//! reply; otherwise every call ships the full source with `EVAL`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, Script};
use tracing::{debug, info};

use super::{AtomicStore, BucketState, SlidingWindowReply, TokenBucketReply};
use crate::error::{RatewardenError, Result};
use crate::ratelimit::{fixed_window, sliding_window, token_bucket};

const RAISE_SCRIPT: &str = r#"
local key   = KEYS[1]
local value = tonumber(ARGV[1])
local ttl   = tonumber(ARGV[2])

local current = redis.call("GET", key)
if current == false then
  redis.call("SET", key, value, "PX", ttl)
  return value
end

current = tonumber(current)
if current >= value then
  return current
end

redis.call("SET", key, value, "KEEPTTL")
return value
"#;

const EVENT_SCRIPT: &str = r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])

for i = 2, #ARGV do
  redis.call("HINCRBY", key, ARGV[i], 1)
end
redis.call("PEXPIRE", key, ttl)
return 1
"#;

/// Compiled scripts; `Script` carries the SHA1 used for `EVALSHA`.
struct Scripts {
    fixed_window: Script,
    sliding_window: Script,
    token_bucket: Script,
    raise: Script,
    event: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            fixed_window: Script::new(fixed_window::SCRIPT),
            sliding_window: Script::new(sliding_window::SCRIPT),
            token_bucket: Script::new(token_bucket::SCRIPT),
            raise: Script::new(RAISE_SCRIPT),
            event: Script::new(EVENT_SCRIPT),
        }
    }
}

/// Store backed by a single Redis deployment.
pub struct RedisStore {
    conn: ConnectionManager,
    scripts: Scripts,
    cache_scripts: bool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("cache_scripts", &self.cache_scripts)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis at `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str, cache_scripts: bool) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| RatewardenError::Config(format!("invalid redis url {}: {}", redis_url, e)))?;
        let conn = ConnectionManager::new(client).await?;

        info!(cache_scripts, "Connected to redis");
        Ok(Self::from_connection(conn, cache_scripts))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager, cache_scripts: bool) -> Self {
        Self {
            conn,
            scripts: Scripts::new(),
            cache_scripts,
        }
    }

    async fn run<T: FromRedisValue>(
        &self,
        script: &Script,
        source: &str,
        keys: &[&str],
        args: &[String],
    ) -> Result<T> {
        let mut conn = self.conn.clone();

        if self.cache_scripts {
            let mut invocation = script.prepare_invoke();
            for key in keys {
                invocation.key(*key);
            }
            for arg in args {
                invocation.arg(arg);
            }
            return Ok(invocation.invoke_async(&mut conn).await?);
        }

        let mut cmd = redis::cmd("EVAL");
        cmd.arg(source).arg(keys.len());
        for key in keys {
            cmd.arg(*key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        Ok(cmd.query_async(&mut conn).await?)
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn fixed_window(&self, key: &str, window_ms: u64, increment: u64) -> Result<i64> {
        self.run(
            &self.scripts.fixed_window,
            fixed_window::SCRIPT,
            &[key],
            &[window_ms.to_string(), increment.to_string()],
        )
        .await
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
        let (accepted, current, weighted_previous): (i64, i64, i64) = self
            .run(
                &self.scripts.sliding_window,
                sliding_window::SCRIPT,
                &[current_key, previous_key],
                &[
                    limit.to_string(),
                    now.to_string(),
                    window_ms.to_string(),
                    increment.to_string(),
                ],
            )
            .await?;

        Ok(SlidingWindowReply {
            accepted: accepted == 1,
            current,
            weighted_previous,
        })
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
        let (remaining, reset): (i64, i64) = self
            .run(
                &self.scripts.token_bucket,
                token_bucket::SCRIPT,
                &[key],
                &[
                    max_tokens.to_string(),
                    interval_ms.to_string(),
                    refill_rate.to_string(),
                    now.to_string(),
                    increment.to_string(),
                ],
            )
            .await?;

        let reset = u64::try_from(reset)
            .map_err(|_| RatewardenError::Store(format!("negative reset {} for {}", reset, key)))?;
        Ok(TokenBucketReply { remaining, reset })
    }

    async fn get_count(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.unwrap_or(0))
    }

    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>> {
        let mut conn = self.conn.clone();
        let fields: Vec<Option<i64>> = redis::cmd("HMGET")
            .arg(key)
            .arg("refilledAt")
            .arg("tokens")
            .query_async(&mut conn)
            .await?;

        match fields.as_slice() {
            [Some(refilled_at), Some(tokens)] => Ok(Some(BucketState {
                tokens: *tokens,
                refilled_at: u64::try_from(*refilled_at).unwrap_or(0),
            })),
            _ => Ok(None),
        }
    }

    async fn raise_count(&self, key: &str, value: i64, ttl_ms: u64) -> Result<i64> {
        let result = self
            .run(
                &self.scripts.raise,
                RAISE_SCRIPT,
                &[key],
                &[value.to_string(), ttl_ms.to_string()],
            )
            .await?;
        debug!(key = %key, target = value, result, "Raised counter");
        Ok(result)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(())
    }

    async fn record_event(&self, key: &str, fields: &[String], ttl_ms: u64) -> Result<()> {
        let mut args = Vec::with_capacity(fields.len() + 1);
        args.push(ttl_ms.to_string());
        args.extend(fields.iter().cloned());

        let _: i64 = self
            .run(&self.scripts.event, EVENT_SCRIPT, &[key], &args)
            .await?;
        Ok(())
    }
}
