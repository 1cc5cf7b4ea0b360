//! Redis-backed store for distributed deployments.
//!
//! Multi-step operations run as server-side Lua scripts so each one is a
//! single atomic round trip no matter how many engine instances share the
//! keys.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{KeyExpiry, LogSnapshot, RateLimitStore, ScanBatch, StoreError, StoreResult};

const INCREMENT_WINDOW: &str = r"
local count = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

const LOG_APPEND: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {redis.call('ZCARD', KEYS[1]), oldest[2] or ''}
";

const LOG_PEEK: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {redis.call('ZCARD', KEYS[1]), oldest[2] or ''}
";

const HASH_COMPARE_AND_SET: &str = r"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if ARGV[2] == '1' then
  if current ~= ARGV[3] then return 0 end
elseif current then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 5))
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return 1
";

struct Scripts {
    increment_window: Script,
    log_append: Script,
    log_peek: Script,
    hash_compare_and_set: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            increment_window: Script::new(INCREMENT_WINDOW),
            log_append: Script::new(LOG_APPEND),
            log_peek: Script::new(LOG_PEEK),
            hash_compare_and_set: Script::new(HASH_COMPARE_AND_SET),
        }
    }
}

/// A [`RateLimitStore`] backed by Redis (or a protocol-compatible server).
///
/// The connection is opened on first use. Until it succeeds every operation
/// fails with [`StoreError::Unavailable`] and the next one tries again, so an
/// unreachable server at startup behaves like any other outage.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    scripts: Scripts,
}

impl RedisStore {
    /// Create a store for `url` (e.g. `redis://127.0.0.1:6379`) without
    /// connecting. Only a malformed URL is an error.
    pub fn new(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client");
            StoreError::Unavailable(format!("invalid redis url: {}", e))
        })?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            scripts: Scripts::load(),
        })
    }

    /// Create a store for `url` and verify the server answers.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let store = Self::new(url)?;
        store.ping().await?;
        Ok(store)
    }

    /// Round-trip a `PING`, connecting first if needed.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn conn(&self) -> StoreResult<ConnectionManager> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let connection = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| {
                        warn!(error = %e, "Failed to connect to Redis");
                        StoreError::Unavailable(e.to_string())
                    })?;
                debug!("Connected to Redis");
                Ok::<_, StoreError>(connection)
            })
            .await?;
        Ok(connection.clone())
    }
}

/// Expiry in milliseconds, clamped to what `PEXPIRE` accepts.
fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn parse_snapshot(key: &str, (count, oldest): (u64, String)) -> StoreResult<LogSnapshot> {
    let oldest = if oldest.is_empty() {
        None
    } else {
        let score: f64 = oldest.parse().map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("bad log score {:?}: {}", oldest, e),
        })?;
        Some(score as u64)
    };
    Ok(LogSnapshot { count, oldest })
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn increment_window(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = self
            .scripts
            .increment_window
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn get_counter(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.conn().await?;
        let value: Option<u64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn log_append(
        &self,
        key: &str,
        window_start: u64,
        now: u64,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<LogSnapshot> {
        let mut conn = self.conn().await?;
        let raw: (u64, String) = self
            .scripts
            .log_append
            .key(key)
            .arg(window_start)
            .arg(now)
            .arg(member)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        parse_snapshot(key, raw)
    }

    async fn log_peek(&self, key: &str, window_start: u64) -> StoreResult<LogSnapshot> {
        let mut conn = self.conn().await?;
        let raw: (u64, String) = self
            .scripts
            .log_peek
            .key(key)
            .arg(window_start)
            .invoke_async(&mut conn)
            .await?;
        parse_snapshot(key, raw)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(fields)
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        guard_field: &str,
        expected: Option<&str>,
        fields: &[(&str, String)],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let mut invocation = self.scripts.hash_compare_and_set.key(key);
        invocation
            .arg(guard_field)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(ttl_millis(ttl));
        for (name, value) in fields {
            invocation.arg(*name).arg(value.as_str());
        }
        let written: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }

    async fn hash_increment(
        &self,
        key: &str,
        set: &[(&str, String)],
        increments: &[(&str, i64)],
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !set.is_empty() {
            let pairs: Vec<(&str, &str)> = set.iter().map(|(k, v)| (*k, v.as_str())).collect();
            pipe.hset_multiple(key, &pairs).ignore();
        }
        for (field, delta) in increments {
            pipe.hincr(key, *field, *delta).ignore();
        }
        pipe.pexpire(key, ttl_millis(ttl)).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn expiry(&self, key: &str) -> StoreResult<KeyExpiry> {
        let mut conn = self.conn().await?;
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(match pttl {
            -2 => KeyExpiry::Missing,
            -1 => KeyExpiry::Persistent,
            ms => KeyExpiry::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<ScanBatch> {
        let mut conn = self.conn().await?;
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(glob_escape(prefix))
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(ScanBatch { cursor, keys })
    }
}
