//! Token bucket.
//!
//! A bucket holds up to `bucket_size` tokens and regains `refill_rate` tokens
//! per second. Each admitted check takes one token.
//!
//! The refill is computed locally, so a check is a read, a computation and a
//! write. The write is guarded on a `version` field that every write bumps;
//! a writer that lost the race re-reads and tries again. Two concurrent
//! checks therefore can never both spend the same token.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, trace};

use super::algorithm::LimitAlgorithm;
use super::policy::{Algorithm, RateLimitConfig};
use super::result::{LimitStatus, RateLimitResult};
use crate::store::{RateLimitStore, StoreError, StoreResult};

const TOKENS: &str = "tokens";
const LAST_REFILL: &str = "last_refill";
const VERSION: &str = "version";

/// Default number of guarded write attempts per check.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Persisted bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Whole tokens available
    pub tokens: u64,
    /// Epoch ms up to which refill has been credited
    pub last_refill: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BucketParams {
    refill_rate: f64,
    bucket_size: u64,
}

impl BucketParams {
    fn from_config(config: &RateLimitConfig) -> StoreResult<Self> {
        match config.algorithm() {
            Algorithm::TokenBucket {
                refill_rate,
                bucket_size,
            } => Ok(Self {
                refill_rate,
                bucket_size,
            }),
            other => Err(StoreError::Unsupported(format!(
                "{} limit passed to the token bucket",
                other
            ))),
        }
    }

    /// Milliseconds needed to regain `tokens`. Float to int casts saturate.
    fn millis_for(&self, tokens: u64) -> u64 {
        (tokens as f64 * 1000.0 / self.refill_rate).ceil() as u64
    }

    /// Time to earn one token.
    fn token_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.refill_rate).unwrap_or(Duration::MAX)
    }

    fn ttl(&self, config: &RateLimitConfig) -> Duration {
        Duration::from_millis(self.millis_for(self.bucket_size).max(config.window_millis()))
    }
}

impl BucketState {
    fn full(bucket_size: u64, now: u64) -> Self {
        Self {
            tokens: bucket_size,
            last_refill: now,
        }
    }

    /// Credit the whole tokens earned since `last_refill`.
    ///
    /// `last_refill` only advances by the time those tokens cost, so partial
    /// progress towards the next token survives frequent checks.
    fn refill(self, now: u64, params: BucketParams) -> Self {
        let elapsed_ms = now.saturating_sub(self.last_refill);
        let earned = (elapsed_ms as f64 / 1000.0 * params.refill_rate).floor() as u64;
        let tokens = self.tokens.saturating_add(earned).min(params.bucket_size);

        let last_refill = if tokens >= params.bucket_size {
            now
        } else if earned == 0 {
            self.last_refill
        } else {
            self.last_refill.saturating_add(params.millis_for(earned)).min(now)
        };

        Self {
            tokens,
            last_refill,
        }
    }

    /// Epoch ms at which the bucket is full again.
    fn full_at(&self, params: BucketParams) -> u64 {
        let missing = params.bucket_size - self.tokens.min(params.bucket_size);
        self.last_refill.saturating_add(params.millis_for(missing))
    }
}

fn decode(key: &str, fields: &HashMap<String, String>) -> StoreResult<Option<(BucketState, u64)>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let field = |name: &str| -> StoreResult<u64> {
        fields
            .get(name)
            .ok_or_else(|| StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("missing field {}", name),
            })?
            .parse::<u64>()
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("field {}: {}", name, e),
            })
    };
    Ok(Some((
        BucketState {
            tokens: field(TOKENS)?,
            last_refill: field(LAST_REFILL)?,
        },
        field(VERSION)?,
    )))
}

/// The token bucket algorithm.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    max_attempts: u32,
}

impl TokenBucket {
    /// Create a bucket algorithm giving up after `max_attempts` lost writes.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    async fn load(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
    ) -> StoreResult<Option<(BucketState, u64)>> {
        let fields = store.hash_get_all(key).await?;
        decode(key, &fields)
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

#[async_trait]
impl LimitAlgorithm for TokenBucket {
    async fn check(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> StoreResult<RateLimitResult> {
        let params = BucketParams::from_config(config)?;
        let ttl = params.ttl(config);

        for attempt in 1..=self.max_attempts {
            let (current, version) = match self.load(store, key).await? {
                Some((state, version)) => (state, Some(version)),
                None => (BucketState::full(params.bucket_size, now), None),
            };

            let mut next = current.refill(now, params);
            let allowed = next.tokens > 0;
            if allowed {
                next.tokens -= 1;
            }

            let expected = version.map(|v| v.to_string());
            let fields = [
                (TOKENS, next.tokens.to_string()),
                (LAST_REFILL, next.last_refill.to_string()),
                (VERSION, (version.unwrap_or(0) + 1).to_string()),
            ];
            let written = store
                .hash_compare_and_set(key, VERSION, expected.as_deref(), &fields, ttl)
                .await?;

            if written {
                trace!(
                    key = %key,
                    tokens = next.tokens,
                    attempt = attempt,
                    "Token bucket check"
                );
                let limit = params.bucket_size;
                return Ok(if allowed {
                    RateLimitResult::allowed(limit, next.tokens, next.full_at(params))
                } else {
                    RateLimitResult::denied(
                        limit,
                        next.full_at(params),
                        params.token_interval(),
                    )
                });
            }

            let backoff = rand::thread_rng().gen_range(0..=u64::from(attempt));
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }

        debug!(key = %key, attempts = self.max_attempts, "Token bucket write kept conflicting");
        Err(StoreError::Contention {
            key: key.to_string(),
            attempts: self.max_attempts,
        })
    }

    async fn status(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> StoreResult<LimitStatus> {
        let params = BucketParams::from_config(config)?;
        let state = match self.load(store, key).await? {
            Some((state, _)) => state.refill(now, params),
            None => BucketState::full(params.bucket_size, now),
        };
        Ok(LimitStatus::new(
            params.bucket_size.saturating_sub(state.tokens),
            params.bucket_size,
            state.full_at(params),
        ))
    }

    async fn reset(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        _config: &RateLimitConfig,
        _now: u64,
    ) -> StoreResult<()> {
        store.delete(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::{KeyExpiry, MemoryStore};
    use std::sync::Arc;

    const T0: u64 = 1_700_000_000_000;

    fn bucket(refill_rate: f64, bucket_size: u64) -> RateLimitConfig {
        RateLimitConfig::token_bucket(Duration::from_secs(60), bucket_size, refill_rate, bucket_size)
            .unwrap()
    }

    fn params(refill_rate: f64, bucket_size: u64) -> BucketParams {
        BucketParams {
            refill_rate,
            bucket_size,
        }
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let state = BucketState { tokens: 2, last_refill: T0 };
        let refilled = state.refill(T0 + 60_000, params(1.0, 5));
        assert_eq!(refilled.tokens, 5);
        assert_eq!(refilled.last_refill, T0 + 60_000);
    }

    #[test]
    fn test_refill_keeps_partial_progress() {
        let p = params(1.0, 5);
        let state = BucketState { tokens: 0, last_refill: T0 };

        // 600 ms is not enough for a token and must not be thrown away.
        let after = state.refill(T0 + 600, p);
        assert_eq!(after, state);

        let after = after.refill(T0 + 1_200, p);
        assert_eq!(after.tokens, 1);
        assert_eq!(after.last_refill, T0 + 1_000);
    }

    #[test]
    fn test_decode_rejects_partial_records() {
        let mut fields = HashMap::new();
        fields.insert(TOKENS.to_string(), "3".to_string());
        assert!(decode("k", &fields).is_err());

        fields.insert(LAST_REFILL.to_string(), "10".to_string());
        fields.insert(VERSION.to_string(), "2".to_string());
        let (state, version) = decode("k", &fields).unwrap().unwrap();
        assert_eq!(state, BucketState { tokens: 3, last_refill: 10 });
        assert_eq!(version, 2);

        assert!(decode("k", &HashMap::new()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_bucket_admits_burst_then_denies() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = MemoryStore::with_clock(clock.clone());
        let config = bucket(1.0, 3);
        let algo = TokenBucket::default();

        for expected in [2, 1, 0] {
            let result = algo.check(&store, "k", &config, clock.now_millis()).await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
        }

        let result = algo.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after, Some(Duration::from_secs(1)));
        assert_eq!(result.reset_time.timestamp_millis() as u64, T0 + 3_000);
    }

    #[tokio::test]
    async fn test_one_token_after_one_interval() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = MemoryStore::with_clock(clock.clone());
        let config = bucket(2.0, 2);
        let algo = TokenBucket::default();

        for _ in 0..3 {
            algo.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        }

        clock.advance(Duration::from_millis(500));
        let result = algo.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);

        let result = algo.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after, Some(Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn test_frequent_denied_checks_do_not_starve_refill() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = MemoryStore::with_clock(clock.clone());
        let config = bucket(1.0, 1);
        let algo = TokenBucket::default();

        assert!(algo.check(&store, "k", &config, clock.now_millis()).await.unwrap().allowed);
        clock.advance(Duration::from_millis(600));
        assert!(!algo.check(&store, "k", &config, clock.now_millis()).await.unwrap().allowed);
        clock.advance(Duration::from_millis(600));
        assert!(algo.check(&store, "k", &config, clock.now_millis()).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_record_carries_expiry() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = MemoryStore::with_clock(clock.clone());
        // Refilling 10 tokens at 0.1/s takes 100 s, longer than the window.
        let config = RateLimitConfig::token_bucket(Duration::from_secs(60), 10, 0.1, 10).unwrap();

        TokenBucket::default().check(&store, "k", &config, T0).await.unwrap();
        assert_eq!(
            store.expiry("k").await.unwrap(),
            KeyExpiry::Expires(Duration::from_secs(100))
        );
    }

    #[tokio::test]
    async fn test_status_is_read_only() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = MemoryStore::with_clock(clock.clone());
        let config = bucket(1.0, 4);
        let algo = TokenBucket::default();

        let fresh = algo.status(&store, "k", &config, T0).await.unwrap();
        assert_eq!(fresh.remaining, 4);
        assert!(store.is_empty());

        algo.check(&store, "k", &config, T0).await.unwrap();
        for _ in 0..3 {
            let status = algo.status(&store, "k", &config, T0).await.unwrap();
            assert_eq!(status.current, 1);
            assert_eq!(status.remaining, 3);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_overspend() {
        let store = Arc::new(MemoryStore::with_clock(Arc::new(ManualClock::new(T0))));
        let config = bucket(0.001, 10);
        let algo = TokenBucket::new(1_000);

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let store = store.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    algo.check(store.as_ref(), "shared", &config, T0)
                        .await
                        .unwrap()
                        .allowed
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_contention_is_reported() {
        struct AlwaysConflicting(MemoryStore);

        #[async_trait]
        impl RateLimitStore for AlwaysConflicting {
            async fn increment_window(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
                self.0.increment_window(key, ttl).await
            }
            async fn get_counter(&self, key: &str) -> StoreResult<Option<u64>> {
                self.0.get_counter(key).await
            }
            async fn log_append(
                &self,
                key: &str,
                window_start: u64,
                now: u64,
                member: &str,
                ttl: Duration,
            ) -> StoreResult<crate::store::LogSnapshot> {
                self.0.log_append(key, window_start, now, member, ttl).await
            }
            async fn log_peek(
                &self,
                key: &str,
                window_start: u64,
            ) -> StoreResult<crate::store::LogSnapshot> {
                self.0.log_peek(key, window_start).await
            }
            async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
                self.0.hash_get_all(key).await
            }
            async fn hash_compare_and_set(
                &self,
                _key: &str,
                _guard_field: &str,
                _expected: Option<&str>,
                _fields: &[(&str, String)],
                _ttl: Duration,
            ) -> StoreResult<bool> {
                Ok(false)
            }
            async fn hash_increment(
                &self,
                key: &str,
                set: &[(&str, String)],
                increments: &[(&str, i64)],
                ttl: Duration,
            ) -> StoreResult<()> {
                self.0.hash_increment(key, set, increments, ttl).await
            }
            async fn delete(&self, key: &str) -> StoreResult<bool> {
                self.0.delete(key).await
            }
            async fn expiry(&self, key: &str) -> StoreResult<KeyExpiry> {
                self.0.expiry(key).await
            }
            async fn scan_prefix(
                &self,
                prefix: &str,
                cursor: u64,
                count: usize,
            ) -> StoreResult<crate::store::ScanBatch> {
                self.0.scan_prefix(prefix, cursor, count).await
            }
        }

        let store = AlwaysConflicting(MemoryStore::new());
        let err = TokenBucket::new(3)
            .check(&store, "k", &bucket(1.0, 1), T0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Contention { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_window_configs_are_rejected() {
        let store = MemoryStore::new();
        let algo = TokenBucket::default();
        let fixed = RateLimitConfig::fixed_window(Duration::from_secs(1), 5).unwrap();

        let err = algo.check(&store, "k", &fixed, T0).await.unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
        let err = algo.status(&store, "k", &fixed, T0).await.unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_slow_refill_stays_in_range() {
        let store = MemoryStore::with_clock(Arc::new(ManualClock::new(T0)));
        let config = bucket(1e-8, 1);
        let algo = TokenBucket::default();

        assert!(algo.check(&store, "k", &config, T0).await.unwrap().allowed);
        let denied = algo.check(&store, "k", &config, T0).await.unwrap();
        assert!(!denied.allowed);
        let wait = denied.retry_after.unwrap().as_secs_f64();
        assert!((wait - 1e8).abs() < 1.0);

        let far = BucketState { tokens: 0, last_refill: u64::MAX - 10 };
        assert_eq!(far.full_at(params(1e-8, 1)), u64::MAX);
        let refilled = far.refill(u64::MAX, params(1000.0, 100));
        assert_eq!(refilled.tokens, 10);
        assert_eq!(refilled.last_refill, u64::MAX);
    }
}
