//! The admission-control engine.
//!
//! [`RateLimitEngine`] ties the key space, the algorithms and the shared
//! store together. It holds no admission state of its own: every decision
//! is made by the store round trips of the selected algorithms, so any
//! number of engine instances can share one store.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::algorithm::LimitAlgorithm;
use super::fixed_window::FixedWindow;
use super::key::KeySpace;
use super::policy::{Algorithm, RateLimitConfig};
use super::result::{LimitStatus, RateLimitResult};
use super::sliding_window::SlidingWindowLog;
use super::token_bucket::TokenBucket;
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, TurnstileConfig};
use crate::error::{Result, TurnstileError};
use crate::metrics::{
    aggregate, MetricsCache, RateLimitMetrics, UsageSample, FIELD_BLOCKED, FIELD_IDENTIFIER,
    FIELD_ROUTE, FIELD_TOTAL,
};
use crate::store::{KeyExpiry, MemoryStore, RateLimitStore, RedisStore, StoreError, StoreResult};

/// Distributed admission-control engine.
///
/// Admission checks never fail because of the store: when it is unreachable
/// or slower than the configured timeout the engine admits the request and
/// reports full quota. Invalid input is rejected before the store is
/// touched.
pub struct RateLimitEngine {
    store: Arc<dyn RateLimitStore>,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    settings: EngineConfig,
    fixed: FixedWindow,
    sliding: SlidingWindowLog,
    bucket: TokenBucket,
    metrics_cache: MetricsCache,
    stats_writes: Arc<PendingWrites>,
}

/// Count of usage writes still in flight.
#[derive(Default)]
struct PendingWrites {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the pending count when a write task ends, even if cancelled.
struct PendingGuard(Arc<PendingWrites>);

impl PendingGuard {
    fn new(pending: Arc<PendingWrites>) -> Self {
        pending.count.fetch_add(1, Ordering::SeqCst);
        Self(pending)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for RateLimitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitEngine")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RateLimitEngine {
    /// Create an engine over `store` using the system clock.
    pub fn new(store: Arc<dyn RateLimitStore>, config: &TurnstileConfig) -> Result<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create an engine over `store` reading time from `clock`.
    pub fn with_clock(
        store: Arc<dyn RateLimitStore>,
        config: &TurnstileConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            keys: KeySpace::new(&config.store.key_prefix)?,
            timeout: config.store.timeout(),
            settings: config.engine.clone(),
            fixed: FixedWindow,
            sliding: SlidingWindowLog,
            bucket: TokenBucket::new(config.engine.max_cas_attempts),
            metrics_cache: MetricsCache::new(clock.clone(), config.engine.metrics_cache_ttl()),
            clock,
            stats_writes: Arc::new(PendingWrites::default()),
        })
    }

    /// Build the store named by the configuration and an engine over it.
    ///
    /// Without a store URL the engine runs on an in-process store, which
    /// only limits traffic seen by this process. An unreachable Redis server
    /// is logged and tolerated: checks fail open until it answers.
    pub async fn connect(config: &TurnstileConfig) -> Result<Self> {
        let url = config.store.url.as_deref().filter(|_| config.store.is_shared());
        let store: Arc<dyn RateLimitStore> = match url {
            Some(url) => {
                let store = RedisStore::new(url)?;
                match tokio::time::timeout(config.store.timeout(), store.ping()).await {
                    Ok(Ok(())) => info!("Using Redis store"),
                    Ok(Err(e)) => warn!(error = %e, "Redis unreachable, admitting requests until it answers"),
                    Err(_) => warn!("Redis did not answer in time, admitting requests until it does"),
                }
                Arc::new(store)
            }
            None => {
                info!("No store URL configured, using in-process store");
                Arc::new(MemoryStore::new())
            }
        };
        Self::new(store, config)
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    fn algorithm(&self, config: &RateLimitConfig) -> &dyn LimitAlgorithm {
        match config.algorithm() {
            Algorithm::FixedWindow => &self.fixed,
            Algorithm::SlidingWindow => &self.sliding,
            Algorithm::TokenBucket { .. } => &self.bucket,
        }
    }

    /// Run a store operation under the round-trip deadline.
    async fn guarded<T>(&self, op: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    fn derive_key(&self, identifier: &str, route: &str, config: &RateLimitConfig) -> Result<String> {
        validate_request(identifier, route)?;
        let key = self.keys.derive_key(identifier, route, config);
        if key.is_empty() {
            return Err(TurnstileError::Validation(
                "key generator produced an empty key".to_string(),
            ));
        }
        Ok(key)
    }

    /// Check a single limit. See [`evaluate`](Self::evaluate).
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        route: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult> {
        self.evaluate(identifier, route, std::slice::from_ref(config))
            .await
    }

    /// Check every limit in `configs` concurrently and return the most
    /// restrictive outcome.
    ///
    /// The first denial in `configs` order wins. When everything is admitted
    /// the result with the least `remaining` is returned, the first one on
    /// ties.
    #[instrument(skip(self, configs), fields(limits = configs.len()))]
    pub async fn evaluate(
        &self,
        identifier: &str,
        route: &str,
        configs: &[RateLimitConfig],
    ) -> Result<RateLimitResult> {
        if configs.is_empty() {
            return Err(TurnstileError::Validation(
                "at least one limit is required".to_string(),
            ));
        }
        let keys = configs
            .iter()
            .map(|config| self.derive_key(identifier, route, config))
            .collect::<Result<Vec<_>>>()?;

        let now = self.clock.now_millis();
        let checks = configs
            .iter()
            .zip(keys.iter())
            .map(|(config, key)| self.check_one(key, config, now));
        let results = join_all(checks).await;

        let decision = most_restrictive(results).ok_or_else(|| {
            TurnstileError::Validation("at least one limit is required".to_string())
        })?;

        if !decision.allowed {
            debug!(
                identifier = %identifier,
                route = %route,
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        }
        self.record_usage(identifier, route, !decision.allowed);
        Ok(decision)
    }

    async fn check_one(&self, key: &str, config: &RateLimitConfig, now: u64) -> RateLimitResult {
        trace!(key = %key, algorithm = %config.algorithm(), "Checking limit");
        let check = self
            .algorithm(config)
            .check(self.store.as_ref(), key, config, now);
        match self.guarded(check).await {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %key, error = %e, "Store check failed, admitting request");
                RateLimitResult::fail_open(config, now)
            }
        }
    }

    /// Queue a usage sample. The write runs on its own task so admission
    /// never waits on it.
    fn record_usage(&self, identifier: &str, route: &str, blocked: bool) {
        if !self.settings.record_stats {
            return;
        }
        let store = self.store.clone();
        let key = self.keys.stats_key(identifier, route);
        let set = [
            (FIELD_IDENTIFIER, identifier.to_string()),
            (FIELD_ROUTE, route.to_string()),
        ];
        let timeout = self.timeout;
        let ttl = self.settings.stats_ttl();
        let guard = PendingGuard::new(self.stats_writes.clone());

        tokio::spawn(async move {
            let _guard = guard;
            let increments = [(FIELD_TOTAL, 1), (FIELD_BLOCKED, i64::from(blocked))];
            let write = store.hash_increment(&key, &set, &increments, ttl);
            match tokio::time::timeout(timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(key = %key, error = %e, "Failed to record usage"),
                Err(_) => debug!(key = %key, "Recording usage timed out"),
            }
        });
    }

    /// Wait until every queued usage write has finished.
    ///
    /// Short-lived processes call this before exiting so their samples are
    /// not lost with the runtime.
    pub async fn flush_stats(&self) {
        loop {
            let idle = self.stats_writes.idle.notified();
            if self.stats_writes.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Current usage of a limit without consuming quota.
    pub async fn status(
        &self,
        identifier: &str,
        route: &str,
        config: &RateLimitConfig,
    ) -> Result<LimitStatus> {
        let key = self.derive_key(identifier, route, config)?;
        let now = self.clock.now_millis();
        let status = self
            .guarded(self.algorithm(config).status(self.store.as_ref(), &key, config, now))
            .await?;
        Ok(status)
    }

    /// Forget all usage of a limit. Resetting an unused limit is a no-op.
    pub async fn reset(&self, identifier: &str, route: &str, config: &RateLimitConfig) -> Result<()> {
        let key = self.derive_key(identifier, route, config)?;
        let now = self.clock.now_millis();
        self.guarded(self.algorithm(config).reset(self.store.as_ref(), &key, config, now))
            .await?;
        info!(key = %key, "Rate limit reset");
        Ok(())
    }

    /// Aggregate usage across all routes and identifiers.
    ///
    /// Scan failures end the scan early; whatever was collected is returned
    /// with `complete` set to `false`.
    pub async fn metrics(&self) -> RateLimitMetrics {
        if let Some(cached) = self.metrics_cache.get() {
            return cached;
        }

        let mut samples = Vec::new();
        let mut complete = true;
        let keys = match self.scan_all(&self.keys.stats_prefix()).await {
            Ok(keys) => keys,
            Err((keys, e)) => {
                warn!(error = %e, collected = keys.len(), "Metrics scan incomplete");
                complete = false;
                keys
            }
        };

        for key in keys {
            match self.guarded(self.store.hash_get_all(&key)).await {
                Ok(fields) => samples.extend(UsageSample::from_fields(&fields)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read usage");
                    complete = false;
                }
            }
        }

        let metrics = aggregate(samples, self.settings.top_n, complete);
        if complete {
            self.metrics_cache.put(metrics.clone());
        }
        metrics
    }

    /// Drop the memoised metrics report.
    pub fn invalidate_metrics(&self) {
        self.metrics_cache.invalidate();
    }

    /// Delete keys in the engine's namespace that carry no expiry.
    ///
    /// Returns the number of keys deleted. Errors are logged and skipped.
    pub async fn cleanup(&self) -> usize {
        let keys = match self.scan_all(&self.keys.namespace()).await {
            Ok(keys) => keys,
            Err((keys, e)) => {
                warn!(error = %e, collected = keys.len(), "Cleanup scan incomplete");
                keys
            }
        };

        let mut removed = 0;
        for key in keys {
            match self.guarded(self.store.expiry(&key)).await {
                Ok(KeyExpiry::Persistent) => match self.guarded(self.store.delete(&key)).await {
                    Ok(true) => {
                        debug!(key = %key, "Removed key without expiry");
                        removed += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(key = %key, error = %e, "Failed to remove key"),
                },
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to inspect key"),
            }
        }

        if removed > 0 {
            info!(removed = removed, "Cleanup removed keys without expiry");
        }
        removed
    }

    /// Collect every key under `prefix`. On failure the keys gathered so far
    /// come back with the error.
    async fn scan_all(
        &self,
        prefix: &str,
    ) -> std::result::Result<Vec<String>, (Vec<String>, StoreError)> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let scan = self
                .store
                .scan_prefix(prefix, cursor, self.settings.scan_batch_size);
            let batch = match self.guarded(scan).await {
                Ok(batch) => batch,
                Err(e) => return Err((keys, e)),
            };
            for key in batch.keys {
                // SCAN may return a key more than once.
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
            if batch.cursor == 0 {
                return Ok(keys);
            }
            cursor = batch.cursor;
        }
    }
}

fn validate_request(identifier: &str, route: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(TurnstileError::Validation("identifier must not be empty".to_string()));
    }
    if route.is_empty() {
        return Err(TurnstileError::Validation("route must not be empty".to_string()));
    }
    Ok(())
}

/// Reduce per-limit results to one: the first denial, otherwise the
/// tightest admission.
pub fn most_restrictive(results: Vec<RateLimitResult>) -> Option<RateLimitResult> {
    if let Some(denied) = results.iter().position(|r| !r.allowed) {
        return results.into_iter().nth(denied);
    }
    results.into_iter().min_by_key(|r| r.remaining)
}

/// Run [`RateLimitEngine::cleanup`] every `interval` until `shutdown`
/// completes.
pub fn spawn_cleanup_task<S>(
    engine: Arc<RateLimitEngine>,
    interval: Duration,
    shutdown: S,
) -> JoinHandle<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    engine.cleanup().await;
                }
                _ = &mut shutdown => {
                    info!("Cleanup task stopping");
                    break;
                }
            }
        }
    })
}
