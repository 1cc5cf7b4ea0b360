//! Shared interface of the admission algorithms.

use async_trait::async_trait;

use super::policy::RateLimitConfig;
use super::result::{LimitStatus, RateLimitResult};
use crate::store::{RateLimitStore, StoreResult};

/// One admission algorithm.
///
/// `key` is the base key from [`KeySpace::derive_key`](super::KeySpace::derive_key);
/// `now` is epoch milliseconds. Implementations perform at most one logically
/// atomic store operation per call, retried only where they say so.
#[async_trait]
pub trait LimitAlgorithm: Send + Sync {
    /// Count one unit against the limit and decide.
    async fn check(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> StoreResult<RateLimitResult>;

    /// Report usage without consuming quota.
    async fn status(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> StoreResult<LimitStatus>;

    /// Drop the record backing the limit.
    async fn reset(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> StoreResult<()>;
}
