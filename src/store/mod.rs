//! Shared key-value store abstraction.
//!
//! Every admission algorithm talks to the store through [`RateLimitStore`].
//! Each method is one logically atomic round trip: implementations must make
//! the multi-step operations indivisible with respect to concurrent callers
//! on the same key.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by store backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A round trip exceeded its deadline
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Optimistic writes kept losing to concurrent writers
    #[error("gave up after {attempts} conflicting writes on {key}")]
    Contention { key: String, attempts: u32 },

    /// A record did not have the expected shape
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// The operation does not apply to the given limit
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Redis protocol or connection error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Snapshot of a sliding-window log after a trim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSnapshot {
    /// Entries remaining in the window
    pub count: u64,
    /// Timestamp (epoch ms) of the oldest surviving entry
    pub oldest: Option<u64>,
}

/// Expiry state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExpiry {
    /// The key does not exist
    Missing,
    /// The key exists without an expiry
    Persistent,
    /// The key expires after the given duration
    Expires(Duration),
}

/// One page of a prefix scan.
#[derive(Debug, Clone, Default)]
pub struct ScanBatch {
    /// Cursor for the next page; `0` once the scan is complete
    pub cursor: u64,
    /// Keys found in this page
    pub keys: Vec<String>,
}

/// Operations the engine needs from the shared store.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Increment a counter and give it `ttl` if it has no expiry yet.
    ///
    /// Returns the post-increment value.
    async fn increment_window(&self, key: &str, ttl: Duration) -> StoreResult<u64>;

    /// Read a counter without modifying it.
    async fn get_counter(&self, key: &str) -> StoreResult<Option<u64>>;

    /// Drop log entries older than `window_start`, add `member` at `now`,
    /// refresh the expiry to `ttl`, and report what is left.
    async fn log_append(
        &self,
        key: &str,
        window_start: u64,
        now: u64,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<LogSnapshot>;

    /// Drop log entries older than `window_start` and report what is left.
    async fn log_peek(&self, key: &str, window_start: u64) -> StoreResult<LogSnapshot>;

    /// Read every field of a hash. Missing keys read as an empty map.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Overwrite `fields` only if `guard_field` currently equals `expected`
    /// (`None` meaning the field is absent), then set the expiry to `ttl`.
    ///
    /// Returns `false` when the guard did not match and nothing was written.
    async fn hash_compare_and_set(
        &self,
        key: &str,
        guard_field: &str,
        expected: Option<&str>,
        fields: &[(&str, String)],
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Set string fields, add to integer fields, and refresh the expiry.
    async fn hash_increment(
        &self,
        key: &str,
        set: &[(&str, String)],
        increments: &[(&str, i64)],
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Inspect the expiry of a key.
    async fn expiry(&self, key: &str) -> StoreResult<KeyExpiry>;

    /// Return one page of keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str, cursor: u64, count: usize)
        -> StoreResult<ScanBatch>;
}
