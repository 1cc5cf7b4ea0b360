//! In-process store for single-node deployments and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tracing::trace;

use super::{KeyExpiry, LogSnapshot, RateLimitStore, ScanBatch, StoreError, StoreResult};
use crate::clock::{Clock, SystemClock};

/// Operations between sweeps of expired records.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    /// Sorted by timestamp, then member.
    Log(Vec<(u64, String)>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Record {
    value: Value,
    expires_at: Option<u64>,
}

impl Record {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// A [`RateLimitStore`] held in process memory.
///
/// Each key lives in a [`DashMap`] shard; holding the shard entry for the
/// whole operation makes every method atomic per key. Expiry is evaluated
/// against the injected clock on access; expired records are swept every
/// [`SWEEP_EVERY`] operations and at the start of each prefix scan.
///
/// The store can be switched off or slowed down to exercise the engine's
/// failure handling.
pub struct MemoryStore {
    data: DashMap<String, Record>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    ops: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that evaluates expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            ops: AtomicU64::new(0),
        }
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every subsequent operation.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Write a counter with no expiry, as a crashed writer might leave behind.
    pub fn insert_persistent(&self, key: &str, value: u64) {
        self.data
            .insert(key.to_string(), Record::new(Value::Counter(value)));
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.data.iter().filter(|r| !r.is_expired(now)).count()
    }

    /// Number of records held, including expired ones not yet swept.
    pub fn record_count(&self) -> usize {
        self.data.len()
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        self.data.retain(|_, record| {
            let keep = !record.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            trace!(removed = removed, "Swept expired records");
        }
        removed
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn gate(&self) -> StoreResult<u64> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store disabled".to_string()));
        }
        // Callers hold no entry locks here, so sweeping cannot deadlock.
        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == 0 {
            self.purge_expired();
        }
        Ok(self.clock.now_millis())
    }

    fn wrong_type(key: &str, expected: &str) -> StoreError {
        StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("expected a {} record", expected),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expires_at(now: u64, ttl: Duration) -> Option<u64> {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    Some(now.saturating_add(ttl_ms))
}

fn trim_log(log: &mut Vec<(u64, String)>, window_start: u64) -> LogSnapshot {
    log.retain(|(ts, _)| *ts >= window_start);
    LogSnapshot {
        count: log.len() as u64,
        oldest: log.first().map(|(ts, _)| *ts),
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn increment_window(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let now = self.gate().await?;
        let mut record = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Record::new(Value::Counter(0)));
        if record.is_expired(now) {
            *record = Record::new(Value::Counter(0));
        }

        let count = match &mut record.value {
            Value::Counter(count) => {
                *count += 1;
                *count
            }
            _ => return Err(Self::wrong_type(key, "counter")),
        };
        if record.expires_at.is_none() {
            record.expires_at = expires_at(now, ttl);
        }
        Ok(count)
    }

    async fn get_counter(&self, key: &str) -> StoreResult<Option<u64>> {
        let now = self.gate().await?;
        match self.data.get(key) {
            Some(record) if !record.is_expired(now) => match record.value {
                Value::Counter(count) => Ok(Some(count)),
                _ => Err(Self::wrong_type(key, "counter")),
            },
            _ => Ok(None),
        }
    }

    async fn log_append(
        &self,
        key: &str,
        window_start: u64,
        now: u64,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<LogSnapshot> {
        let clock_now = self.gate().await?;
        let mut record = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Record::new(Value::Log(Vec::new())));
        if record.is_expired(clock_now) {
            *record = Record::new(Value::Log(Vec::new()));
        }

        let snapshot = match &mut record.value {
            Value::Log(log) => {
                let entry = (now, member.to_string());
                let at = log.partition_point(|existing| *existing <= entry);
                log.insert(at, entry);
                trim_log(log, window_start)
            }
            _ => return Err(Self::wrong_type(key, "log")),
        };
        record.expires_at = expires_at(clock_now, ttl);
        Ok(snapshot)
    }

    async fn log_peek(&self, key: &str, window_start: u64) -> StoreResult<LogSnapshot> {
        let now = self.gate().await?;
        let empty = LogSnapshot {
            count: 0,
            oldest: None,
        };
        match self.data.get_mut(key) {
            Some(mut record) if !record.is_expired(now) => match &mut record.value {
                Value::Log(log) => Ok(trim_log(log, window_start)),
                _ => Err(Self::wrong_type(key, "log")),
            },
            _ => Ok(empty),
        }
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let now = self.gate().await?;
        match self.data.get(key) {
            Some(record) if !record.is_expired(now) => match &record.value {
                Value::Hash(fields) => Ok(fields.clone()),
                _ => Err(Self::wrong_type(key, "hash")),
            },
            _ => Ok(HashMap::new()),
        }
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        guard_field: &str,
        expected: Option<&str>,
        fields: &[(&str, String)],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = self.gate().await?;
        let write = |map: &mut HashMap<String, String>| {
            for (name, value) in fields {
                map.insert(name.to_string(), value.clone());
            }
        };

        match self.data.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_expired(now) {
                    *record = Record::new(Value::Hash(HashMap::new()));
                }
                let Value::Hash(map) = &mut record.value else {
                    return Err(Self::wrong_type(key, "hash"));
                };
                if map.get(guard_field).map(String::as_str) != expected {
                    trace!(key = %key, "Guarded hash write lost the race");
                    return Ok(false);
                }
                write(map);
                record.expires_at = expires_at(now, ttl);
                Ok(true)
            }
            MapEntry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                let mut map = HashMap::new();
                write(&mut map);
                vacant.insert(Record {
                    value: Value::Hash(map),
                    expires_at: expires_at(now, ttl),
                });
                Ok(true)
            }
        }
    }

    async fn hash_increment(
        &self,
        key: &str,
        set: &[(&str, String)],
        increments: &[(&str, i64)],
        ttl: Duration,
    ) -> StoreResult<()> {
        let now = self.gate().await?;
        let mut record = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Record::new(Value::Hash(HashMap::new())));
        if record.is_expired(now) {
            *record = Record::new(Value::Hash(HashMap::new()));
        }

        let Value::Hash(map) = &mut record.value else {
            return Err(Self::wrong_type(key, "hash"));
        };
        for (name, value) in set {
            map.insert(name.to_string(), value.clone());
        }
        for (name, delta) in increments {
            let current = match map.get(*name) {
                Some(raw) => raw.parse::<i64>().map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: format!("field {} is not an integer: {}", name, e),
                })?,
                None => 0,
            };
            map.insert(name.to_string(), (current + delta).to_string());
        }
        record.expires_at = expires_at(now, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = self.gate().await?;
        Ok(self
            .data
            .remove(key)
            .map(|(_, record)| !record.is_expired(now))
            .unwrap_or(false))
    }

    async fn expiry(&self, key: &str) -> StoreResult<KeyExpiry> {
        let now = self.gate().await?;
        Ok(match self.data.get(key) {
            None => KeyExpiry::Missing,
            Some(record) => match record.expires_at {
                Some(at) if at <= now => KeyExpiry::Missing,
                Some(at) => KeyExpiry::Expires(Duration::from_millis(at - now)),
                None => KeyExpiry::Persistent,
            },
        })
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<ScanBatch> {
        let now = self.gate().await?;
        if cursor == 0 {
            self.purge_expired();
        }
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|r| r.key().starts_with(prefix) && !r.value().is_expired(now))
            .map(|r| r.key().clone())
            .collect();
        keys.sort();

        let start = cursor as usize;
        let page: Vec<String> = keys.iter().skip(start).take(count.max(1)).cloned().collect();
        let next = start + page.len();
        Ok(ScanBatch {
            cursor: if next >= keys.len() { 0 } else { next as u64 },
            keys: page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_increment_sets_expiry_once() {
        let (clock, store) = store();

        assert_eq!(store.increment_window("c", Duration::from_millis(500)).await.unwrap(), 1);
        clock.advance(Duration::from_millis(300));
        assert_eq!(store.increment_window("c", Duration::from_millis(500)).await.unwrap(), 2);

        // The second increment must not push the expiry out.
        assert_eq!(
            store.expiry("c").await.unwrap(),
            KeyExpiry::Expires(Duration::from_millis(200))
        );

        clock.advance(Duration::from_millis(200));
        assert_eq!(store.get_counter("c").await.unwrap(), None);
        assert_eq!(store.increment_window("c", Duration::from_millis(500)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_log_append_trims_and_orders() {
        let (_clock, store) = store();
        let ttl = Duration::from_secs(1);

        store.log_append("l", 0, 100, "a", ttl).await.unwrap();
        store.log_append("l", 0, 50, "b", ttl).await.unwrap();
        let snap = store.log_append("l", 60, 200, "c", ttl).await.unwrap();

        assert_eq!(snap.count, 2);
        assert_eq!(snap.oldest, Some(100));

        let peek = store.log_peek("l", 150).await.unwrap();
        assert_eq!(peek, LogSnapshot { count: 1, oldest: Some(200) });
    }

    #[tokio::test]
    async fn test_compare_and_set_guards_on_field() {
        let (_clock, store) = store();
        let ttl = Duration::from_secs(5);
        let fields = [("tokens", "4".to_string()), ("version", "1".to_string())];

        // A guarded write against an absent key with a stale expectation fails
        assert!(!store
            .hash_compare_and_set("h", "version", Some("0"), &fields, ttl)
            .await
            .unwrap());
        assert_eq!(store.expiry("h").await.unwrap(), KeyExpiry::Missing);

        assert!(store
            .hash_compare_and_set("h", "version", None, &fields, ttl)
            .await
            .unwrap());
        assert!(!store
            .hash_compare_and_set("h", "version", None, &fields, ttl)
            .await
            .unwrap());

        let next = [("tokens", "3".to_string()), ("version", "2".to_string())];
        assert!(store
            .hash_compare_and_set("h", "version", Some("1"), &next, ttl)
            .await
            .unwrap());
        assert_eq!(store.hash_get_all("h").await.unwrap()["tokens"], "3");
    }

    #[tokio::test]
    async fn test_hash_increment_accumulates() {
        let (_clock, store) = store();
        let ttl = Duration::from_secs(5);

        store
            .hash_increment("s", &[("route", "/a".to_string())], &[("total", 1)], ttl)
            .await
            .unwrap();
        store
            .hash_increment("s", &[], &[("total", 2), ("blocked", 1)], ttl)
            .await
            .unwrap();

        let fields = store.hash_get_all("s").await.unwrap();
        assert_eq!(fields["total"], "3");
        assert_eq!(fields["blocked"], "1");
        assert_eq!(fields["route"], "/a");
    }

    #[tokio::test]
    async fn test_wrong_type_is_corrupt() {
        let (_clock, store) = store();
        store.insert_persistent("k", 3);

        let err = store.hash_get_all("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_scan_prefix_pages() {
        let (_clock, store) = store();
        for i in 0..5 {
            store.insert_persistent(&format!("p:{}", i), 1);
        }
        store.insert_persistent("other", 1);

        let first = store.scan_prefix("p:", 0, 3).await.unwrap();
        assert_eq!(first.keys.len(), 3);
        assert_ne!(first.cursor, 0);

        let second = store.scan_prefix("p:", first.cursor, 3).await.unwrap();
        assert_eq!(second.keys.len(), 2);
        assert_eq!(second.cursor, 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let (_clock, store) = store();
        store.set_available(false);

        let err = store.get_counter("x").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.set_available(true);
        assert_eq!(store.get_counter("x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_windows_are_reclaimed() {
        let (clock, store) = store();
        let start = clock.now_millis();

        // One counter per successive one-second window, each dead by the next
        for i in 0..1_100u64 {
            let window_start = start + i * 1_000;
            clock.set(window_start);
            store
                .increment_window(&format!("w:{}", window_start), Duration::from_millis(1_000))
                .await
                .unwrap();
        }

        assert_eq!(store.len(), 1);
        assert!(store.record_count() < 100);

        store.scan_prefix("w:", 0, 10).await.unwrap();
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_purge_expired_counts_removals() {
        let (clock, store) = store();
        store.insert_persistent("keep", 1);
        store.data.insert(
            "gone".to_string(),
            Record {
                value: Value::Counter(1),
                expires_at: Some(clock.now_millis()),
            },
        );

        assert_eq!(store.record_count(), 2);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates() {
        let (_clock, store) = store();
        store.increment_window("c", Duration::MAX).await.unwrap();
        assert!(matches!(store.expiry("c").await.unwrap(), KeyExpiry::Expires(_)));
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let (_clock, store) = store();
        store.insert_persistent("d", 1);

        assert!(store.delete("d").await.unwrap());
        assert!(!store.delete("d").await.unwrap());
        assert!(store.is_empty());
    }
}
