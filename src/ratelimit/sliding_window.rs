//! Sliding-window log.
//!
//! Every check is recorded as a timestamped entry in an ordered log; entries
//! older than `now - window` are trimmed before counting. Denied checks are
//! recorded too, so a caller that keeps hammering a limit stays limited.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;
use uuid::Uuid;

use super::algorithm::LimitAlgorithm;
use super::policy::RateLimitConfig;
use super::result::{LimitStatus, RateLimitResult};
use crate::store::{RateLimitStore, StoreResult};

/// The sliding-window log algorithm.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlidingWindowLog;

#[async_trait]
impl LimitAlgorithm for SlidingWindowLog {
    async fn check(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> StoreResult<RateLimitResult> {
        let window = config.window_millis();
        let window_start = now.saturating_sub(window);
        // Same-millisecond checks need distinct members to all be counted.
        let member = format!("{}-{}", now, Uuid::new_v4().simple());

        let snapshot = store
            .log_append(key, window_start, now, &member, config.window())
            .await?;
        let oldest = snapshot.oldest.unwrap_or(now);
        let reset_at = oldest.saturating_add(window);

        trace!(key = %key, count = snapshot.count, max = config.max(), "Sliding window check");

        if snapshot.count <= config.max() {
            Ok(RateLimitResult::allowed(
                config.max(),
                config.max() - snapshot.count,
                reset_at,
            ))
        } else {
            let wait = reset_at.saturating_sub(now).max(1);
            Ok(RateLimitResult::denied(
                config.max(),
                reset_at,
                Duration::from_millis(wait),
            ))
        }
    }

    async fn status(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> StoreResult<LimitStatus> {
        let window = config.window_millis();
        let snapshot = store.log_peek(key, now.saturating_sub(window)).await?;
        let reset_at = snapshot.oldest.map(|ts| ts.saturating_add(window)).unwrap_or(now);
        Ok(LimitStatus::new(snapshot.count, config.max(), reset_at))
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
    use crate::ratelimit::fixed_window::FixedWindow;
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Arc;

    const T0: u64 = 1_700_000_000_000;

    fn setup(max: u64) -> (Arc<ManualClock>, MemoryStore, RateLimitConfig) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = MemoryStore::with_clock(clock.clone());
        let config = RateLimitConfig::sliding_window(Duration::from_millis(1000), max).unwrap();
        (clock, store, config)
    }

    #[tokio::test]
    async fn test_admits_up_to_max() {
        let (clock, store, config) = setup(3);

        for expected in [2, 1, 0] {
            let result = SlidingWindowLog.check(&store, "k", &config, clock.now_millis()).await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
        }
        let result = SlidingWindowLog.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_retry_after_uses_oldest_entry() {
        let (clock, store, config) = setup(2);

        SlidingWindowLog.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        clock.advance(Duration::from_millis(300));
        SlidingWindowLog.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        clock.advance(Duration::from_millis(100));

        let result = SlidingWindowLog.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        assert!(!result.allowed);
        // Oldest entry at T0 leaves the window at T0 + 1000; now is T0 + 400
        assert_eq!(result.retry_after, Some(Duration::from_millis(600)));
        assert_eq!(result.reset_time.timestamp_millis() as u64, T0 + 1000);
    }

    #[tokio::test]
    async fn test_entries_leave_the_window() {
        let (clock, store, config) = setup(2);

        SlidingWindowLog.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        SlidingWindowLog.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        clock.advance(Duration::from_millis(1001));

        let result = SlidingWindowLog.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
    }

    #[tokio::test]
    async fn test_boundary_straddle_never_exceeds_max() {
        let (clock, store, config) = setup(3);
        let fixed_store = MemoryStore::with_clock(clock.clone());
        let fixed = RateLimitConfig::fixed_window(Duration::from_millis(1000), 3).unwrap();

        // Bursts at the tail of one aligned window and the head of the next.
        let mut sliding_admitted: Vec<u64> = Vec::new();
        let mut fixed_admitted = 0;
        for at in [T0 + 998, T0 + 999, T0 + 999, T0 + 1000, T0 + 1000, T0 + 1001] {
            clock.set(at);
            if SlidingWindowLog.check(&store, "k", &config, at).await.unwrap().allowed {
                sliding_admitted.push(at);
            }
            if FixedWindow.check(&fixed_store, "k", &fixed, at).await.unwrap().allowed {
                fixed_admitted += 1;
            }
        }

        assert_eq!(sliding_admitted.len(), 3);
        assert_eq!(fixed_admitted, 6);
    }

    #[tokio::test]
    async fn test_trailing_window_property() {
        let (clock, store, config) = setup(5);
        let window = config.window_millis();

        // A deterministic but irregular arrival pattern over several windows.
        let mut admitted: VecDeque<u64> = VecDeque::new();
        let mut all_admitted = Vec::new();
        let mut now = T0;
        for i in 0..400u64 {
            now += (i * 37) % 53;
            clock.set(now);
            if SlidingWindowLog.check(&store, "k", &config, now).await.unwrap().allowed {
                admitted.push_back(now);
                all_admitted.push(now);
            }
            while let Some(&front) = admitted.front() {
                if front + window <= now {
                    admitted.pop_front();
                } else {
                    break;
                }
            }
            assert!(admitted.len() as u64 <= config.max());
        }

        // Check every trailing interval that ends at an admission.
        for (i, &end) in all_admitted.iter().enumerate() {
            let in_window = all_admitted[..=i]
                .iter()
                .filter(|&&ts| ts + window > end)
                .count();
            assert!(in_window as u64 <= config.max());
        }
        assert!(!all_admitted.is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_without_recording() {
        let (clock, store, config) = setup(3);
        SlidingWindowLog.check(&store, "k", &config, clock.now_millis()).await.unwrap();

        let status = SlidingWindowLog.status(&store, "k", &config, clock.now_millis()).await.unwrap();
        assert_eq!(status.current, 1);
        let again = SlidingWindowLog.status(&store, "k", &config, clock.now_millis()).await.unwrap();
        assert_eq!(again.current, 1);
        assert_eq!(again.remaining, 2);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let (clock, store, config) = setup(1);
        SlidingWindowLog.check(&store, "k", &config, clock.now_millis()).await.unwrap();

        SlidingWindowLog.reset(&store, "k", &config, clock.now_millis()).await.unwrap();
        SlidingWindowLog.reset(&store, "k", &config, clock.now_millis()).await.unwrap();

        let result = SlidingWindowLog.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        assert!(result.allowed);
    }
}
