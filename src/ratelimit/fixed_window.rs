//! Fixed-window counter.
//!
//! One counter per `(key, window_start)` where windows are aligned to
//! multiples of the configured length. The counter expires at its window's
//! end, so a new window always starts from zero.
//!
//! A burst that straddles a boundary can see up to `2 * max` admissions in a
//! short span: `max` at the end of one window and `max` at the start of the
//! next. The sliding-window log does not have this property.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::algorithm::LimitAlgorithm;
use super::policy::RateLimitConfig;
use super::result::{LimitStatus, RateLimitResult};
use crate::store::{RateLimitStore, StoreResult};

/// The fixed-window counter algorithm.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedWindow;

/// Start and end (epoch ms) of the window containing `now`.
pub fn window_bounds(now: u64, window_ms: u64) -> (u64, u64) {
    let start = (now / window_ms) * window_ms;
    (start, start.saturating_add(window_ms))
}

fn window_key(key: &str, window_start: u64) -> String {
    format!("{}:{}", key, window_start)
}

#[async_trait]
impl LimitAlgorithm for FixedWindow {
    async fn check(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> StoreResult<RateLimitResult> {
        let (start, end) = window_bounds(now, config.window_millis());
        let until_reset = Duration::from_millis(end - now);

        let count = store
            .increment_window(&window_key(key, start), until_reset)
            .await?;

        trace!(key = %key, window = start, count = count, max = config.max(), "Fixed window check");

        if count <= config.max() {
            Ok(RateLimitResult::allowed(config.max(), config.max() - count, end))
        } else {
            Ok(RateLimitResult::denied(config.max(), end, until_reset))
        }
    }

    async fn status(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> StoreResult<LimitStatus> {
        let (start, end) = window_bounds(now, config.window_millis());
        let count = store.get_counter(&window_key(key, start)).await?.unwrap_or(0);
        Ok(LimitStatus::new(count, config.max(), end))
    }

    async fn reset(
        &self,
        store: &dyn RateLimitStore,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> StoreResult<()> {
        let (start, _) = window_bounds(now, config.window_millis());
        store.delete(&window_key(key, start)).await?;
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

    fn setup() -> (Arc<ManualClock>, MemoryStore, RateLimitConfig) {
        let clock = Arc::new(ManualClock::new(T0 + 200));
        let store = MemoryStore::with_clock(clock.clone());
        let config = RateLimitConfig::fixed_window(Duration::from_millis(1000), 3).unwrap();
        (clock, store, config)
    }

    #[test]
    fn test_window_bounds() {
        assert_eq!(window_bounds(1_234, 1_000), (1_000, 2_000));
        assert_eq!(window_bounds(2_000, 1_000), (2_000, 3_000));
        assert_eq!(window_bounds(u64::MAX - 5, 1_000).1, u64::MAX);
    }

    #[tokio::test]
    async fn test_login_scenario() {
        let (clock, store, config) = setup();
        let now = clock.now_millis();

        for expected in [2, 1, 0] {
            let result = FixedWindow.check(&store, "k", &config, now).await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
            assert!(result.retry_after.is_none());
        }

        let result = FixedWindow.check(&store, "k", &config, now).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after, Some(Duration::from_millis(800)));
        assert_eq!(result.reset_time.timestamp_millis() as u64, T0 + 1000);
    }

    #[tokio::test]
    async fn test_counter_resets_after_boundary() {
        let (clock, store, config) = setup();

        for _ in 0..4 {
            FixedWindow.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        }

        clock.set(T0 + 1000);
        for _ in 0..3 {
            let result = FixedWindow.check(&store, "k", &config, clock.now_millis()).await.unwrap();
            assert!(result.allowed);
        }
        let result = FixedWindow.check(&store, "k", &config, clock.now_millis()).await.unwrap();
        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn test_boundary_burst_admits_twice_max() {
        // Known limitation of fixed windows: 2 * max admissions within 2 ms.
        let (clock, store, config) = setup();

        clock.set(T0 + 999);
        let mut admitted = 0;
        for _ in 0..3 {
            if FixedWindow.check(&store, "k", &config, clock.now_millis()).await.unwrap().allowed {
                admitted += 1;
            }
        }
        clock.set(T0 + 1000);
        for _ in 0..3 {
            if FixedWindow.check(&store, "k", &config, clock.now_millis()).await.unwrap().allowed {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 6);
    }

    #[tokio::test]
    async fn test_counter_expires_at_window_end() {
        let (clock, store, config) = setup();
        FixedWindow.check(&store, "k", &config, clock.now_millis()).await.unwrap();

        let expiry = store.expiry(&window_key("k", T0)).await.unwrap();
        assert_eq!(expiry, KeyExpiry::Expires(Duration::from_millis(800)));
    }

    #[tokio::test]
    async fn test_status_does_not_increment() {
        let (clock, store, config) = setup();
        let now = clock.now_millis();
        FixedWindow.check(&store, "k", &config, now).await.unwrap();

        for _ in 0..3 {
            let status = FixedWindow.status(&store, "k", &config, now).await.unwrap();
            assert_eq!(status.current, 1);
            assert_eq!(status.remaining, 2);
        }
    }

    #[tokio::test]
    async fn test_reset_clears_current_window() {
        let (clock, store, config) = setup();
        let now = clock.now_millis();
        for _ in 0..3 {
            FixedWindow.check(&store, "k", &config, now).await.unwrap();
        }

        FixedWindow.reset(&store, "k", &config, now).await.unwrap();
        FixedWindow.reset(&store, "k", &config, now).await.unwrap();

        let status = FixedWindow.status(&store, "k", &config, now).await.unwrap();
        assert_eq!(status.remaining, 3);
    }
}
