//! Admission decisions and quota snapshots.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::policy::RateLimitConfig;
use crate::clock::to_datetime;

/// The outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The ceiling `remaining` counts down from
    pub limit: u64,
    /// Quota left in the current window or bucket
    pub remaining: u64,
    /// When the quota is fully replenished
    pub reset_time: DateTime<Utc>,
    /// How long to wait before retrying; only set on denial
    pub retry_after: Option<Duration>,
}

impl RateLimitResult {
    pub fn allowed(limit: u64, remaining: u64, reset_at_ms: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: remaining.min(limit),
            reset_time: to_datetime(reset_at_ms),
            retry_after: None,
        }
    }

    pub fn denied(limit: u64, reset_at_ms: u64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_time: to_datetime(reset_at_ms),
            retry_after: Some(retry_after),
        }
    }

    /// The answer given when the store cannot be consulted.
    pub fn fail_open(config: &RateLimitConfig, now: u64) -> Self {
        Self::allowed(config.limit(), config.limit(), now.saturating_add(config.window_millis()))
    }

    /// `retry_after` rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| {
            let secs = d.as_secs();
            if d.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        })
    }
}

/// A read-only view of a limit's current usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitStatus {
    /// Units consumed in the current window, or tokens missing from the bucket
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
}

impl LimitStatus {
    pub fn new(current: u64, limit: u64, reset_at_ms: u64) -> Self {
        Self {
            current,
            limit,
            remaining: limit.saturating_sub(current),
            reset_time: to_datetime(reset_at_ms),
        }
    }
}
