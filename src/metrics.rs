//! Usage aggregation for observability.
//!
//! The engine keeps one small statistics hash per `(route, identifier)` in
//! the store. [`aggregate`] folds a scan of those hashes into a
//! [`RateLimitMetrics`] report, and [`MetricsCache`] memoises the report per
//! engine instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::Clock;

/// Statistics hash field holding the raw identifier.
pub const FIELD_IDENTIFIER: &str = "identifier";
/// Statistics hash field holding the raw route.
pub const FIELD_ROUTE: &str = "route";
/// Statistics hash field counting checks.
pub const FIELD_TOTAL: &str = "total";
/// Statistics hash field counting denials.
pub const FIELD_BLOCKED: &str = "blocked";

/// Usage recorded for one `(route, identifier)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSample {
    pub identifier: String,
    pub route: String,
    pub total: u64,
    pub blocked: u64,
}

impl UsageSample {
    /// Rebuild a sample from a statistics hash. Returns `None` for hashes
    /// that are missing the identifying fields.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let count = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Some(Self {
            identifier: fields.get(FIELD_IDENTIFIER)?.clone(),
            route: fields.get(FIELD_ROUTE)?.clone(),
            total: count(FIELD_TOTAL),
            blocked: count(FIELD_BLOCKED),
        })
    }
}

/// A route or identifier ranked by how often it was limited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedEntry {
    pub name: String,
    pub blocked: u64,
}

/// Aggregate view of recent admission activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitMetrics {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub top_limited_routes: Vec<RankedEntry>,
    pub top_limited_identifiers: Vec<RankedEntry>,
    /// `false` when the scan stopped early and the numbers are partial
    pub complete: bool,
}

/// Fold samples into a report keeping the `top_n` most limited routes and
/// identifiers.
pub fn aggregate<I>(samples: I, top_n: usize, complete: bool) -> RateLimitMetrics
where
    I: IntoIterator<Item = UsageSample>,
{
    let mut metrics = RateLimitMetrics {
        complete,
        ..Default::default()
    };
    let mut routes: HashMap<String, u64> = HashMap::new();
    let mut identifiers: HashMap<String, u64> = HashMap::new();

    for sample in samples {
        metrics.total_requests += sample.total;
        metrics.blocked_requests += sample.blocked;
        if sample.blocked > 0 {
            *routes.entry(sample.route).or_default() += sample.blocked;
            *identifiers.entry(sample.identifier).or_default() += sample.blocked;
        }
    }

    metrics.top_limited_routes = rank(routes, top_n);
    metrics.top_limited_identifiers = rank(identifiers, top_n);
    metrics
}

fn rank(counts: HashMap<String, u64>, top_n: usize) -> Vec<RankedEntry> {
    let mut ranked: Vec<RankedEntry> = counts
        .into_iter()
        .map(|(name, blocked)| RankedEntry { name, blocked })
        .collect();
    ranked.sort_by(|a, b| b.blocked.cmp(&a.blocked).then_with(|| a.name.cmp(&b.name)));
    ranked.truncate(top_n);
    ranked
}

/// Time-bounded memo of the last metrics report.
pub struct MetricsCache {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    slot: Mutex<Option<(u64, RateLimitMetrics)>>,
}

impl MetricsCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// The cached report, if it is younger than the TTL.
    pub fn get(&self) -> Option<RateLimitMetrics> {
        let now = self.clock.now_millis();
        let ttl = self.ttl.as_millis() as u64;
        let mut slot = self.slot.lock();
        let fresh = matches!(slot.as_ref(), Some((stored_at, _)) if now < stored_at + ttl);
        if fresh {
            slot.as_ref().map(|(_, metrics)| metrics.clone())
        } else {
            *slot = None;
            None
        }
    }

    pub fn put(&self, metrics: RateLimitMetrics) {
        *self.slot.lock() = Some((self.clock.now_millis(), metrics));
    }

    pub fn invalidate(&self) {
        *self.slot.lock() = None;
    }
}
