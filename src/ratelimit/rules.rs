//! Route policy files.
//!
//! A policy file maps routes to the limits that guard them:
//!
//! ```yaml
//! default:
//!   - algorithm: fixed_window
//!     window_ms: 60000
//!     max: 100
//! routes:
//!   /login:
//!     - algorithm: sliding_window
//!       window_ms: 60000
//!       max: 5
//!   /api/*:
//!     - algorithm: token_bucket
//!       window_ms: 1000
//!       max: 10
//!       refill_rate: 5.0
//!       bucket_size: 20
//! ```
//!
//! Routes ending in `*` match by prefix. Every rule is validated into a
//! [`RateLimitConfig`] when the file is loaded, so a bad file never reaches
//! the engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::policy::{Algorithm, RateLimitConfig};
use crate::error::{Result, TurnstileError};

/// Algorithm names accepted in policy files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

/// One limit as written in a policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRule {
    pub algorithm: AlgorithmKind,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Admissions per window
    pub max: u64,
    /// Tokens per second, token buckets only
    #[serde(default)]
    pub refill_rate: Option<f64>,
    /// Bucket capacity, token buckets only
    #[serde(default)]
    pub bucket_size: Option<u64>,
    #[serde(default)]
    pub skip_successful_requests: bool,
    #[serde(default)]
    pub skip_failed_requests: bool,
}

impl LimitRule {
    /// Validate the rule into an engine policy.
    pub fn to_config(&self) -> Result<RateLimitConfig> {
        let algorithm = match self.algorithm {
            AlgorithmKind::FixedWindow => Algorithm::FixedWindow,
            AlgorithmKind::SlidingWindow => Algorithm::SlidingWindow,
            AlgorithmKind::TokenBucket => {
                let (Some(refill_rate), Some(bucket_size)) = (self.refill_rate, self.bucket_size)
                else {
                    return Err(TurnstileError::Config(
                        "token_bucket rules need refill_rate and bucket_size".to_string(),
                    ));
                };
                Algorithm::TokenBucket {
                    refill_rate,
                    bucket_size,
                }
            }
        };
        let config = RateLimitConfig::new(algorithm, Duration::from_millis(self.window_ms), self.max)?
            .with_skip_successful_requests(self.skip_successful_requests)
            .with_skip_failed_requests(self.skip_failed_requests);
        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    default: Vec<LimitRule>,
    #[serde(default)]
    routes: HashMap<String, Vec<LimitRule>>,
}

/// Validated limits per route.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    default: Vec<RateLimitConfig>,
    exact: HashMap<String, Vec<RateLimitConfig>>,
    /// Prefix routes, longest first
    prefixes: Vec<(String, Vec<RateLimitConfig>)>,
}

impl PolicySet {
    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading route policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse policies: {}", e)))?;

        let mut set = PolicySet {
            default: compile("default", &file.default)?,
            ..Default::default()
        };
        for (route, rules) in &file.routes {
            if rules.is_empty() {
                return Err(TurnstileError::Config(format!("route {} has no limits", route)));
            }
            let configs = compile(route, rules)?;
            match route.strip_suffix('*') {
                Some(prefix) => set.prefixes.push((prefix.to_string(), configs)),
                None => {
                    set.exact.insert(route.clone(), configs);
                }
            }
        }
        set.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        info!(
            routes = set.exact.len() + set.prefixes.len(),
            default = set.default.len(),
            "Route policies loaded"
        );
        Ok(set)
    }

    /// Limits guarding `route`: an exact entry, else the longest matching
    /// prefix entry, else the defaults. `None` when nothing applies.
    pub fn limits_for(&self, route: &str) -> Option<&[RateLimitConfig]> {
        if let Some(configs) = self.exact.get(route) {
            return Some(configs);
        }
        if let Some((_, configs)) = self
            .prefixes
            .iter()
            .find(|(prefix, _)| route.starts_with(prefix.as_str()))
        {
            return Some(configs);
        }
        if self.default.is_empty() {
            None
        } else {
            Some(&self.default)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_empty() && self.exact.is_empty() && self.prefixes.is_empty()
    }
}

fn compile(route: &str, rules: &[LimitRule]) -> Result<Vec<RateLimitConfig>> {
    rules
        .iter()
        .map(|rule| {
            rule.to_config().map_err(|e| {
                TurnstileError::Config(format!("invalid limit for {}: {}", route, e))
            })
        })
        .collect()
}
