//! Limit policies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Longest window, and longest full-bucket refill, a policy may use.
///
/// Expiry and reset times are computed in epoch milliseconds; this keeps
/// `now + window` far from overflow.
pub const MAX_WINDOW: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Custom key derivation: `(identifier, route) -> key`.
pub type KeyGenerator = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// The admission algorithm a policy runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Algorithm {
    /// One counter per aligned window
    FixedWindow,
    /// Exact log of recent checks
    SlidingWindow,
    /// Lazily refilled token count
    TokenBucket {
        /// Tokens added per second
        refill_rate: f64,
        /// Capacity of the bucket
        bucket_size: u64,
    },
}

impl Algorithm {
    /// Key namespace for records of this algorithm.
    pub fn namespace(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed",
            Algorithm::SlidingWindow => "sliding",
            Algorithm::TokenBucket { .. } => "bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::FixedWindow => write!(f, "fixed_window"),
            Algorithm::SlidingWindow => write!(f, "sliding_window"),
            Algorithm::TokenBucket {
                refill_rate,
                bucket_size,
            } => write!(f, "token_bucket({}/s, {})", refill_rate, bucket_size),
        }
    }
}

/// An immutable, validated rate limit policy.
///
/// Constructors reject non-positive windows, ceilings, refill rates and
/// bucket sizes, so a `RateLimitConfig` in hand is always usable.
#[derive(Clone)]
pub struct RateLimitConfig {
    window: Duration,
    max: u64,
    algorithm: Algorithm,
    key_generator: Option<KeyGenerator>,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
}

impl RateLimitConfig {
    /// Create a policy for any algorithm.
    pub fn new(algorithm: Algorithm, window: Duration, max: u64) -> Result<Self> {
        if window.as_millis() == 0 {
            return Err(TurnstileError::Config(
                "window must be at least one millisecond".to_string(),
            ));
        }
        if window > MAX_WINDOW {
            return Err(TurnstileError::Config(format!(
                "window must not exceed {} seconds",
                MAX_WINDOW.as_secs()
            )));
        }
        if max == 0 {
            return Err(TurnstileError::Config("max must be positive".to_string()));
        }
        if let Algorithm::TokenBucket {
            refill_rate,
            bucket_size,
        } = algorithm
        {
            if !refill_rate.is_finite() || refill_rate <= 0.0 {
                return Err(TurnstileError::Config(format!(
                    "refill_rate must be a positive number, got {}",
                    refill_rate
                )));
            }
            if bucket_size == 0 {
                return Err(TurnstileError::Config(
                    "bucket_size must be positive".to_string(),
                ));
            }
            let refill_ms = bucket_size as f64 * 1000.0 / refill_rate;
            if refill_ms > MAX_WINDOW.as_millis() as f64 {
                return Err(TurnstileError::Config(format!(
                    "refilling {} tokens at {}/s takes longer than {} seconds",
                    bucket_size,
                    refill_rate,
                    MAX_WINDOW.as_secs()
                )));
            }
        }

        Ok(Self {
            window,
            max,
            algorithm,
            key_generator: None,
            skip_successful_requests: false,
            skip_failed_requests: false,
        })
    }

    /// A fixed-window counter policy.
    pub fn fixed_window(window: Duration, max: u64) -> Result<Self> {
        Self::new(Algorithm::FixedWindow, window, max)
    }

    /// A sliding-window log policy.
    pub fn sliding_window(window: Duration, max: u64) -> Result<Self> {
        Self::new(Algorithm::SlidingWindow, window, max)
    }

    /// A token bucket policy. `window` bounds how long an idle bucket lives.
    pub fn token_bucket(
        window: Duration,
        max: u64,
        refill_rate: f64,
        bucket_size: u64,
    ) -> Result<Self> {
        Self::new(
            Algorithm::TokenBucket {
                refill_rate,
                bucket_size,
            },
            window,
            max,
        )
    }

    /// Replace default key derivation entirely.
    pub fn with_key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&str, &str) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    /// Ask the caller not to count successful requests.
    pub fn with_skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    /// Ask the caller not to count failed requests.
    pub fn with_skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_millis(&self) -> u64 {
        self.window.as_millis() as u64
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn key_generator(&self) -> Option<&KeyGenerator> {
        self.key_generator.as_ref()
    }

    pub fn skip_successful_requests(&self) -> bool {
        self.skip_successful_requests
    }

    pub fn skip_failed_requests(&self) -> bool {
        self.skip_failed_requests
    }

    /// Parameters that shape the stored record, for use in default keys.
    ///
    /// Two policies of the same algorithm with different parameters must not
    /// share a record.
    pub fn fingerprint(&self) -> String {
        match self.algorithm {
            Algorithm::TokenBucket {
                refill_rate,
                bucket_size,
            } => format!(
                "{}ms-{}-{}ps-{}",
                self.window_millis(),
                self.max,
                refill_rate,
                bucket_size
            ),
            _ => format!("{}ms-{}", self.window_millis(), self.max),
        }
    }

    /// The ceiling `remaining` is measured against: `bucket_size` for token
    /// buckets, `max` otherwise.
    pub fn limit(&self) -> u64 {
        match self.algorithm {
            Algorithm::TokenBucket { bucket_size, .. } => bucket_size,
            _ => self.max,
        }
    }
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("window", &self.window)
            .field("max", &self.max)
            .field("algorithm", &self.algorithm)
            .field("custom_key", &self.key_generator.is_some())
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .finish()
    }
}
