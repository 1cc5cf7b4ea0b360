//! Configuration management for Turnstile.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Environment variable prefix for overrides, e.g. `TURNSTILE__STORE__URL`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for a Turnstile engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; the in-process store is used when unset
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix of every key the engine writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for a single store round trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Whether state lives in a store other processes can see.
    pub fn is_shared(&self) -> bool {
        self.url.as_deref().is_some_and(|url| !url.trim().is_empty())
    }
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

fn default_timeout_ms() -> u64 {
    100
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Guarded write attempts per token bucket check
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,

    /// Record per route/identifier usage for `metrics`
    #[serde(default = "default_record_stats")]
    pub record_stats: bool,

    /// Lifetime of usage statistics in seconds
    #[serde(default = "default_stats_ttl")]
    pub stats_ttl_secs: u64,

    /// How long a metrics report is reused, in milliseconds
    #[serde(default = "default_metrics_cache_ttl")]
    pub metrics_cache_ttl_ms: u64,

    /// Entries kept in each metrics ranking
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Keys requested per scan page
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,

    /// Interval between cleanup passes in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cas_attempts: default_max_cas_attempts(),
            record_stats: default_record_stats(),
            stats_ttl_secs: default_stats_ttl(),
            metrics_cache_ttl_ms: default_metrics_cache_ttl(),
            top_n: default_top_n(),
            scan_batch_size: default_scan_batch_size(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_max_cas_attempts() -> u32 {
    10
}

fn default_record_stats() -> bool {
    true
}

fn default_stats_ttl() -> u64 {
    3600
}

fn default_metrics_cache_ttl() -> u64 {
    5000
}

fn default_top_n() -> usize {
    10
}

fn default_scan_batch_size() -> usize {
    500
}

fn default_cleanup_interval() -> u64 {
    300
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TurnstileConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file overlaid with
    /// `TURNSTILE__SECTION__FIELD` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder
                .add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.key_prefix.is_empty() {
            return Err(TurnstileError::Config("store.key_prefix must not be empty".to_string()));
        }
        if self.store.timeout_ms == 0 {
            return Err(TurnstileError::Config("store.timeout_ms must be positive".to_string()));
        }
        if self.engine.max_cas_attempts == 0 {
            return Err(TurnstileError::Config(
                "engine.max_cas_attempts must be positive".to_string(),
            ));
        }
        if self.engine.scan_batch_size == 0 || self.engine.top_n == 0 {
            return Err(TurnstileError::Config(
                "engine.scan_batch_size and engine.top_n must be positive".to_string(),
            ));
        }
        if self.engine.cleanup_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "engine.cleanup_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl EngineConfig {
    pub fn stats_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_ttl_secs)
    }

    pub fn metrics_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.metrics_cache_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}
