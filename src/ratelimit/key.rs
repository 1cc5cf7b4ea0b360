//! Store key derivation.

use super::policy::RateLimitConfig;
use crate::error::{Result, TurnstileError};

/// Owns the naming of every key the engine writes.
///
/// Default keys look like `{prefix}:{namespace}:{fingerprint}:{route}:{identifier}`
/// with `%` and `:` escaped in the route and identifier. The fingerprint
/// carries the policy parameters, so two limits of the same algorithm on one
/// request keep separate records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space rooted at `prefix`.
    pub fn new(prefix: &str) -> Result<Self> {
        if prefix.is_empty() {
            return Err(TurnstileError::Config(
                "key prefix must not be empty".to_string(),
            ));
        }
        Ok(Self {
            prefix: prefix.to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix shared by every key in this space.
    pub fn namespace(&self) -> String {
        format!("{}:", self.prefix)
    }

    /// Key for the limit record of `(identifier, route)` under `config`.
    ///
    /// A configured key generator is used verbatim.
    pub fn derive_key(&self, identifier: &str, route: &str, config: &RateLimitConfig) -> String {
        if let Some(generator) = config.key_generator() {
            return generator(identifier, route);
        }
        format!(
            "{}:{}:{}:{}:{}",
            self.prefix,
            config.algorithm().namespace(),
            config.fingerprint(),
            escape(route),
            escape(identifier)
        )
    }

    /// Key for the usage statistics of `(identifier, route)`.
    pub fn stats_key(&self, identifier: &str, route: &str) -> String {
        format!("{}{}:{}", self.stats_prefix(), escape(route), escape(identifier))
    }

    /// Prefix shared by every statistics key.
    pub fn stats_prefix(&self) -> String {
        format!("{}:stats:", self.prefix)
    }
}

fn escape(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}
