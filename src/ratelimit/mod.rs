//! Rate limiting algorithms and the engine that composes them.

mod algorithm;
mod engine;
mod fixed_window;
mod key;
mod policy;
mod result;
mod rules;
mod sliding_window;
mod token_bucket;

pub use algorithm::LimitAlgorithm;
pub use engine::{most_restrictive, spawn_cleanup_task, RateLimitEngine};
pub use fixed_window::{window_bounds, FixedWindow};
pub use key::KeySpace;
pub use policy::{Algorithm, KeyGenerator, RateLimitConfig};
pub use result::{LimitStatus, RateLimitResult};
pub use rules::{AlgorithmKind, LimitRule, PolicySet};
pub use sliding_window::SlidingWindowLog;
pub use token_bucket::TokenBucket;
