//! Turnstile - Distributed Admission Control
//!
//! This crate decides whether a request from a given identifier to a given
//! route may proceed. Limits are enforced with fixed-window counters,
//! sliding-window logs or token buckets whose state lives in a shared store,
//! so every engine instance pointed at the same store enforces the same
//! limits. When the store is unreachable the engine admits requests rather
//! than failing them.

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod store;
