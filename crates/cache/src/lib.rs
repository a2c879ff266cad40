//! Redis-backed shared state for multi-node deployments.

#![warn(clippy::unwrap_used)]

pub mod limiter;

pub use limiter::RedisRateLimiter;
