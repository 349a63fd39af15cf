//! Admission control for the gateway: access tiers and a sliding-window
//! rate limiter with burst and sustained ceilings.
//!
//! # Main types
//!
//! - [`AccessTier`] — Anonymous through admin, each mapped to limits.
//! - [`RateLimiter`] — Dual sliding windows (minute burst, hourly
//!   sustained) per caller key, with allow-list bypass and a tier cache.
//! - [`rate_limit_middleware`] — Axum layer converting rejections into
//!   `429` with `Retry-After`.

/// Sliding-window rate limiter.
pub mod limiter;
/// Axum middleware wiring.
pub mod middleware;
/// Access tiers and their limits.
pub mod tiers;

pub use limiter::{Admission, RateLimiter};
pub use middleware::{rate_limit_middleware, GateState};
pub use tiers::AccessTier;
