//! Resilience layer protecting calls to the external inference provider.
//!
//! Two cooperating subsystems: per-dependency circuit breakers that fail
//! fast when a model endpoint is unhealthy, and an exponential-backoff
//! retry executor that absorbs transient failures.
//!
//! # Main types
//!
//! - [`CircuitBreaker`] — Three-state breaker (closed / open / half-open).
//! - [`BreakerRegistry`] — Lazily-created, isolated breaker per dependency.
//! - [`BreakerEvent`] — State-transition events for external consumption.
//! - [`RetryExecutor`] — Backoff-with-jitter wrapper around a fallible call.
//! - [`is_retryable`] — Transient/permanent error classification.

/// Circuit breaker state machine and registry.
pub mod breaker;
/// Retry executor and error classification.
pub mod retry;

pub use breaker::{BreakerEvent, BreakerRegistry, BreakerStatus, CircuitBreaker, CircuitState};
pub use retry::{is_retryable, RetryExecutor, RetryStats, RetryStatsSnapshot};
