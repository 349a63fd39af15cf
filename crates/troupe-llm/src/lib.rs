//! Inference provider abstraction, the OpenAI-compatible HTTP client, and
//! the guarded decorator that composes budget, breaker, retry, and usage
//! logging around every call.
//!
//! # Main types
//!
//! - [`InferenceProvider`] — The provider seam every model call goes
//!   through.
//! - [`HttpProvider`] — OpenAI-compatible chat-completions client with
//!   typed error classification.
//! - [`GuardedProvider`] — Decorator: budget check, circuit breaker,
//!   retry, breaker recording, and ledger logging, in that order.

/// Guarded decorator composing the resilience and cost layers.
pub mod guarded;
/// OpenAI-compatible HTTP client.
pub mod http;
/// Provider trait and request/reply types.
pub mod provider;

pub use guarded::GuardedProvider;
pub use http::HttpProvider;
pub use provider::{InferenceProvider, InvokeRequest, ProviderOutput, ProviderReply, ToolCall};
