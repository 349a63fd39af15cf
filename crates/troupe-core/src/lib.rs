//! Core types shared across the Troupe orchestration control plane.
//!
//! This crate provides the foundational vocabulary used by every other
//! Troupe crate: error handling, conversation messages, the fixed worker
//! roster, conversation state with its merge reducers, artifacts, and
//! configuration.
//!
//! # Main types
//!
//! - [`TroupeError`] — Unified error enum for all Troupe subsystems.
//! - [`TroupeResult`] — Convenience alias for `Result<T, TroupeError>`.
//! - [`Role`] / [`Message`] — Role-tagged conversation messages.
//! - [`WorkerId`] / [`RouteTarget`] — The fixed roster and routing targets.
//! - [`ConversationState`] / [`StateDelta`] — Dispatcher state plus the pure
//!   per-field merge reducers.
//! - [`Artifact`] / [`ArtifactKind`] — Typed documents exchanged by workers.
//! - [`TroupeConfig`] — Runtime configuration with serde defaults.

/// Typed artifacts produced by workers.
pub mod artifact;
/// Runtime configuration loading and defaults.
pub mod config;
/// Unified error type.
pub mod error;
/// Conversation messages.
pub mod message;
/// The fixed worker roster and routing targets.
pub mod roster;
/// Conversation state and merge reducers.
pub mod state;

pub use artifact::{Artifact, ArtifactKind};
pub use config::{
    BreakerSettings, ProviderSettings, RetrySettings, TierLimits, TierLimitsConfig, TroupeConfig,
};
pub use error::{TroupeError, TroupeResult};
pub use message::{Message, Role};
pub use roster::{RouteTarget, WorkerId};
pub use state::{ConversationState, ErrorUpdate, StateDelta};
