//! The dispatcher: a state-machine conversation engine that routes turns
//! between the fixed worker roster, applies their state deltas, and
//! degrades to a clean finish on every failure path.
//!
//! # Main types
//!
//! - [`Dispatcher`] — The per-request run loop: router decision, worker
//!   dispatch, self-loop retry, safety ceilings.
//! - [`DecisionEngine`] — Four-level routing decision fallback chain,
//!   ending in infallible rule-based routing.
//! - [`Worker`] — The roster seam; five fixed implementations.
//! - [`ArtifactStore`] — Current-per-kind view of produced documents.
//! - [`DispatchEvent`] — Stream events mirrored to SSE by the gateway.

/// Current-per-kind artifact view.
pub mod artifacts;
/// Routing decision fallback chain.
pub mod decision;
/// Stream events.
pub mod events;
/// The dispatcher run loop.
pub mod graph;
/// Worker trait and the fixed roster.
pub mod workers;

pub use artifacts::ArtifactStore;
pub use decision::{DecisionEngine, DecisionLevelCounts, RouteDecision};
pub use events::DispatchEvent;
pub use graph::{DispatchReport, Dispatcher};
pub use workers::{standard_roster, Worker, WorkerContext};
