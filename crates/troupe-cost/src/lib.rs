//! Cost tracking, budget enforcement, and cost-aware model routing.
//!
//! Every inference call is logged as an immutable [`UsageRecord`]; the
//! [`CostLedger`] answers budget and aggregate-cost queries over them, and
//! the [`ModelRouter`] picks the cheapest acceptable model tier for each
//! worker/query pair.
//!
//! # Main types
//!
//! - [`CostLedger`] — Durable usage log with budget enforcement and
//!   summaries/projections.
//! - [`UsageStore`] — Storage seam (in-memory and SQLite implementations).
//! - [`ModelRouter`] — Pure decision function: pinning, complexity
//!   heuristics, auto-upgrade on repeated failure.
//! - [`ModelTier`] — Light / standard / premium model tiers.

/// Usage records, storage seam, and the cost ledger.
pub mod ledger;
/// Per-model pricing table and cost computation.
pub mod pricing;
/// Cost-aware model selection.
pub mod router;

pub use ledger::{
    AgentCost, CostLedger, CostProjection, CostSummary, InMemoryUsageStore, SqliteUsageStore,
    Trend, UsageFilter, UsageRecord, UsageStore,
};
pub use pricing::{compute_cost, pricing_for, ModelPricing};
pub use router::{estimate_complexity, ModelChoice, ModelRouter, ModelTier, QueryComplexity, TierModels};
