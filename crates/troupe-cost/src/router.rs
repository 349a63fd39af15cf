use crate::pricing::{compute_cost, pricing_for};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use troupe_core::{ProviderSettings, WorkerId};

/// Token counts assumed for savings estimates when the real usage is not
/// yet known.
const ASSUMED_TOKENS_IN: u64 = 1_500;
const ASSUMED_TOKENS_OUT: u64 = 600;

/// Consecutive failures on a tier before the router upgrades past it.
const UPGRADE_THRESHOLD: u32 = 3;

/// How long an auto-upgrade sticks before the tier is retried.
const UPGRADE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Capability tier a query can be routed to, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Cheapest model, simple queries.
    Light,
    /// Default mid-range model.
    Standard,
    /// Most capable model.
    Premium,
}

impl ModelTier {
    /// The next tier up, saturating at premium.
    pub fn next(self) -> Self {
        match self {
            Self::Light => Self::Standard,
            Self::Standard | Self::Premium => Self::Premium,
        }
    }
}

/// Concrete model identifiers backing each tier.
#[derive(Debug, Clone)]
pub struct TierModels {
    /// Model used for the light tier.
    pub light: String,
    /// Model used for the standard tier.
    pub standard: String,
    /// Model used for the premium tier.
    pub premium: String,
}

impl TierModels {
    /// Builds the tier table from provider settings.
    pub fn from_provider(settings: &ProviderSettings) -> Self {
        Self {
            light: settings.light_model.clone(),
            standard: settings.standard_model.clone(),
            premium: settings.premium_model.clone(),
        }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Light => &self.light,
            ModelTier::Standard => &self.standard,
            ModelTier::Premium => &self.premium,
        }
    }
}

/// Rough difficulty of a query, from keyword and length heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryComplexity {
    /// Lookup-style or yes/no questions.
    Simple,
    /// The default when no signal fires.
    Medium,
    /// Multi-step design, analysis, or long prompts.
    Complex,
}

const COMPLEX_MARKERS: &[&str] = &[
    "architecture",
    "design",
    "refactor",
    "analyze",
    "security",
    "vulnerability",
    "concurrency",
    "race condition",
    "optimize",
    "trade-off",
    "tradeoff",
    "migration",
    "step by step",
    "implement",
    "algorithm",
];

const MEDIUM_MARKERS: &[&str] = &[
    "explain",
    "compare",
    "summarize",
    "describe",
    "convert",
    "debug",
    "fix",
    "update",
];

const SIMPLE_MARKERS: &[&str] = &[
    "what is",
    "what's",
    "define",
    "list",
    "yes or no",
    "true or false",
    "how many",
    "rename",
    "typo",
];

/// Length past which an unmarked query is treated as complex.
const LONG_QUERY_CHARS: usize = 600;

/// Classifies a query by keyword markers, complex markers winning over
/// simple and medium ones, then by length, defaulting to medium.
pub fn estimate_complexity(query: &str) -> QueryComplexity {
    let lowered = query.to_lowercase();
    if COMPLEX_MARKERS.iter().any(|m| lowered.contains(m)) {
        return QueryComplexity::Complex;
    }
    if SIMPLE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return QueryComplexity::Simple;
    }
    if MEDIUM_MARKERS.iter().any(|m| lowered.contains(m)) {
        return QueryComplexity::Medium;
    }
    if query.len() > LONG_QUERY_CHARS {
        return QueryComplexity::Complex;
    }
    QueryComplexity::Medium
}

fn tier_for_complexity(complexity: QueryComplexity) -> ModelTier {
    match complexity {
        QueryComplexity::Simple => ModelTier::Light,
        QueryComplexity::Medium => ModelTier::Standard,
        QueryComplexity::Complex => ModelTier::Premium,
    }
}

/// The router's answer for one call.
#[derive(Debug, Clone, Serialize)]
pub struct ModelChoice {
    /// Concrete model identifier to invoke.
    pub model: String,
    /// Tier the model belongs to.
    pub tier: ModelTier,
    /// Human-readable reason for the choice.
    pub reason: String,
    /// True when the worker is pinned and heuristics were skipped.
    pub pinned: bool,
    /// Estimated savings versus always using premium, in USD.
    pub estimated_savings_usd: f64,
}

#[derive(Debug, Default)]
struct FailureTrack {
    consecutive: u32,
    upgraded_until: Option<Instant>,
}

/// Cost-aware model selection.
///
/// Planner and builder are pinned to premium; other workers get the
/// cheapest tier the query's complexity allows. Repeated failures on a
/// tier upgrade that worker past it for a window.
pub struct ModelRouter {
    models: TierModels,
    pinned: HashMap<WorkerId, ModelTier>,
    tracks: Mutex<HashMap<(WorkerId, ModelTier), FailureTrack>>,
}

impl ModelRouter {
    /// Creates a router with the default planner/builder premium pins.
    pub fn new(models: TierModels) -> Self {
        let mut pinned = HashMap::new();
        pinned.insert(WorkerId::Planner, ModelTier::Premium);
        pinned.insert(WorkerId::Builder, ModelTier::Premium);
        Self {
            models,
            pinned,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    /// Picks a model for a worker/query pair.
    pub fn select_model(&self, worker: WorkerId, query: &str) -> ModelChoice {
        self.select_model_at(worker, query, Instant::now())
    }

    /// [`Self::select_model`] against an explicit clock.
    pub fn select_model_at(&self, worker: WorkerId, query: &str, now: Instant) -> ModelChoice {
        if let Some(&tier) = self.pinned.get(&worker) {
            return self.choice(
                worker,
                tier,
                format!("{worker} is pinned to the {tier:?} tier"),
                true,
            );
        }

        let complexity = estimate_complexity(query);
        let mut tier = tier_for_complexity(complexity);

        // Honor any active auto-upgrade for this worker/tier.
        {
            let tracks = self.tracks.lock();
            while tier != ModelTier::Premium {
                let upgraded = tracks
                    .get(&(worker, tier))
                    .and_then(|t| t.upgraded_until)
                    .is_some_and(|until| now < until);
                if !upgraded {
                    break;
                }
                tier = tier.next();
            }
        }

        self.choice(
            worker,
            tier,
            format!("query classified as {complexity:?}"),
            false,
        )
    }

    fn choice(
        &self,
        worker: WorkerId,
        tier: ModelTier,
        reason: String,
        pinned: bool,
    ) -> ModelChoice {
        let model = self.models.model_for(tier).to_string();
        let premium_cost = compute_cost(
            ASSUMED_TOKENS_IN,
            ASSUMED_TOKENS_OUT,
            &pricing_for(self.models.model_for(ModelTier::Premium)),
        );
        let chosen_cost = compute_cost(ASSUMED_TOKENS_IN, ASSUMED_TOKENS_OUT, &pricing_for(&model));
        let savings = (premium_cost - chosen_cost).max(0.0);
        debug!(worker = %worker, model = %model, tier = ?tier, reason = %reason, "Model selected");
        ModelChoice {
            model,
            tier,
            reason,
            pinned,
            estimated_savings_usd: savings,
        }
    }

    /// Records a failed call on a tier. At the threshold the worker is
    /// upgraded past that tier for the window.
    pub fn record_failure(&self, worker: WorkerId, tier: ModelTier) {
        self.record_failure_at(worker, tier, Instant::now());
    }

    /// [`Self::record_failure`] against an explicit clock.
    pub fn record_failure_at(&self, worker: WorkerId, tier: ModelTier, now: Instant) {
        let mut tracks = self.tracks.lock();
        let track = tracks.entry((worker, tier)).or_default();
        track.consecutive += 1;
        if track.consecutive >= UPGRADE_THRESHOLD && tier != ModelTier::Premium {
            track.upgraded_until = Some(now + UPGRADE_WINDOW);
            track.consecutive = 0;
            info!(
                worker = %worker,
                tier = ?tier,
                "Repeated failures, upgrading worker past tier"
            );
        }
    }

    /// Records a successful call, clearing the failure streak for that
    /// worker/tier.
    pub fn record_success(&self, worker: WorkerId, tier: ModelTier) {
        let mut tracks = self.tracks.lock();
        if let Some(track) = tracks.get_mut(&(worker, tier)) {
            track.consecutive = 0;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn router() -> ModelRouter {
        ModelRouter::new(TierModels {
            light: "gpt-4o-mini".to_string(),
            standard: "gpt-4o".to_string(),
            premium: "o1".to_string(),
        })
    }

    #[test]
    fn test_complexity_markers() {
        assert_eq!(
            estimate_complexity("Please analyze the architecture"),
            QueryComplexity::Complex
        );
        assert_eq!(
            estimate_complexity("What is a mutex?"),
            QueryComplexity::Simple
        );
        assert_eq!(
            estimate_complexity("Add a flag to the parser"),
            QueryComplexity::Medium
        );
    }

    #[test]
    fn test_complex_marker_wins_over_simple() {
        assert_eq!(
            estimate_complexity("What is the best way to refactor this?"),
            QueryComplexity::Complex
        );
    }

    #[test]
    fn test_medium_marker_classifies_medium() {
        assert_eq!(
            estimate_complexity("Debug the login handler"),
            QueryComplexity::Medium
        );
        // An explicit medium marker outweighs the length rule.
        let long = format!("Explain this trace: {}", "x".repeat(700));
        assert_eq!(estimate_complexity(&long), QueryComplexity::Medium);
    }

    #[test]
    fn test_long_query_is_complex() {
        let long = "x".repeat(700);
        assert_eq!(estimate_complexity(&long), QueryComplexity::Complex);
    }

    #[test]
    fn test_planner_and_builder_pinned_premium() {
        let router = router();
        for worker in [WorkerId::Planner, WorkerId::Builder] {
            let choice = router.select_model(worker, "what is 2+2");
            assert_eq!(choice.tier, ModelTier::Premium);
            assert_eq!(choice.model, "o1");
            assert!(choice.pinned);
            assert_eq!(choice.estimated_savings_usd, 0.0);
        }
    }

    #[test]
    fn test_simple_query_routes_light() {
        let router = router();
        let choice = router.select_model(WorkerId::Tester, "what is a unit test");
        assert_eq!(choice.tier, ModelTier::Light);
        assert_eq!(choice.model, "gpt-4o-mini");
        assert!(!choice.pinned);
        assert!(choice.estimated_savings_usd > 0.0);
    }

    #[test]
    fn test_failures_upgrade_tier_within_window() {
        let router = router();
        let now = Instant::now();
        for _ in 0..3 {
            router.record_failure_at(WorkerId::Tester, ModelTier::Light, now);
        }
        let choice = router.select_model_at(WorkerId::Tester, "what is a unit test", now);
        assert_eq!(choice.tier, ModelTier::Standard);
    }

    #[test]
    fn test_upgrade_expires_after_window() {
        let router = router();
        let now = Instant::now();
        for _ in 0..3 {
            router.record_failure_at(WorkerId::Tester, ModelTier::Light, now);
        }
        let later = now + UPGRADE_WINDOW + Duration::from_secs(1);
        let choice = router.select_model_at(WorkerId::Tester, "what is a unit test", later);
        assert_eq!(choice.tier, ModelTier::Light);
    }

    #[test]
    fn test_success_clears_failure_streak() {
        let router = router();
        let now = Instant::now();
        router.record_failure_at(WorkerId::Tester, ModelTier::Light, now);
        router.record_failure_at(WorkerId::Tester, ModelTier::Light, now);
        router.record_success(WorkerId::Tester, ModelTier::Light);
        router.record_failure_at(WorkerId::Tester, ModelTier::Light, now);
        let choice = router.select_model_at(WorkerId::Tester, "what is a unit test", now);
        assert_eq!(choice.tier, ModelTier::Light);
    }

    #[test]
    fn test_chained_upgrades_reach_premium() {
        let router = router();
        let now = Instant::now();
        for _ in 0..3 {
            router.record_failure_at(WorkerId::Tester, ModelTier::Light, now);
        }
        for _ in 0..3 {
            router.record_failure_at(WorkerId::Tester, ModelTier::Standard, now);
        }
        let choice = router.select_model_at(WorkerId::Tester, "what is a unit test", now);
        assert_eq!(choice.tier, ModelTier::Premium);
    }
}
