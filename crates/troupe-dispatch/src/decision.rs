use crate::workers::latest_user_query;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use troupe_core::{ConversationState, RouteTarget, TroupeError, TroupeResult, WorkerId};
use troupe_llm::{InferenceProvider, InvokeRequest};

/// Agent label for routing calls in the usage log.
pub const ROUTER_AGENT: &str = "router";

const ROUTER_MAX_TOKENS: u32 = 128;

const ROUTER_PROMPT: &str = "You are the dispatcher of a software delivery \
team. Given the conversation, decide which stage should act next: planner, \
builder, tester, security, reviewer, or finish when the work is complete. \
Reply with JSON of the form {\"next\": \"<stage>\", \"reasoning\": \"<why>\"}.";

/// A routing decision and the reason it was made.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    /// Where control goes next.
    pub target: RouteTarget,
    /// Non-empty explanation of the choice.
    pub reasoning: String,
}

/// Per-level hit counters for the decision chain.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DecisionLevelCounts {
    /// Level 0: primary provider, schema-constrained.
    pub structured: u64,
    /// Level 1: primary provider, JSON extracted from free text.
    pub extracted: u64,
    /// Level 2: secondary provider, schema-constrained.
    pub secondary: u64,
    /// Level 3: rule-based routing, no I/O.
    pub rule_based: u64,
}

/// Four-level routing decision chain.
///
/// Levels are tried in order and the first that yields a valid target
/// wins; level 3 is infallible, so `decide` never errors. Any level
/// other than 0 serving a decision is logged as degraded operation.
pub struct DecisionEngine {
    primary: Arc<dyn InferenceProvider>,
    secondary: Option<Arc<dyn InferenceProvider>>,
    model: String,
    fallback_worker: WorkerId,
    levels: [AtomicU64; 4],
    fenced_re: Regex,
}

impl DecisionEngine {
    /// Creates the chain. `model` is the (cheap) model used for routing
    /// calls; `fallback_worker` is the rule-based safe default.
    pub fn new(
        primary: Arc<dyn InferenceProvider>,
        secondary: Option<Arc<dyn InferenceProvider>>,
        model: String,
        fallback_worker: WorkerId,
    ) -> Self {
        #[allow(clippy::expect_used)]
        let fenced_re = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```")
            .expect("static regex is valid");
        Self {
            primary,
            secondary,
            model,
            fallback_worker,
            levels: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            fenced_re,
        }
    }

    /// Current per-level hit counts.
    pub fn level_counts(&self) -> DecisionLevelCounts {
        DecisionLevelCounts {
            structured: self.levels[0].load(Ordering::Relaxed),
            extracted: self.levels[1].load(Ordering::Relaxed),
            secondary: self.levels[2].load(Ordering::Relaxed),
            rule_based: self.levels[3].load(Ordering::Relaxed),
        }
    }

    /// Decides where control goes next. Never fails: every provider-side
    /// problem degrades one level, down to rule-based routing. Every
    /// decision carries a non-empty reasoning string.
    pub async fn decide(&self, state: &ConversationState) -> RouteDecision {
        match self.structured_decision(self.primary.as_ref(), state).await {
            Ok(decision) => {
                self.levels[0].fetch_add(1, Ordering::Relaxed);
                return decision;
            }
            Err(e) => debug!(error = %e, "Structured routing failed"),
        }

        match self.extracted_decision(state).await {
            Ok(decision) => {
                self.levels[1].fetch_add(1, Ordering::Relaxed);
                warn!(level = 1, target = %decision.target, "Routing served by JSON extraction");
                return decision;
            }
            Err(e) => debug!(error = %e, "Extraction routing failed"),
        }

        if let Some(ref secondary) = self.secondary {
            match self.structured_decision(secondary.as_ref(), state).await {
                Ok(decision) => {
                    self.levels[2].fetch_add(1, Ordering::Relaxed);
                    warn!(level = 2, target = %decision.target, "Routing served by secondary provider");
                    return decision;
                }
                Err(e) => debug!(error = %e, "Secondary routing failed"),
            }
        }

        let decision = self.rule_decision(state);
        self.levels[3].fetch_add(1, Ordering::Relaxed);
        warn!(
            level = 3,
            target = %decision.target,
            reasoning = %decision.reasoning,
            "Routing served by rule-based fallback"
        );
        decision
    }

    fn routing_request(&self, state: &ConversationState, schema: bool) -> InvokeRequest {
        InvokeRequest {
            model: self.model.clone(),
            system: Some(ROUTER_PROMPT.to_string()),
            messages: state.messages.clone(),
            schema: schema.then(route_schema),
            max_tokens: ROUTER_MAX_TOKENS,
            agent: ROUTER_AGENT.to_string(),
            thread_id: Some(state.thread_id),
        }
    }

    async fn structured_decision(
        &self,
        provider: &dyn InferenceProvider,
        state: &ConversationState,
    ) -> TroupeResult<RouteDecision> {
        let reply = provider.invoke(&self.routing_request(state, true)).await?;
        let value = reply
            .structured()
            .ok_or_else(|| TroupeError::Decision("expected structured output".to_string()))?;
        decision_from_value(value)
    }

    async fn extracted_decision(&self, state: &ConversationState) -> TroupeResult<RouteDecision> {
        let reply = self
            .primary
            .invoke(&self.routing_request(state, false))
            .await?;
        let text = reply
            .text()
            .ok_or_else(|| TroupeError::Decision("expected text output".to_string()))?;
        let value = self
            .extract_json(text)
            .ok_or_else(|| TroupeError::Decision("no JSON object in reply".to_string()))?;
        decision_from_value(&value)
    }

    /// Pulls a JSON object out of free text: a fenced block first, then
    /// the outermost brace span.
    fn extract_json(&self, text: &str) -> Option<Value> {
        if let Some(caps) = self.fenced_re.captures(text) {
            if let Ok(value) = serde_json::from_str(&caps[1]) {
                return Some(value);
            }
        }
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&text[start..=end]).ok()
    }

    /// Infallible rule-based routing: keyword match against workers that
    /// have not yet acted, the safe default on a fresh conversation,
    /// finish otherwise.
    fn rule_decision(&self, state: &ConversationState) -> RouteDecision {
        let query = latest_user_query(state).to_lowercase();
        const KEYWORDS: &[(&str, WorkerId)] = &[
            ("plan", WorkerId::Planner),
            ("design", WorkerId::Planner),
            ("test", WorkerId::Tester),
            ("security", WorkerId::Security),
            ("vulnerab", WorkerId::Security),
            ("review", WorkerId::Reviewer),
        ];
        for &(keyword, worker) in KEYWORDS {
            if query.contains(keyword) && !state.contributors.contains(&worker) {
                return RouteDecision {
                    target: RouteTarget::Worker(worker),
                    reasoning: format!("keyword '{keyword}' matched the idle {worker} stage"),
                };
            }
        }
        if state.contributors.is_empty() {
            return RouteDecision {
                target: RouteTarget::Worker(self.fallback_worker),
                reasoning: format!("fresh conversation, safe default {}", self.fallback_worker),
            };
        }
        RouteDecision {
            target: RouteTarget::Finish,
            reasoning: "every matching stage has already contributed".to_string(),
        }
    }
}

fn route_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "next": {
                "type": "string",
                "enum": ["planner", "builder", "tester", "security", "reviewer", "finish"],
            },
            "reasoning": {
                "type": "string",
            },
        },
        "required": ["next"],
        "additionalProperties": false,
    })
}

fn decision_from_value(value: &Value) -> TroupeResult<RouteDecision> {
    let raw = value["next"]
        .as_str()
        .ok_or_else(|| TroupeError::Decision("missing \"next\" field".to_string()))?;
    let target = RouteTarget::parse(raw)
        .ok_or_else(|| TroupeError::Decision(format!("unknown route target: {raw}")))?;
    let reasoning = value["reasoning"]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("model-selected route")
        .to_string();
    Ok(RouteDecision { target, reasoning })
}
