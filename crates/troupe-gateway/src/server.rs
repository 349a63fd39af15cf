use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware as axum_mw,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{info, warn};
use troupe_core::{ConversationState, Message, TroupeConfig, TroupeResult, WorkerId};
use troupe_cost::{CostLedger, ModelRouter, TierModels, UsageStore};
use troupe_dispatch::{DecisionEngine, Dispatcher};
use troupe_gate::{rate_limit_middleware, AccessTier, GateState, RateLimiter};
use troupe_llm::{GuardedProvider, HttpProvider, InferenceProvider};
use troupe_resilience::{BreakerRegistry, RetryExecutor};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Shared application state: the singletons every request goes through.
pub struct AppState {
    /// Per-model circuit breakers.
    pub breakers: Arc<BreakerRegistry>,
    /// Retry executor wrapping provider calls.
    pub retry: Arc<RetryExecutor>,
    /// Usage ledger and budget gate.
    pub ledger: Arc<CostLedger>,
    /// Complexity-based model selection.
    pub models: Arc<ModelRouter>,
    /// The four-level routing decision chain.
    pub decisions: Arc<DecisionEngine>,
    /// The conversation run loop.
    pub dispatcher: Dispatcher,
    /// Per-key sliding-window rate limiter.
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Wires the singletons from configuration. Both providers are
    /// wrapped in the budget/breaker/retry guard so every inference call
    /// is accounted for.
    pub fn from_config(
        config: &TroupeConfig,
        store: Arc<dyn UsageStore>,
    ) -> TroupeResult<Arc<Self>> {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let retry = Arc::new(RetryExecutor::new(config.retry.clone()));
        let ledger = Arc::new(CostLedger::new(store, config.daily_budget_usd));

        let primary: Arc<dyn InferenceProvider> = Arc::new(HttpProvider::primary(&config.provider)?);
        let guarded: Arc<dyn InferenceProvider> = Arc::new(GuardedProvider::new(
            primary,
            breakers.clone(),
            retry.clone(),
            ledger.clone(),
        ));
        let secondary = HttpProvider::secondary(&config.provider)?.map(|provider| {
            Arc::new(GuardedProvider::new(
                Arc::new(provider) as Arc<dyn InferenceProvider>,
                breakers.clone(),
                retry.clone(),
                ledger.clone(),
            )) as Arc<dyn InferenceProvider>
        });

        let models = Arc::new(ModelRouter::new(TierModels::from_provider(&config.provider)));
        let decisions = Arc::new(DecisionEngine::new(
            guarded.clone(),
            secondary,
            config.provider.light_model.clone(),
            config.fallback_worker,
        ));
        let dispatcher = Dispatcher::new(
            decisions.clone(),
            guarded,
            models.clone(),
            breakers.clone(),
            config.max_turns,
            config.max_agent_retries,
        );
        let limiter = Arc::new(RateLimiter::new(
            config.limits.clone(),
            config.allow_list.clone(),
        ));

        Ok(Arc::new(Self {
            breakers,
            retry,
            ledger,
            models,
            decisions,
            dispatcher,
            limiter,
        }))
    }
}

/// Builds the middleware state from the configured API-key tier table.
/// Unknown tier names are dropped with a warning.
pub fn build_gate(config: &TroupeConfig, limiter: Arc<RateLimiter>) -> Arc<GateState> {
    let mut api_tiers = HashMap::new();
    for (key, name) in &config.api_tiers {
        match AccessTier::parse(name) {
            Some(tier) => {
                api_tiers.insert(key.clone(), tier);
            }
            None => warn!(tier = %name, "Unknown access tier in api_tiers, entry dropped"),
        }
    }
    Arc::new(GateState::new(limiter, api_tiers))
}

/// One chat request.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// The user's message.
    pub message: String,
    /// Existing thread to continue; a fresh one is minted when absent.
    #[serde(default)]
    pub thread_id: Option<Uuid>,
}

/// The completed run, as returned to the caller.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    /// Final assistant reply.
    pub reply: String,
    /// Thread identifier, echoed or minted.
    pub thread_id: Uuid,
    /// Workers that acted, in first-contribution order.
    pub contributors: Vec<WorkerId>,
    /// Router turns consumed.
    pub turn_count: u32,
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    message: String,
    #[serde(default)]
    thread_id: Option<Uuid>,
}

/// Builds the gateway router. The rate-limit middleware guards the chat
/// and status routes; `/health` stays open for probes.
pub fn build_router(state: Arc<AppState>, gate: Arc<GateState>) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/stream", get(stream_handler))
        .route("/status", get(status_handler))
        .layer(axum_mw::from_fn_with_state(gate, rate_limit_middleware))
        .route("/health", get(health_handler))
        .with_state(state)
}

fn new_conversation(message: &str, thread_id: Option<Uuid>) -> ConversationState {
    let thread_id = thread_id.unwrap_or_else(Uuid::new_v4);
    let mut conversation = ConversationState::new(thread_id);
    conversation
        .messages
        .push(Message::user(message, thread_id));
    conversation
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, String)> {
    if request.message.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "message must not be empty".to_string(),
        ));
    }

    let mut conversation = new_conversation(&request.message, request.thread_id);
    info!(thread_id = %conversation.thread_id, "Chat request accepted");
    let report = state.dispatcher.run(&mut conversation, None).await;

    Ok(Json(ChatResponse {
        reply: report.reply,
        thread_id: report.thread_id,
        contributors: report.contributors,
        turn_count: report.turn_count,
    }))
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if params.message.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "message must not be empty".to_string(),
        ));
    }

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut conversation = new_conversation(&params.message, params.thread_id);
        info!(thread_id = %conversation.thread_id, "Stream request accepted");
        state.dispatcher.run(&mut conversation, Some(tx)).await;
    });

    let stream = ReceiverStream::new(rx).map(|event| Event::default().json_data(&event));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let now = Utc::now();
    let spent_today = match state.ledger.daily_cost(now.date_naive()).await {
        Ok(spent) => Some(spent),
        Err(e) => {
            warn!(error = %e, "Daily cost unavailable for status");
            None
        }
    };
    let cost = match state.ledger.cost_summary(now - Duration::days(7), now).await {
        Ok(summary) => serde_json::to_value(summary).ok(),
        Err(e) => {
            warn!(error = %e, "Cost summary unavailable for status");
            None
        }
    };

    Json(serde_json::json!({
        "breakers": state.breakers.status(),
        "retries": state.retry.stats().snapshot(),
        "decision_levels": state.decisions.level_counts(),
        "daily_budget_usd": state.ledger.daily_budget_usd(),
        "spent_today_usd": spent_today,
        "cost_last_7d": cost,
    }))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "troupe-gateway",
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use std::net::SocketAddr;
    use tower::ServiceExt;
    use troupe_core::{TierLimits, TierLimitsConfig};
    use troupe_cost::InMemoryUsageStore;
    use troupe_llm::{InvokeRequest, ProviderOutput, ProviderReply};

    /// Routes every conversation straight to finish.
    struct FinishProvider;

    #[async_trait]
    impl InferenceProvider for FinishProvider {
        async fn invoke(&self, request: &InvokeRequest) -> TroupeResult<ProviderReply> {
            let output = if request.schema.is_some() {
                ProviderOutput::Structured(serde_json::json!({ "next": "finish" }))
            } else {
                ProviderOutput::Text("ok".to_string())
            };
            Ok(ProviderReply {
                output,
                tokens_in: 1,
                tokens_out: 1,
            })
        }

        fn name(&self) -> &str {
            "finish"
        }
    }

    fn test_app(limits: TierLimitsConfig) -> Router {
        let mut config = TroupeConfig::default();
        config.limits = limits;
        test_app_with(config)
    }

    fn test_app_with(config: TroupeConfig) -> Router {
        let provider: Arc<dyn InferenceProvider> = Arc::new(FinishProvider);
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let retry = Arc::new(RetryExecutor::new(config.retry.clone()));
        let ledger = Arc::new(CostLedger::new(Arc::new(InMemoryUsageStore::new()), 50.0));
        let models = Arc::new(ModelRouter::new(TierModels::from_provider(&config.provider)));
        let decisions = Arc::new(DecisionEngine::new(
            provider.clone(),
            None,
            config.provider.light_model.clone(),
            config.fallback_worker,
        ));
        let dispatcher = Dispatcher::new(
            decisions.clone(),
            provider,
            models.clone(),
            breakers.clone(),
            config.max_turns,
            config.max_agent_retries,
        );
        let limiter = Arc::new(RateLimiter::new(
            config.limits.clone(),
            config.allow_list.clone(),
        ));

        let state = Arc::new(AppState {
            breakers,
            retry,
            ledger,
            models,
            decisions,
            dispatcher,
            limiter: limiter.clone(),
        });
        let gate = build_gate(&config, limiter);
        build_router(state, gate).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4242))))
    }

    fn chat_request(message: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/chat")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "message": message }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let app = test_app(TierLimitsConfig::default());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_message() {
        let app = test_app(TierLimitsConfig::default());
        let response = app.oneshot(chat_request("   ")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_returns_report_fields() {
        let app = test_app(TierLimitsConfig::default());
        let response = app.oneshot(chat_request("hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["reply"].is_string());
        assert!(json["thread_id"].is_string());
        assert!(json["turn_count"].is_u64());
    }

    #[tokio::test]
    async fn test_burst_limit_returns_429_with_retry_after() {
        let limits = TierLimitsConfig {
            anonymous: TierLimits {
                hourly_limit: 100,
                burst_limit: 1,
            },
            ..TierLimitsConfig::default()
        };
        let app = test_app(limits);

        let first = app.clone().oneshot(chat_request("hello")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(chat_request("hello again")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn test_allow_listed_origin_bypasses_limits() {
        let mut config = TroupeConfig::default();
        config.limits.anonymous = TierLimits {
            hourly_limit: 100,
            burst_limit: 1,
        };
        config.allow_list = vec!["127.0.0.1".to_string()];
        let app = test_app_with(config);

        let first = app.clone().oneshot(chat_request("hello")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(chat_request("hello again")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }

    #[test]
    fn test_build_gate_parses_tier_table() {
        let mut config = TroupeConfig::default();
        config
            .api_tiers
            .insert("vip-key".to_string(), "enterprise".to_string());
        config
            .api_tiers
            .insert("broken".to_string(), "platinum".to_string());
        let limiter = Arc::new(RateLimiter::new(config.limits.clone(), vec![]));

        let gate = build_gate(&config, limiter);
        assert_eq!(gate.api_tiers.get("vip-key"), Some(&AccessTier::Enterprise));
        assert!(!gate.api_tiers.contains_key("broken"));
    }

    #[tokio::test]
    async fn test_status_exposes_snapshots() {
        let app = test_app(TierLimitsConfig::default());
        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["breakers"].is_array());
        assert!(json["decision_levels"].is_object());
        assert_eq!(json["daily_budget_usd"], 50.0);
    }
}
