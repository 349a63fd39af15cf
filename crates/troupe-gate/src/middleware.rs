use crate::limiter::RateLimiter;
use crate::tiers::AccessTier;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Shared state for the rate-limit middleware.
#[derive(Clone)]
pub struct GateState {
    /// The limiter itself.
    pub limiter: Arc<RateLimiter>,
    /// Known API keys and the tier each one belongs to.
    pub api_tiers: HashMap<String, AccessTier>,
}

impl GateState {
    /// Creates middleware state over a limiter and a key-to-tier table.
    pub fn new(limiter: Arc<RateLimiter>, api_tiers: HashMap<String, AccessTier>) -> Self {
        Self { limiter, api_tiers }
    }

    /// Caller key and tier for a request: bearer identity when present,
    /// otherwise the peer origin at the anonymous tier.
    fn resolve(&self, headers: &HeaderMap, peer: SocketAddr) -> (String, AccessTier) {
        let bearer = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        match bearer {
            Some(key) => {
                let tier = match self.limiter.cached_tier(&key) {
                    Some(tier) => tier,
                    None => {
                        let tier = self
                            .api_tiers
                            .get(&key)
                            .copied()
                            .unwrap_or(AccessTier::Free);
                        self.limiter.cache_tier(&key, tier);
                        tier
                    }
                };
                (key, tier)
            }
            None => (peer.ip().to_string(), AccessTier::Anonymous),
        }
    }
}

/// Rate limiting middleware. Rejections become `429` with a `Retry-After`
/// hint in seconds.
pub async fn rate_limit_middleware(
    State(state): State<Arc<GateState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let (key, tier) = state.resolve(request.headers(), peer);
    let admission = state.limiter.admit(&key, tier);
    if !admission.allowed {
        let retry_after = admission.retry_after_secs.unwrap_or(1);
        warn!(%tier, retry_after, "Rate limited request");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", retry_after.to_string())],
            "Rate limit exceeded",
        )
            .into_response();
    }
    next.run(request).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use troupe_core::TierLimitsConfig;

    fn state() -> GateState {
        let limiter = Arc::new(RateLimiter::new(TierLimitsConfig::default(), vec![]));
        let mut api_tiers = HashMap::new();
        api_tiers.insert("pro-key".to_string(), AccessTier::Pro);
        GateState::new(limiter, api_tiers)
    }

    fn peer() -> SocketAddr {
        "192.0.2.1:50000".parse().unwrap()
    }

    #[test]
    fn test_bearer_key_resolves_configured_tier() {
        let state = state();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer pro-key".parse().unwrap());
        let (key, tier) = state.resolve(&headers, peer());
        assert_eq!(key, "pro-key");
        assert_eq!(tier, AccessTier::Pro);
        // Second resolution comes from the cache.
        assert_eq!(state.limiter.cached_tier("pro-key"), Some(AccessTier::Pro));
    }

    #[test]
    fn test_unknown_bearer_key_defaults_free() {
        let state = state();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer mystery".parse().unwrap());
        let (_, tier) = state.resolve(&headers, peer());
        assert_eq!(tier, AccessTier::Free);
    }

    #[test]
    fn test_no_auth_uses_origin_as_anonymous() {
        let state = state();
        let (key, tier) = state.resolve(&HeaderMap::new(), peer());
        assert_eq!(key, "192.0.2.1");
        assert_eq!(tier, AccessTier::Anonymous);
    }
}
