use crate::error::{TroupeError, TroupeResult};
use crate::roster::WorkerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Cooldown after the last failure before a probe is allowed.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_max_failures() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    60_000
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Retry executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Jitter added on top of each delay, as a percentage of that delay.
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: u32,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_jitter_percent() -> u32 {
    25
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            jitter_percent: default_jitter_percent(),
        }
    }
}

/// Request limits for one access tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierLimits {
    /// Requests allowed per sliding hour.
    pub hourly_limit: u32,
    /// Requests allowed per sliding minute.
    pub burst_limit: u32,
}

/// Per-tier rate limits. Admin is unlimited and carries no entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimitsConfig {
    /// Unauthenticated callers, keyed by network origin.
    #[serde(default = "default_anonymous_limits")]
    pub anonymous: TierLimits,
    /// Free-plan callers.
    #[serde(default = "default_free_limits")]
    pub free: TierLimits,
    /// Paid plan.
    #[serde(default = "default_pro_limits")]
    pub pro: TierLimits,
    /// Top paid plan.
    #[serde(default = "default_enterprise_limits")]
    pub enterprise: TierLimits,
}

fn default_anonymous_limits() -> TierLimits {
    TierLimits {
        hourly_limit: 20,
        burst_limit: 5,
    }
}

fn default_free_limits() -> TierLimits {
    TierLimits {
        hourly_limit: 100,
        burst_limit: 10,
    }
}

fn default_pro_limits() -> TierLimits {
    TierLimits {
        hourly_limit: 1_000,
        burst_limit: 30,
    }
}

fn default_enterprise_limits() -> TierLimits {
    TierLimits {
        hourly_limit: 10_000,
        burst_limit: 60,
    }
}

impl Default for TierLimitsConfig {
    fn default() -> Self {
        Self {
            anonymous: default_anonymous_limits(),
            free: default_free_limits(),
            pro: default_pro_limits(),
            enterprise: default_enterprise_limits(),
        }
    }
}

/// Inference provider endpoints and model identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Primary provider base URL (OpenAI-compatible chat completions).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Primary provider API key.
    #[serde(default)]
    pub api_key: String,
    /// Alternate provider base URL for the Level-2 decision fallback.
    #[serde(default)]
    pub secondary_base_url: Option<String>,
    /// Alternate provider API key.
    #[serde(default)]
    pub secondary_api_key: Option<String>,
    /// Cheapest model, used for simple queries.
    #[serde(default = "default_light_model")]
    pub light_model: String,
    /// Mid-tier model, the default for unclassified queries.
    #[serde(default = "default_standard_model")]
    pub standard_model: String,
    /// Strongest model, used for complex queries and pinned workers.
    #[serde(default = "default_premium_model")]
    pub premium_model: String,
    /// Hard per-call timeout in seconds; a timed-out call is transient.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_light_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_standard_model() -> String {
    "gpt-4o".to_string()
}

fn default_premium_model() -> String {
    "o1".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            secondary_base_url: None,
            secondary_api_key: None,
            light_model: default_light_model(),
            standard_model: default_standard_model(),
            premium_model: default_premium_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Top-level runtime configuration.
///
/// Every numeric default here is illustrative and tunable, not a contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TroupeConfig {
    /// Daily spend ceiling in USD; calls fail fast once reached.
    #[serde(default = "default_daily_budget")]
    pub daily_budget_usd: f64,
    /// Circuit breaker tuning.
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Retry executor tuning.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Per-tier rate limits.
    #[serde(default)]
    pub limits: TierLimitsConfig,
    /// Caller keys and origins exempt from rate limiting.
    #[serde(default)]
    pub allow_list: Vec<String>,
    /// API key to access-tier assignments (tier names, lowercase).
    #[serde(default)]
    pub api_tiers: HashMap<String, String>,
    /// Router-turn ceiling per conversation run.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Self-loop retry ceiling for the retry-capable worker.
    #[serde(default = "default_max_agent_retries")]
    pub max_agent_retries: u32,
    /// Safe-default worker for rule-based routing when nothing matches.
    #[serde(default = "default_fallback_worker")]
    pub fallback_worker: WorkerId,
    /// Provider endpoints and model identifiers.
    #[serde(default)]
    pub provider: ProviderSettings,
    /// Gateway listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for TroupeConfig {
    fn default() -> Self {
        Self {
            daily_budget_usd: default_daily_budget(),
            breaker: BreakerSettings::default(),
            retry: RetrySettings::default(),
            limits: TierLimitsConfig::default(),
            allow_list: Vec::new(),
            api_tiers: HashMap::new(),
            max_turns: default_max_turns(),
            max_agent_retries: default_max_agent_retries(),
            fallback_worker: default_fallback_worker(),
            provider: ProviderSettings::default(),
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_daily_budget() -> f64 {
    50.0
}

fn default_max_turns() -> u32 {
    12
}

fn default_max_agent_retries() -> u32 {
    2
}

fn default_fallback_worker() -> WorkerId {
    WorkerId::Builder
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl TroupeConfig {
    /// Loads configuration from a TOML file, then applies environment
    /// overrides.
    pub fn load(path: &Path) -> TroupeResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: TroupeConfig = toml::from_str(&raw)
            .map_err(|e| TroupeError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `TROUPE_*` environment variable overrides on top of the
    /// current values. Unparseable values are ignored with a default left
    /// in place.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TROUPE_API_KEY") {
            self.provider.api_key = v;
        }
        if let Some(v) = env_parse::<f64>("TROUPE_DAILY_BUDGET_USD") {
            self.daily_budget_usd = v;
        }
        if let Some(v) = env_parse::<u32>("TROUPE_MAX_TURNS") {
            self.max_turns = v;
        }
        if let Some(v) = env_parse::<u32>("TROUPE_MAX_AGENT_RETRIES") {
            self.max_agent_retries = v;
        }
        if let Some(v) = env_parse::<u32>("TROUPE_BREAKER_MAX_FAILURES") {
            self.breaker.max_failures = v;
        }
        if let Some(v) = env_parse::<u64>("TROUPE_BREAKER_COOLDOWN_MS") {
            self.breaker.cooldown_ms = v;
        }
        if let Some(v) = env_parse::<u32>("TROUPE_RETRY_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("TROUPE_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = env_parse::<u32>("TROUPE_RETRY_JITTER_PERCENT") {
            self.retry.jitter_percent = v;
        }
        if let Ok(v) = std::env::var("TROUPE_FALLBACK_WORKER") {
            if let Some(worker) = WorkerId::parse(&v) {
                self.fallback_worker = worker;
            }
        }
        if let Ok(v) = std::env::var("TROUPE_LISTEN_ADDR") {
            self.listen_addr = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TroupeConfig::default();
        assert_eq!(config.max_turns, 12);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.breaker.max_failures, 5);
        assert_eq!(config.fallback_worker, WorkerId::Builder);
        assert_eq!(config.limits.anonymous.burst_limit, 5);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: TroupeConfig = toml::from_str(
            r#"
            daily_budget_usd = 10.0

            [breaker]
            max_failures = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.daily_budget_usd, 10.0);
        assert_eq!(config.breaker.max_failures, 2);
        assert_eq!(config.breaker.cooldown_ms, 60_000);
        assert_eq!(config.retry.base_delay_ms, 1_000);
    }

    #[test]
    fn test_gate_tables_from_toml() {
        let config: TroupeConfig = toml::from_str(
            r#"
            allow_list = ["10.0.0.7", "health-checker"]

            [api_tiers]
            vip-key = "enterprise"
            trial-key = "free"
            "#,
        )
        .unwrap();
        assert_eq!(config.allow_list, vec!["10.0.0.7", "health-checker"]);
        assert_eq!(config.api_tiers["vip-key"], "enterprise");
        assert_eq!(config.api_tiers["trial-key"], "free");
    }

    #[test]
    fn test_fallback_worker_from_toml() {
        let config: TroupeConfig = toml::from_str("fallback_worker = \"planner\"").unwrap();
        assert_eq!(config.fallback_worker, WorkerId::Planner);
    }
}
