use crate::tiers::AccessTier;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use troupe_core::TierLimitsConfig;

const BURST_WINDOW: Duration = Duration::from_secs(60);
const SUSTAINED_WINDOW: Duration = Duration::from_secs(60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const TIER_CACHE_TTL: Duration = Duration::from_secs(60);
const TIER_CACHE_CAP: usize = 10_000;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// When denied, seconds until the caller should retry.
    pub retry_after_secs: Option<u64>,
}

impl Admission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
        }
    }

    fn denied(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: Some(retry_after_secs),
        }
    }
}

#[derive(Debug, Default)]
struct KeyWindows {
    burst: VecDeque<Instant>,
    sustained: VecDeque<Instant>,
}

impl KeyWindows {
    fn prune(&mut self, now: Instant) {
        while self
            .burst
            .front()
            .is_some_and(|&t| now.duration_since(t) >= BURST_WINDOW)
        {
            self.burst.pop_front();
        }
        while self
            .sustained
            .front()
            .is_some_and(|&t| now.duration_since(t) >= SUSTAINED_WINDOW)
        {
            self.sustained.pop_front();
        }
    }

    fn is_empty(&self) -> bool {
        self.burst.is_empty() && self.sustained.is_empty()
    }
}

/// Seconds until the oldest timestamp in a window ages out, at least 1.
fn retry_after(oldest: Instant, window: Duration, now: Instant) -> u64 {
    let elapsed = now.duration_since(oldest);
    window.saturating_sub(elapsed).as_secs().max(1)
}

/// Sliding-window rate limiter keyed by caller identity.
///
/// Each key carries two windows: a one-minute burst window and a one-hour
/// sustained window. The burst check runs first, so a caller who trips
/// both sees the shorter retry hint. Shared across all requests.
pub struct RateLimiter {
    limits: TierLimitsConfig,
    allow_list: HashSet<String>,
    entries: Mutex<HashMap<String, KeyWindows>>,
    tier_cache: Mutex<HashMap<String, (AccessTier, Instant)>>,
}

impl RateLimiter {
    /// Creates a limiter with per-tier limits and an origin allow-list.
    pub fn new(limits: TierLimitsConfig, allow_list: Vec<String>) -> Self {
        Self {
            limits,
            allow_list: allow_list.into_iter().collect(),
            entries: Mutex::new(HashMap::new()),
            tier_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Checks and records one request for `key` at its tier.
    pub fn admit(&self, key: &str, tier: AccessTier) -> Admission {
        self.admit_at(key, tier, Instant::now())
    }

    /// [`Self::admit`] against an explicit clock.
    pub fn admit_at(&self, key: &str, tier: AccessTier, now: Instant) -> Admission {
        let Some(limits) = tier.limits(&self.limits) else {
            return Admission::allowed();
        };
        if self.allow_list.contains(key) {
            return Admission::allowed();
        }

        let mut entries = self.entries.lock();
        let windows = entries.entry(key.to_string()).or_default();
        windows.prune(now);

        if windows.burst.len() >= limits.burst_limit as usize {
            let hint = windows
                .burst
                .front()
                .map(|&t| retry_after(t, BURST_WINDOW, now))
                .unwrap_or(1);
            warn!(key, %tier, "Burst limit hit");
            return Admission::denied(hint);
        }
        if windows.sustained.len() >= limits.hourly_limit as usize {
            let hint = windows
                .sustained
                .front()
                .map(|&t| retry_after(t, SUSTAINED_WINDOW, now))
                .unwrap_or(1);
            warn!(key, %tier, "Hourly limit hit");
            return Admission::denied(hint);
        }

        windows.burst.push_back(now);
        windows.sustained.push_back(now);
        Admission::allowed()
    }

    /// Drops keys whose windows have fully aged out.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    /// [`Self::sweep`] against an explicit clock.
    pub fn sweep_at(&self, now: Instant) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, windows| {
            windows.prune(now);
            !windows.is_empty()
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Swept idle limiter keys");
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }

    /// Caches a resolved tier for a key.
    pub fn cache_tier(&self, key: &str, tier: AccessTier) {
        self.cache_tier_at(key, tier, Instant::now());
    }

    /// [`Self::cache_tier`] against an explicit clock.
    pub fn cache_tier_at(&self, key: &str, tier: AccessTier, now: Instant) {
        let mut cache = self.tier_cache.lock();
        if cache.len() >= TIER_CACHE_CAP {
            cache.retain(|_, &mut (_, at)| now.duration_since(at) < TIER_CACHE_TTL);
            if cache.len() >= TIER_CACHE_CAP {
                // Still full of fresh entries; drop an arbitrary one to
                // keep the map bounded.
                if let Some(evict) = cache.keys().next().cloned() {
                    cache.remove(&evict);
                }
            }
        }
        cache.insert(key.to_string(), (tier, now));
    }

    /// Looks up a cached tier, if still fresh.
    pub fn cached_tier(&self, key: &str) -> Option<AccessTier> {
        self.cached_tier_at(key, Instant::now())
    }

    /// [`Self::cached_tier`] against an explicit clock.
    pub fn cached_tier_at(&self, key: &str, now: Instant) -> Option<AccessTier> {
        let cache = self.tier_cache.lock();
        cache
            .get(key)
            .filter(|&&(_, at)| now.duration_since(at) < TIER_CACHE_TTL)
            .map(|&(tier, _)| tier)
    }

    /// Spawns a background task that sweeps idle keys every five minutes.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // First tick fires immediately.
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use troupe_core::TierLimits;

    fn limiter() -> RateLimiter {
        RateLimiter::new(TierLimitsConfig::default(), vec![])
    }

    /// Tight limits so tests exercise both windows cheaply.
    fn tight_limiter() -> RateLimiter {
        let limits = TierLimitsConfig {
            anonymous: TierLimits {
                hourly_limit: 5,
                burst_limit: 2,
            },
            ..TierLimitsConfig::default()
        };
        RateLimiter::new(limits, vec![])
    }

    #[test]
    fn test_allows_under_burst_limit() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.admit_at("1.2.3.4", AccessTier::Anonymous, now).allowed);
        }
    }

    #[test]
    fn test_burst_limit_denies_with_hint() {
        let limiter = tight_limiter();
        let now = Instant::now();
        assert!(limiter.admit_at("k", AccessTier::Anonymous, now).allowed);
        assert!(limiter.admit_at("k", AccessTier::Anonymous, now).allowed);
        let denied = limiter.admit_at("k", AccessTier::Anonymous, now);
        assert!(!denied.allowed);
        let hint = denied.retry_after_secs.unwrap();
        assert!(hint >= 1 && hint <= 60);
    }

    #[test]
    fn test_burst_window_expiry_readmits() {
        let limiter = tight_limiter();
        let now = Instant::now();
        limiter.admit_at("k", AccessTier::Anonymous, now);
        limiter.admit_at("k", AccessTier::Anonymous, now);
        let later = now + Duration::from_secs(61);
        assert!(limiter.admit_at("k", AccessTier::Anonymous, later).allowed);
    }

    #[test]
    fn test_sustained_limit_outlasts_burst_expiry() {
        let limiter = tight_limiter();
        let mut now = Instant::now();
        // 5 admits spread over minutes: burst never trips, sustained fills.
        for _ in 0..5 {
            assert!(limiter.admit_at("k", AccessTier::Anonymous, now).allowed);
            now += Duration::from_secs(120);
        }
        let denied = limiter.admit_at("k", AccessTier::Anonymous, now);
        assert!(!denied.allowed);
        // Hint comes from the hourly window, beyond the burst window.
        assert!(denied.retry_after_secs.unwrap() > 60);
    }

    #[test]
    fn test_burst_checked_before_sustained() {
        // Both windows full at once: the hint must be the burst one.
        let limits = TierLimitsConfig {
            anonymous: TierLimits {
                hourly_limit: 2,
                burst_limit: 2,
            },
            ..TierLimitsConfig::default()
        };
        let limiter = RateLimiter::new(limits, vec![]);
        let now = Instant::now();
        limiter.admit_at("k", AccessTier::Anonymous, now);
        limiter.admit_at("k", AccessTier::Anonymous, now);
        let denied = limiter.admit_at("k", AccessTier::Anonymous, now);
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs.unwrap() <= 60);
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = tight_limiter();
        let now = Instant::now();
        limiter.admit_at("a", AccessTier::Anonymous, now);
        limiter.admit_at("a", AccessTier::Anonymous, now);
        assert!(!limiter.admit_at("a", AccessTier::Anonymous, now).allowed);
        assert!(limiter.admit_at("b", AccessTier::Anonymous, now).allowed);
    }

    #[test]
    fn test_admin_bypasses() {
        let limiter = tight_limiter();
        let now = Instant::now();
        for _ in 0..100 {
            assert!(limiter.admit_at("ops", AccessTier::Admin, now).allowed);
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_allow_list_bypasses() {
        let limiter = RateLimiter::new(
            TierLimitsConfig {
                anonymous: TierLimits {
                    hourly_limit: 1,
                    burst_limit: 1,
                },
                ..TierLimitsConfig::default()
            },
            vec!["10.0.0.1".to_string()],
        );
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.admit_at("10.0.0.1", AccessTier::Anonymous, now).allowed);
        }
    }

    #[test]
    fn test_sweep_drops_idle_keys() {
        let limiter = tight_limiter();
        let now = Instant::now();
        limiter.admit_at("k", AccessTier::Anonymous, now);
        assert_eq!(limiter.tracked_keys(), 1);
        limiter.sweep_at(now + Duration::from_secs(3_601));
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_sweep_keeps_active_keys() {
        let limiter = tight_limiter();
        let now = Instant::now();
        limiter.admit_at("k", AccessTier::Anonymous, now);
        limiter.sweep_at(now + Duration::from_secs(30));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_tier_cache_ttl() {
        let limiter = limiter();
        let now = Instant::now();
        limiter.cache_tier_at("key", AccessTier::Pro, now);
        assert_eq!(limiter.cached_tier_at("key", now), Some(AccessTier::Pro));
        assert_eq!(
            limiter.cached_tier_at("key", now + Duration::from_secs(61)),
            None
        );
    }
}
