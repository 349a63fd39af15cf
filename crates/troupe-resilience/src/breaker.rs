use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use troupe_core::{BreakerSettings, TroupeError, TroupeResult};
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls allowed; failures counted.
    Closed,
    /// Calls rejected until the cooldown elapses.
    Open,
    /// One probe call allowed.
    HalfOpen,
}

/// A state-transition event emitted by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BreakerEvent {
    /// The breaker tripped open.
    Opened {
        /// Dependency key.
        dependency: String,
    },
    /// Cooldown elapsed; a probe was granted.
    HalfOpened {
        /// Dependency key.
        dependency: String,
    },
    /// A probe succeeded; the breaker closed.
    Closed {
        /// Dependency key.
        dependency: String,
    },
}

/// Observability snapshot of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    /// Dependency key.
    pub dependency: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failure count (reset only on success).
    pub failure_count: u32,
}

/// Per-dependency three-state circuit breaker.
///
/// Consecutive failures while closed trip the breaker open; after the
/// cooldown has elapsed since the last failure, the next execution check
/// grants exactly one probe. A probe success closes the breaker and resets
/// the failure counter; a probe failure reopens it with the counter intact
/// and the cooldown restarted.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    settings: BreakerSettings,
}

impl CircuitBreaker {
    /// Creates a closed breaker for the given dependency.
    pub fn new(dependency: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            dependency: dependency.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            settings,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may proceed right now. May transition open → half-open.
    pub fn can_execute(&mut self) -> bool {
        self.check_at(Instant::now()).1
    }

    /// Checks admission at `now`. Returns the optional transition event and
    /// whether the call is allowed. When open and past the cooldown this
    /// grants the single half-open probe.
    pub fn check_at(&mut self, now: Instant) -> (Option<BreakerEvent>, bool) {
        match self.state {
            CircuitState::Closed => (None, true),
            // The single probe has already been granted.
            CircuitState::HalfOpen => (None, false),
            CircuitState::Open => {
                if self.cooldown_elapsed(now) {
                    self.state = CircuitState::HalfOpen;
                    (
                        Some(BreakerEvent::HalfOpened {
                            dependency: self.dependency.clone(),
                        }),
                        true,
                    )
                } else {
                    (None, false)
                }
            }
        }
    }

    /// Whether a call would be admitted at `now`, without granting the
    /// half-open probe or changing state.
    pub fn would_admit_at(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            // A probe is in flight; its outcome decides the next state.
            CircuitState::HalfOpen => false,
            CircuitState::Open => self.cooldown_elapsed(now),
        }
    }

    /// Records a successful call: closes the breaker and resets the counter.
    pub fn record_success(&mut self) -> Option<BreakerEvent> {
        let was = self.state;
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
        if was != CircuitState::Closed {
            Some(BreakerEvent::Closed {
                dependency: self.dependency.clone(),
            })
        } else {
            None
        }
    }

    /// Records a failed call at the current instant.
    pub fn record_failure(&mut self) -> Option<BreakerEvent> {
        self.record_failure_at(Instant::now())
    }

    /// [`record_failure`](Self::record_failure) with an explicit clock reading.
    pub fn record_failure_at(&mut self, now: Instant) -> Option<BreakerEvent> {
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.settings.max_failures {
                    self.state = CircuitState::Open;
                    return Some(BreakerEvent::Opened {
                        dependency: self.dependency.clone(),
                    });
                }
                None
            }
            // Probe failed: reopen without resetting the counter; the
            // cooldown restarts from this failure.
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                Some(BreakerEvent::Opened {
                    dependency: self.dependency.clone(),
                })
            }
            CircuitState::Open => {
                self.failure_count += 1;
                None
            }
        }
    }

    /// The typed rejection error, with a remaining-cooldown hint.
    pub fn open_error(&self, now: Instant) -> TroupeError {
        TroupeError::CircuitOpen {
            dependency: self.dependency.clone(),
            retry_after_secs: self.remaining_cooldown(now).as_secs().max(1),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.settings.cooldown_ms)
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        match self.last_failure {
            Some(at) => now.duration_since(at) >= self.cooldown(),
            None => true,
        }
    }

    fn remaining_cooldown(&self, now: Instant) -> Duration {
        match self.last_failure {
            Some(at) => self.cooldown().saturating_sub(now.duration_since(at)),
            None => Duration::ZERO,
        }
    }

    fn status(&self) -> BreakerStatus {
        BreakerStatus {
            dependency: self.dependency.clone(),
            state: self.state,
            failure_count: self.failure_count,
        }
    }
}

/// Registry of isolated breakers, keyed by dependency name.
///
/// One instance is created at process start and shared across all
/// conversation-processing paths; breakers are created lazily on first use
/// and live for the process lifetime. Failures on one dependency never
/// affect another.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    events: broadcast::Sender<BreakerEvent>,
}

impl BreakerRegistry {
    /// Creates an empty registry with shared breaker settings.
    pub fn new(settings: BreakerSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribes to state-transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Checks whether a call to `dependency` may proceed.
    ///
    /// Returns the typed circuit-open error (with retry hint) when rejected.
    pub fn acquire(&self, dependency: &str) -> TroupeResult<()> {
        self.acquire_at(dependency, Instant::now())
    }

    /// [`acquire`](Self::acquire) with an explicit clock reading.
    pub fn acquire_at(&self, dependency: &str, now: Instant) -> TroupeResult<()> {
        let mut breakers = self.breakers.lock();
        let breaker = self.entry(&mut breakers, dependency);
        let (event, allowed) = breaker.check_at(now);
        let err = if allowed {
            None
        } else {
            Some(breaker.open_error(now))
        };
        drop(breakers);

        if let Some(event) = event {
            self.emit(event);
        }
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether a call to `dependency` would currently be admitted.
    ///
    /// Read-only: unlike [`acquire`](Self::acquire), this never grants the
    /// half-open probe, so pre-checks do not starve the caller that
    /// actually executes.
    pub fn can_execute(&self, dependency: &str) -> bool {
        self.can_execute_at(dependency, Instant::now())
    }

    /// [`can_execute`](Self::can_execute) with an explicit clock reading.
    pub fn can_execute_at(&self, dependency: &str, now: Instant) -> bool {
        let breakers = self.breakers.lock();
        breakers
            .get(dependency)
            .map_or(true, |breaker| breaker.would_admit_at(now))
    }

    /// Records a successful call against a dependency.
    pub fn record_success(&self, dependency: &str) {
        let event = {
            let mut breakers = self.breakers.lock();
            self.entry(&mut breakers, dependency).record_success()
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Records a failed call against a dependency.
    pub fn record_failure(&self, dependency: &str) {
        self.record_failure_at(dependency, Instant::now());
    }

    /// [`record_failure`](Self::record_failure) with an explicit clock reading.
    pub fn record_failure_at(&self, dependency: &str, now: Instant) {
        let event = {
            let mut breakers = self.breakers.lock();
            self.entry(&mut breakers, dependency).record_failure_at(now)
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Observability snapshot of all known breakers.
    pub fn status(&self) -> Vec<BreakerStatus> {
        let breakers = self.breakers.lock();
        let mut statuses: Vec<BreakerStatus> = breakers.values().map(CircuitBreaker::status).collect();
        statuses.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        statuses
    }

    fn entry<'a>(
        &self,
        breakers: &'a mut HashMap<String, CircuitBreaker>,
        dependency: &str,
    ) -> &'a mut CircuitBreaker {
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| CircuitBreaker::new(dependency, self.settings.clone()))
    }

    fn emit(&self, event: BreakerEvent) {
        match &event {
            BreakerEvent::Opened { dependency } => {
                warn!(dependency = %dependency, "Circuit breaker opened");
            }
            BreakerEvent::HalfOpened { dependency } => {
                info!(dependency = %dependency, "Circuit breaker half-opened, probing");
            }
            BreakerEvent::Closed { dependency } => {
                info!(dependency = %dependency, "Circuit breaker closed");
            }
        }
        // No subscribers is fine; events are best-effort.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            max_failures: 3,
            cooldown_ms: 1_000,
        }
    }

    #[test]
    fn test_opens_exactly_once_after_max_failures() {
        let mut breaker = CircuitBreaker::new("model-a", settings());
        let t0 = Instant::now();

        assert!(breaker.record_failure_at(t0).is_none());
        assert!(breaker.record_failure_at(t0).is_none());
        let event = breaker.record_failure_at(t0);
        assert_eq!(
            event,
            Some(BreakerEvent::Opened {
                dependency: "model-a".to_string()
            })
        );
        assert_eq!(breaker.state(), CircuitState::Open);

        // Rejected until the cooldown has elapsed since the last failure.
        let (_, allowed) = breaker.check_at(t0 + Duration::from_millis(500));
        assert!(!allowed);
    }

    #[test]
    fn test_half_open_probe_then_success_closes() {
        let mut breaker = CircuitBreaker::new("model-a", settings());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(t0);
        }

        // Cooldown elapsed: exactly one probe is granted.
        let (event, allowed) = breaker.check_at(t0 + Duration::from_millis(1_001));
        assert!(allowed);
        assert!(matches!(event, Some(BreakerEvent::HalfOpened { .. })));
        let (_, second) = breaker.check_at(t0 + Duration::from_millis(1_002));
        assert!(!second);

        let closed = breaker.record_success();
        assert!(matches!(closed, Some(BreakerEvent::Closed { .. })));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().failure_count, 0);
    }

    #[test]
    fn test_half_open_probe_failure_reopens_without_reset() {
        let mut breaker = CircuitBreaker::new("model-a", settings());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(t0);
        }
        let t1 = t0 + Duration::from_millis(1_001);
        let (_, allowed) = breaker.check_at(t1);
        assert!(allowed);

        breaker.record_failure_at(t1);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.status().failure_count, 3);

        // Cooldown restarted from the probe failure.
        let (_, too_early) = breaker.check_at(t1 + Duration::from_millis(500));
        assert!(!too_early);
        let (_, after) = breaker.check_at(t1 + Duration::from_millis(1_001));
        assert!(after);
    }

    #[test]
    fn test_can_execute_is_read_only() {
        let registry = BreakerRegistry::new(BreakerSettings {
            max_failures: 1,
            cooldown_ms: 1_000,
        });
        let t0 = Instant::now();
        registry.record_failure_at("model-a", t0);
        let after_cooldown = t0 + Duration::from_millis(1_001);

        // Peeking any number of times leaves the probe available.
        assert!(registry.can_execute_at("model-a", after_cooldown));
        assert!(registry.can_execute_at("model-a", after_cooldown));
        assert!(registry.acquire_at("model-a", after_cooldown).is_ok());

        // With the probe in flight, peeks report unavailable until its
        // outcome is recorded.
        assert!(!registry.can_execute_at("model-a", after_cooldown));
        registry.record_success("model-a");
        assert!(registry.can_execute_at("model-a", after_cooldown));
    }

    #[test]
    fn test_can_execute_true_for_unknown_dependency() {
        let registry = BreakerRegistry::new(settings());
        assert!(registry.can_execute("model-z"));
        // Peeking must not create an entry.
        assert!(registry.status().is_empty());
    }

    #[test]
    fn test_success_resets_counter_while_closed() {
        let mut breaker = CircuitBreaker::new("model-a", settings());
        let t0 = Instant::now();
        breaker.record_failure_at(t0);
        breaker.record_failure_at(t0);
        breaker.record_success();
        assert_eq!(breaker.status().failure_count, 0);

        // Two more failures no longer trip the breaker.
        breaker.record_failure_at(t0);
        breaker.record_failure_at(t0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_error_carries_retry_hint() {
        let mut breaker = CircuitBreaker::new(
            "model-a",
            BreakerSettings {
                max_failures: 1,
                cooldown_ms: 30_000,
            },
        );
        let t0 = Instant::now();
        breaker.record_failure_at(t0);
        match breaker.open_error(t0 + Duration::from_secs(10)) {
            TroupeError::CircuitOpen {
                dependency,
                retry_after_secs,
            } => {
                assert_eq!(dependency, "model-a");
                assert_eq!(retry_after_secs, 20);
            }
            other => panic!("Expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_registry_isolation_between_dependencies() {
        let registry = BreakerRegistry::new(settings());
        let t0 = Instant::now();
        for _ in 0..3 {
            registry.record_failure_at("model-a", t0);
        }

        assert!(registry.acquire_at("model-a", t0).is_err());
        assert!(registry.acquire_at("model-b", t0).is_ok());

        let statuses = registry.status();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].dependency, "model-a");
        assert_eq!(statuses[0].state, CircuitState::Open);
        assert_eq!(statuses[1].state, CircuitState::Closed);
    }

    #[test]
    fn test_registry_acquire_returns_typed_error() {
        let registry = BreakerRegistry::new(BreakerSettings {
            max_failures: 1,
            cooldown_ms: 60_000,
        });
        let t0 = Instant::now();
        registry.record_failure_at("model-a", t0);
        match registry.acquire_at("model-a", t0) {
            Err(TroupeError::CircuitOpen { dependency, .. }) => {
                assert_eq!(dependency, "model-a");
            }
            other => panic!("Expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_registry_emits_transition_events() {
        let registry = BreakerRegistry::new(BreakerSettings {
            max_failures: 1,
            cooldown_ms: 100,
        });
        let mut events = registry.subscribe();
        let t0 = Instant::now();

        registry.record_failure_at("model-a", t0);
        assert_eq!(
            events.recv().await.unwrap(),
            BreakerEvent::Opened {
                dependency: "model-a".to_string()
            }
        );

        assert!(registry
            .acquire_at("model-a", t0 + Duration::from_millis(101))
            .is_ok());
        assert_eq!(
            events.recv().await.unwrap(),
            BreakerEvent::HalfOpened {
                dependency: "model-a".to_string()
            }
        );

        registry.record_success("model-a");
        assert_eq!(
            events.recv().await.unwrap(),
            BreakerEvent::Closed {
                dependency: "model-a".to_string()
            }
        );
    }
}
