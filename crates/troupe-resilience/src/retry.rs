use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use troupe_core::{RetrySettings, TroupeError, TroupeResult};
use tracing::{debug, warn};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Determines whether an error is transient and worth retrying.
///
/// Retryable: provider-side rate limiting (429), server and gateway errors
/// (500/502/503/504), and network-level failures (reset, refused, timeout,
/// DNS), matched by status code or message pattern. Never retryable:
/// malformed requests (400), auth failures (401/403), circuit-open,
/// budget-exceeded, admission rate limiting, and content-policy errors —
/// these fail fast without consuming retry budget.
pub fn is_retryable(err: &TroupeError) -> bool {
    match err {
        TroupeError::CircuitOpen { .. }
        | TroupeError::BudgetExceeded { .. }
        | TroupeError::RateLimited { .. }
        | TroupeError::ContentPolicy(_)
        | TroupeError::Auth(_)
        | TroupeError::BadRequest(_) => false,
        // Network-level I/O failures are transient by nature.
        TroupeError::Io(_) => true,
        TroupeError::Provider(msg) => {
            let lower = msg.to_lowercase();

            // Non-retryable patterns checked first.
            if lower.contains("400")
                || lower.contains("401")
                || lower.contains("403")
                || lower.contains("bad request")
                || lower.contains("unauthorized")
                || lower.contains("forbidden")
            {
                return false;
            }

            lower.contains("429")
                || lower.contains("500")
                || lower.contains("502")
                || lower.contains("503")
                || lower.contains("504")
                || lower.contains("rate limit")
                || lower.contains("too many requests")
                || lower.contains("overloaded")
                || lower.contains("timeout")
                || lower.contains("timed out")
                || lower.contains("connection reset")
                || lower.contains("connection refused")
                || lower.contains("dns")
        }
        _ => false,
    }
}

/// Computes the backoff delay for an attempt: `base * 2^attempt` plus a
/// random jitter in `0..=jitter_percent%` of that value.
pub fn backoff_delay_ms(settings: &RetrySettings, attempt: u32) -> u64 {
    let base = settings
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    if settings.jitter_percent == 0 {
        return base;
    }
    let max_jitter = base.saturating_mul(u64::from(settings.jitter_percent)) / 100;
    base.saturating_add(rand::thread_rng().gen_range(0..=max_jitter))
}

/// Operational counters for the retry executor.
///
/// Incremented concurrently from every conversation-processing path.
#[derive(Debug, Default)]
pub struct RetryStats {
    total_calls: AtomicU64,
    total_retries: AtomicU64,
    first_attempt_successes: AtomicU64,
    retried_successes: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time copy of [`RetryStats`] for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RetryStatsSnapshot {
    /// Calls entering the executor.
    pub total_calls: u64,
    /// Individual retry attempts performed.
    pub total_retries: u64,
    /// Calls that succeeded without retrying.
    pub first_attempt_successes: u64,
    /// Calls that succeeded after at least one retry.
    pub retried_successes: u64,
    /// Calls that exhausted their retry budget.
    pub exhausted: u64,
}

impl RetryStats {
    /// Takes a consistent-enough snapshot for reporting.
    pub fn snapshot(&self) -> RetryStatsSnapshot {
        RetryStatsSnapshot {
            total_calls: self.total_calls.load(Ordering::SeqCst),
            total_retries: self.total_retries.load(Ordering::SeqCst),
            first_attempt_successes: self.first_attempt_successes.load(Ordering::SeqCst),
            retried_successes: self.retried_successes.load(Ordering::SeqCst),
            exhausted: self.exhausted.load(Ordering::SeqCst),
        }
    }
}

/// Exponential-backoff-with-jitter wrapper around a fallible async call.
///
/// Non-retryable errors are rethrown immediately; retryable errors are
/// retried up to `max_retries` times, after which the last error is
/// rethrown. Errors are never silently swallowed.
pub struct RetryExecutor {
    settings: RetrySettings,
    stats: RetryStats,
    /// Injectable sleep function for testing (allows skipping real delays).
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl RetryExecutor {
    /// Creates an executor with the given settings.
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            stats: RetryStats::default(),
            #[cfg(test)]
            sleep_fn: None,
        }
    }

    /// The executor's operational counters.
    pub fn stats(&self) -> &RetryStats {
        &self.stats
    }

    /// Runs `f`, retrying transient failures with exponential backoff.
    pub async fn run<T, F, Fut>(&self, mut f: F) -> TroupeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TroupeResult<T>>,
    {
        self.stats.total_calls.fetch_add(1, Ordering::SeqCst);
        let mut attempt: u32 = 0;

        loop {
            match f().await {
                Ok(value) => {
                    if attempt == 0 {
                        self.stats
                            .first_attempt_successes
                            .fetch_add(1, Ordering::SeqCst);
                    } else {
                        self.stats.retried_successes.fetch_add(1, Ordering::SeqCst);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !is_retryable(&e) {
                        debug!(error = %e, "Non-retryable error, failing fast");
                        return Err(e);
                    }
                    if attempt >= self.settings.max_retries {
                        self.stats.exhausted.fetch_add(1, Ordering::SeqCst);
                        warn!(
                            attempts = attempt + 1,
                            error = %e,
                            "Retry budget exhausted"
                        );
                        return Err(e);
                    }

                    let delay = backoff_delay_ms(&self.settings, attempt);
                    debug!(attempt, delay_ms = delay, error = %e, "Retryable error, backing off");
                    self.do_sleep(delay).await;
                    attempt += 1;
                    self.stats.total_retries.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}
