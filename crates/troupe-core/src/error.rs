use thiserror::Error;

/// A convenience `Result` alias using [`TroupeError`].
pub type TroupeResult<T> = Result<T, TroupeError>;

/// Top-level error type for the Troupe control plane.
///
/// Transport-level provider failures stay stringly-typed in [`Provider`]
/// (the retry classifier inspects the message), while resource-exhaustion
/// conditions get their own variants so callers can fail fast on them
/// without pattern-matching text.
///
/// [`Provider`]: TroupeError::Provider
#[derive(Debug, Error)]
pub enum TroupeError {
    /// An error from an outbound inference provider call (HTTP status text,
    /// network failure, malformed response body).
    #[error("Provider error: {0}")]
    Provider(String),

    /// The circuit breaker for a dependency is open; the call was rejected
    /// without reaching the provider.
    #[error("Circuit open for {dependency}, retry after {retry_after_secs}s")]
    CircuitOpen {
        /// The dependency key whose breaker rejected the call.
        dependency: String,
        /// Remaining cooldown before a probe will be allowed.
        retry_after_secs: u64,
    },

    /// The configured daily budget has been reached.
    #[error("Daily budget exceeded: spent ${spent_usd:.2} of ${limit_usd:.2}")]
    BudgetExceeded {
        /// Spend recorded so far today, in USD.
        spent_usd: f64,
        /// The configured daily ceiling, in USD.
        limit_usd: f64,
    },

    /// The caller was rejected by the rate limiter.
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the oldest window entry expires.
        retry_after_secs: u64,
    },

    /// The provider refused the request on content-policy grounds.
    #[error("Content policy violation: {0}")]
    ContentPolicy(String),

    /// Authentication or authorization failure (401/403).
    #[error("Auth error: {0}")]
    Auth(String),

    /// The request was malformed (400); retrying cannot help.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A routing decision could not be produced at a given fallback level.
    #[error("Decision error: {0}")]
    Decision(String),

    /// An error from the usage/ledger storage layer.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_open_display_includes_hint() {
        let err = TroupeError::CircuitOpen {
            dependency: "gpt-4o".to_string(),
            retry_after_secs: 42,
        };
        let msg = err.to_string();
        assert!(msg.contains("gpt-4o"));
        assert!(msg.contains("42"));
    }

    #[test]
    fn test_budget_exceeded_display() {
        let err = TroupeError::BudgetExceeded {
            spent_usd: 51.234,
            limit_usd: 50.0,
        };
        assert!(err.to_string().contains("$51.23"));
    }
}
