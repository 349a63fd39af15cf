use crate::provider::{InferenceProvider, InvokeRequest, ProviderReply};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use troupe_cost::CostLedger;
use troupe_core::TroupeResult;
use troupe_resilience::{BreakerRegistry, RetryExecutor};

/// Decorator composing the guards around an inner provider, in order:
/// budget check, circuit breaker on the model, retry executor, breaker
/// recording, usage logging.
///
/// Budget and breaker rejections fail fast before any network call; retry
/// wraps only the inner invocation.
pub struct GuardedProvider {
    inner: Arc<dyn InferenceProvider>,
    breakers: Arc<BreakerRegistry>,
    retry: Arc<RetryExecutor>,
    ledger: Arc<CostLedger>,
}

impl GuardedProvider {
    /// Wraps an inner provider with the shared guard singletons.
    pub fn new(
        inner: Arc<dyn InferenceProvider>,
        breakers: Arc<BreakerRegistry>,
        retry: Arc<RetryExecutor>,
        ledger: Arc<CostLedger>,
    ) -> Self {
        Self {
            inner,
            breakers,
            retry,
            ledger,
        }
    }
}

#[async_trait]
impl InferenceProvider for GuardedProvider {
    async fn invoke(&self, request: &InvokeRequest) -> TroupeResult<ProviderReply> {
        self.ledger.check_budget().await?;
        self.breakers.acquire(&request.model)?;

        let started = Instant::now();
        let result = self.retry.run(|| self.inner.invoke(request)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(reply) => {
                self.breakers.record_success(&request.model);
                if let Err(e) = self
                    .ledger
                    .log_usage(
                        &request.agent,
                        &request.model,
                        reply.tokens_in,
                        reply.tokens_out,
                        latency_ms,
                        request.thread_id,
                    )
                    .await
                {
                    // A broken ledger must not fail a successful call.
                    warn!(error = %e, model = %request.model, "Failed to log usage");
                }
                Ok(reply)
            }
            Err(e) => {
                self.breakers.record_failure(&request.model);
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::provider::ProviderOutput;
    use std::sync::atomic::{AtomicU32, Ordering};
    use troupe_core::{BreakerSettings, Message, RetrySettings, TroupeError};
    use troupe_cost::{InMemoryUsageStore, UsageFilter, UsageStore};
    use uuid::Uuid;

    struct StubProvider {
        calls: AtomicU32,
        fail_with: Option<fn() -> TroupeError>,
    }

    impl StubProvider {
        fn ok() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_with: None,
            }
        }

        fn failing(f: fn() -> TroupeError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_with: Some(f),
            }
        }
    }

    #[async_trait]
    impl InferenceProvider for StubProvider {
        async fn invoke(&self, _request: &InvokeRequest) -> TroupeResult<ProviderReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(f) => Err(f()),
                None => Ok(ProviderReply {
                    output: ProviderOutput::Text("ok".to_string()),
                    tokens_in: 100,
                    tokens_out: 50,
                }),
            }
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    fn request() -> InvokeRequest {
        InvokeRequest {
            model: "gpt-4o".to_string(),
            system: None,
            messages: vec![Message::user("hi", Uuid::new_v4())],
            schema: None,
            max_tokens: 256,
            agent: "builder".to_string(),
            thread_id: None,
        }
    }

    struct Harness {
        inner: Arc<StubProvider>,
        store: Arc<InMemoryUsageStore>,
        breakers: Arc<BreakerRegistry>,
        guarded: GuardedProvider,
    }

    fn harness(inner: StubProvider, budget: f64) -> Harness {
        let inner = Arc::new(inner);
        let store = Arc::new(InMemoryUsageStore::new());
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings::default()));
        let retry = Arc::new(RetryExecutor::new(RetrySettings {
            max_retries: 0,
            base_delay_ms: 1,
            jitter_percent: 0,
        }));
        let ledger = Arc::new(CostLedger::new(store.clone(), budget));
        let guarded = GuardedProvider::new(
            inner.clone(),
            breakers.clone(),
            retry,
            ledger,
        );
        Harness {
            inner,
            store,
            breakers,
            guarded,
        }
    }

    #[tokio::test]
    async fn test_success_logs_usage_and_records_breaker() {
        let h = harness(StubProvider::ok(), 50.0);
        let reply = h.guarded.invoke(&request()).await.unwrap();
        assert_eq!(reply.tokens_in, 100);

        let rows = h.store.query(&UsageFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].agent, "builder");
        assert_eq!(rows[0].model, "gpt-4o");
        assert!(h.breakers.can_execute("gpt-4o"));
    }

    #[tokio::test]
    async fn test_budget_exhausted_blocks_before_provider() {
        let h = harness(StubProvider::ok(), 0.0);
        let err = h.guarded.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, TroupeError::BudgetExceeded { .. }));
        assert_eq!(h.inner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_breaker_blocks_before_provider() {
        let h = harness(StubProvider::ok(), 50.0);
        for _ in 0..BreakerSettings::default().max_failures {
            h.breakers.record_failure("gpt-4o");
        }
        let err = h.guarded.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, TroupeError::CircuitOpen { .. }));
        assert_eq!(h.inner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_records_breaker_and_logs_nothing() {
        let h = harness(
            StubProvider::failing(|| TroupeError::Provider("503: unavailable".to_string())),
            50.0,
        );
        let err = h.guarded.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, TroupeError::Provider(_)));
        assert_eq!(h.inner.calls.load(Ordering::SeqCst), 1);

        let rows = h.store.query(&UsageFilter::default()).await.unwrap();
        assert!(rows.is_empty());

        let status = h.breakers.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].failure_count, 1);
    }
}
