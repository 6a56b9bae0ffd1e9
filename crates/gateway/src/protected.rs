//! Gateway decorator: semaphore → circuit breaker → hard call timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use lumagen_core::{GenerationError, GenerationResult, ProviderTaskId};
use lumagen_resilience::{CircuitBreaker, ProviderSemaphore};

use crate::provider::{ProviderGateway, SubmitRequest, TaskObservation};

/// Wraps a gateway so every outbound call is bounded and breaker-guarded.
///
/// One instance per provider scope (vendor × kind): the scope owns its
/// semaphore and breaker, so a saturated or failing video vendor never
/// affects photo traffic.
pub struct ProtectedGateway<G> {
    inner: G,
    key: String,
    semaphore: ProviderSemaphore,
    breaker: Arc<CircuitBreaker>,
    acquire_timeout: Duration,
    call_timeout: Duration,
}

impl<G: ProviderGateway> ProtectedGateway<G> {
    pub fn new(
        inner: G,
        key: impl Into<String>,
        semaphore: ProviderSemaphore,
        breaker: Arc<CircuitBreaker>,
        acquire_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            key: key.into(),
            semaphore,
            breaker,
            acquire_timeout,
            call_timeout,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn guarded<T>(
        &self,
        call: impl Future<Output = GenerationResult<T>>,
    ) -> GenerationResult<T> {
        // A caller that cannot get a slot must not reach the network.
        let mut slot = self
            .semaphore
            .acquire(self.acquire_timeout)
            .await
            .map_err(|e| GenerationError::AcquireTimeout { scope: e.scope })?;

        self.breaker.check().map_err(|e| GenerationError::CircuitOpen {
            key: e.key,
            retry_in_ms: e.retry_in_ms,
        })?;

        // The wire call gets its own hard timeout, distinct from the
        // semaphore wait; overruns count as the provider being unavailable.
        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %self.key, timeout_ms = self.call_timeout.as_millis() as u64, "provider call timed out");
                Err(GenerationError::provider_unavailable(format!(
                    "call to {} exceeded {}ms",
                    self.key,
                    self.call_timeout.as_millis()
                )))
            }
        };

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.counts_toward_breaker() => self.breaker.record_failure(),
            // The provider answered; a validation or business rejection is
            // not evidence it is down, and it resolves a pending probe.
            Err(_) => self.breaker.record_success(),
        }

        slot.release();
        result
    }
}

#[async_trait]
impl<G: ProviderGateway> ProviderGateway for ProtectedGateway<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn submit(&self, request: &SubmitRequest) -> GenerationResult<ProviderTaskId> {
        self.guarded(self.inner.submit(request)).await
    }

    async fn poll(&self, task_id: &ProviderTaskId) -> GenerationResult<TaskObservation> {
        self.guarded(self.inner.poll(task_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use lumagen_core::JobKind;
    use lumagen_resilience::{BreakerConfig, BreakerPhase};

    fn request() -> SubmitRequest {
        SubmitRequest {
            kind: JobKind::Photo,
            model: "test/model".into(),
            input: serde_json::json!({ "prompt": "a lighthouse" }),
            callback_url: None,
        }
    }

    fn protected(mock: MockProvider, breaker_threshold: u32) -> ProtectedGateway<MockProvider> {
        ProtectedGateway::new(
            mock,
            "mock:photo",
            ProviderSemaphore::new(2, "mock:photo"),
            Arc::new(CircuitBreaker::new(
                "mock:photo",
                BreakerConfig {
                    failure_threshold: breaker_threshold,
                    cooldown: Duration::from_secs(60),
                    max_cooldown: Duration::from_secs(600),
                },
            )),
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn transient_failures_trip_the_breaker_and_short_circuit() {
        let mock = MockProvider::new("mock");
        for _ in 0..2 {
            mock.enqueue_submit(Err(GenerationError::provider_unavailable("boom")));
        }
        let gateway = protected(mock, 2);

        for _ in 0..2 {
            let err = gateway.submit(&request()).await.unwrap_err();
            assert!(matches!(err, GenerationError::ProviderUnavailable(_)));
        }

        // Third call is rejected without reaching the mock.
        let err = gateway.submit(&request()).await.unwrap_err();
        assert!(matches!(err, GenerationError::CircuitOpen { .. }));
        assert_eq!(gateway.breaker.snapshot().phase, BreakerPhase::Open);
        assert_eq!(gateway.inner.submit_calls(), 2);
    }

    #[tokio::test]
    async fn rejections_pass_through_without_moving_the_breaker() {
        let mock = MockProvider::new("mock");
        for _ in 0..5 {
            mock.enqueue_submit(Err(GenerationError::provider_rejected("nsfw")));
        }
        let gateway = protected(mock, 2);

        for _ in 0..5 {
            let err = gateway.submit(&request()).await.unwrap_err();
            assert!(matches!(err, GenerationError::ProviderRejected(_)));
        }
        assert_eq!(gateway.breaker.snapshot().phase, BreakerPhase::Closed);
    }

    #[tokio::test]
    async fn saturated_semaphore_keeps_the_caller_off_the_network() {
        let mock = MockProvider::new("mock");
        let gateway = Arc::new(ProtectedGateway::new(
            mock,
            "mock:photo",
            ProviderSemaphore::new(1, "mock:photo"),
            Arc::new(CircuitBreaker::new("mock:photo", BreakerConfig::default())),
            Duration::from_millis(30),
            Duration::from_secs(5),
        ));

        let _held = gateway.semaphore.acquire(Duration::from_millis(50)).await.unwrap();

        let err = gateway.submit(&request()).await.unwrap_err();
        assert!(matches!(err, GenerationError::AcquireTimeout { .. }));
        assert_eq!(gateway.inner.submit_calls(), 0);
    }

    #[tokio::test]
    async fn slow_calls_become_provider_unavailable() {
        let mock = MockProvider::new("mock").with_submit_delay(Duration::from_millis(100));
        mock.enqueue_submit(Ok(ProviderTaskId::new("task_1")));
        let gateway = ProtectedGateway::new(
            mock,
            "mock:photo",
            ProviderSemaphore::new(1, "mock:photo"),
            Arc::new(CircuitBreaker::new("mock:photo", BreakerConfig::default())),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );

        let err = gateway.submit(&request()).await.unwrap_err();
        assert!(matches!(err, GenerationError::ProviderUnavailable(_)));
        assert_eq!(gateway.breaker.snapshot().consecutive_failures, 1);
    }
}
