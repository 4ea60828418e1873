//! Integration tests for the breaker, limiter, retry executor and facade.

use futures::future::join_all;
use integrations_resilience::cache::RequestDescriptor;
use integrations_resilience::mocks::{MockOperation, MockResponse};
use integrations_resilience::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimiter, RateLimiterConfig,
    RetryConfig, RetryExecutor,
};
use integrations_resilience::{
    DependencyRegistry, ResilienceConfig, ResilienceError, ResilienceOrchestrator, UpstreamError,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn transient() -> UpstreamError {
    UpstreamError::from_status(502, "bad gateway")
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_recovers() {
    // Arrange
    let breaker = CircuitBreaker::new(
        "image-gen",
        CircuitBreakerConfig::new()
            .failure_threshold(5)
            .recovery_timeout(Duration::from_millis(30_000)),
    );
    let op = MockOperation::<String>::new();
    op.set_default(MockResponse::error(transient()));

    // Act: five consecutive failures
    for _ in 0..5 {
        assert!(breaker.execute(op.as_fn()).await.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Sixth call is rejected without reaching the operation
    let rejected = breaker.execute(op.as_fn()).await;
    assert!(matches!(rejected, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(op.calls(), 5);

    // After the recovery timeout exactly one probe runs
    tokio::time::advance(Duration::from_millis(30_001)).await;
    op.push_ok("rendered".to_string());
    let probe = breaker.execute(op.as_fn()).await;

    assert_eq!(assert_ok!(probe), "rendered");
    assert_eq!(op.calls(), 6);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.stats().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_schedules_next_attempt() {
    let breaker = CircuitBreaker::new(
        "image-gen",
        CircuitBreakerConfig::new()
            .failure_threshold(1)
            .recovery_timeout(Duration::from_secs(10)),
    );
    let op = MockOperation::<String>::new();
    op.set_default(MockResponse::error(transient()));

    let _ = breaker.execute(op.as_fn()).await;
    let first_next = breaker.stats().next_attempt_time.unwrap();

    tokio::time::advance(Duration::from_secs(10)).await;
    let _ = breaker.execute(op.as_fn()).await;

    let stats = breaker.stats();
    assert_eq!(stats.state, CircuitState::Open);
    assert!(stats.next_attempt_time.unwrap() > first_next);
    assert_eq!(op.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_window() {
    let limiter = RateLimiter::new(
        "image-gen",
        RateLimiterConfig::new()
            .max_requests(10)
            .window(Duration::from_millis(60_000)),
    );

    for _ in 0..10 {
        assert!(limiter.check_limit());
    }
    assert!(!limiter.check_limit());

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(!limiter.check_limit());

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(limiter.check_limit());
    assert_eq!(limiter.stats().total_denied, 2);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_invokes_once() {
    let executor = RetryExecutor::new(RetryConfig::new().max_retries(4));
    let op = MockOperation::<String>::new();
    op.set_default(MockResponse::error(UpstreamError::from_status(
        401,
        "invalid api key",
    )));

    let result = executor.execute(op.as_fn(), None).await;

    assert!(matches!(
        result,
        Err(ResilienceError::Upstream(UpstreamError::Unauthorized { .. }))
    ));
    assert_eq!(op.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_retried_to_bound() {
    let executor = RetryExecutor::new(
        RetryConfig::new()
            .max_retries(3)
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(3)),
    );
    let op = MockOperation::<String>::new();
    op.set_default(MockResponse::error(transient()));

    let start = tokio::time::Instant::now();
    let result = executor.execute(op.as_fn(), None).await;

    assert_eq!(result.unwrap_err(), ResilienceError::from(transient()));
    assert_eq!(op.calls(), 4);
    // 1s + 2s + 3s (capped)
    assert_eq!(start.elapsed(), Duration::from_secs(6));
}

fn facade_config() -> ResilienceConfig {
    ResilienceConfig::builder()
        .retry(
            RetryConfig::new()
                .max_retries(1)
                .base_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(1)),
        )
        .circuit_breaker(
            CircuitBreakerConfig::new()
                .failure_threshold(2)
                .recovery_timeout(Duration::from_secs(30)),
        )
        .rate_limiter(RateLimiterConfig::new().max_requests(3))
        .build()
        .unwrap()
}

fn outline(topic: &str) -> RequestDescriptor {
    RequestDescriptor::new("lesson-outline").field("topic", topic)
}

#[tokio::test(start_paused = true)]
async fn test_facade_coalesces_concurrent_callers() {
    let orchestrator: Arc<ResilienceOrchestrator<String>> =
        Arc::new(ResilienceOrchestrator::new("gemini", &facade_config()).unwrap());
    let op = MockOperation::new();
    op.push(MockResponse::ok("outline".to_string()).with_delay(Duration::from_secs(3)));

    let callers = (0..8).map(|_| {
        let orchestrator = orchestrator.clone();
        let op = op.clone();
        tokio::spawn(async move { orchestrator.execute(&outline("tides"), op.as_fn()).await })
    });
    let results = join_all(callers).await;

    for result in results {
        assert_eq!(result.unwrap().unwrap().result, "outline");
    }
    assert_eq!(op.calls(), 1);
    assert_eq!(orchestrator.rate_limiter().remaining_requests(), 2);
    assert_eq!(orchestrator.stats().cache.coalesced, 7);
}

#[tokio::test(start_paused = true)]
async fn test_facade_open_circuit_fails_fast() {
    let orchestrator: ResilienceOrchestrator<String> =
        ResilienceOrchestrator::new("gemini", &facade_config()).unwrap();
    let op = MockOperation::new();
    op.set_default(MockResponse::error(transient()));

    // Two attempts (one retry) trip the breaker
    let first = orchestrator.execute(&outline("tides"), op.as_fn()).await;
    assert!(matches!(first, Err(ResilienceError::Upstream(_))));
    assert_eq!(orchestrator.circuit_state(), CircuitState::Open);
    assert_eq!(op.calls(), 2);

    // Different request, same dependency: rejected before any attempt
    let second = orchestrator.execute(&outline("volcanoes"), op.as_fn()).await;
    let error = second.unwrap_err();
    assert!(matches!(error, ResilienceError::CircuitOpen { .. }));
    assert_eq!(
        error.disposition(),
        integrations_resilience::errors::ErrorDisposition::RetryShortly
    );
    assert_eq!(op.calls(), 2);
    assert_eq!(orchestrator.stats().cache.size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_facade_rate_limit_denial() {
    let orchestrator: ResilienceOrchestrator<String> =
        ResilienceOrchestrator::new("gemini", &facade_config()).unwrap();
    let op = MockOperation::new();
    op.set_default(MockResponse::ok("ok".to_string()));

    for topic in ["a", "b", "c"] {
        assert_ok!(orchestrator.execute(&outline(topic), op.as_fn()).await);
    }

    let denied = orchestrator.execute(&outline("d"), op.as_fn()).await;
    assert!(matches!(denied, Err(ResilienceError::RateLimitExceeded { .. })));
    assert_eq!(op.calls(), 3);
    assert_eq!(orchestrator.circuit_state(), CircuitState::Closed);

    // Cached requests are still served while the limiter is exhausted
    assert_ok!(orchestrator.execute(&outline("a"), op.as_fn()).await);
    assert_eq!(op.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_registry_shares_state_across_orchestrators() {
    let registry = DependencyRegistry::new(facade_config());
    let outlines = registry.orchestrator::<String>("gemini").unwrap();
    let quizzes = registry.orchestrator::<Vec<String>>("gemini").unwrap();

    let op = MockOperation::<String>::new();
    op.set_default(MockResponse::error(transient()));
    let _ = outlines.execute(&outline("tides"), op.as_fn()).await;

    assert_eq!(quizzes.circuit_state(), CircuitState::Open);
    let quiz = quizzes
        .execute(&outline("tides"), || async { Ok(vec!["Q1".to_string()]) })
        .await;
    assert!(matches!(quiz, Err(ResilienceError::CircuitOpen { .. })));

    let metrics = registry.metrics().dependency("gemini").unwrap();
    assert_eq!(metrics.calls, 2);
    assert_eq!(metrics.failures, 1);
    assert_eq!(metrics.circuit_rejections, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_handles_coalesce_one_dependency() {
    let registry = DependencyRegistry::new(facade_config());
    let first = Arc::new(registry.orchestrator::<String>("gemini").unwrap());
    let second = Arc::new(registry.orchestrator::<String>("gemini").unwrap());
    let op = MockOperation::new();
    op.set_default(MockResponse::ok("outline".to_string()).with_delay(Duration::from_millis(200)));
    let barrier = Arc::new(tokio::sync::Barrier::new(16));

    let callers = (0..16).map(|n| {
        let orchestrator = if n % 2 == 0 { first.clone() } else { second.clone() };
        let op = op.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            orchestrator.execute(&outline("tides"), op.as_fn()).await
        })
    });
    let results = join_all(callers).await;

    for result in results {
        assert_eq!(result.unwrap().unwrap().result, "outline");
    }
    assert_eq!(op.calls(), 1);
    assert_eq!(first.stats().cache.misses, 1);
    assert_eq!(second.stats().cache.size, 1);
    assert_eq!(registry.rate_limiter("gemini").remaining_requests(), 2);
}
