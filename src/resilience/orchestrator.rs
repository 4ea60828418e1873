//! Resilient call facade.
//!
//! Every guarded call goes cache first. Only a genuine miss reaches the
//! upstream, and only after the rate limiter admits it; the operation then
//! runs under retry with each attempt gated by the circuit breaker.

use super::{
    CircuitBreaker, CircuitState, CircuitStats, RateLimiter, RateLimiterStats, RetryExecutor,
};
use crate::cache::{CacheStats, CachedResult, CoalescingCache, Fingerprint, Resolution};
use crate::config::ResilienceConfig;
use crate::errors::{ResilienceError, ResilienceResult};
use crate::observability::MetricsCollector;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Administrative view of one guarded dependency
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorStats {
    /// Dependency name
    pub dependency: String,
    /// Breaker snapshot
    pub circuit: CircuitStats,
    /// Limiter snapshot
    pub rate_limiter: RateLimiterStats,
    /// Cache snapshot
    pub cache: CacheStats,
}

/// The upstream-facing half of the facade: limiter, retry and breaker
#[derive(Clone)]
struct Guards {
    name: Arc<str>,
    circuit_breaker: Arc<CircuitBreaker>,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Guards {
    async fn run<F, Fut, T>(&self, operation: F) -> ResilienceResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        if let Err(error) = self.rate_limiter.acquire() {
            if let Some(metrics) = &self.metrics {
                metrics.record_rate_limited(&self.name);
            }
            return Err(error);
        }

        let started = Instant::now();
        let result = self
            .retry
            .execute(operation, Some(self.circuit_breaker.as_ref()))
            .await;

        if let Some(metrics) = &self.metrics {
            match &result {
                Err(ResilienceError::CircuitOpen { .. }) => {
                    metrics.record_circuit_rejection(&self.name);
                }
                outcome => metrics.record_generation(&self.name, started.elapsed(), outcome.is_ok()),
            }
        }
        result
    }
}

/// Facade composing the coalescing cache, rate limiter, retry executor and
/// circuit breaker for one dependency
pub struct ResilienceOrchestrator<T> {
    guards: Guards,
    cache: CoalescingCache<T>,
    sweeper: Option<JoinHandle<()>>,
}

impl<T> ResilienceOrchestrator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an orchestrator owning fresh components built from `config`
    pub fn new(name: impl Into<String>, config: &ResilienceConfig) -> ResilienceResult<Self> {
        Self::builder(name).config(config.clone()).build()
    }

    /// Create an orchestrator builder
    pub fn builder(name: impl Into<String>) -> OrchestratorBuilder<T> {
        OrchestratorBuilder::new(name)
    }

    /// Dependency this orchestrator guards
    pub fn name(&self) -> &str {
        &self.guards.name
    }

    /// Run a request through cache, limiter, retry and breaker.
    ///
    /// Callers with the same fingerprint share one execution and receive the
    /// identical result or error. A limiter denial fails the call with
    /// `RateLimitExceeded` and leaves the breaker untouched.
    #[instrument(skip(self, request, operation), fields(dependency = %self.guards.name))]
    pub async fn execute<R, F, Fut>(
        &self,
        request: &R,
        operation: F,
    ) -> ResilienceResult<CachedResult<T>>
    where
        R: Fingerprint + Sync + ?Sized,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<T>> + Send + 'static,
    {
        if let Some(metrics) = &self.guards.metrics {
            metrics.record_call(&self.guards.name);
        }

        let guards = self.guards.clone();
        let (value, resolution) = self
            .cache
            .resolve(request, move || async move { guards.run(operation).await })
            .await?;

        match resolution {
            Resolution::Hit => {
                debug!("Served from cache");
                if let Some(metrics) = &self.guards.metrics {
                    metrics.record_cache_hit(&self.guards.name);
                }
            }
            Resolution::Joined => {
                if let Some(metrics) = &self.guards.metrics {
                    metrics.record_coalesced(&self.guards.name);
                }
            }
            Resolution::Generated => {}
        }

        Ok(value)
    }

    /// Run an operation through limiter, retry and breaker, bypassing the cache
    #[instrument(skip(self, operation), fields(dependency = %self.guards.name))]
    pub async fn execute_uncached<F, Fut, V>(&self, operation: F) -> ResilienceResult<V>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ResilienceResult<V>>,
    {
        if let Some(metrics) = &self.guards.metrics {
            metrics.record_call(&self.guards.name);
        }
        self.guards.run(operation).await
    }

    /// The breaker guarding this dependency
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.guards.circuit_breaker
    }

    /// The limiter guarding this dependency
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.guards.rate_limiter
    }

    /// The coalescing cache in front of this dependency
    pub fn cache(&self) -> &CoalescingCache<T> {
        &self.cache
    }

    /// Get the circuit breaker state
    pub fn circuit_state(&self) -> CircuitState {
        self.guards.circuit_breaker.state()
    }

    /// Reset the circuit breaker
    pub fn reset_circuit(&self) {
        self.guards.circuit_breaker.reset();
    }

    /// Drop every cached result
    pub fn clear_cache(&self) {
        self.cache.clear_cache();
    }

    /// Drop the cached result for one request
    pub fn remove_from_cache<R: Fingerprint + ?Sized>(&self, request: &R) -> bool {
        self.cache.remove_from_cache(request)
    }

    /// Snapshot of every component
    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            dependency: self.guards.name.to_string(),
            circuit: self.guards.circuit_breaker.stats(),
            rate_limiter: self.guards.rate_limiter.stats(),
            cache: self.cache.stats(),
        }
    }
}

impl<T> Drop for ResilienceOrchestrator<T> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl<T> std::fmt::Debug for ResilienceOrchestrator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceOrchestrator")
            .field("name", &self.guards.name)
            .field("circuit_breaker", &self.guards.circuit_breaker)
            .field("rate_limiter", &self.guards.rate_limiter)
            .field("retry", &self.guards.retry)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Builder for [`ResilienceOrchestrator`].
///
/// Components not supplied are created from the configuration. Supplying a
/// shared breaker, limiter or cache keeps one instance per dependency across
/// orchestrators. A cache created here is swept in the background for as
/// long as the orchestrator lives, when built inside a Tokio runtime.
pub struct OrchestratorBuilder<T> {
    name: String,
    config: ResilienceConfig,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    cache: Option<CoalescingCache<T>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<T> OrchestratorBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a builder for a dependency
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ResilienceConfig::default(),
            circuit_breaker: None,
            rate_limiter: None,
            cache: None,
            metrics: None,
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing circuit breaker
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Use an existing rate limiter
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Use an existing cache
    pub fn cache(mut self, cache: CoalescingCache<T>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Record counters into a collector
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and build the orchestrator
    pub fn build(self) -> ResilienceResult<ResilienceOrchestrator<T>> {
        self.config.validate()?;

        let circuit_breaker = self.circuit_breaker.unwrap_or_else(|| {
            Arc::new(CircuitBreaker::new(
                self.name.clone(),
                self.config.circuit_breaker.clone(),
            ))
        });
        let rate_limiter = self.rate_limiter.unwrap_or_else(|| {
            Arc::new(RateLimiter::new(
                self.name.clone(),
                self.config.rate_limiter.clone(),
            ))
        });
        let (cache, sweeper) = match self.cache {
            Some(cache) => (cache, None),
            None => {
                let cache = CoalescingCache::new(self.config.cache.clone());
                let sweeper = cache.spawn_sweeper_in_runtime();
                (cache, sweeper)
            }
        };

        Ok(ResilienceOrchestrator {
            guards: Guards {
                name: Arc::from(self.name),
                circuit_breaker,
                rate_limiter,
                retry: RetryExecutor::new(self.config.retry),
                metrics: self.metrics,
            },
            cache,
            sweeper,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, RequestDescriptor};
    use crate::errors::UpstreamError;
    use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config() -> ResilienceConfig {
        ResilienceConfig::builder()
            .retry(
                RetryConfig::new()
                    .max_retries(2)
                    .base_delay(Duration::from_millis(10))
                    .max_delay(Duration::from_millis(100)),
            )
            .circuit_breaker(CircuitBreakerConfig::new().failure_threshold(3))
            .rate_limiter(RateLimiterConfig::new().max_requests(2))
            .build()
            .unwrap()
    }

    fn request(n: u32) -> RequestDescriptor {
        RequestDescriptor::new("lesson").field("slide", n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_limiter() {
        let metrics = Arc::new(MetricsCollector::new());
        let orchestrator: ResilienceOrchestrator<String> = ResilienceOrchestrator::builder("llm")
            .config(config())
            .metrics(metrics.clone())
            .build()
            .unwrap();

        for _ in 0..5 {
            let value = orchestrator
                .execute(&request(1), || async { Ok("text".to_string()) })
                .await
                .unwrap();
            assert_eq!(value.result, "text");
        }

        assert_eq!(orchestrator.rate_limiter().remaining_requests(), 1);
        let counters = metrics.dependency("llm").unwrap();
        assert_eq!(counters.calls, 5);
        assert_eq!(counters.cache_hits, 4);
        assert_eq!(counters.generations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_leaves_breaker_closed() {
        let orchestrator: ResilienceOrchestrator<String> =
            ResilienceOrchestrator::new("llm", &config()).unwrap();

        for n in 0..2 {
            orchestrator
                .execute(&request(n), || async { Ok("ok".to_string()) })
                .await
                .unwrap();
        }

        let denied = orchestrator
            .execute(&request(9), || async { Ok("ok".to_string()) })
            .await;
        assert!(matches!(denied, Err(ResilienceError::RateLimitExceeded { .. })));
        assert_eq!(orchestrator.circuit_state(), CircuitState::Closed);
        assert_eq!(orchestrator.stats().circuit.total_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failure() {
        let orchestrator: ResilienceOrchestrator<u32> =
            ResilienceOrchestrator::new("llm", &config()).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let value = orchestrator
            .execute(&request(1), move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(UpstreamError::from_status(503, "busy").into())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value.result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // One limiter slot for the whole retry sequence
        assert_eq!(orchestrator.rate_limiter().remaining_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_uncached() {
        let orchestrator: ResilienceOrchestrator<String> =
            ResilienceOrchestrator::new("llm", &config()).unwrap();

        let result: ResilienceResult<&str> = orchestrator
            .execute_uncached(|| async { Err(UpstreamError::from_status(404, "gone").into()) })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::Upstream(UpstreamError::NotFound { .. }))
        ));
        assert_eq!(orchestrator.stats().cache.size, 0);
        assert_eq!(orchestrator.stats().circuit.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owned_cache_is_swept() {
        let mut config = config();
        config.cache = CacheConfig::new()
            .ttl(Duration::from_secs(5))
            .sweep_interval(Duration::from_secs(10));
        let orchestrator: ResilienceOrchestrator<String> =
            ResilienceOrchestrator::new("llm", &config).unwrap();

        orchestrator
            .execute(&request(1), || async { Ok("a".to_string()) })
            .await
            .unwrap();
        assert_eq!(orchestrator.stats().cache.size, 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(orchestrator.stats().cache.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_runs_in_caller_span() {
        let _subscriber = tracing::subscriber::set_default(tracing_subscriber::registry());
        let orchestrator: ResilienceOrchestrator<String> =
            ResilienceOrchestrator::new("llm", &config()).unwrap();

        let value = orchestrator
            .execute(&request(1), || async {
                let span = tracing::Span::current();
                Ok(span.metadata().map_or("none", |m| m.name()).to_string())
            })
            .await
            .unwrap();

        assert_eq!(value.result, "execute");
    }

    #[test]
    fn test_build_outside_runtime() {
        let orchestrator: ResilienceOrchestrator<String> =
            ResilienceOrchestrator::new("llm", &config()).unwrap();
        assert!(orchestrator.sweeper.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_surface() {
        let orchestrator: ResilienceOrchestrator<String> =
            ResilienceOrchestrator::new("llm", &config()).unwrap();

        orchestrator
            .execute(&request(1), || async { Ok("a".to_string()) })
            .await
            .unwrap();
        assert!(orchestrator.remove_from_cache(&request(1)));
        assert!(!orchestrator.remove_from_cache(&request(1)));

        orchestrator
            .execute(&request(2), || async { Ok("b".to_string()) })
            .await
            .unwrap();
        orchestrator.clear_cache();
        assert_eq!(orchestrator.stats().cache.size, 0);

        orchestrator.reset_circuit();
        assert_eq!(orchestrator.circuit_state(), CircuitState::Closed);
        assert_eq!(orchestrator.name(), "llm");
    }
}
