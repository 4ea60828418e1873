//! Resilience patterns guarding upstream dependencies.
//!
//! Provides rate limiting, circuit breaking, retry with backoff, and the
//! facade composing them with the coalescing cache.

pub mod circuit_breaker;
pub mod orchestrator;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use orchestrator::{OrchestratorBuilder, OrchestratorStats, ResilienceOrchestrator};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use registry::DependencyRegistry;
pub use retry::{is_non_retryable_error, RetryConfig, RetryExecutor};
