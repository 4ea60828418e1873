//! Retry logic with exponential backoff for transient failures.

use super::CircuitBreaker;
use crate::errors::{ConfigurationError, ResilienceError, ResilienceResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Random spread applied to each delay, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum retries
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Set base delay
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set jitter factor
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before retry number `attempt` (0-based):
    /// `min(base_delay * 2^attempt, max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter > 0.0 {
            let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
            delay.mul_f64((1.0 + spread).max(0.0)).min(self.max_delay)
        } else {
            delay
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.base_delay > self.max_delay {
            return Err(ConfigurationError::invalid(
                "retry.base_delay",
                "must not exceed max_delay",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigurationError::invalid(
                "retry.jitter",
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }
}

/// Check if an error must propagate on first occurrence
pub fn is_non_retryable_error(error: &ResilienceError) -> bool {
    error.is_non_retryable()
}

/// Retry executor with exponential backoff.
///
/// Holds no per-call state, so one executor may serve concurrent calls.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic.
    ///
    /// With a breaker, every attempt goes through
    /// [`CircuitBreaker::execute`], so a breaker that opens mid-sequence
    /// stops the remaining retries with `CircuitOpen`.
    pub async fn execute<F, Fut, T>(
        &self,
        operation: F,
        breaker: Option<&CircuitBreaker>,
    ) -> ResilienceResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let mut attempt = 0;

        loop {
            let result = match breaker {
                Some(breaker) => breaker.execute(&operation).await,
                None => operation().await,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if is_non_retryable_error(&error) {
                debug!(error = %error, "Non-retryable error, not retrying");
                return Err(error);
            }

            if attempt >= self.config.max_retries {
                warn!(
                    attempts = attempt + 1,
                    max_retries = self.config.max_retries,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(error);
            }

            let delay = self.delay_for(attempt, &error);
            debug!(
                attempt = attempt + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Retrying after transient error"
            );

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Backoff for a retry, stretched to an upstream hint but never past `max_delay`
    fn delay_for(&self, attempt: u32, error: &ResilienceError) -> Duration {
        let backoff = self.config.delay_for_attempt(attempt);
        match error.retry_after() {
            Some(hint) => backoff.max(hint).min(self.config.max_delay),
            None => backoff,
        }
    }
}
