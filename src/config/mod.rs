//! Configuration for a guarded dependency.
//!
//! [`ResilienceConfig`] aggregates the settings of every component guarding
//! one dependency. Build it in code, or load it from `RESILIENCE_*`
//! environment variables.

use crate::cache::CacheConfig;
use crate::errors::{ConfigurationError, ResilienceResult};
use crate::health::HealthConfig;
use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
use std::str::FromStr;
use std::time::Duration;

/// Prefix of every environment variable read by [`ResilienceConfig::from_env`]
pub const ENV_PREFIX: &str = "RESILIENCE";

/// Settings for every component guarding one dependency
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResilienceConfig {
    /// Retry configuration
    pub retry: RetryConfig,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Rate limiter configuration
    pub rate_limiter: RateLimiterConfig,
    /// Coalescing cache configuration
    pub cache: CacheConfig,
    /// Health check configuration
    pub health: HealthConfig,
}

impl ResilienceConfig {
    /// Create a new configuration builder
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::new()
    }

    /// Load configuration for a dependency from the environment.
    ///
    /// Each setting is read from `RESILIENCE_<DEPENDENCY>_<KEY>` first, then
    /// `RESILIENCE_<KEY>`. Unset settings keep their defaults.
    ///
    /// | Key | Setting |
    /// |---|---|
    /// | `MAX_RETRIES` | `retry.max_retries` |
    /// | `BASE_DELAY_MS` | `retry.base_delay` |
    /// | `MAX_DELAY_MS` | `retry.max_delay` |
    /// | `FAILURE_THRESHOLD` | `circuit_breaker.failure_threshold` |
    /// | `RECOVERY_TIMEOUT_MS` | `circuit_breaker.recovery_timeout` |
    /// | `RATE_LIMIT_MAX` | `rate_limiter.max_requests` |
    /// | `RATE_LIMIT_WINDOW_MS` | `rate_limiter.window` |
    /// | `CACHE_TTL_MS` | `cache.ttl` |
    /// | `CACHE_MAX_SIZE` | `cache.max_size` |
    /// | `PENDING_TIMEOUT_MS` | `cache.pending_timeout` |
    pub fn from_env(dependency: &str) -> ResilienceResult<Self> {
        Self::from_lookup(dependency, |key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<L>(dependency: &str, lookup: L) -> ResilienceResult<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let source = EnvSource {
            dependency: normalize(dependency),
            lookup,
        };
        let mut builder = Self::builder();

        if let Some(n) = source.parse::<u32>("MAX_RETRIES")? {
            builder.config.retry.max_retries = n;
        }
        if let Some(delay) = source.millis("BASE_DELAY_MS")? {
            builder.config.retry.base_delay = delay;
        }
        if let Some(delay) = source.millis("MAX_DELAY_MS")? {
            builder.config.retry.max_delay = delay;
        }
        if let Some(n) = source.parse::<u32>("FAILURE_THRESHOLD")? {
            builder.config.circuit_breaker.failure_threshold = n;
        }
        if let Some(timeout) = source.millis("RECOVERY_TIMEOUT_MS")? {
            builder.config.circuit_breaker.recovery_timeout = timeout;
        }
        if let Some(n) = source.parse::<u32>("RATE_LIMIT_MAX")? {
            builder.config.rate_limiter.max_requests = n;
        }
        if let Some(window) = source.millis("RATE_LIMIT_WINDOW_MS")? {
            builder.config.rate_limiter.window = window;
        }
        if let Some(ttl) = source.millis("CACHE_TTL_MS")? {
            builder.config.cache.ttl = ttl;
        }
        if let Some(n) = source.parse::<usize>("CACHE_MAX_SIZE")? {
            builder.config.cache.max_size = n;
        }
        if let Some(timeout) = source.millis("PENDING_TIMEOUT_MS")? {
            builder.config.cache.pending_timeout = timeout;
        }

        builder.build()
    }

    /// Validate every component's configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.rate_limiter.validate()?;
        self.cache.validate()?;
        self.health.validate()?;
        Ok(())
    }
}

/// Builder for [`ResilienceConfig`]
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfigBuilder {
    config: ResilienceConfig,
}

impl ResilienceConfigBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set retry configuration
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    /// Set circuit breaker configuration
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Set rate limiter configuration
    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.config.rate_limiter = config;
        self
    }

    /// Set cache configuration
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    /// Set health check configuration
    pub fn health(mut self, config: HealthConfig) -> Self {
        self.config.health = config;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> ResilienceResult<ResilienceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

struct EnvSource<L> {
    dependency: String,
    lookup: L,
}

impl<L> EnvSource<L>
where
    L: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<(String, String)> {
        let scoped = format!("{ENV_PREFIX}_{}_{key}", self.dependency);
        if let Some(value) = (self.lookup)(&scoped) {
            return Some((scoped, value));
        }
        let global = format!("{ENV_PREFIX}_{key}");
        (self.lookup)(&global).map(|value| (global, value))
    }

    fn parse<V: FromStr>(&self, key: &str) -> Result<Option<V>, ConfigurationError> {
        match self.raw(key) {
            Some((name, value)) => value.trim().parse::<V>().map(Some).map_err(|_| {
                ConfigurationError::InvalidValue {
                    field: name,
                    message: format!("cannot parse '{value}'"),
                }
            }),
            None => Ok(None),
        }
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigurationError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

/// Upper-case a dependency name and map separators to `_`
fn normalize(dependency: &str) -> String {
    dependency
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
