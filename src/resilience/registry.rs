//! One breaker, one limiter and one cache per dependency, shared by handle.

use super::{CircuitBreaker, CircuitStats, RateLimiter, ResilienceOrchestrator};
use crate::cache::CoalescingCache;
use crate::config::ResilienceConfig;
use crate::errors::ResilienceResult;
use crate::health::{CircuitProbe, HealthChecker};
use crate::observability::MetricsCollector;
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A type-erased cache plus the task sweeping it
struct CacheSlot {
    cache: Box<dyn Any + Send + Sync>,
    sweeper: Option<JoinHandle<()>>,
}

/// Registry handing out the per-dependency breaker, limiter and cache.
///
/// Construct one at startup and pass it to whatever needs a guarded
/// dependency; repeated lookups of a name return the same instances.
/// Caches are keyed by dependency and result type.
pub struct DependencyRegistry {
    defaults: ResilienceConfig,
    overrides: RwLock<HashMap<String, ResilienceConfig>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
    caches: Mutex<HashMap<(String, TypeId), CacheSlot>>,
    metrics: Arc<MetricsCollector>,
}

impl DependencyRegistry {
    /// Create a registry using `defaults` for unconfigured dependencies
    pub fn new(defaults: ResilienceConfig) -> Self {
        Self {
            defaults,
            overrides: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            limiters: RwLock::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    /// Set the configuration for one dependency.
    ///
    /// Takes effect for components created afterwards.
    pub fn configure(
        &self,
        dependency: impl Into<String>,
        config: ResilienceConfig,
    ) -> ResilienceResult<()> {
        config.validate()?;
        self.overrides.write().insert(dependency.into(), config);
        Ok(())
    }

    /// Configuration that applies to a dependency
    pub fn config_for(&self, dependency: &str) -> ResilienceConfig {
        self.overrides
            .read()
            .get(dependency)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Shared metrics collector
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Get or create the breaker for a dependency
    pub fn circuit_breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(dependency) {
            return Arc::clone(breaker);
        }

        let config = self.config_for(dependency).circuit_breaker;
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(dependency.to_string()).or_insert_with(|| {
            debug!(dependency, "Creating circuit breaker");
            Arc::new(CircuitBreaker::new(dependency, config))
        }))
    }

    /// Get or create the limiter for a dependency
    pub fn rate_limiter(&self, dependency: &str) -> Arc<RateLimiter> {
        if let Some(limiter) = self.limiters.read().get(dependency) {
            return Arc::clone(limiter);
        }

        let config = self.config_for(dependency).rate_limiter;
        let mut limiters = self.limiters.write();
        Arc::clone(limiters.entry(dependency.to_string()).or_insert_with(|| {
            debug!(dependency, "Creating rate limiter");
            Arc::new(RateLimiter::new(dependency, config))
        }))
    }

    /// Get or create the cache for a dependency and result type.
    ///
    /// A new cache is swept in the background until the registry is dropped,
    /// when created inside a Tokio runtime.
    pub fn cache<T>(&self, dependency: &str) -> CoalescingCache<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = (dependency.to_string(), TypeId::of::<T>());
        let mut caches = self.caches.lock();

        if let Some(cache) = caches
            .get(&key)
            .and_then(|slot| slot.cache.downcast_ref::<CoalescingCache<T>>())
        {
            return cache.clone();
        }

        debug!(dependency, "Creating coalescing cache");
        let cache = CoalescingCache::<T>::new(self.config_for(dependency).cache);
        let sweeper = cache.spawn_sweeper_in_runtime();
        caches.insert(
            key,
            CacheSlot {
                cache: Box::new(cache.clone()),
                sweeper,
            },
        );
        cache
    }

    /// Build an orchestrator sharing this registry's breaker, limiter, cache
    /// and metrics for the dependency
    pub fn orchestrator<T>(&self, dependency: &str) -> ResilienceResult<ResilienceOrchestrator<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        ResilienceOrchestrator::builder(dependency)
            .config(self.config_for(dependency))
            .circuit_breaker(self.circuit_breaker(dependency))
            .rate_limiter(self.rate_limiter(dependency))
            .cache(self.cache::<T>(dependency))
            .metrics(Arc::clone(&self.metrics))
            .build()
    }

    /// Names of dependencies with a breaker, sorted
    pub fn dependencies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Breaker snapshots for every dependency, sorted by name
    pub fn circuit_stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<CircuitStats> = self
            .breakers
            .read()
            .values()
            .map(|breaker| breaker.stats())
            .collect();
        stats.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        stats
    }

    /// Register a breaker-state probe for every known dependency
    pub fn register_health_checks(&self, checker: &HealthChecker) {
        for (name, breaker) in self.breakers.read().iter() {
            checker.add_check(name.clone(), CircuitProbe::new(Arc::clone(breaker)));
        }
    }
}

impl Default for DependencyRegistry {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl Drop for DependencyRegistry {
    fn drop(&mut self) {
        for slot in self.caches.get_mut().values_mut() {
            if let Some(sweeper) = slot.sweeper.take() {
                sweeper.abort();
            }
        }
    }
}

impl std::fmt::Debug for DependencyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyRegistry")
            .field("dependencies", &self.dependencies())
            .finish()
    }
}
