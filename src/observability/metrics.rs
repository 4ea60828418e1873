//! Per-dependency counters for guarded calls.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters for one dependency
#[derive(Debug, Default)]
struct DependencyCounters {
    calls: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    generations: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejections: AtomicU64,
    failures: AtomicU64,
    generation_micros: AtomicU64,
}

impl DependencyCounters {
    #[allow(clippy::cast_precision_loss)]
    fn snapshot(&self) -> DependencyMetrics {
        let generations = self.generations.load(Ordering::Relaxed);
        let micros = self.generation_micros.load(Ordering::Relaxed);

        DependencyMetrics {
            calls: self.calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            generations,
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            average_generation_ms: if generations == 0 {
                None
            } else {
                Some(micros as f64 / generations as f64 / 1000.0)
            },
        }
    }
}

/// Metrics collector shared by every orchestrator of a process
#[derive(Debug, Default)]
pub struct MetricsCollector {
    dependencies: RwLock<HashMap<String, Arc<DependencyCounters>>>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, dependency: &str) -> Arc<DependencyCounters> {
        if let Some(counters) = self.dependencies.read().get(dependency) {
            return Arc::clone(counters);
        }
        let mut dependencies = self.dependencies.write();
        Arc::clone(dependencies.entry(dependency.to_string()).or_default())
    }

    /// Record a call offered to the facade
    pub fn record_call(&self, dependency: &str) {
        self.counters(dependency).calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call served from cache
    pub fn record_cache_hit(&self, dependency: &str) {
        self.counters(dependency)
            .cache_hits
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call that joined an in-flight request
    pub fn record_coalesced(&self, dependency: &str) {
        self.counters(dependency)
            .coalesced
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished upstream execution, retries included
    pub fn record_generation(&self, dependency: &str, elapsed: Duration, success: bool) {
        let counters = self.counters(dependency);
        counters.generations.fetch_add(1, Ordering::Relaxed);
        counters.generation_micros.fetch_add(
            u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        if !success {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a rate limiter denial
    pub fn record_rate_limited(&self, dependency: &str) {
        self.counters(dependency)
            .rate_limited
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call rejected by an open breaker
    pub fn record_circuit_rejection(&self, dependency: &str) {
        self.counters(dependency)
            .circuit_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Counters for one dependency, if it has seen any call
    pub fn dependency(&self, dependency: &str) -> Option<DependencyMetrics> {
        self.dependencies
            .read()
            .get(dependency)
            .map(|counters| counters.snapshot())
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let dependencies = self
            .dependencies
            .read()
            .iter()
            .map(|(name, counters)| (name.clone(), counters.snapshot()))
            .collect();

        MetricsSnapshot { dependencies }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.dependencies.write().clear();
    }
}

/// Counters for one dependency at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyMetrics {
    /// Calls offered to the facade
    pub calls: u64,
    /// Calls served from cache
    pub cache_hits: u64,
    /// Calls that joined an in-flight request
    pub coalesced: u64,
    /// Upstream executions started
    pub generations: u64,
    /// Executions denied by the rate limiter
    pub rate_limited: u64,
    /// Executions rejected by an open breaker
    pub circuit_rejections: u64,
    /// Executions that ended in an error
    pub failures: u64,
    /// Mean wall time of an execution
    pub average_generation_ms: Option<f64>,
}

/// Snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Counters by dependency name
    pub dependencies: BTreeMap<String, DependencyMetrics>,
}
