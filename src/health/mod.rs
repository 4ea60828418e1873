//! Health checks for guarded dependencies.
//!
//! Probes run off the request path. A probe that errors, panics or overruns
//! its timeout reports unhealthy instead of failing the run.

use crate::errors::{ConfigurationError, ResilienceResult};
use crate::resilience::{CircuitBreaker, CircuitState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Configuration for health checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Upper bound for a single probe
    pub probe_timeout: Duration,
    /// Period of background runs
    pub interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            interval: Duration::from_secs(30),
        }
    }
}

impl HealthConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set probe timeout
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set background run interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.probe_timeout.is_zero() {
            return Err(ConfigurationError::invalid(
                "health.probe_timeout",
                "must be greater than zero",
            ));
        }
        if self.interval.is_zero() {
            return Err(ConfigurationError::invalid(
                "health.interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// A named liveness check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Report whether the dependency is healthy
    async fn check(&self) -> ResilienceResult<bool>;
}

struct FnProbe<F>(F);

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ResilienceResult<bool>> + Send,
{
    async fn check(&self) -> ResilienceResult<bool> {
        (self.0)().await
    }
}

/// Probe that reports a dependency unhealthy while its breaker is open
pub struct CircuitProbe {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitProbe {
    /// Watch a breaker
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

#[async_trait]
impl HealthProbe for CircuitProbe {
    async fn check(&self) -> ResilienceResult<bool> {
        Ok(self.breaker.state() != CircuitState::Open)
    }
}

/// Outcome of one health run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Dependency name to probe result
    pub checks: BTreeMap<String, bool>,
    /// True iff every probe reported healthy
    pub healthy: bool,
    /// When the run finished
    pub checked_at: DateTime<Utc>,
    /// Run sequence number; higher is newer
    pub generation: u64,
}

impl HealthReport {
    /// Names of the probes that reported unhealthy
    pub fn failing(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, healthy)| !**healthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Render the report as JSON for monitoring collaborators
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Registry of health probes
pub struct HealthChecker {
    config: HealthConfig,
    probes: RwLock<HashMap<String, Arc<dyn HealthProbe>>>,
    generation: AtomicU64,
    last_report: RwLock<Option<HealthReport>>,
}

impl HealthChecker {
    /// Create an empty checker
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            probes: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            last_report: RwLock::new(None),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Register a probe. A later registration for the same name wins.
    pub fn add_check(&self, name: impl Into<String>, probe: impl HealthProbe + 'static) {
        let name = name.into();
        debug!(check = %name, "Registering health check");
        self.probes.write().insert(name, Arc::new(probe));
    }

    /// Register an async closure as a probe
    pub fn add_check_fn<F, Fut>(&self, name: impl Into<String>, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<bool>> + Send + 'static,
    {
        self.add_check(name, FnProbe(probe));
    }

    /// Unregister a probe
    pub fn remove_check(&self, name: &str) -> bool {
        self.probes.write().remove(name).is_some()
    }

    /// Registered probe names, sorted
    pub fn check_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.probes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run every probe concurrently and record the report
    pub async fn run_checks(&self) -> HealthReport {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let probe_timeout = self.config.probe_timeout;

        let probes: Vec<(String, Arc<dyn HealthProbe>)> = self
            .probes
            .read()
            .iter()
            .map(|(name, probe)| (name.clone(), Arc::clone(probe)))
            .collect();

        let runs = probes.into_iter().map(|(name, probe)| {
            let handle =
                tokio::spawn(async move { tokio::time::timeout(probe_timeout, probe.check()).await });

            async move {
                let healthy = match handle.await {
                    Ok(Ok(Ok(healthy))) => healthy,
                    Ok(Ok(Err(error))) => {
                        warn!(check = %name, error = %error, "Health check failed");
                        false
                    }
                    Ok(Err(_)) => {
                        warn!(check = %name, timeout = ?probe_timeout, "Health check timed out");
                        false
                    }
                    Err(error) => {
                        warn!(check = %name, error = %error, "Health check aborted");
                        false
                    }
                };
                (name, healthy)
            }
        });

        let checks: BTreeMap<String, bool> = join_all(runs).await.into_iter().collect();
        let report = HealthReport {
            healthy: checks.values().all(|healthy| *healthy),
            checks,
            checked_at: Utc::now(),
            generation,
        };

        self.store(&report);
        if !report.healthy {
            warn!(failing = ?report.failing(), "Dependencies unhealthy");
        }
        report
    }

    /// Keep the newest run; a slower older run never replaces it
    fn store(&self, report: &HealthReport) {
        let mut last = self.last_report.write();
        if last
            .as_ref()
            .map_or(true, |current| current.generation < report.generation)
        {
            *last = Some(report.clone());
        }
    }

    /// Run every probe and report whether all are healthy.
    ///
    /// No probes registered counts as healthy.
    pub async fn is_healthy(&self) -> bool {
        self.run_checks().await.healthy
    }

    /// Newest completed report, if any run has finished
    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report.read().clone()
    }

    /// Run checks every `interval` in the background.
    ///
    /// The task holds a weak handle and exits once the checker is dropped.
    pub fn spawn_periodic(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(checker) = weak.upgrade() else {
                    break;
                };
                checker.run_checks().await;
            }
        })
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.config)
            .field("checks", &self.check_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UpstreamError;
    use crate::resilience::CircuitBreakerConfig;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let checker = HealthChecker::default();
        assert!(checker.is_healthy().await);
        assert!(checker.last_report().unwrap().checks.is_empty());
    }

    #[tokio::test]
    async fn test_error_maps_to_unhealthy() {
        let checker = HealthChecker::default();
        checker.add_check_fn("db", || async { Ok(true) });
        checker.add_check_fn("llm", || async {
            Err(UpstreamError::transient("connection refused").into())
        });

        let report = checker.run_checks().await;
        assert!(!report.healthy);
        assert_eq!(report.checks.get("db"), Some(&true));
        assert_eq!(report.failing(), vec!["llm"]);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let checker = HealthChecker::default();
        checker.add_check_fn("db", || async { Ok(false) });
        checker.add_check_fn("db", || async { Ok(true) });

        assert_eq!(checker.check_names(), vec!["db".to_string()]);
        assert!(checker.is_healthy().await);
    }

    #[tokio::test]
    async fn test_circuit_probe() {
        let breaker = Arc::new(CircuitBreaker::new(
            "llm",
            CircuitBreakerConfig::new().failure_threshold(1),
        ));
        let checker = HealthChecker::default();
        checker.add_check("llm", CircuitProbe::new(breaker.clone()));
        assert!(checker.is_healthy().await);

        let _: ResilienceResult<()> = breaker
            .execute(|| async { Err(UpstreamError::transient("down").into()) })
            .await;
        assert!(!checker.is_healthy().await);
    }

    #[tokio::test]
    async fn test_report_json() {
        let checker = HealthChecker::default();
        checker.add_check_fn("db", || async { Ok(true) });

        let json = checker.run_checks().await.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["checks"]["db"], serde_json::Value::Bool(true));
        assert_eq!(value["healthy"], serde_json::Value::Bool(true));
    }

    #[test]
    fn test_validate() {
        assert!(HealthConfig::default().validate().is_ok());
        assert!(HealthConfig::new()
            .probe_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
