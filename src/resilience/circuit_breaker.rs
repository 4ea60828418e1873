//! Circuit breaker pattern for fault tolerance.
//!
//! One breaker guards one dependency. The OPEN to HALF_OPEN transition is
//! taken lazily by the first caller that observes the recovery timeout has
//! elapsed; that caller becomes the single probe and every other caller keeps
//! failing fast until the probe resolves.

use crate::errors::{ConfigurationError, ResilienceError, ResilienceResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, one probe is testing the dependency
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// How long to stay open before allowing a probe
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_millis(crate::DEFAULT_RECOVERY_TIMEOUT_MS),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    /// Set recovery timeout
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.failure_threshold == 0 {
            return Err(ConfigurationError::invalid(
                "circuit_breaker.failure_threshold",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Immutable snapshot of a breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    /// Dependency the breaker guards
    pub dependency: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures counted while closed
    pub failure_count: u32,
    /// Consecutive successes
    pub success_count: u32,
    /// When the last failure was recorded
    pub last_failure_time: Option<Instant>,
    /// When an open breaker next admits a probe
    pub next_attempt_time: Option<Instant>,
    /// Total calls offered to the breaker
    pub total_calls: u64,
    /// Total failures recorded
    pub total_failures: u64,
    /// Total calls rejected without an attempt
    pub total_rejections: u64,
}

/// Internal circuit breaker record
#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
    probe_in_flight: bool,
    /// Bumped by every reset; attempts admitted earlier no longer count
    epoch: u64,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
            probe_in_flight: false,
            epoch: 0,
        }
    }
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    record: Mutex<CircuitRecord>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for a dependency
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            record: Mutex::new(CircuitRecord::default()),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Dependency this breaker guards
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in use
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current circuit state.
    ///
    /// Reading the state never takes the OPEN to HALF_OPEN transition; only
    /// a call through [`execute`](Self::execute) can become the probe.
    pub fn state(&self) -> CircuitState {
        self.record.lock().state
    }

    /// Execute an operation through the circuit breaker.
    ///
    /// The operation's error is returned unchanged; the breaker only decides
    /// whether to attempt and records the outcome.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let attempt = self.try_acquire()?;
        let result = operation().await;
        attempt.complete(result.is_ok());
        result
    }

    /// Decide whether a call may proceed, taking the probe slot if needed
    fn try_acquire(&self) -> ResilienceResult<Attempt<'_>> {
        let now = Instant::now();
        let mut record = self.record.lock();

        if record.state == CircuitState::Open {
            let next_attempt = record.next_attempt_time.unwrap_or(now);
            if now < next_attempt {
                drop(record);
                return Err(self.reject(next_attempt.saturating_duration_since(now)));
            }
            debug!(dependency = %self.name, "Circuit breaker transitioning to HALF_OPEN");
            record.state = CircuitState::HalfOpen;
            record.probe_in_flight = false;
        }

        let (state, epoch) = (record.state, record.epoch);
        match state {
            CircuitState::Closed => Ok(Attempt::new(self, false, epoch)),
            CircuitState::HalfOpen if !record.probe_in_flight => {
                record.probe_in_flight = true;
                Ok(Attempt::new(self, true, epoch))
            }
            _ => {
                drop(record);
                Err(self.reject(Duration::ZERO))
            }
        }
    }

    fn reject(&self, retry_after: Duration) -> ResilienceError {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        ResilienceError::CircuitOpen {
            dependency: self.name.clone(),
            retry_after,
        }
    }

    fn record_success(&self, probe: bool, epoch: u64) {
        let mut record = self.record.lock();
        if record.epoch != epoch {
            return;
        }
        record.success_count = record.success_count.saturating_add(1);

        match record.state {
            CircuitState::Closed => {
                record.failure_count = 0;
            }
            CircuitState::HalfOpen if probe => {
                info!(dependency = %self.name, "Circuit breaker transitioning to CLOSED");
                record.state = CircuitState::Closed;
                record.failure_count = 0;
                record.next_attempt_time = None;
                record.probe_in_flight = false;
            }
            // Late results from calls admitted before the circuit opened
            _ => {}
        }
    }

    fn record_failure(&self, probe: bool, epoch: u64) {
        let now = Instant::now();
        let mut record = self.record.lock();
        if record.epoch != epoch {
            debug!(dependency = %self.name, "Ignoring failure admitted before reset");
            return;
        }
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        record.success_count = 0;
        record.last_failure_time = Some(now);

        match record.state {
            CircuitState::Closed => {
                record.failure_count = record.failure_count.saturating_add(1);
                if record.failure_count >= self.config.failure_threshold {
                    warn!(
                        dependency = %self.name,
                        failure_count = record.failure_count,
                        "Circuit breaker transitioning to OPEN"
                    );
                    record.state = CircuitState::Open;
                    record.next_attempt_time = Some(now + self.config.recovery_timeout);
                }
            }
            CircuitState::HalfOpen if probe => {
                warn!(dependency = %self.name, "Circuit breaker returning to OPEN from half-open");
                record.state = CircuitState::Open;
                record.next_attempt_time = Some(now + self.config.recovery_timeout);
                record.probe_in_flight = false;
            }
            _ => {}
        }
    }

    /// Immutable snapshot of the breaker
    pub fn stats(&self) -> CircuitStats {
        let record = self.record.lock();
        CircuitStats {
            dependency: self.name.clone(),
            state: record.state,
            failure_count: record.failure_count,
            success_count: record.success_count,
            last_failure_time: record.last_failure_time,
            next_attempt_time: record.next_attempt_time,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker to CLOSED with zeroed counters.
    ///
    /// Calls admitted before the reset settle without touching the new record.
    pub fn reset(&self) {
        let mut record = self.record.lock();
        *record = CircuitRecord {
            epoch: record.epoch.wrapping_add(1),
            ..CircuitRecord::default()
        };
        self.total_calls.store(0, Ordering::Relaxed);
        self.total_failures.store(0, Ordering::Relaxed);
        self.total_rejections.store(0, Ordering::Relaxed);
        drop(record);
        debug!(dependency = %self.name, "Circuit breaker reset to CLOSED");
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// An admitted call. A probe dropped before completing counts as a failure
/// so the breaker cannot stay HALF_OPEN with no probe in flight.
struct Attempt<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    epoch: u64,
    finished: bool,
}

impl<'a> Attempt<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool, epoch: u64) -> Self {
        Self {
            breaker,
            probe,
            epoch,
            finished: false,
        }
    }

    fn complete(mut self, success: bool) {
        self.finished = true;
        if success {
            self.breaker.record_success(self.probe, self.epoch);
        } else {
            self.breaker.record_failure(self.probe, self.epoch);
        }
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.finished && self.probe {
            self.breaker.record_failure(true, self.epoch);
        }
    }
}
