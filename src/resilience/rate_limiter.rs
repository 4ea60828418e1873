//! Sliding-window rate limiter.

use crate::errors::{ConfigurationError, ResilienceError, ResilienceResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Configuration for rate limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Maximum calls admitted within one window
    pub max_requests: u32,
    /// Length of the sliding window
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum calls per window
    pub fn max_requests(mut self, n: u32) -> Self {
        self.max_requests = n;
        self
    }

    /// Set window length
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_requests == 0 {
            return Err(ConfigurationError::invalid(
                "rate_limiter.max_requests",
                "must be greater than zero",
            ));
        }
        if self.window.is_zero() {
            return Err(ConfigurationError::invalid(
                "rate_limiter.window",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Calls currently counted in the window
    pub in_window: u32,
    /// Calls still admissible in the window
    pub remaining: u32,
    /// Time until the oldest call leaves the window
    pub reset_after: Duration,
    /// Total calls denied
    pub total_denied: u64,
}

struct RateWindow {
    timestamps: VecDeque<Instant>,
    total_denied: u64,
}

impl RateWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Rate limiter bounding outbound calls to one dependency
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    window: Mutex<RateWindow>,
}

impl RateLimiter {
    /// Create a new rate limiter for a dependency
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            name: name.into(),
            window: Mutex::new(RateWindow {
                timestamps: VecDeque::new(),
                total_denied: 0,
            }),
            config,
        }
    }

    /// Dependency this limiter guards
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in use
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Admit or deny one call, recording it when admitted.
    ///
    /// Never blocks. A denial is an ordinary outcome, not an error.
    pub fn check_limit(&self) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.prune(now, self.config.window);

        if window.timestamps.len() >= self.config.max_requests as usize {
            window.total_denied += 1;
            debug!(
                dependency = %self.name,
                in_window = window.timestamps.len(),
                "Rate limit reached"
            );
            return false;
        }

        window.timestamps.push_back(now);
        true
    }

    /// Admit one call or fail with `RateLimitExceeded`
    pub fn acquire(&self) -> ResilienceResult<()> {
        if self.check_limit() {
            Ok(())
        } else {
            Err(ResilienceError::RateLimitExceeded {
                dependency: self.name.clone(),
                reset_after: self.reset_after(),
            })
        }
    }

    /// Calls still admissible in the current window
    pub fn remaining_requests(&self) -> u32 {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.prune(now, self.config.window);
        let used = u32::try_from(window.timestamps.len()).unwrap_or(u32::MAX);
        self.config.max_requests.saturating_sub(used)
    }

    /// Instant at which the oldest recorded call leaves the window
    pub fn reset_time(&self) -> Instant {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.prune(now, self.config.window);
        window
            .timestamps
            .front()
            .map_or(now, |oldest| *oldest + self.config.window)
    }

    /// Time until the oldest recorded call leaves the window
    pub fn reset_after(&self) -> Duration {
        self.reset_time().saturating_duration_since(Instant::now())
    }

    /// Snapshot of the window
    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.prune(now, self.config.window);
        let in_window = u32::try_from(window.timestamps.len()).unwrap_or(u32::MAX);
        let reset_after = window
            .timestamps
            .front()
            .map_or(Duration::ZERO, |oldest| {
                (*oldest + self.config.window).saturating_duration_since(now)
            });

        RateLimiterStats {
            in_window,
            remaining: self.config.max_requests.saturating_sub(in_window),
            reset_after,
            total_denied: window.total_denied,
        }
    }

    /// Forget every recorded call
    pub fn reset(&self) {
        let mut window = self.window.lock();
        window.timestamps.clear();
        debug!(dependency = %self.name, "Rate limiter reset");
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("remaining", &self.remaining_requests())
            .finish()
    }
}
