//! Resilience Layer for Upstream Dependencies
//!
//! Production-ready guards for slow, rate-limited or flaky upstream calls:
//! - Sliding-window rate limiting
//! - Circuit breaking with a single half-open probe
//! - Retry with exponential backoff and error classification
//! - Request coalescing with a TTL-bounded result cache
//! - Health checks for readiness and liveness reporting
//! - Observability (tracing, metrics, logging)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use integrations_resilience::cache::RequestDescriptor;
//! use integrations_resilience::{ResilienceConfig, ResilienceOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ResilienceConfig::from_env("gemini")?;
//!     let gemini: ResilienceOrchestrator<String> = ResilienceOrchestrator::new("gemini", &config)?;
//!
//!     let request = RequestDescriptor::new("lesson-outline")
//!         .field("topic", "photosynthesis")
//!         .field("grade", 7);
//!
//!     let outline = gemini
//!         .execute(&request, || async { Ok("1. Light reactions".to_string()) })
//!         .await?;
//!
//!     println!("{} (generated at {})", outline.result, outline.timestamp);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod errors;

// Request coalescing
pub mod cache;

// Resilience
pub mod resilience;

// Health
pub mod health;

// Observability
pub mod observability;

// Testing utilities
pub mod mocks;

// Re-exports for convenience
pub use cache::{CachedResult, CoalescingCache, Fingerprint, RequestDescriptor};
pub use config::{ResilienceConfig, ResilienceConfigBuilder};
pub use errors::{ResilienceError, ResilienceResult, UpstreamError};
pub use health::{HealthChecker, HealthReport};
pub use resilience::{DependencyRegistry, ResilienceOrchestrator};

/// Default consecutive failures before a breaker opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default breaker recovery timeout in milliseconds
pub const DEFAULT_RECOVERY_TIMEOUT_MS: u64 = 30_000;

/// Default maximum retries
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default cached result TTL in seconds
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Default pending request timeout in seconds
pub const DEFAULT_PENDING_TIMEOUT_SECS: u64 = 30;
