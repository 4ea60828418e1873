//! Observability for the resilience layer.
//!
//! Provides logging setup and per-dependency metrics.

pub mod logging;
pub mod metrics;

pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use metrics::{DependencyMetrics, MetricsCollector, MetricsSnapshot};
