//! Walk through the resilience layer against a scripted upstream.
//!
//! Run with `cargo run --example resilience`.

use integrations_resilience::cache::RequestDescriptor;
use integrations_resilience::health::HealthChecker;
use integrations_resilience::mocks::{MockOperation, MockResponse};
use integrations_resilience::observability::{LogLevel, LoggingConfig};
use integrations_resilience::resilience::{CircuitBreakerConfig, RetryConfig};
use integrations_resilience::{DependencyRegistry, ResilienceConfig, UpstreamError};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    LoggingConfig::from_env()?.with_level(LogLevel::Debug).init()?;

    let defaults = ResilienceConfig::builder()
        .retry(
            RetryConfig::new()
                .max_retries(2)
                .base_delay(Duration::from_millis(50))
                .max_delay(Duration::from_millis(200)),
        )
        .circuit_breaker(
            CircuitBreakerConfig::new()
                .failure_threshold(3)
                .recovery_timeout(Duration::from_secs(1)),
        )
        .build()?;
    let registry = DependencyRegistry::new(defaults);
    let images = Arc::new(registry.orchestrator::<String>("image-gen")?);

    // Five classrooms ask for the same slide at once
    let upstream = MockOperation::new();
    upstream.push(
        MockResponse::ok("https://cdn.example/slides/volcano-3.png".to_string())
            .with_delay(Duration::from_millis(300)),
    );
    let request = RequestDescriptor::new("slide-image")
        .field("topic", "volcanoes")
        .field("slide", 3);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let images = Arc::clone(&images);
        let upstream = upstream.clone();
        let request = request.clone();
        handles.push(tokio::spawn(async move {
            images.execute(&request, upstream.as_fn()).await
        }));
    }
    for handle in handles {
        let image = handle.await??;
        println!("got {} (generated {})", image.result, image.timestamp);
    }
    println!("upstream invocations: {}", upstream.calls());

    // A failing upstream trips the breaker
    let failing = MockOperation::new();
    failing.set_default(MockResponse::error(UpstreamError::from_status(
        503,
        "model overloaded",
    )));
    let other = RequestDescriptor::new("slide-image").field("slide", 4);
    if let Err(error) = images.execute(&other, failing.as_fn()).await {
        println!("first call failed: {error}");
    }
    if let Err(error) = images.execute(&other, failing.as_fn()).await {
        println!("second call failed fast: {error} ({:?})", error.disposition());
    }

    let checker = HealthChecker::default();
    registry.register_health_checks(&checker);
    let report = checker.run_checks().await;
    println!("health: {}", report.to_json()?);

    println!("metrics: {}", serde_json::to_string_pretty(&registry.metrics().snapshot())?);
    Ok(())
}
