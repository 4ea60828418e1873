//! Integration tests for the health checker.

use integrations_resilience::health::{HealthConfig, HealthProbe};
use integrations_resilience::{HealthChecker, ResilienceResult};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct SlowProbe {
    delay: Duration,
    healthy: bool,
}

#[async_trait::async_trait]
impl HealthProbe for SlowProbe {
    async fn check(&self) -> ResilienceResult<bool> {
        tokio::time::sleep(self.delay).await;
        Ok(self.healthy)
    }
}

#[tokio::test(start_paused = true)]
async fn test_probes_run_concurrently() {
    let checker = HealthChecker::default();
    for name in ["gemini", "images", "speech"] {
        checker.add_check(
            name,
            SlowProbe {
                delay: Duration::from_secs(1),
                healthy: true,
            },
        );
    }

    let start = Instant::now();
    let report = checker.run_checks().await;

    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert!(report.healthy);
    assert_eq!(report.checks.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_probe_times_out_as_unhealthy() {
    let checker = HealthChecker::new(HealthConfig::new().probe_timeout(Duration::from_secs(5)));
    checker.add_check(
        "images",
        SlowProbe {
            delay: Duration::from_secs(60),
            healthy: true,
        },
    );
    checker.add_check_fn("gemini", || async { Ok(true) });

    let start = Instant::now();
    let report = checker.run_checks().await;

    assert_eq!(start.elapsed(), Duration::from_secs(5));
    assert!(!report.healthy);
    assert_eq!(report.failing(), vec!["images"]);
}

#[tokio::test]
async fn test_panicking_probe_is_unhealthy() {
    let checker = HealthChecker::default();
    checker.add_check_fn("db", || async { Ok(true) });
    checker.add_check_fn("broken", || async {
        if true {
            panic!("probe bug");
        }
        Ok(true)
    });

    let report = checker.run_checks().await;
    assert_eq!(report.checks.get("db"), Some(&true));
    assert_eq!(report.checks.get("broken"), Some(&false));
}

#[tokio::test(start_paused = true)]
async fn test_older_run_never_replaces_newer_report() {
    let checker = HealthChecker::default();
    let calls = Arc::new(AtomicU32::new(0));

    // First invocation is slow and unhealthy, later ones fast and healthy
    let counter = calls.clone();
    checker.add_check_fn("gemini", move || {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(false)
            } else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(true)
            }
        }
    });

    let (older, newer) = tokio::join!(checker.run_checks(), checker.run_checks());

    assert_eq!(older.generation, 1);
    assert!(!older.healthy);
    assert_eq!(newer.generation, 2);
    assert!(newer.healthy);

    let last = checker.last_report().unwrap();
    assert_eq!(last.generation, 2);
    assert!(last.healthy);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_runs_until_dropped() {
    let checker = Arc::new(HealthChecker::new(
        HealthConfig::new().interval(Duration::from_secs(30)),
    ));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    checker.add_check_fn("gemini", move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    });

    let handle = checker.spawn_periodic();
    tokio::time::sleep(Duration::from_secs(61)).await;

    // Ticks at 0s, 30s and 60s
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(checker.last_report().unwrap().generation, 3);

    drop(checker);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(handle.is_finished());
}
