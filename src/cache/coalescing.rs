//! Request coalescing cache.
//!
//! Identical concurrent requests share one upstream execution. Completed
//! results are cached for a bounded time; failures are never cached.
//!
//! Lock order is `pending` then `entries`. Neither lock is held across an
//! await point.

use super::fingerprint::Fingerprint;
use crate::errors::{ConfigurationError, ResilienceError, ResilienceResult, UpstreamError};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn, Instrument, Span};
use uuid::Uuid;

/// Configuration for the coalescing cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// How long a completed result stays valid
    pub ttl: Duration,
    /// How long a pending request may stay unresolved before it is orphaned
    pub pending_timeout: Duration,
    /// Maximum number of cached results
    pub max_size: usize,
    /// Share of entries evicted when `max_size` is exceeded
    pub eviction_fraction: f64,
    /// Period of the background sweep
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(crate::DEFAULT_CACHE_TTL_SECS),
            pending_timeout: Duration::from_secs(crate::DEFAULT_PENDING_TIMEOUT_SECS),
            max_size: 1000,
            eviction_fraction: 0.2,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set result TTL
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set pending request timeout
    pub fn pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// Set maximum number of cached results
    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    /// Set eviction fraction
    pub fn eviction_fraction(mut self, fraction: f64) -> Self {
        self.eviction_fraction = fraction;
        self
    }

    /// Set sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.ttl.is_zero() {
            return Err(ConfigurationError::invalid("cache.ttl", "must be greater than zero"));
        }
        if self.pending_timeout.is_zero() {
            return Err(ConfigurationError::invalid(
                "cache.pending_timeout",
                "must be greater than zero",
            ));
        }
        if self.max_size == 0 {
            return Err(ConfigurationError::invalid(
                "cache.max_size",
                "must be greater than zero",
            ));
        }
        if !(self.eviction_fraction > 0.0 && self.eviction_fraction <= 1.0) {
            return Err(ConfigurationError::invalid(
                "cache.eviction_fraction",
                "must be in (0.0, 1.0]",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigurationError::invalid(
                "cache.sweep_interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// A result handed to callers: the payload plus when it was produced
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult<T> {
    /// Opaque payload produced by the generation function
    pub result: T,
    /// When the payload was produced
    pub timestamp: DateTime<Utc>,
}

/// How a call was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Served from a cached result
    Hit,
    /// Joined a request already in flight
    Joined,
    /// Ran the generation function
    Generated,
}

/// Point-in-time view of the cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    /// Cached results
    pub size: usize,
    /// Requests in flight
    pub pending: usize,
    /// Calls served from cache
    pub hits: u64,
    /// Calls that started a generation
    pub misses: u64,
    /// Calls that joined an in-flight request
    pub coalesced: u64,
    /// Entries removed by size-bound eviction
    pub evictions: u64,
    /// Age of the oldest cached result
    pub oldest_entry_age: Option<Duration>,
    /// Age of the newest cached result
    pub newest_entry_age: Option<Duration>,
}

impl CacheStats {
    /// Share of calls answered without a new generation
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.coalesced;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = served as f64 / total as f64;
            rate
        }
    }
}

/// What a sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Results older than the TTL
    pub expired: usize,
    /// Pending requests older than their timeout
    pub orphaned: usize,
}

type SharedOutcome<T> = Shared<BoxFuture<'static, ResilienceResult<CachedResult<T>>>>;

struct CacheEntry<T> {
    value: CachedResult<T>,
    created_at: Instant,
}

struct PendingRequest<T> {
    outcome: SharedOutcome<T>,
    created_at: Instant,
    request_id: Uuid,
}

enum Admission<T> {
    Hit(CachedResult<T>),
    Join {
        outcome: SharedOutcome<T>,
        created_at: Instant,
    },
    Register {
        outcome: SharedOutcome<T>,
        created_at: Instant,
        request_id: Uuid,
        sender: oneshot::Sender<ResilienceResult<CachedResult<T>>>,
    },
}

struct CacheInner<T> {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
    pending: Mutex<HashMap<String, PendingRequest<T>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl<T> CacheInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Fresh cached result; an expired one is dropped on the way
    fn lookup(&self, fingerprint: &str, now: Instant) -> Option<CachedResult<T>> {
        let mut entries = self.entries.lock();
        let entry = entries.get(fingerprint)?;
        if now.saturating_duration_since(entry.created_at) < self.config.ttl {
            return Some(entry.value.clone());
        }
        entries.remove(fingerprint);
        None
    }

    /// Join the in-flight request for a fingerprint or register a new one.
    ///
    /// The check and the insert happen under one lock, so two callers can
    /// never both register for the same fingerprint.
    fn admit(&self, fingerprint: &str) -> Admission<T> {
        let now = Instant::now();
        let mut pending = self.pending.lock();

        if let Some(existing) = pending.get(fingerprint) {
            if now.saturating_duration_since(existing.created_at) < self.config.pending_timeout {
                return Admission::Join {
                    outcome: existing.outcome.clone(),
                    created_at: existing.created_at,
                };
            }
            warn!(
                fingerprint,
                request_id = %existing.request_id,
                "Replacing orphaned pending request"
            );
        }

        // A generation may have completed between the first lookup and now
        if let Some(hit) = self.lookup(fingerprint, now) {
            return Admission::Hit(hit);
        }

        let (sender, receiver) = oneshot::channel();
        let outcome = receiver
            .map(|received| {
                received.unwrap_or_else(|_| {
                    Err(ResilienceError::Upstream(UpstreamError::Aborted {
                        message: "generation task ended without a result".to_string(),
                    }))
                })
            })
            .boxed()
            .shared();
        let request_id = Uuid::new_v4();

        pending.insert(
            fingerprint.to_string(),
            PendingRequest {
                outcome: outcome.clone(),
                created_at: now,
                request_id,
            },
        );

        Admission::Register {
            outcome,
            created_at: now,
            request_id,
            sender,
        }
    }

    /// Settle a generation: cache a success and release the registration.
    ///
    /// A registration that was purged as orphaned no longer owns the
    /// fingerprint, so its late result is handed to its waiters only.
    fn complete(
        &self,
        fingerprint: &str,
        request_id: Uuid,
        outcome: ResilienceResult<T>,
    ) -> ResilienceResult<CachedResult<T>> {
        let outcome = outcome.map(|result| CachedResult {
            result,
            timestamp: Utc::now(),
        });

        let mut pending = self.pending.lock();
        let owner = pending
            .get(fingerprint)
            .is_some_and(|p| p.request_id == request_id);

        if owner {
            if let Ok(value) = &outcome {
                let mut entries = self.entries.lock();
                entries.insert(
                    fingerprint.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        created_at: Instant::now(),
                    },
                );
                self.evict_if_needed(&mut entries);
            }
            pending.remove(fingerprint);
        } else {
            debug!(fingerprint, %request_id, "Discarding result of purged request");
        }

        outcome
    }

    /// Drop the oldest share of entries once the size bound is exceeded
    fn evict_if_needed(&self, entries: &mut HashMap<String, CacheEntry<T>>) {
        let len = entries.len();
        if len <= self.config.max_size {
            return;
        }

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let batch = (len as f64 * self.config.eviction_fraction).ceil() as usize;
        let count = batch.max(len - self.config.max_size).min(len);

        let mut by_age: Vec<(Instant, String)> = entries
            .iter()
            .map(|(key, entry)| (entry.created_at, key.clone()))
            .collect();
        by_age.sort_unstable();

        for (_, key) in by_age.into_iter().take(count) {
            entries.remove(&key);
        }

        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        debug!(evicted = count, remaining = entries.len(), "Evicted oldest cache entries");
    }

    fn sweep(&self) -> SweepReport {
        let now = Instant::now();

        let orphaned = {
            let mut pending = self.pending.lock();
            let before = pending.len();
            pending.retain(|_, p| {
                now.saturating_duration_since(p.created_at) < self.config.pending_timeout
            });
            before - pending.len()
        };

        let expired = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, e| now.saturating_duration_since(e.created_at) < self.config.ttl);
            before - entries.len()
        };

        let report = SweepReport { expired, orphaned };
        if expired > 0 || orphaned > 0 {
            debug!(expired, orphaned, "Cache sweep removed stale state");
        }
        report
    }
}

/// Cache that coalesces identical concurrent requests.
///
/// Cloning yields another handle to the same cache.
pub struct CoalescingCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for CoalescingCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> CoalescingCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                entries: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Return the cached result, join the in-flight request, or generate.
    ///
    /// Must be called within a Tokio runtime: generation runs on a spawned
    /// task so that it completes, and its result is cached, even if the
    /// caller that started it goes away.
    pub async fn get_or_generate<R, F, Fut>(
        &self,
        request: &R,
        generation_fn: F,
    ) -> ResilienceResult<CachedResult<T>>
    where
        R: Fingerprint + ?Sized,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ResilienceResult<T>> + Send + 'static,
    {
        self.resolve(request, generation_fn)
            .await
            .map(|(value, _)| value)
    }

    /// Like [`get_or_generate`](Self::get_or_generate), also reporting how
    /// the call was satisfied
    pub async fn resolve<R, F, Fut>(
        &self,
        request: &R,
        generation_fn: F,
    ) -> ResilienceResult<(CachedResult<T>, Resolution)>
    where
        R: Fingerprint + ?Sized,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ResilienceResult<T>> + Send + 'static,
    {
        let fingerprint = request.fingerprint()?;

        if let Some(hit) = self.inner.lookup(&fingerprint, Instant::now()) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((hit, Resolution::Hit));
        }

        let (outcome, created_at, resolution) = match self.inner.admit(&fingerprint) {
            Admission::Hit(hit) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Ok((hit, Resolution::Hit));
            }
            Admission::Join {
                outcome,
                created_at,
            } => {
                self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %fingerprint, "Joining in-flight request");
                (outcome, created_at, Resolution::Joined)
            }
            Admission::Register {
                outcome,
                created_at,
                request_id,
                sender,
            } => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %fingerprint, %request_id, "Starting generation");
                self.spawn_generation(fingerprint.clone(), request_id, sender, generation_fn);
                (outcome, created_at, Resolution::Generated)
            }
        };

        let deadline = created_at + self.inner.config.pending_timeout;
        match tokio::time::timeout_at(deadline, outcome).await {
            Ok(result) => result.map(|value| (value, resolution)),
            Err(_) => Err(ResilienceError::RequestTimeout {
                fingerprint,
                elapsed: Instant::now().saturating_duration_since(created_at),
            }),
        }
    }

    fn spawn_generation<F, Fut>(
        &self,
        fingerprint: String,
        request_id: Uuid,
        sender: oneshot::Sender<ResilienceResult<CachedResult<T>>>,
        generation_fn: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ResilienceResult<T>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);

        let generation = async move {
            let outcome = AssertUnwindSafe(async move { generation_fn().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    warn!(fingerprint = %fingerprint, "Generation function panicked");
                    Err(ResilienceError::Upstream(UpstreamError::Aborted {
                        message: "generation function panicked".to_string(),
                    }))
                });

            let settled = inner.complete(&fingerprint, request_id, outcome);
            // Every waiter may have gone away already
            let _ = sender.send(settled);
        };

        // Events logged during generation keep the caller's span fields
        tokio::spawn(generation.instrument(Span::current()));
    }

    /// Check for a fresh cached result without generating.
    ///
    /// A request with no fingerprint is never cached.
    pub fn contains<R: Fingerprint + ?Sized>(&self, request: &R) -> bool {
        request.fingerprint().is_ok_and(|fingerprint| {
            self.inner.lookup(&fingerprint, Instant::now()).is_some()
        })
    }

    /// Drop the cached result for a request
    pub fn remove_from_cache<R: Fingerprint + ?Sized>(&self, request: &R) -> bool {
        request
            .fingerprint()
            .is_ok_and(|fingerprint| self.inner.entries.lock().remove(&fingerprint).is_some())
    }

    /// Drop every cached result. Requests in flight are unaffected.
    pub fn clear_cache(&self) {
        let mut entries = self.inner.entries.lock();
        let cleared = entries.len();
        entries.clear();
        debug!(cleared, "Cache cleared");
    }

    /// Remove expired results and orphaned pending requests.
    ///
    /// Orphaned generations keep running; only their registration is purged.
    pub fn sweep(&self) -> SweepReport {
        self.inner.sweep()
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` in the background.
    ///
    /// The task holds a weak handle and exits once the cache is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak: Weak<CacheInner<T>> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.sweep();
            }
        })
    }

    /// Start the background sweep when called inside a Tokio runtime
    pub(crate) fn spawn_sweeper_in_runtime(&self) -> Option<JoinHandle<()>> {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("No Tokio runtime, background cache sweep not started");
            return None;
        }
        Some(self.spawn_sweeper())
    }

    /// Snapshot of size, in-flight count, counters and age bounds
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let pending = self.inner.pending.lock().len();
        let (size, oldest, newest) = {
            let entries = self.inner.entries.lock();
            let ages = entries
                .values()
                .map(|e| now.saturating_duration_since(e.created_at));
            let (oldest, newest) = ages.fold((None, None), |(max, min), age| {
                (
                    Some(max.map_or(age, |m: Duration| m.max(age))),
                    Some(min.map_or(age, |m: Duration| m.min(age))),
                )
            });
            (entries.len(), oldest, newest)
        };

        CacheStats {
            size,
            pending,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            oldest_entry_age: oldest,
            newest_entry_age: newest,
        }
    }
}

impl<T> std::fmt::Debug for CoalescingCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingCache")
            .field("config", &self.inner.config)
            .field("size", &self.inner.entries.lock().len())
            .field("pending", &self.inner.pending.lock().len())
            .finish()
    }
}
