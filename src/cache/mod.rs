//! Request coalescing and result caching.
//!
//! Concurrent identical requests share one execution, and completed results
//! are served from memory until they expire.

mod coalescing;
mod fingerprint;

pub use coalescing::{
    CacheConfig, CacheStats, CachedResult, CoalescingCache, Resolution, SweepReport,
};
pub use fingerprint::{fingerprint_of, Fingerprint, RequestDescriptor};
