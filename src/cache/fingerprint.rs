//! Deterministic request fingerprints.

use crate::errors::{ResilienceError, ResilienceResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A request that can identify itself for coalescing and caching.
///
/// Two requests with equal fingerprints are the same logical request.
pub trait Fingerprint {
    /// Deterministic key derived from the identifying fields.
    ///
    /// Fails with `InvalidRequest` when the fields cannot be encoded; such a
    /// request is never cached or coalesced.
    fn fingerprint(&self) -> ResilienceResult<String>;
}

/// Hash any serializable value into a fingerprint.
///
/// Field order is the serialization order, so struct fields hash
/// deterministically; use ordered maps for dynamic keys. Values JSON cannot
/// represent, such as maps keyed by tuples, are rejected.
pub fn fingerprint_of<T: Serialize + ?Sized>(value: &T) -> ResilienceResult<String> {
    let bytes = serde_json::to_vec(value).map_err(|e| ResilienceError::InvalidRequest {
        message: format!("request fields cannot be encoded: {e}"),
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Generic request descriptor: a kind plus named identifying fields.
///
/// ```
/// use integrations_resilience::cache::{Fingerprint, RequestDescriptor};
///
/// let a = RequestDescriptor::new("slide-image")
///     .field("topic", "photosynthesis")
///     .field("slide", 3)
///     .field("tenant", "school-42");
/// let b = RequestDescriptor::new("slide-image")
///     .field("tenant", "school-42")
///     .field("slide", 3)
///     .field("topic", "photosynthesis");
///
/// assert_eq!(a.fingerprint()?, b.fingerprint()?);
/// # Ok::<(), integrations_resilience::ResilienceError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestDescriptor {
    kind: String,
    fields: BTreeMap<String, String>,
}

impl RequestDescriptor {
    /// Create a descriptor for a kind of request
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add an identifying field
    pub fn field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(name.into(), value.to_string());
        self
    }

    /// Kind of request
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Value of an identifying field
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

impl Fingerprint for RequestDescriptor {
    fn fingerprint(&self) -> ResilienceResult<String> {
        fingerprint_of(self)
    }
}

impl Fingerprint for str {
    fn fingerprint(&self) -> ResilienceResult<String> {
        fingerprint_of(self)
    }
}

impl Fingerprint for String {
    fn fingerprint(&self) -> ResilienceResult<String> {
        fingerprint_of(self.as_str())
    }
}
