//! Shared cache types: primary-key tuples, timestamps, and the core error enum
//!
//! This module defines the key representation used across all identity maps.
//! Primary keys are ordered tuples of scalar values compared by structural
//! equality; the cache never interprets them beyond hashing and comparison.

use std::fmt;
use std::time::{Duration, SystemTime};

use uuid::Uuid;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Read timestamps and invalidation deadlines are wall-clock based because
/// they are compared against data-source refresh times, not monotonic spans.
#[inline(always)]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// One scalar component of a primary key or write-lock value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdValue {
    Int(i64),
    Uint(u64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Int(v) => write!(f, "{}", v),
            IdValue::Uint(v) => write!(f, "{}", v),
            IdValue::Text(v) => write!(f, "{}", v),
            IdValue::Bytes(v) => write!(f, "{} bytes", v.len()),
            IdValue::Uuid(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for IdValue {
    fn from(v: i64) -> Self {
        IdValue::Int(v)
    }
}

impl From<u64> for IdValue {
    fn from(v: u64) -> Self {
        IdValue::Uint(v)
    }
}

impl From<&str> for IdValue {
    fn from(v: &str) -> Self {
        IdValue::Text(v.to_string())
    }
}

impl From<String> for IdValue {
    fn from(v: String) -> Self {
        IdValue::Text(v)
    }
}

impl From<Uuid> for IdValue {
    fn from(v: Uuid) -> Self {
        IdValue::Uuid(v)
    }
}

/// Primary key of a cached object: an ordered tuple of scalars.
///
/// Structural equality; component order matters. Composite keys are just
/// longer tuples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheId(Vec<IdValue>);

impl CacheId {
    pub fn new(components: Vec<IdValue>) -> Self {
        CacheId(components)
    }

    /// Single-component key, the common case.
    pub fn single(component: impl Into<IdValue>) -> Self {
        CacheId(vec![component.into()])
    }

    pub fn components(&self) -> &[IdValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", component)?;
        }
        write!(f, "]")
    }
}

impl From<IdValue> for CacheId {
    fn from(v: IdValue) -> Self {
        CacheId(vec![v])
    }
}

impl From<i64> for CacheId {
    fn from(v: i64) -> Self {
        CacheId::single(v)
    }
}

impl From<u64> for CacheId {
    fn from(v: u64) -> Self {
        CacheId::single(v)
    }
}

impl From<&str> for CacheId {
    fn from(v: &str) -> Self {
        CacheId::single(v)
    }
}

impl From<Uuid> for CacheId {
    fn from(v: Uuid) -> Self {
        CacheId::single(v)
    }
}

/// Cache-level failures surfaced to callers.
///
/// A cache miss is never an error; read paths return `Option::None` for
/// absent, invalidated, and reclaimed entries alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The configured map variant could not be instantiated for a type.
    /// Fatal for that type's cache; surfaced at first access.
    MapConstruction(String),
    /// Lock acquisition failed (timeout or ownership violation).
    Lock(crate::cache::sync::LockError),
    /// An invalidation policy failed to evaluate and the sweep policy was
    /// set to abort.
    InvalidationPolicy(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::MapConstruction(msg) => {
                write!(f, "Identity map construction failed: {}", msg)
            }
            CacheError::Lock(err) => write!(f, "Lock error: {}", err),
            CacheError::InvalidationPolicy(msg) => {
                write!(f, "Invalidation policy error: {}", msg)
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Lock(err) => Some(err),
            _ => None,
        }
    }
}

impl From<crate::cache::sync::LockError> for CacheError {
    fn from(err: crate::cache::sync::LockError) -> Self {
        CacheError::Lock(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_keys_compare_structurally() {
        let a = CacheId::new(vec![IdValue::Int(7), IdValue::Text("emp".into())]);
        let b = CacheId::new(vec![IdValue::Int(7), IdValue::Text("emp".into())]);
        let c = CacheId::new(vec![IdValue::Text("emp".into()), IdValue::Int(7)]);

        assert_eq!(a, b);
        assert_ne!(a, c); // order matters
    }

    #[test]
    fn single_component_conversions() {
        assert_eq!(CacheId::from(42i64), CacheId::single(42i64));
        assert_eq!(
            CacheId::from("pk"),
            CacheId::new(vec![IdValue::Text("pk".into())])
        );
    }

    #[test]
    fn display_is_bracketed_tuple() {
        let id = CacheId::new(vec![IdValue::Int(1), IdValue::Text("a".into())]);
        assert_eq!(id.to_string(), "[1, a]");
    }
}
