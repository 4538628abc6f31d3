//! Entry invalidation: tri-state flag and pluggable staleness policies
//!
//! Invalidation never removes anything. A swept entry stays in its map with
//! the `Invalidated` flag set; read paths then treat it as a miss and the
//! next refresh from the data source flips it back to `Valid`.

use std::fmt;

use crate::cache::entry::CacheKeyEntry;

/// Validity of a cached entry's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InvalidationState {
    /// Data is current; time-based policies may still expire it.
    Valid = 0,
    /// Explicitly marked stale. Sticky until the next refresh.
    Invalidated = 1,
    /// Neither confirmed current nor stale; the policy decides per read.
    CheckPolicy = 2,
}

impl InvalidationState {
    /// Decode the atomic representation. Unknown values read as
    /// `CheckPolicy`, the conservative choice.
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => InvalidationState::Valid,
            1 => InvalidationState::Invalidated,
            _ => InvalidationState::CheckPolicy,
        }
    }
}

/// A policy failed to evaluate for an entry.
///
/// Whether this aborts the surrounding sweep or just invalidates the entry
/// is the sweep's decision, not the policy's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyError {
    pub message: String,
}

impl PolicyError {
    pub fn new(message: impl Into<String>) -> Self {
        PolicyError {
            message: message.into(),
        }
    }
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalidation policy failed: {}", self.message)
    }
}

impl std::error::Error for PolicyError {}

/// Pluggable rule deciding whether a cached entry's data is stale.
///
/// Consulted before a cached object is returned to a caller, and by
/// invalidation sweeps. The entry's explicit `Invalidated` flag always wins;
/// policies only refine `Valid` and `CheckPolicy`.
pub trait InvalidationPolicy: Send + Sync + fmt::Debug {
    /// Whether `entry` should be treated as stale as of `as_of_millis`
    /// (wall-clock, Unix epoch).
    fn is_invalidated(&self, entry: &CacheKeyEntry, as_of_millis: u64)
    -> Result<bool, PolicyError>;
}

/// Entries never expire on their own; only explicit invalidation applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExpiry;

impl InvalidationPolicy for NoExpiry {
    fn is_invalidated(
        &self,
        entry: &CacheKeyEntry,
        _as_of_millis: u64,
    ) -> Result<bool, PolicyError> {
        Ok(entry.invalidation_state() == InvalidationState::Invalidated)
    }
}

/// Entries expire a fixed interval after their last refresh from the data
/// source.
#[derive(Debug, Clone, Copy)]
pub struct TimeToLive {
    pub ttl_millis: u64,
}

impl TimeToLive {
    pub fn new(ttl_millis: u64) -> Self {
        TimeToLive { ttl_millis }
    }
}

impl InvalidationPolicy for TimeToLive {
    fn is_invalidated(
        &self,
        entry: &CacheKeyEntry,
        as_of_millis: u64,
    ) -> Result<bool, PolicyError> {
        if entry.invalidation_state() == InvalidationState::Invalidated {
            return Ok(true);
        }
        let read_time = entry.read_time_millis();
        Ok(as_of_millis.saturating_sub(read_time) > self.ttl_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::types::CacheId;
    use std::sync::Arc;

    fn entry_read_at(read_time: u64) -> CacheKeyEntry {
        let entry = CacheKeyEntry::new(CacheId::from(1i64));
        entry.set_object_strong(Arc::new("obj".to_string()));
        entry.set_read_time_millis(read_time);
        entry
    }

    #[test]
    fn no_expiry_honors_only_the_explicit_flag() {
        let entry = entry_read_at(0);
        assert!(!NoExpiry.is_invalidated(&entry, u64::MAX).unwrap());

        entry.set_invalidation_state(InvalidationState::Invalidated);
        assert!(NoExpiry.is_invalidated(&entry, 0).unwrap());
    }

    #[test]
    fn ttl_expires_after_the_interval() {
        let entry = entry_read_at(1_000);
        let policy = TimeToLive::new(500);

        assert!(!policy.is_invalidated(&entry, 1_400).unwrap());
        assert!(policy.is_invalidated(&entry, 1_501).unwrap());
    }

    #[test]
    fn explicit_invalidation_beats_a_fresh_read_time() {
        let entry = entry_read_at(1_000);
        entry.set_invalidation_state(InvalidationState::Invalidated);
        assert!(TimeToLive::new(500).is_invalidated(&entry, 1_000).unwrap());
    }
}
