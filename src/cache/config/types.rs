//! Core configuration types and enums
//!
//! Fundamental data structures and enums for the identity-map cache
//! configuration: map variants, session kinds, sweep policies, and the
//! top-level `CacheConfig`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which identity-map variant a type's cache uses.
///
/// The choice is per type (carried by the descriptor) with a session-level
/// default; the unit-of-work variant is selected by session kind, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IdentityMapKind {
    /// Unbounded, strong references. Objects live as long as the map.
    #[default]
    #[serde(rename = "full")]
    Full,
    /// Fixed-capacity LRU sub-cache. Least recently used entries are
    /// evicted once capacity is reached.
    #[serde(rename = "lru")]
    Lru,
    /// Weak references with amortized reclamation of dead slots. The map
    /// never keeps an object alive on its own.
    #[serde(rename = "weak")]
    Weak,
}

/// The kind of session owning a manager; drives map-variant selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionKind {
    /// Full shared cache scope: descriptor-preferred map variants.
    #[default]
    #[serde(rename = "shared")]
    Shared,
    /// Isolated client scope: same variant selection, separate manager.
    #[serde(rename = "isolated")]
    Isolated,
    /// Transactional working copy: every type gets the unit-of-work map,
    /// which skips locking overhead the single-owner contract makes
    /// unnecessary.
    #[serde(rename = "unit_of_work")]
    UnitOfWork,
}

/// What an invalidation sweep does when a policy or predicate fails to
/// evaluate for an entry. Either way the entry is never left half-decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SweepErrorPolicy {
    /// Mark the entry invalid and keep sweeping.
    #[default]
    #[serde(rename = "invalidate_on_error")]
    InvalidateOnError,
    /// Stop the sweep and surface the error.
    #[serde(rename = "abort_sweep")]
    AbortSweep,
}

/// Top-level configuration for one cache scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Session kind; see [`SessionKind`].
    pub session_kind: SessionKind,
    /// Map variant for descriptors that do not state a preference.
    pub default_map_kind: IdentityMapKind,
    /// Initial capacity hint for newly constructed maps; hard bound for
    /// LRU maps whose descriptor does not set one.
    pub default_map_capacity: usize,
    /// Serialize every read against concurrent writes through the global
    /// cache lock. Off by default: most configurations allow concurrent
    /// reads and writes, and the pre-check optimization depends on this
    /// staying off.
    pub strict_read_write_synchronization: bool,
    /// Bound for manager-level lock acquisitions that support timeouts, in
    /// milliseconds.
    pub lock_timeout_ms: u64,
    /// Budget for the non-acquiring check of a foreign write lock, in
    /// milliseconds.
    pub check_read_lock_budget_ms: u64,
    /// Capacity of each per-query result sub-cache.
    pub query_results_capacity: usize,
    /// Behavior of invalidation sweeps on policy evaluation errors.
    pub sweep_error_policy: SweepErrorPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            session_kind: SessionKind::Shared,
            default_map_kind: IdentityMapKind::Full,
            default_map_capacity: 100,
            strict_read_write_synchronization: false,
            lock_timeout_ms: 10_000,
            check_read_lock_budget_ms: 500,
            query_results_capacity: 32,
            sweep_error_policy: SweepErrorPolicy::InvalidateOnError,
        }
    }
}

impl CacheConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn check_read_lock_budget(&self) -> Duration {
        Duration::from_millis(self.check_read_lock_budget_ms)
    }

    /// Validate invariants that cannot be encoded in the types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_map_capacity == 0 {
            return Err(ConfigError::InvalidFieldValue {
                field: "default_map_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.query_results_capacity == 0 {
            return Err(ConfigError::InvalidFieldValue {
                field: "query_results_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::InvalidFieldValue {
                field: "lock_timeout_ms".to_string(),
                reason: "a zero timeout would fail every contended acquisition".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidFieldValue { field: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidFieldValue { field, reason } => {
                write!(f, "Invalid value for {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CacheConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = CacheConfig {
            default_map_capacity: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFieldValue { .. })
        ));
    }
}
