//! Keylox prelude - convenient imports for users
//!
//! Everything callers need to configure a session, register descriptors,
//! and work with cached entries.

// Session facade
pub use crate::session::{CacheSession, CacheSessionBuilder};

// Manager-level API
pub use crate::cache::manager::{CachedQueryResult, IdentityMapManager, QueryId};

// Keys, descriptors, and cached objects
pub use crate::cache::descriptor::TypeDescriptor;
pub use crate::cache::entry::{CacheKeyEntry, ObjectReference};
pub use crate::cache::traits::{CacheObject, downcast_object, same_object};
pub use crate::cache::types::{CacheError, CacheId, IdValue};

// Configuration
pub use crate::cache::config::{
    CacheConfig, ConfigError, IdentityMapKind, SessionKind, SweepErrorPolicy,
};

// Maps and diagnostics
pub use crate::cache::map::{
    FullIdentityMap, HeldLock, IdentityMap, LockReport, LruIdentityMap, UnitOfWorkIdentityMap,
    WeakIdentityMap,
};

// Locking
pub use crate::cache::sync::{
    ConcurrencyManager, DeferredLockRegistry, DeferredOutcome, LockError, LockRequestState,
};

// Invalidation
pub use crate::cache::invalidation::{
    InvalidationPolicy, InvalidationState, NoExpiry, PolicyError, TimeToLive,
};

// Telemetry
pub use crate::telemetry::{
    CacheStatsSnapshot, NoopProfiler, ProfileCounter, ProfileOperation, SessionProfiler,
};
