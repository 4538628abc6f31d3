//! Concurrency primitives for cache entries and whole-cache locking
//!
//! The same reentrant mutex type serves two roles: embedded in every cache
//! entry (object-level lock) and owned once by the manager (whole-cache lock
//! for isolation and merge). Deferred acquisition is the escape hatch for
//! cyclic object-graph merges; see [`deferred`].

pub(crate) mod concurrency_manager;
pub(crate) mod deferred;

pub use concurrency_manager::{ConcurrencyManager, DeferredOutcome, LockError};
pub use deferred::{DeferredLockRegistry, LockRequestState};
