//! Keylox - concurrent identity-map cache
//!
//! A per-type, keyed, reference-managed object cache with entry-level
//! concurrency control, built for parallel native threads sharing one
//! cache scope.
//!
//! # Features
//!
//! - **Identity guarantee**: looking up the same logical entity by primary
//!   key always yields the same in-memory object
//! - **Per-entry locking**: reentrant exclusive locks plus a shared read
//!   mode, with no-wait, timeout, and deferred acquisition
//! - **Deferred locks**: cycle-safe lock requests for merging
//!   self-referential object graphs without deadlocking
//! - **Reference management**: unbounded strong, bounded LRU, and weak map
//!   variants with amortized dead-slot reclamation
//! - **Inheritance-aware routing**: subtypes share their root type's map
//! - **Pluggable invalidation**: explicit marking plus time-based policies
//! - **Query-result caching**: bounded per-query result maps with a
//!   distinguished no-result sentinel
//! - **Zero-overhead default path**: uninstrumented, non-strict
//!   configurations skip all locking and profiling glue

// Public API modules
pub mod prelude;
pub mod session;

// Cache implementation modules
pub mod cache;
pub mod telemetry;

// Re-export the public API at the crate root for convenience
pub use prelude::*;
