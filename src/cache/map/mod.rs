//! Identity maps: keyed containers of cache key entries
//!
//! One map per root entity type. Variants differ in reference and eviction
//! policy only; the keyed surface and the at-most-one-entry-per-key
//! guarantee are shared. Concurrent get-or-create races resolve first
//! writer wins: the losing thread adopts the winning entry, never a second
//! slot for the same key.

pub(crate) mod full_map;
pub(crate) mod lru_map;
pub(crate) mod unit_of_work;
pub(crate) mod weak_map;

pub use full_map::FullIdentityMap;
pub use lru_map::LruIdentityMap;
pub use unit_of_work::UnitOfWorkIdentityMap;
pub use weak_map::WeakIdentityMap;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use dashmap::DashMap;

use crate::cache::config::IdentityMapKind;
use crate::cache::descriptor::TypeDescriptor;
use crate::cache::entry::CacheKeyEntry;
use crate::cache::sync::DeferredOutcome;
use crate::cache::traits::{CacheObject, same_object};
use crate::cache::types::{CacheId, IdValue};

/// One lock-held entry observed by a diagnostic sweep.
#[derive(Debug, Clone)]
pub struct HeldLock {
    pub type_name: String,
    pub key: CacheId,
    pub depth: usize,
}

/// Owning thread → held entries, gathered across maps. Point-in-time and
/// advisory: locks move while the sweep runs.
#[derive(Debug, Default)]
pub struct LockReport {
    held: HashMap<ThreadId, Vec<HeldLock>>,
}

impl LockReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, owner: ThreadId, lock: HeldLock) {
        self.held.entry(owner).or_default().push(lock);
    }

    pub fn threads(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.held.keys().copied()
    }

    pub fn locks_for(&self, thread: ThreadId) -> &[HeldLock] {
        self.held.get(&thread).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total_held(&self) -> usize {
        self.held.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// The keyed container for one entity type's cache slots.
///
/// Object-safe; the manager stores maps as `Arc<dyn IdentityMap>` and picks
/// the variant at construction time. Enumeration yields a point-in-time
/// snapshot: callers must tolerate entries mutating (or dying, for weak
/// variants) while they iterate.
pub trait IdentityMap: Send + Sync + fmt::Debug {
    fn descriptor(&self) -> &Arc<TypeDescriptor>;

    fn map_kind(&self) -> IdentityMapKind;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity bound, if this variant enforces one.
    fn max_size(&self) -> Option<usize> {
        None
    }

    /// Existing entry or `None`; never creates.
    fn get_cache_key(&self, key: &CacheId) -> Option<Arc<CacheKeyEntry>>;

    /// Existing entry, or a fresh empty one inserted race-free. All racers
    /// observe the same entry identity.
    fn get_or_create_cache_key(&self, key: &CacheId) -> Arc<CacheKeyEntry>;

    /// Insert or overwrite. Overwrites replace the entry's fields in
    /// place, so a thread already holding the old entry's lock keeps
    /// operating on live data; the put also resets the invalidation flag,
    /// since fresh data from the source is by definition current.
    fn put(
        &self,
        key: CacheId,
        object: Arc<dyn CacheObject>,
        write_lock_value: Option<IdValue>,
        read_time_millis: u64,
    ) -> Arc<CacheKeyEntry>;

    /// Remove by key. With `expected` set, the removal is identity-checked:
    /// an entry whose object is a different live allocation is left alone,
    /// so a stale evictor cannot remove a newer entry that raced in.
    fn remove(
        &self,
        key: &CacheId,
        expected: Option<&Arc<dyn CacheObject>>,
    ) -> Option<Arc<CacheKeyEntry>>;

    fn clear(&self);

    /// Lazy enumeration of the entries. `check_read_locks` waits briefly,
    /// at yield time, for in-flight writes to settle so scans do not
    /// observe half-written objects.
    fn entries(&self, check_read_locks: bool) -> Box<dyn Iterator<Item = Arc<CacheKeyEntry>>>;

    /// Record every currently lock-held entry into `report`.
    fn collect_locks(&self, report: &mut LockReport);

    /// Deep copy: fresh entries (metadata copied, locks unheld) sharing the
    /// contained objects. The copy is exclusively owned by the caller.
    fn snapshot(&self) -> Arc<dyn IdentityMap>;

    /// Reclaim slots whose referent is gone. No-op except for
    /// reference-managed variants.
    fn cleanup_dead_entries(&self) -> usize {
        0
    }

    /// Whether entry locks mean anything for this variant. The
    /// unit-of-work map is single-owner by contract and skips them.
    fn requires_locking(&self) -> bool {
        true
    }

    /// Get-or-create, then lock. The create path is race-free; racers on
    /// one key end up holding or waiting on the same entry's lock.
    fn acquire_lock(&self, key: &CacheId) -> Arc<CacheKeyEntry> {
        let entry = self.get_or_create_cache_key(key);
        if self.requires_locking() {
            entry.acquire();
        }
        entry
    }

    /// Get-or-create, then try to lock without blocking.
    fn acquire_lock_nowait(&self, key: &CacheId) -> Option<Arc<CacheKeyEntry>> {
        let entry = self.get_or_create_cache_key(key);
        if !self.requires_locking() || entry.acquire_nowait() {
            Some(entry)
        } else {
            None
        }
    }

    /// Get-or-create, then lock with the deferred escape hatch.
    fn acquire_deferred_lock(&self, key: &CacheId) -> (Arc<CacheKeyEntry>, DeferredOutcome) {
        let entry = self.get_or_create_cache_key(key);
        let outcome = if self.requires_locking() {
            entry.acquire_deferred()
        } else {
            DeferredOutcome::Acquired
        };
        (entry, outcome)
    }
}

/// Shared keyed storage used by every variant except the bounded one.
///
/// `DashMap` gives lock-free reads and per-shard insert-if-absent, which is
/// exactly the race the uniqueness invariant needs resolved.
#[derive(Debug)]
pub(crate) struct MapCore {
    descriptor: Arc<TypeDescriptor>,
    entries: DashMap<CacheId, Arc<CacheKeyEntry>>,
}

impl MapCore {
    pub(crate) fn new(descriptor: Arc<TypeDescriptor>, capacity: usize) -> Self {
        MapCore {
            descriptor,
            entries: DashMap::with_capacity(capacity),
        }
    }

    pub(crate) fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, key: &CacheId) -> Option<Arc<CacheKeyEntry>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn get_or_create(&self, key: &CacheId) -> Arc<CacheKeyEntry> {
        Arc::clone(
            self.entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CacheKeyEntry::new(key.clone())))
                .value(),
        )
    }

    /// Insert or update-in-place under the shard guard, so two racing puts
    /// for one key serialize and never interleave field writes.
    pub(crate) fn put_with<F>(
        &self,
        key: CacheId,
        populate: F,
    ) -> Arc<CacheKeyEntry>
    where
        F: Fn(&CacheKeyEntry),
    {
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                let entry = Arc::clone(occupied.get());
                populate(&entry);
                entry
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let entry = Arc::new(CacheKeyEntry::new(vacant.key().clone()));
                populate(&entry);
                vacant.insert(Arc::clone(&entry));
                entry
            }
        }
    }

    pub(crate) fn remove(
        &self,
        key: &CacheId,
        expected: Option<&Arc<dyn CacheObject>>,
    ) -> Option<Arc<CacheKeyEntry>> {
        match expected {
            None => self.entries.remove(key).map(|(_, entry)| entry),
            Some(expected) => self
                .entries
                .remove_if(key, |_, entry| match entry.object() {
                    // A cleared or empty slot is safe to remove; a live,
                    // different object means a newer entry raced in.
                    None => true,
                    Some(current) => same_object(&current, expected),
                })
                .map(|(_, entry)| entry),
        }
    }

    /// Remove only if the slot's referent is gone and nobody holds its
    /// lock. The reclamation path for weak maps.
    pub(crate) fn remove_if_dead(&self, key: &CacheId) -> bool {
        self.entries
            .remove_if(key, |_, entry| {
                entry.is_dead_referent() && !entry.is_acquired()
            })
            .is_some()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    /// Point-in-time snapshot of the live entries.
    pub(crate) fn entry_vec(&self) -> Vec<Arc<CacheKeyEntry>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn keys(&self) -> Vec<CacheId> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub(crate) fn collect_locks(&self, report: &mut LockReport) {
        for entry in self.entries.iter() {
            if let Some(owner) = entry.value().lock_owner() {
                report.record(
                    owner,
                    HeldLock {
                        type_name: self.descriptor.name().to_string(),
                        key: entry.key().clone(),
                        depth: entry.value().lock_depth(),
                    },
                );
            }
        }
    }

    /// Entry-by-entry deep copy into a fresh core; objects shared.
    pub(crate) fn snapshot_into(&self) -> MapCore {
        let copy = MapCore::new(Arc::clone(&self.descriptor), self.entries.len());
        for entry in self.entries.iter() {
            copy.entries
                .insert(entry.key().clone(), Arc::new(entry.value().snapshot()));
        }
        copy
    }
}

/// Iterator wrapper applying the read-lock check lazily at yield time.
pub(crate) fn entry_iter(
    entries: Vec<Arc<CacheKeyEntry>>,
    check_read_locks: bool,
) -> Box<dyn Iterator<Item = Arc<CacheKeyEntry>>> {
    Box::new(entries.into_iter().inspect(move |entry| {
        if check_read_locks {
            entry.check_read_lock();
        }
    }))
}
