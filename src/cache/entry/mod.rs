//! Cache key entries: one slot per cached object
//!
//! A `CacheKeyEntry` binds a primary key to a possibly-cleared object
//! reference plus the metadata callers synchronize on: the optimistic
//! write-lock value, the last-refresh timestamp, the invalidation flag, and
//! the embedded concurrency lock. Entries are shared as `Arc` between the
//! owning map and every thread holding or waiting on their lock, so all
//! fields after the key use interior mutability.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use crate::cache::invalidation::{InvalidationPolicy, InvalidationState, PolicyError};
use crate::cache::sync::{ConcurrencyManager, DeferredOutcome, LockError};
use crate::cache::traits::CacheObject;
use crate::cache::types::{CacheId, IdValue, timestamp_millis};

/// The held object reference. Which variant a map stores is the map's
/// reference policy, not the entry's choice.
#[derive(Debug, Clone, Default)]
pub enum ObjectReference {
    /// Slot exists but carries no object (lock-only entries during a
    /// build, or explicitly cleared).
    #[default]
    None,
    /// Keeps the object alive as long as the entry lives.
    Strong(Arc<dyn CacheObject>),
    /// Never keeps the object alive; a failed upgrade reads as a miss.
    Weak(Weak<dyn CacheObject>),
}

/// One cache slot: primary key, object reference, lock surface, metadata.
///
/// The primary key is immutable for the life of the entry; everything else
/// is replaced in place so threads already holding the entry's lock keep
/// operating on live data.
#[derive(Debug)]
pub struct CacheKeyEntry {
    key: CacheId,
    object: RwLock<ObjectReference>,
    /// Optimistic-lock token compared against the data source; opaque here.
    write_lock_value: RwLock<Option<IdValue>>,
    /// Wall-clock millis of the last refresh from the data source.
    read_time_millis: AtomicU64,
    invalidation: AtomicU8,
    lock: Arc<ConcurrencyManager>,
}

impl CacheKeyEntry {
    /// Empty slot for `key`; used by the get-or-create-then-lock path
    /// where the object arrives only after the build completes.
    pub fn new(key: CacheId) -> Self {
        CacheKeyEntry {
            key,
            object: RwLock::new(ObjectReference::None),
            write_lock_value: RwLock::new(None),
            read_time_millis: AtomicU64::new(timestamp_millis()),
            invalidation: AtomicU8::new(InvalidationState::Valid as u8),
            lock: Arc::new(ConcurrencyManager::new()),
        }
    }

    /// Fully populated slot, the plain `put` path.
    pub fn with_object(
        key: CacheId,
        object: ObjectReference,
        write_lock_value: Option<IdValue>,
        read_time_millis: u64,
    ) -> Self {
        CacheKeyEntry {
            key,
            object: RwLock::new(object),
            write_lock_value: RwLock::new(write_lock_value),
            read_time_millis: AtomicU64::new(read_time_millis),
            invalidation: AtomicU8::new(InvalidationState::Valid as u8),
            lock: Arc::new(ConcurrencyManager::new()),
        }
    }

    pub fn key(&self) -> &CacheId {
        &self.key
    }

    /// The held object, if alive. A cleared weak reference reads as `None`
    /// exactly like an empty slot; read paths treat both as a miss.
    pub fn object(&self) -> Option<Arc<dyn CacheObject>> {
        match &*self
            .object
            .read()
            .unwrap_or_else(PoisonError::into_inner)
        {
            ObjectReference::None => None,
            ObjectReference::Strong(object) => Some(Arc::clone(object)),
            ObjectReference::Weak(weak) => weak.upgrade(),
        }
    }

    /// Whether this slot held a weak reference whose referent is gone.
    /// Distinguishes "cleared by reclamation" from "never populated" for
    /// the cleanup sweep; read paths never need the distinction.
    pub fn is_dead_referent(&self) -> bool {
        match &*self
            .object
            .read()
            .unwrap_or_else(PoisonError::into_inner)
        {
            ObjectReference::Weak(weak) => weak.upgrade().is_none(),
            _ => false,
        }
    }

    pub fn set_object(&self, reference: ObjectReference) {
        *self
            .object
            .write()
            .unwrap_or_else(PoisonError::into_inner) = reference;
    }

    pub fn set_object_strong(&self, object: Arc<dyn CacheObject>) {
        self.set_object(ObjectReference::Strong(object));
    }

    /// Hold `object` weakly: the entry never keeps it alive.
    pub fn set_object_weak(&self, object: &Arc<dyn CacheObject>) {
        self.set_object(ObjectReference::Weak(Arc::downgrade(object)));
    }

    pub fn clear_object(&self) {
        self.set_object(ObjectReference::None);
    }

    pub fn write_lock_value(&self) -> Option<IdValue> {
        self.write_lock_value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_write_lock_value(&self, value: Option<IdValue>) {
        *self
            .write_lock_value
            .write()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn read_time_millis(&self) -> u64 {
        self.read_time_millis.load(Ordering::Acquire)
    }

    pub fn set_read_time_millis(&self, millis: u64) {
        self.read_time_millis.store(millis, Ordering::Release);
    }

    pub fn invalidation_state(&self) -> InvalidationState {
        InvalidationState::from_u8(self.invalidation.load(Ordering::Acquire))
    }

    /// Idempotent: setting `Invalidated` twice leaves `Invalidated`.
    pub fn set_invalidation_state(&self, state: InvalidationState) {
        self.invalidation.store(state as u8, Ordering::Release);
    }

    /// Consult the explicit flag, then the policy. The flag always wins.
    pub fn is_invalidated(
        &self,
        policy: &dyn InvalidationPolicy,
        as_of_millis: u64,
    ) -> Result<bool, PolicyError> {
        if self.invalidation_state() == InvalidationState::Invalidated {
            return Ok(true);
        }
        policy.is_invalidated(self, as_of_millis)
    }

    // Lock surface: thin delegation to the embedded ConcurrencyManager.

    pub fn acquire(&self) {
        self.lock.acquire();
    }

    pub fn acquire_nowait(&self) -> bool {
        self.lock.acquire_nowait()
    }

    pub fn acquire_with_timeout(&self, timeout: Duration) -> Result<(), LockError> {
        self.lock.acquire_with_timeout(timeout)
    }

    pub fn acquire_deferred(&self) -> DeferredOutcome {
        ConcurrencyManager::acquire_deferred(&self.lock)
    }

    pub fn release(&self) -> Result<(), LockError> {
        self.lock.release()
    }

    pub fn acquire_read_lock(&self) {
        self.lock.acquire_read_lock();
    }

    pub fn release_read_lock(&self) -> Result<(), LockError> {
        self.lock.release_read_lock()
    }

    /// Wait briefly for a foreign writer to finish, without acquiring.
    /// Guards result-set scans against observing half-written objects.
    pub fn check_read_lock(&self) -> bool {
        self.lock.check_read_lock()
    }

    pub fn check_read_lock_within(&self, budget: Duration) -> bool {
        self.lock.check_read_lock_within(budget)
    }

    pub fn is_acquired(&self) -> bool {
        self.lock.is_acquired()
    }

    pub fn lock_owner(&self) -> Option<ThreadId> {
        self.lock.owner()
    }

    pub fn lock_depth(&self) -> usize {
        self.lock.depth()
    }

    /// Deep copy of the slot metadata with a fresh, unheld lock; the
    /// contained object is shared, not copied. Used by map snapshots.
    pub fn snapshot(&self) -> CacheKeyEntry {
        CacheKeyEntry {
            key: self.key.clone(),
            object: RwLock::new(
                self.object
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            ),
            write_lock_value: RwLock::new(self.write_lock_value()),
            read_time_millis: AtomicU64::new(self.read_time_millis()),
            invalidation: AtomicU8::new(self.invalidation.load(Ordering::Acquire)),
            lock: Arc::new(ConcurrencyManager::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::invalidation::NoExpiry;

    fn strong_entry(key: i64, value: &str) -> CacheKeyEntry {
        CacheKeyEntry::with_object(
            CacheId::from(key),
            ObjectReference::Strong(Arc::new(value.to_string())),
            Some(IdValue::Uint(1)),
            100,
        )
    }

    #[test]
    fn weak_reference_clears_when_the_referent_drops() {
        let object: Arc<dyn CacheObject> = Arc::new("transient".to_string());
        let entry = CacheKeyEntry::new(CacheId::from(5i64));
        entry.set_object_weak(&object);

        assert!(entry.object().is_some());
        assert!(!entry.is_dead_referent());

        drop(object);
        assert!(entry.object().is_none());
        assert!(entry.is_dead_referent());
    }

    #[test]
    fn invalidation_is_idempotent_and_sticky() {
        let entry = strong_entry(1, "a");
        entry.set_invalidation_state(InvalidationState::Invalidated);
        entry.set_invalidation_state(InvalidationState::Invalidated);

        assert_eq!(entry.invalidation_state(), InvalidationState::Invalidated);
        assert!(entry.is_invalidated(&NoExpiry, 0).unwrap());
        assert!(entry.is_invalidated(&NoExpiry, u64::MAX).unwrap());
    }

    #[test]
    fn fields_replace_in_place() {
        let entry = strong_entry(7, "v1");
        entry.set_object_strong(Arc::new("v2".to_string()));
        entry.set_write_lock_value(Some(IdValue::Uint(2)));
        entry.set_read_time_millis(200);

        let object = entry.object().unwrap();
        assert_eq!(
            crate::cache::traits::downcast_object::<String>(&object).unwrap(),
            "v2"
        );
        assert_eq!(entry.write_lock_value(), Some(IdValue::Uint(2)));
        assert_eq!(entry.read_time_millis(), 200);
    }

    #[test]
    fn snapshot_shares_the_object_but_not_the_lock() {
        let entry = strong_entry(9, "shared");
        entry.acquire();
        let copy = entry.snapshot();

        assert_eq!(copy.key(), entry.key());
        assert!(!copy.is_acquired()); // fresh lock
        assert!(crate::cache::traits::same_object(
            &entry.object().unwrap(),
            &copy.object().unwrap()
        ));
        entry.release().unwrap();
    }
}
