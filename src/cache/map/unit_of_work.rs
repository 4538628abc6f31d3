//! Identity map variant for transactional working copies
//!
//! A unit of work owns its map exclusively: one logical operation builds,
//! mutates, and merges it, so per-entry lock traffic is pure overhead. The
//! variant keeps the same keyed surface (the manager does not special-case
//! it) but reports that locking is unnecessary, and enumeration never waits
//! on read locks.

use std::sync::Arc;

use crate::cache::config::IdentityMapKind;
use crate::cache::descriptor::TypeDescriptor;
use crate::cache::entry::CacheKeyEntry;
use crate::cache::invalidation::InvalidationState;
use crate::cache::map::{IdentityMap, LockReport, MapCore, entry_iter};
use crate::cache::traits::CacheObject;
use crate::cache::types::{CacheId, IdValue};

#[derive(Debug)]
pub struct UnitOfWorkIdentityMap {
    core: MapCore,
}

impl UnitOfWorkIdentityMap {
    pub fn new(descriptor: Arc<TypeDescriptor>, capacity: usize) -> Self {
        UnitOfWorkIdentityMap {
            core: MapCore::new(descriptor, capacity),
        }
    }
}

impl IdentityMap for UnitOfWorkIdentityMap {
    fn descriptor(&self) -> &Arc<TypeDescriptor> {
        self.core.descriptor()
    }

    fn map_kind(&self) -> IdentityMapKind {
        IdentityMapKind::Full
    }

    fn len(&self) -> usize {
        self.core.len()
    }

    fn get_cache_key(&self, key: &CacheId) -> Option<Arc<CacheKeyEntry>> {
        self.core.get(key)
    }

    fn get_or_create_cache_key(&self, key: &CacheId) -> Arc<CacheKeyEntry> {
        self.core.get_or_create(key)
    }

    fn put(
        &self,
        key: CacheId,
        object: Arc<dyn CacheObject>,
        write_lock_value: Option<IdValue>,
        read_time_millis: u64,
    ) -> Arc<CacheKeyEntry> {
        self.core.put_with(key, |entry| {
            entry.set_object_strong(Arc::clone(&object));
            entry.set_write_lock_value(write_lock_value.clone());
            entry.set_read_time_millis(read_time_millis);
            entry.set_invalidation_state(InvalidationState::Valid);
        })
    }

    fn remove(
        &self,
        key: &CacheId,
        expected: Option<&Arc<dyn CacheObject>>,
    ) -> Option<Arc<CacheKeyEntry>> {
        self.core.remove(key, expected)
    }

    fn clear(&self) {
        self.core.clear();
    }

    fn entries(&self, _check_read_locks: bool) -> Box<dyn Iterator<Item = Arc<CacheKeyEntry>>> {
        // Single-owner contract: no in-flight foreign writes to wait for.
        entry_iter(self.core.entry_vec(), false)
    }

    fn collect_locks(&self, report: &mut LockReport) {
        self.core.collect_locks(report);
    }

    fn snapshot(&self) -> Arc<dyn IdentityMap> {
        Arc::new(UnitOfWorkIdentityMap {
            core: self.core.snapshot_into(),
        })
    }

    fn requires_locking(&self) -> bool {
        false
    }
}
