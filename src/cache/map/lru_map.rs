//! Fixed-capacity identity map with least-recently-used eviction
//!
//! The sub-cache variant: strong references under a hard size bound, with
//! recency-ordered eviction once the bound is reached. Lock-held entries
//! are never evicted; they requeue as most recently used and the next
//! eviction pass tries again. Also backs the per-query result caches.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;

use crate::cache::config::IdentityMapKind;
use crate::cache::descriptor::TypeDescriptor;
use crate::cache::entry::CacheKeyEntry;
use crate::cache::invalidation::InvalidationState;
use crate::cache::map::{HeldLock, IdentityMap, LockReport, entry_iter};
use crate::cache::traits::{CacheObject, same_object};
use crate::cache::types::{CacheId, IdValue};

pub struct LruIdentityMap {
    descriptor: Arc<TypeDescriptor>,
    max_size: usize,
    /// A single mutex rather than sharded storage: every access mutates
    /// recency order, so read/write locks would buy nothing, and bounded
    /// sub-caches stay small.
    entries: Mutex<LruCache<CacheId, Arc<CacheKeyEntry>>>,
}

impl std::fmt::Debug for LruIdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruIdentityMap")
            .field("type", &self.descriptor.name())
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl LruIdentityMap {
    pub fn new(descriptor: Arc<TypeDescriptor>, max_size: usize) -> Self {
        let bound = NonZeroUsize::new(max_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        LruIdentityMap {
            descriptor,
            max_size: bound.get(),
            entries: Mutex::new(LruCache::new(bound)),
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, LruCache<CacheId, Arc<CacheKeyEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make room for one insertion, evicting from the LRU end but skipping
    /// lock-held entries. If every resident entry is locked the bound is
    /// exceeded for this put rather than evicting under a holder.
    fn make_room(&self, entries: &mut LruCache<CacheId, Arc<CacheKeyEntry>>) {
        let mut requeued = 0;
        let resident = entries.len();

        while entries.len() >= self.max_size && requeued < resident {
            match entries.pop_lru() {
                Some((key, entry)) if entry.is_acquired() => {
                    entries.push(key, entry);
                    requeued += 1;
                }
                Some(_) => {}
                None => break,
            }
        }
        if entries.len() >= self.max_size {
            log::warn!(
                "lru identity map for {} over capacity: all {} resident entries are lock-held",
                self.descriptor.name(),
                entries.len()
            );
        }
    }
}

impl IdentityMap for LruIdentityMap {
    fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    fn map_kind(&self) -> IdentityMapKind {
        IdentityMapKind::Lru
    }

    fn len(&self) -> usize {
        self.lock_entries().len()
    }

    fn max_size(&self) -> Option<usize> {
        Some(self.max_size)
    }

    fn get_cache_key(&self, key: &CacheId) -> Option<Arc<CacheKeyEntry>> {
        self.lock_entries().get(key).map(Arc::clone)
    }

    fn get_or_create_cache_key(&self, key: &CacheId) -> Arc<CacheKeyEntry> {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get(key) {
            return Arc::clone(entry);
        }
        self.make_room(&mut entries);
        let entry = Arc::new(CacheKeyEntry::new(key.clone()));
        entries.push(key.clone(), Arc::clone(&entry));
        entry
    }

    fn put(
        &self,
        key: CacheId,
        object: Arc<dyn CacheObject>,
        write_lock_value: Option<IdValue>,
        read_time_millis: u64,
    ) -> Arc<CacheKeyEntry> {
        let mut entries = self.lock_entries();
        let entry = match entries.get(&key) {
            Some(existing) => Arc::clone(existing),
            None => {
                self.make_room(&mut entries);
                let created = Arc::new(CacheKeyEntry::new(key.clone()));
                entries.push(key, Arc::clone(&created));
                created
            }
        };
        // The map mutex is still held, so racing puts serialize here.
        entry.set_object_strong(object);
        entry.set_write_lock_value(write_lock_value);
        entry.set_read_time_millis(read_time_millis);
        entry.set_invalidation_state(InvalidationState::Valid);
        entry
    }

    fn remove(
        &self,
        key: &CacheId,
        expected: Option<&Arc<dyn CacheObject>>,
    ) -> Option<Arc<CacheKeyEntry>> {
        let mut entries = self.lock_entries();
        if let Some(expected) = expected {
            let matches = match entries.peek(key) {
                None => return None,
                Some(entry) => match entry.object() {
                    None => true,
                    Some(current) => same_object(&current, expected),
                },
            };
            if !matches {
                return None;
            }
        }
        entries.pop(key)
    }

    fn clear(&self) {
        self.lock_entries().clear();
    }

    fn entries(&self, check_read_locks: bool) -> Box<dyn Iterator<Item = Arc<CacheKeyEntry>>> {
        let snapshot: Vec<_> = self
            .lock_entries()
            .iter()
            .map(|(_, entry)| Arc::clone(entry))
            .collect();
        entry_iter(snapshot, check_read_locks)
    }

    fn collect_locks(&self, report: &mut LockReport) {
        for (key, entry) in self.lock_entries().iter() {
            if let Some(owner) = entry.lock_owner() {
                report.record(
                    owner,
                    HeldLock {
                        type_name: self.descriptor.name().to_string(),
                        key: key.clone(),
                        depth: entry.lock_depth(),
                    },
                );
            }
        }
    }

    fn snapshot(&self) -> Arc<dyn IdentityMap> {
        let copy = LruIdentityMap::new(Arc::clone(&self.descriptor), self.max_size);
        {
            let source = self.lock_entries();
            let mut target = copy.lock_entries();
            // Iteration runs most- to least-recent; push in reverse so the
            // copy preserves recency order.
            let pairs: Vec<_> = source
                .iter()
                .map(|(key, entry)| (key.clone(), Arc::new(entry.snapshot())))
                .collect();
            for (key, entry) in pairs.into_iter().rev() {
                target.push(key, entry);
            }
        }
        Arc::new(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(capacity: usize) -> LruIdentityMap {
        let descriptor = TypeDescriptor::new::<String>("Order").into_arc();
        LruIdentityMap::new(descriptor, capacity)
    }

    fn text(value: &str) -> Arc<dyn CacheObject> {
        Arc::new(value.to_string())
    }

    #[test]
    fn capacity_bound_is_enforced_lru_first() {
        let map = map(2);
        map.put(CacheId::from(1i64), text("one"), None, 0);
        map.put(CacheId::from(2i64), text("two"), None, 0);
        map.put(CacheId::from(3i64), text("three"), None, 0);

        assert_eq!(map.len(), 2);
        assert!(map.get_cache_key(&CacheId::from(1i64)).is_none()); // oldest evicted
        assert!(map.get_cache_key(&CacheId::from(2i64)).is_some());
        assert!(map.get_cache_key(&CacheId::from(3i64)).is_some());
    }

    #[test]
    fn access_refreshes_recency() {
        let map = map(2);
        map.put(CacheId::from(1i64), text("one"), None, 0);
        map.put(CacheId::from(2i64), text("two"), None, 0);

        // Touch 1 so 2 becomes the eviction candidate.
        map.get_cache_key(&CacheId::from(1i64)).unwrap();
        map.put(CacheId::from(3i64), text("three"), None, 0);

        assert!(map.get_cache_key(&CacheId::from(1i64)).is_some());
        assert!(map.get_cache_key(&CacheId::from(2i64)).is_none());
    }

    #[test]
    fn locked_entries_are_not_evicted() {
        let map = map(2);
        let held = map.put(CacheId::from(1i64), text("held"), None, 0);
        held.acquire();
        map.put(CacheId::from(2i64), text("two"), None, 0);
        map.put(CacheId::from(3i64), text("three"), None, 0);

        // The held entry survived; the unlocked one went instead.
        assert!(map.get_cache_key(&CacheId::from(1i64)).is_some());
        assert!(map.get_cache_key(&CacheId::from(2i64)).is_none());
        held.release().unwrap();
    }

    #[test]
    fn update_in_place_keeps_the_slot() {
        let map = map(4);
        let key = CacheId::from(5i64);
        let first = map.put(key.clone(), text("v1"), Some(IdValue::Uint(1)), 10);
        let second = map.put(key.clone(), text("v2"), Some(IdValue::Uint(2)), 20);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(map.len(), 1);
        assert_eq!(second.write_lock_value(), Some(IdValue::Uint(2)));
    }
}
