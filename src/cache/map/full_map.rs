//! Unbounded identity map holding strong references
//!
//! The default variant: objects stay cached for the life of the map, and
//! the map only shrinks through explicit removal or reset. Suited to
//! reference data and types whose instance count is naturally bounded.

use std::sync::Arc;

use crate::cache::config::IdentityMapKind;
use crate::cache::descriptor::TypeDescriptor;
use crate::cache::entry::CacheKeyEntry;
use crate::cache::invalidation::InvalidationState;
use crate::cache::map::{IdentityMap, LockReport, MapCore, entry_iter};
use crate::cache::traits::CacheObject;
use crate::cache::types::{CacheId, IdValue};

#[derive(Debug)]
pub struct FullIdentityMap {
    core: MapCore,
}

impl FullIdentityMap {
    pub fn new(descriptor: Arc<TypeDescriptor>, capacity: usize) -> Self {
        FullIdentityMap {
            core: MapCore::new(descriptor, capacity),
        }
    }

    pub(crate) fn from_core(core: MapCore) -> Self {
        FullIdentityMap { core }
    }
}

impl IdentityMap for FullIdentityMap {
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

    fn entries(&self, check_read_locks: bool) -> Box<dyn Iterator<Item = Arc<CacheKeyEntry>>> {
        entry_iter(self.core.entry_vec(), check_read_locks)
    }

    fn collect_locks(&self, report: &mut LockReport) {
        self.core.collect_locks(report);
    }

    fn snapshot(&self) -> Arc<dyn IdentityMap> {
        Arc::new(FullIdentityMap::from_core(self.core.snapshot_into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::traits::downcast_object;
    use std::thread;

    fn map() -> Arc<FullIdentityMap> {
        let descriptor = TypeDescriptor::new::<String>("Employee").into_arc();
        Arc::new(FullIdentityMap::new(descriptor, 16))
    }

    fn text(value: &str) -> Arc<dyn CacheObject> {
        Arc::new(value.to_string())
    }

    #[test]
    fn unbounded_map_retains_everything() {
        let map = map();
        for id in 1..=3i64 {
            map.put(CacheId::from(id), text(&format!("v{}", id)), None, 0);
        }
        assert_eq!(map.len(), 3);
        for id in 1..=3i64 {
            assert!(map.get_cache_key(&CacheId::from(id)).is_some());
        }
    }

    #[test]
    fn racing_creators_converge_on_one_entry() {
        let map = map();
        let key = CacheId::from(42i64);
        let threads = 8;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let map = Arc::clone(&map);
                let key = key.clone();
                thread::spawn(move || map.get_or_create_cache_key(&key))
            })
            .collect();

        let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(map.len(), 1);
        for entry in &entries[1..] {
            assert!(Arc::ptr_eq(&entries[0], entry));
        }
    }

    #[test]
    fn racing_puts_leave_one_consistent_entry() {
        let map = map();
        let key = CacheId::from(42i64);

        let writer_a = {
            let map = Arc::clone(&map);
            let key = key.clone();
            thread::spawn(move || {
                map.put(key, text("objA"), Some(IdValue::Uint(1)), 100);
            })
        };
        let writer_b = {
            let map = Arc::clone(&map);
            let key = key.clone();
            thread::spawn(move || {
                map.put(key, text("objB"), Some(IdValue::Uint(2)), 200);
            })
        };
        writer_a.join().unwrap();
        writer_b.join().unwrap();

        let entry = map.get_cache_key(&key).unwrap();
        let object = entry.object().unwrap();
        let value = downcast_object::<String>(&object).unwrap().as_str();
        let lock_value = entry.write_lock_value().unwrap();
        let read_time = entry.read_time_millis();

        // All fields come from the same write, never a mix.
        assert!(
            (value, &lock_value, read_time) == ("objA", &IdValue::Uint(1), 100)
                || (value, &lock_value, read_time) == ("objB", &IdValue::Uint(2), 200)
        );
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn identity_checked_remove_spares_newer_objects() {
        let map = map();
        let key = CacheId::from(7i64);
        let stale = text("old");
        map.put(key.clone(), Arc::clone(&stale), None, 0);

        // A newer object races into the slot before the evictor runs.
        let newer = text("new");
        map.put(key.clone(), Arc::clone(&newer), None, 1);

        assert!(map.remove(&key, Some(&stale)).is_none());
        assert!(map.get_cache_key(&key).is_some());

        assert!(map.remove(&key, Some(&newer)).is_some());
        assert!(map.get_cache_key(&key).is_none());
    }

    #[test]
    fn put_replaces_fields_in_place() {
        let map = map();
        let key = CacheId::from(9i64);
        let first = map.put(key.clone(), text("v1"), Some(IdValue::Uint(1)), 10);
        first.set_invalidation_state(InvalidationState::Invalidated);

        let second = map.put(key.clone(), text("v2"), Some(IdValue::Uint(2)), 20);

        // Same slot, refreshed contents, invalidation reset.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.write_lock_value(), Some(IdValue::Uint(2)));
        assert_eq!(first.invalidation_state(), InvalidationState::Valid);
    }

    #[test]
    fn snapshot_is_independent_but_shares_objects() {
        let map = map();
        let key = CacheId::from(1i64);
        map.put(key.clone(), text("shared"), None, 0);

        let copy = map.snapshot();
        map.remove(&key, None);

        assert_eq!(copy.len(), 1);
        assert!(copy.get_cache_key(&key).is_some());
        assert!(map.get_cache_key(&key).is_none());
    }
}
