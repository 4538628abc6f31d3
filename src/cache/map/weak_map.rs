//! Weak-reference identity map with amortized dead-slot reclamation
//!
//! Entries hold their object weakly: once every caller drops its strong
//! references the slot reads as a miss, and a cleanup sweep eventually
//! removes it. Lookups that discover a dead referent feed the key into a
//! reclamation queue so the next sweep can remove it cheaply; a full scan
//! backs the queue up for slots nobody touched. Sweeps are amortized over
//! puts — synchronous reclamation would make every put O(map size), never
//! sweeping would leak dead slots indefinitely.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::cache::config::IdentityMapKind;
use crate::cache::descriptor::TypeDescriptor;
use crate::cache::entry::CacheKeyEntry;
use crate::cache::invalidation::InvalidationState;
use crate::cache::map::{IdentityMap, LockReport, MapCore, entry_iter};
use crate::cache::traits::CacheObject;
use crate::cache::types::{CacheId, IdValue};

/// Floor for the self-tuning cleanup trigger.
const MIN_CLEANUP_INTERVAL: usize = 32;

#[derive(Debug)]
pub struct WeakIdentityMap {
    core: MapCore,
    /// Keys whose referent was found dead by a lookup. Bounded: overflow is
    /// harmless because the full scan catches whatever the queue missed.
    reap_tx: Sender<CacheId>,
    reap_rx: Receiver<CacheId>,
    puts_since_cleanup: AtomicUsize,
    /// Puts between sweeps; retuned to the observed map size after each
    /// sweep so cleanup cost stays proportional to churn.
    cleanup_interval: AtomicUsize,
}

impl WeakIdentityMap {
    pub fn new(descriptor: Arc<TypeDescriptor>, capacity: usize) -> Self {
        let (reap_tx, reap_rx) = crossbeam_channel::bounded(1024);
        WeakIdentityMap {
            core: MapCore::new(descriptor, capacity),
            reap_tx,
            reap_rx,
            puts_since_cleanup: AtomicUsize::new(0),
            cleanup_interval: AtomicUsize::new(MIN_CLEANUP_INTERVAL),
        }
    }

    fn enqueue_dead(&self, key: &CacheId) {
        match self.reap_tx.try_send(key.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Count a put toward the amortized trigger and sweep when it fires.
    fn note_put(&self) {
        let puts = self.puts_since_cleanup.fetch_add(1, Ordering::Relaxed) + 1;
        if puts >= self.cleanup_interval.load(Ordering::Relaxed) {
            self.puts_since_cleanup.store(0, Ordering::Relaxed);
            self.cleanup_dead_entries();
        }
    }
}

impl IdentityMap for WeakIdentityMap {
    fn descriptor(&self) -> &Arc<TypeDescriptor> {
        self.core.descriptor()
    }

    fn map_kind(&self) -> IdentityMapKind {
        IdentityMapKind::Weak
    }

    fn len(&self) -> usize {
        self.core.len()
    }

    fn get_cache_key(&self, key: &CacheId) -> Option<Arc<CacheKeyEntry>> {
        let entry = self.core.get(key)?;
        if entry.is_dead_referent() {
            // Still a valid transient state: the entry is returned (the
            // caller sees a miss through its cleared object) but the slot
            // is queued for the next sweep.
            self.enqueue_dead(key);
        }
        Some(entry)
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
        let entry = self.core.put_with(key, |entry| {
            entry.set_object_weak(&object);
            entry.set_write_lock_value(write_lock_value.clone());
            entry.set_read_time_millis(read_time_millis);
            entry.set_invalidation_state(InvalidationState::Valid);
        });
        self.note_put();
        entry
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
        while self.reap_rx.try_recv().is_ok() {}
    }

    fn entries(&self, check_read_locks: bool) -> Box<dyn Iterator<Item = Arc<CacheKeyEntry>>> {
        entry_iter(self.core.entry_vec(), check_read_locks)
    }

    fn collect_locks(&self, report: &mut LockReport) {
        self.core.collect_locks(report);
    }

    fn snapshot(&self) -> Arc<dyn IdentityMap> {
        let copy = WeakIdentityMap::new(Arc::clone(self.core.descriptor()), self.core.len());
        let core = self.core.snapshot_into();
        // Dead slots are not worth copying into a fresh snapshot.
        for key in core.keys() {
            core.remove_if_dead(&key);
        }
        Arc::new(WeakIdentityMap { core, ..copy })
    }

    /// Drain the reclamation queue, then scan for dead slots the queue
    /// never heard about. Lock-held entries are left for a later sweep.
    fn cleanup_dead_entries(&self) -> usize {
        let mut reclaimed = 0;

        while let Ok(key) = self.reap_rx.try_recv() {
            if self.core.remove_if_dead(&key) {
                reclaimed += 1;
            }
        }
        for key in self.core.keys() {
            if self.core.remove_if_dead(&key) {
                reclaimed += 1;
            }
        }

        let survivors = self.core.len();
        self.cleanup_interval
            .store(survivors.max(MIN_CLEANUP_INTERVAL), Ordering::Relaxed);
        if reclaimed > 0 {
            log::debug!(
                "reclaimed {} dead cache slots for {} ({} live)",
                reclaimed,
                self.core.descriptor().name(),
                survivors
            );
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> WeakIdentityMap {
        let descriptor = TypeDescriptor::new::<String>("Session").into_arc();
        WeakIdentityMap::new(descriptor, 16)
    }

    #[test]
    fn dropped_referent_reads_as_a_miss_before_cleanup() {
        let map = map();
        let key = CacheId::from(1i64);
        let object: Arc<dyn CacheObject> = Arc::new("alive".to_string());
        map.put(key.clone(), Arc::clone(&object), None, 0);

        assert!(map.get_cache_key(&key).unwrap().object().is_some());

        drop(object);
        // Slot still occupies the map, but reads as a miss.
        let entry = map.get_cache_key(&key).unwrap();
        assert!(entry.object().is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn cleanup_removes_dead_slots() {
        let map = map();
        let keep: Arc<dyn CacheObject> = Arc::new("keep".to_string());
        map.put(CacheId::from(1i64), Arc::clone(&keep), None, 0);
        {
            let transient: Arc<dyn CacheObject> = Arc::new("transient".to_string());
            map.put(CacheId::from(2i64), transient, None, 0);
        }

        assert_eq!(map.cleanup_dead_entries(), 1);
        assert_eq!(map.len(), 1);
        assert!(map.get_cache_key(&CacheId::from(1i64)).is_some());
        assert!(map.get_cache_key(&CacheId::from(2i64)).is_none());
    }

    #[test]
    fn amortized_trigger_sweeps_without_an_explicit_call() {
        let map = map();
        {
            let dead: Arc<dyn CacheObject> = Arc::new("dead".to_string());
            map.put(CacheId::from(0i64), dead, None, 0);
        }

        // Enough puts to fire the self-tuning trigger at least once.
        let retained: Vec<Arc<dyn CacheObject>> = (1..=(MIN_CLEANUP_INTERVAL as i64 + 1))
            .map(|id| {
                let object: Arc<dyn CacheObject> = Arc::new(format!("v{}", id));
                map.put(CacheId::from(id), Arc::clone(&object), None, 0);
                object
            })
            .collect();

        assert!(map.get_cache_key(&CacheId::from(0i64)).is_none());
        assert_eq!(map.len(), retained.len());
    }

    #[test]
    fn locked_dead_slots_survive_the_sweep() {
        let map = map();
        let key = CacheId::from(9i64);
        {
            let object: Arc<dyn CacheObject> = Arc::new("gone".to_string());
            map.put(key.clone(), object, None, 0);
        }
        let entry = map.get_cache_key(&key).unwrap();
        entry.acquire();

        assert_eq!(map.cleanup_dead_entries(), 0);
        assert_eq!(map.len(), 1);

        entry.release().unwrap();
        assert_eq!(map.cleanup_dead_entries(), 1);
        assert_eq!(map.len(), 0);
    }
}
