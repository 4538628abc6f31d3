//! Identity-map manager: routes {type, primary key} to the right map
//!
//! One manager per cache scope. Maps are keyed by inheritance-root type and
//! constructed lazily on first access; a single-slot advisory cache covers
//! the common case of repeated access to one type. The manager also owns
//! the query-result cache, the global cache lock, and the precomputed
//! pre-check that lets the default configuration skip locking and profiler
//! overhead entirely.

pub(crate) mod query_results;

pub use query_results::{CachedQueryResult, QueryId};

use std::any::TypeId;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;

use crate::cache::config::{CacheConfig, IdentityMapKind, SessionKind, SweepErrorPolicy};
use crate::cache::descriptor::TypeDescriptor;
use crate::cache::entry::CacheKeyEntry;
use crate::cache::invalidation::{InvalidationState, PolicyError};
use crate::cache::map::{
    FullIdentityMap, IdentityMap, LockReport, LruIdentityMap, UnitOfWorkIdentityMap,
    WeakIdentityMap,
};
use crate::cache::sync::{ConcurrencyManager, DeferredOutcome};
use crate::cache::traits::CacheObject;
use crate::cache::types::{CacheError, CacheId, IdValue, timestamp_millis};
use crate::telemetry::{
    CacheStatistics, CacheStatsSnapshot, NoopProfiler, ProfileCounter, ProfileOperation,
    SessionProfiler,
};

use query_results::QueryResultCache;

/// Advisory single-slot cache of the most recently accessed map.
type LastAccessed = Option<(TypeId, Arc<dyn IdentityMap>)>;

/// Undoes the per-access overhead taken by [`IdentityMapManager::begin_access`].
/// Exists only on instrumented or strictly synchronized configurations.
struct AccessGuard<'a> {
    manager: &'a IdentityMapManager,
    operation: ProfileOperation,
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        if self.manager.config.strict_read_write_synchronization {
            let _ = self.manager.cache_lock.release_read_lock();
        }
        if self.manager.profiler_enabled {
            self.manager.profiler.end_operation(self.operation);
        }
    }
}

/// Coordinator owning one identity map per root entity type.
#[derive(Debug)]
pub struct IdentityMapManager {
    config: CacheConfig,
    identity_maps: DashMap<TypeId, Arc<dyn IdentityMap>>,
    query_results: QueryResultCache,
    /// Whole-cache lock: shared mode around accesses under strict
    /// synchronization, exclusive mode for isolation scenarios.
    cache_lock: Arc<ConcurrencyManager>,
    last_accessed: RwLock<LastAccessed>,
    profiler: Arc<dyn SessionProfiler>,
    profiler_enabled: bool,
    /// Precomputed once: false means every access skips the global read
    /// lock and all profiler calls. The hot path depends on this.
    overhead_required: bool,
    stats: CacheStatistics,
}

impl IdentityMapManager {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_profiler(config, Arc::new(NoopProfiler))
    }

    pub fn with_profiler(config: CacheConfig, profiler: Arc<dyn SessionProfiler>) -> Self {
        let profiler_enabled = profiler.is_enabled();
        let overhead_required = profiler_enabled || config.strict_read_write_synchronization;
        let query_results = QueryResultCache::new(config.query_results_capacity);

        IdentityMapManager {
            config,
            identity_maps: DashMap::new(),
            query_results,
            cache_lock: Arc::new(ConcurrencyManager::new()),
            last_accessed: RwLock::new(None),
            profiler,
            profiler_enabled,
            overhead_required,
            stats: CacheStatistics::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn statistics(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    // -- access pre-check -------------------------------------------------

    #[inline]
    fn begin_access(&self, operation: ProfileOperation) -> Option<AccessGuard<'_>> {
        if !self.overhead_required {
            return None;
        }
        if self.profiler_enabled {
            self.profiler.start_operation(operation);
        }
        if self.config.strict_read_write_synchronization {
            self.cache_lock.acquire_read_lock();
        }
        Some(AccessGuard {
            manager: self,
            operation,
        })
    }

    #[inline]
    fn count(&self, counter: ProfileCounter) {
        if self.profiler_enabled {
            self.profiler.increment(counter);
        }
    }

    // -- map resolution ---------------------------------------------------

    /// Resolve (or lazily build) the identity map for `descriptor`'s
    /// inheritance root. With `return_none_if_absent` the call only
    /// probes and never constructs.
    pub fn get_identity_map(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        return_none_if_absent: bool,
    ) -> Result<Option<Arc<dyn IdentityMap>>, CacheError> {
        let root = TypeDescriptor::root_of(descriptor);
        let root_type = root.type_id();

        // Advisory fast path: one pointer compare, validated by type
        // equality; never trusted across a hierarchy boundary.
        if let Some((cached_type, map)) = self
            .last_accessed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            if *cached_type == root_type {
                return Ok(Some(Arc::clone(map)));
            }
        }

        if let Some(map) = self.identity_maps.get(&root_type) {
            let map = Arc::clone(map.value());
            self.remember_map(root_type, &map);
            return Ok(Some(map));
        }
        if return_none_if_absent {
            return Ok(None);
        }

        // Compare-and-insert under the shard guard: concurrent creators
        // serialize and every racer adopts the one surviving map.
        let map = match self.identity_maps.entry(root_type) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let built = self.build_identity_map(&root)?;
                vacant.insert(Arc::clone(&built));
                built
            }
        };
        self.remember_map(root_type, &map);
        Ok(Some(map))
    }

    fn remember_map(&self, root_type: TypeId, map: &Arc<dyn IdentityMap>) {
        *self
            .last_accessed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some((root_type, Arc::clone(map)));
    }

    fn forget_map(&self) {
        *self
            .last_accessed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn build_identity_map(
        &self,
        root: &Arc<TypeDescriptor>,
    ) -> Result<Arc<dyn IdentityMap>, CacheError> {
        let capacity = root
            .initial_capacity()
            .unwrap_or(self.config.default_map_capacity);
        if capacity == 0 {
            return Err(CacheError::MapConstruction(format!(
                "descriptor {} declares zero capacity",
                root.name()
            )));
        }

        let map: Arc<dyn IdentityMap> = if self.config.session_kind == SessionKind::UnitOfWork {
            Arc::new(UnitOfWorkIdentityMap::new(Arc::clone(root), capacity))
        } else {
            let kind = root.map_kind().unwrap_or(self.config.default_map_kind);
            match kind {
                IdentityMapKind::Full => Arc::new(FullIdentityMap::new(Arc::clone(root), capacity)),
                IdentityMapKind::Lru => Arc::new(LruIdentityMap::new(Arc::clone(root), capacity)),
                IdentityMapKind::Weak => Arc::new(WeakIdentityMap::new(Arc::clone(root), capacity)),
            }
        };
        log::debug!(
            "constructed {:?} identity map for {} (capacity {})",
            map.map_kind(),
            root.name(),
            capacity
        );
        Ok(map)
    }

    // -- keyed access -----------------------------------------------------

    /// The cached object for {descriptor, key}, or `None` for absent,
    /// invalidated, or reclaimed entries alike.
    pub fn get_from_identity_map(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
    ) -> Result<Option<Arc<dyn CacheObject>>, CacheError> {
        let _guard = self.begin_access(ProfileOperation::Caching);

        let Some(map) = self.get_identity_map(descriptor, true)? else {
            self.stats.record_miss();
            self.count(ProfileCounter::CacheMiss);
            return Ok(None);
        };
        let Some(entry) = map.get_cache_key(key) else {
            self.stats.record_miss();
            self.count(ProfileCounter::CacheMiss);
            return Ok(None);
        };

        let object = entry.object();
        let stale = match entry.is_invalidated(
            descriptor.invalidation_policy().as_ref(),
            timestamp_millis(),
        ) {
            Ok(stale) => stale,
            Err(error) => {
                // A read path has no sweep policy to consult; the
                // conservative answer is a miss.
                log::warn!(
                    "invalidation policy failed for {} {}: {}",
                    descriptor.name(),
                    key,
                    error
                );
                true
            }
        };

        match object {
            Some(object) if !stale => {
                self.stats.record_hit();
                self.count(ProfileCounter::CacheHit);
                Ok(Some(object))
            }
            _ => {
                self.stats.record_miss();
                self.count(ProfileCounter::CacheMiss);
                Ok(None)
            }
        }
    }

    /// The raw entry for {descriptor, key}, with no invalidation check.
    pub fn get_cache_key(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
    ) -> Result<Option<Arc<CacheKeyEntry>>, CacheError> {
        let _guard = self.begin_access(ProfileOperation::Caching);
        Ok(self
            .get_identity_map(descriptor, true)?
            .and_then(|map| map.get_cache_key(key)))
    }

    /// Whether a live (and optionally still-valid) object is cached.
    pub fn contains_key(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
        check_invalidation: bool,
    ) -> Result<bool, CacheError> {
        if check_invalidation {
            return Ok(self.get_from_identity_map(descriptor, key)?.is_some());
        }
        let Some(entry) = self.get_cache_key(descriptor, key)? else {
            return Ok(false);
        };
        Ok(entry.object().is_some())
    }

    pub fn put_in_identity_map(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: CacheId,
        object: Arc<dyn CacheObject>,
        write_lock_value: Option<IdValue>,
        read_time_millis: u64,
    ) -> Result<Arc<CacheKeyEntry>, CacheError> {
        let _guard = self.begin_access(ProfileOperation::Caching);
        let map = self.force_identity_map(descriptor)?;
        let entry = map.put(key, object, write_lock_value, read_time_millis);
        self.stats.record_put();
        Ok(entry)
    }

    pub fn remove_from_identity_map(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
        expected: Option<&Arc<dyn CacheObject>>,
    ) -> Result<Option<Arc<CacheKeyEntry>>, CacheError> {
        let _guard = self.begin_access(ProfileOperation::Caching);
        let Some(map) = self.get_identity_map(descriptor, true)? else {
            return Ok(None);
        };
        let removed = map.remove(key, expected);
        if removed.is_some() {
            self.stats.record_removal();
        }
        Ok(removed)
    }

    fn force_identity_map(
        &self,
        descriptor: &Arc<TypeDescriptor>,
    ) -> Result<Arc<dyn IdentityMap>, CacheError> {
        match self.get_identity_map(descriptor, false)? {
            Some(map) => Ok(map),
            // get_identity_map without the probe flag always constructs.
            None => Err(CacheError::MapConstruction(format!(
                "no identity map resolved for {}",
                descriptor.name()
            ))),
        }
    }

    // -- entry locking ----------------------------------------------------

    /// Get-or-create the entry and block until its lock is held.
    pub fn acquire_lock(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
    ) -> Result<Arc<CacheKeyEntry>, CacheError> {
        let _guard = self.begin_access(ProfileOperation::Locking);
        Ok(self.force_identity_map(descriptor)?.acquire_lock(key))
    }

    /// Get-or-create the entry and lock it only if that needs no waiting.
    pub fn acquire_lock_nowait(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
    ) -> Result<Option<Arc<CacheKeyEntry>>, CacheError> {
        let _guard = self.begin_access(ProfileOperation::Locking);
        Ok(self.force_identity_map(descriptor)?.acquire_lock_nowait(key))
    }

    /// Get-or-create the entry and lock it within `timeout`.
    pub fn acquire_lock_with_timeout(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
        timeout: Duration,
    ) -> Result<Arc<CacheKeyEntry>, CacheError> {
        let _guard = self.begin_access(ProfileOperation::Locking);
        let map = self.force_identity_map(descriptor)?;
        let entry = map.get_or_create_cache_key(key);
        if map.requires_locking() {
            entry.acquire_with_timeout(timeout)?;
        }
        Ok(entry)
    }

    /// Get-or-create the entry with the deferred-lock escape hatch for
    /// cyclic merges.
    pub fn acquire_deferred_lock(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
    ) -> Result<(Arc<CacheKeyEntry>, DeferredOutcome), CacheError> {
        let _guard = self.begin_access(ProfileOperation::Locking);
        let (entry, outcome) = self.force_identity_map(descriptor)?.acquire_deferred_lock(key);
        if outcome == DeferredOutcome::Deferred {
            self.stats.record_deferred_lock();
            self.count(ProfileCounter::DeferredLock);
        }
        Ok((entry, outcome))
    }

    // -- write-lock values ------------------------------------------------

    pub fn get_write_lock_value(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
    ) -> Result<Option<IdValue>, CacheError> {
        Ok(self
            .get_cache_key(descriptor, key)?
            .and_then(|entry| entry.write_lock_value()))
    }

    /// Update the optimistic-lock token in place. `false` when no entry
    /// exists for the key.
    pub fn set_write_lock_value(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
        value: Option<IdValue>,
    ) -> Result<bool, CacheError> {
        match self.get_cache_key(descriptor, key)? {
            Some(entry) => {
                entry.set_write_lock_value(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -- enumeration and diagnostics --------------------------------------

    /// Enumerate the entries cached for `descriptor`'s hierarchy. The
    /// checked variant waits for in-flight writes to settle before
    /// yielding each entry.
    pub fn entries(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        check_read_locks: bool,
    ) -> Result<Box<dyn Iterator<Item = Arc<CacheKeyEntry>>>, CacheError> {
        let Some(map) = self.get_identity_map(descriptor, true)? else {
            return Ok(Box::new(std::iter::empty()));
        };
        if check_read_locks && map.requires_locking() {
            // The configured budget, not the entry-level default.
            let budget = self.config.check_read_lock_budget();
            Ok(Box::new(map.entries(false).inspect(move |entry| {
                entry.check_read_lock_within(budget);
            })))
        } else {
            Ok(map.entries(false))
        }
    }

    pub fn size_of(&self, descriptor: &Arc<TypeDescriptor>) -> Result<usize, CacheError> {
        Ok(self
            .get_identity_map(descriptor, true)?
            .map(|map| map.len())
            .unwrap_or(0))
    }

    pub fn total_size(&self) -> usize {
        self.identity_maps
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    /// Owner-thread → held-entry associations across every map. Used to
    /// diagnose deadlocks and long-held locks.
    pub fn collect_all_locks(&self) -> LockReport {
        let mut report = LockReport::new();
        for entry in self.identity_maps.iter() {
            entry.value().collect_locks(&mut report);
        }
        report
    }

    // -- invalidation -----------------------------------------------------

    /// Mark every cached object of `descriptor`'s type (exact, or any
    /// subtype with `recurse`) invalid. Returns how many entries matched.
    pub fn invalidate_all(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        recurse: bool,
    ) -> Result<u64, CacheError> {
        self.invalidate_matching(descriptor, recurse, |_| Ok(true))
    }

    /// Predicate-based invalidation sweep. Predicate failures are handled
    /// per the configured [`SweepErrorPolicy`]; an entry is either decided
    /// or explicitly invalidated, never left half-swept.
    pub fn invalidate_matching<F>(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        recurse: bool,
        predicate: F,
    ) -> Result<u64, CacheError>
    where
        F: Fn(&CacheKeyEntry) -> Result<bool, PolicyError>,
    {
        let Some(map) = self.get_identity_map(descriptor, true)? else {
            return Ok(0);
        };

        let mut invalidated = 0u64;
        for entry in map.entries(false) {
            // A reclaimed or empty slot has no object to type-check and
            // nothing a caller could observe as stale.
            let Some(object) = entry.object() else {
                continue;
            };
            if !descriptor.matches_object(&object, recurse) {
                continue;
            }
            match predicate(&entry) {
                Ok(true) => {
                    entry.set_invalidation_state(InvalidationState::Invalidated);
                    invalidated += 1;
                }
                Ok(false) => {}
                Err(error) => match self.config.sweep_error_policy {
                    SweepErrorPolicy::InvalidateOnError => {
                        log::warn!(
                            "predicate failed for {} {}; invalidating per policy: {}",
                            descriptor.name(),
                            entry.key(),
                            error
                        );
                        entry.set_invalidation_state(InvalidationState::Invalidated);
                        invalidated += 1;
                    }
                    SweepErrorPolicy::AbortSweep => {
                        self.stats.record_invalidations(invalidated);
                        return Err(CacheError::InvalidationPolicy(error.message));
                    }
                },
            }
        }
        self.stats.record_invalidations(invalidated);
        Ok(invalidated)
    }

    // -- reclamation ------------------------------------------------------

    /// Sweep one type's map for dead slots (weak variant only).
    pub fn cleanup_dead_entries(
        &self,
        descriptor: &Arc<TypeDescriptor>,
    ) -> Result<usize, CacheError> {
        let Some(map) = self.get_identity_map(descriptor, true)? else {
            return Ok(0);
        };
        let reclaimed = map.cleanup_dead_entries();
        self.stats.record_reclamations(reclaimed as u64);
        Ok(reclaimed)
    }

    // -- reset and snapshot -----------------------------------------------

    /// Replace one root type's map wholesale with a fresh, empty one.
    pub fn initialize_identity_map(
        &self,
        descriptor: &Arc<TypeDescriptor>,
    ) -> Result<(), CacheError> {
        let root = TypeDescriptor::root_of(descriptor);
        let fresh = self.build_identity_map(&root)?;
        self.identity_maps.insert(root.type_id(), fresh);
        self.forget_map();
        Ok(())
    }

    /// Drop every identity map and cached query result.
    pub fn initialize_all_identity_maps(&self) {
        self.identity_maps.clear();
        self.query_results.clear_all();
        self.forget_map();
    }

    /// Clone-on-commit duplication: a fresh manager with deep-copied entry
    /// metadata sharing the contained objects. The copy owns its entries
    /// exclusively; no aliasing with this manager's entry objects.
    pub fn snapshot(&self) -> IdentityMapManager {
        let copy = IdentityMapManager::with_profiler(self.config.clone(), Arc::clone(&self.profiler));
        for entry in self.identity_maps.iter() {
            copy.identity_maps
                .insert(*entry.key(), entry.value().snapshot());
        }
        copy.query_results.adopt_snapshot(&self.query_results);
        copy
    }

    // -- whole-cache locking ----------------------------------------------

    /// Exclusive whole-cache lock for isolation scenarios (merge under
    /// strict synchronization). Not engaged by default configurations.
    pub fn acquire_whole_cache_lock(&self) {
        self.cache_lock.acquire();
    }

    pub fn release_whole_cache_lock(&self) -> Result<(), CacheError> {
        self.cache_lock.release().map_err(CacheError::from)
    }

    // -- query results ----------------------------------------------------

    /// Cached result for {query, parameters}. `max_age_millis` bounds
    /// staleness against each entry's read time. `None` means "not
    /// cached"; a cached empty result comes back as
    /// [`CachedQueryResult::NoResult`].
    pub fn get_query_result(
        &self,
        query: &QueryId,
        parameters: &CacheId,
        max_age_millis: Option<u64>,
    ) -> Option<CachedQueryResult> {
        let _guard = self.begin_access(ProfileOperation::QueryCache);
        let result = self
            .query_results
            .get(query, parameters, max_age_millis, timestamp_millis());
        match result {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        result
    }

    pub fn put_query_result(
        &self,
        query: QueryId,
        parameters: CacheId,
        result: CachedQueryResult,
        read_time_millis: u64,
    ) {
        let _guard = self.begin_access(ProfileOperation::QueryCache);
        self.query_results
            .put(query, parameters, result, read_time_millis);
        self.stats.record_put();
    }

    pub fn invalidate_query_results(&self, query: &QueryId) {
        self.query_results.invalidate(query);
    }

    pub fn clear_query_results(&self, query: &QueryId) {
        self.query_results.clear(query);
    }

    pub fn clear_all_query_results(&self) {
        self.query_results.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::invalidation::TimeToLive;
    use std::thread;

    #[derive(Debug)]
    struct Vehicle;
    #[derive(Debug)]
    struct Car;

    fn manager() -> IdentityMapManager {
        IdentityMapManager::new(CacheConfig::default())
    }

    fn vehicle_descriptor() -> Arc<TypeDescriptor> {
        TypeDescriptor::new::<Vehicle>("Vehicle").into_arc()
    }

    fn text(value: &str) -> Arc<dyn CacheObject> {
        Arc::new(value.to_string())
    }

    #[test]
    fn subtype_and_root_share_one_map() {
        let manager = manager();
        let vehicle = vehicle_descriptor();
        let car = TypeDescriptor::new::<Car>("Car")
            .with_parent(&vehicle)
            .into_arc();

        let by_root = manager.get_identity_map(&vehicle, false).unwrap().unwrap();
        let by_subtype = manager.get_identity_map(&car, false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&by_root, &by_subtype));
        assert_eq!(manager.total_size(), 0);
    }

    #[test]
    fn probing_never_constructs() {
        let manager = manager();
        let vehicle = vehicle_descriptor();

        assert!(manager.get_identity_map(&vehicle, true).unwrap().is_none());
        manager.get_identity_map(&vehicle, false).unwrap().unwrap();
        assert!(manager.get_identity_map(&vehicle, true).unwrap().is_some());
    }

    #[test]
    fn racing_lock_acquisitions_see_one_entry() {
        let manager = Arc::new(manager());
        let vehicle = vehicle_descriptor();
        let key = CacheId::from(42i64);

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let vehicle = Arc::clone(&vehicle);
                let key = key.clone();
                thread::spawn(move || {
                    let entry = manager.acquire_lock(&vehicle, &key).unwrap();
                    let identity = Arc::as_ptr(&entry) as usize;
                    entry.release().unwrap();
                    identity
                })
            })
            .collect();

        let identities: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(identities.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(manager.size_of(&vehicle).unwrap(), 1);
    }

    #[test]
    fn get_respects_the_invalidation_policy() {
        let manager = manager();
        let vehicle = TypeDescriptor::new::<Vehicle>("Vehicle")
            .with_invalidation_policy(Arc::new(TimeToLive::new(1_000)))
            .into_arc();
        let key = CacheId::from(1i64);

        // Stale read time: a put that happened "long ago".
        manager
            .put_in_identity_map(&vehicle, key.clone(), text("stale"), None, 0)
            .unwrap();
        assert!(manager.get_from_identity_map(&vehicle, &key).unwrap().is_none());

        // Fresh read time resurrects the slot.
        manager
            .put_in_identity_map(&vehicle, key.clone(), text("fresh"), None, timestamp_millis())
            .unwrap();
        assert!(manager.get_from_identity_map(&vehicle, &key).unwrap().is_some());
    }

    #[test]
    fn invalidation_sweep_honors_the_type_hierarchy() {
        let manager = manager();
        let vehicle = vehicle_descriptor();
        let car = TypeDescriptor::new::<Car>("Car")
            .with_parent(&vehicle)
            .into_arc();

        manager
            .put_in_identity_map(&car, CacheId::from(1i64), Arc::new(Car), None, timestamp_millis())
            .unwrap();

        // Exact-type sweep on the root misses the subtype instance.
        assert_eq!(manager.invalidate_all(&vehicle, false).unwrap(), 0);
        assert!(manager
            .get_from_identity_map(&car, &CacheId::from(1i64))
            .unwrap()
            .is_some());

        // Recursive sweep reaches it.
        assert_eq!(manager.invalidate_all(&vehicle, true).unwrap(), 1);
        assert!(manager
            .get_from_identity_map(&car, &CacheId::from(1i64))
            .unwrap()
            .is_none());
    }

    #[test]
    fn sweep_errors_follow_the_configured_policy() {
        let failing = |_: &CacheKeyEntry| Err(PolicyError::new("boom"));

        // Default: invalidate on error and keep sweeping.
        let manager = manager();
        let vehicle = vehicle_descriptor();
        manager
            .put_in_identity_map(
                &vehicle,
                CacheId::from(1i64),
                Arc::new(Vehicle),
                None,
                timestamp_millis(),
            )
            .unwrap();
        assert_eq!(manager.invalidate_matching(&vehicle, false, failing).unwrap(), 1);

        // Abort: surfaced as an error instead.
        let config = CacheConfig {
            sweep_error_policy: SweepErrorPolicy::AbortSweep,
            ..CacheConfig::default()
        };
        let strict = IdentityMapManager::new(config);
        strict
            .put_in_identity_map(
                &vehicle,
                CacheId::from(2i64),
                Arc::new(Vehicle),
                None,
                timestamp_millis(),
            )
            .unwrap();
        assert!(matches!(
            strict.invalidate_matching(&vehicle, false, failing),
            Err(CacheError::InvalidationPolicy(_))
        ));
    }

    #[test]
    fn zero_capacity_descriptor_fails_at_first_access() {
        let manager = manager();
        let broken = TypeDescriptor::new::<Vehicle>("Vehicle")
            .with_capacity(0)
            .into_arc();

        assert!(matches!(
            manager.get_identity_map(&broken, false),
            Err(CacheError::MapConstruction(_))
        ));
    }

    #[test]
    fn unit_of_work_sessions_skip_entry_locking() {
        let config = CacheConfig {
            session_kind: SessionKind::UnitOfWork,
            ..CacheConfig::default()
        };
        let manager = IdentityMapManager::new(config);
        let vehicle = vehicle_descriptor();

        let entry = manager.acquire_lock(&vehicle, &CacheId::from(1i64)).unwrap();
        assert!(!entry.is_acquired());
    }

    #[test]
    fn initialize_replaces_the_map_and_the_fast_path() {
        let manager = manager();
        let vehicle = vehicle_descriptor();
        manager
            .put_in_identity_map(&vehicle, CacheId::from(1i64), text("v"), None, 0)
            .unwrap();
        let before = manager.get_identity_map(&vehicle, true).unwrap().unwrap();

        manager.initialize_identity_map(&vehicle).unwrap();
        let after = manager.get_identity_map(&vehicle, true).unwrap().unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(manager.size_of(&vehicle).unwrap(), 0);
    }

    #[test]
    fn snapshot_is_exclusive_to_the_copy() {
        let manager = manager();
        let vehicle = vehicle_descriptor();
        let key = CacheId::from(1i64);
        manager
            .put_in_identity_map(&vehicle, key.clone(), text("kept"), None, timestamp_millis())
            .unwrap();

        let copy = manager.snapshot();
        manager
            .remove_from_identity_map(&vehicle, &key, None)
            .unwrap();

        assert!(copy.get_from_identity_map(&vehicle, &key).unwrap().is_some());
        assert!(manager.get_from_identity_map(&vehicle, &key).unwrap().is_none());
    }

    #[test]
    fn lock_report_names_the_owner() {
        let manager = manager();
        let vehicle = vehicle_descriptor();
        let entry = manager.acquire_lock(&vehicle, &CacheId::from(9i64)).unwrap();

        let report = manager.collect_all_locks();
        assert_eq!(report.total_held(), 1);
        let me = thread::current().id();
        assert_eq!(report.locks_for(me).len(), 1);
        assert_eq!(report.locks_for(me)[0].type_name, "Vehicle");

        entry.release().unwrap();
        assert!(manager.collect_all_locks().is_empty());
    }

    #[test]
    fn write_lock_values_update_in_place() {
        let manager = manager();
        let vehicle = vehicle_descriptor();
        let key = CacheId::from(3i64);
        manager
            .put_in_identity_map(&vehicle, key.clone(), text("v"), Some(IdValue::Uint(1)), 0)
            .unwrap();

        assert_eq!(
            manager.get_write_lock_value(&vehicle, &key).unwrap(),
            Some(IdValue::Uint(1))
        );
        assert!(manager
            .set_write_lock_value(&vehicle, &key, Some(IdValue::Uint(2)))
            .unwrap());
        assert_eq!(
            manager.get_write_lock_value(&vehicle, &key).unwrap(),
            Some(IdValue::Uint(2))
        );
        assert!(!manager
            .set_write_lock_value(&vehicle, &CacheId::from(99i64), None)
            .unwrap());
    }

    #[test]
    fn statistics_track_the_traffic() {
        let manager = manager();
        let vehicle = vehicle_descriptor();
        let key = CacheId::from(1i64);

        manager
            .put_in_identity_map(&vehicle, key.clone(), text("v"), None, timestamp_millis())
            .unwrap();
        manager.get_from_identity_map(&vehicle, &key).unwrap();
        manager
            .get_from_identity_map(&vehicle, &CacheId::from(2i64))
            .unwrap();

        let stats = manager.statistics();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
