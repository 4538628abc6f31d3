//! Simple public API for the Keylox identity-map cache
//!
//! A `CacheSession` wraps one [`IdentityMapManager`] with a descriptor
//! registry and a builder, so callers configure a scope once and talk to
//! the cache through a single handle. All real work happens in the
//! manager; the session is deliberately thin.

use std::sync::Arc;

use dashmap::DashMap;

use crate::cache::config::{
    CacheConfig, ConfigError, IdentityMapKind, SessionKind, SweepErrorPolicy,
};
use crate::cache::descriptor::TypeDescriptor;
use crate::cache::entry::CacheKeyEntry;
use crate::cache::manager::{CachedQueryResult, IdentityMapManager, QueryId};
use crate::cache::map::LockReport;
use crate::cache::traits::CacheObject;
use crate::cache::types::{CacheError, CacheId, IdValue, timestamp_millis};
use crate::telemetry::{CacheStatsSnapshot, SessionProfiler};

/// Builder for a [`CacheSession`].
#[derive(Debug, Default)]
pub struct CacheSessionBuilder {
    config: CacheConfig,
    profiler: Option<Arc<dyn SessionProfiler>>,
}

impl CacheSessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_kind(mut self, kind: SessionKind) -> Self {
        self.config.session_kind = kind;
        self
    }

    pub fn default_map_kind(mut self, kind: IdentityMapKind) -> Self {
        self.config.default_map_kind = kind;
        self
    }

    pub fn default_map_capacity(mut self, capacity: usize) -> Self {
        self.config.default_map_capacity = capacity;
        self
    }

    pub fn strict_read_write_synchronization(mut self, strict: bool) -> Self {
        self.config.strict_read_write_synchronization = strict;
        self
    }

    pub fn lock_timeout_ms(mut self, millis: u64) -> Self {
        self.config.lock_timeout_ms = millis;
        self
    }

    pub fn query_results_capacity(mut self, capacity: usize) -> Self {
        self.config.query_results_capacity = capacity;
        self
    }

    pub fn sweep_error_policy(mut self, policy: SweepErrorPolicy) -> Self {
        self.config.sweep_error_policy = policy;
        self
    }

    pub fn profiler(mut self, profiler: Arc<dyn SessionProfiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn build(self) -> Result<CacheSession, ConfigError> {
        self.config.validate()?;
        let manager = match self.profiler {
            Some(profiler) => IdentityMapManager::with_profiler(self.config, profiler),
            None => IdentityMapManager::new(self.config),
        };
        Ok(CacheSession {
            manager: Arc::new(manager),
            descriptors: Arc::new(DashMap::new()),
        })
    }
}

/// One cache scope: a manager plus the descriptors registered with it.
#[derive(Debug, Clone)]
pub struct CacheSession {
    manager: Arc<IdentityMapManager>,
    descriptors: Arc<DashMap<String, Arc<TypeDescriptor>>>,
}

impl CacheSession {
    pub fn builder() -> CacheSessionBuilder {
        CacheSessionBuilder::new()
    }

    /// Register a descriptor so it can later be looked up by name.
    /// Hierarchy links must already be in place.
    pub fn register_descriptor(&self, descriptor: Arc<TypeDescriptor>) -> Arc<TypeDescriptor> {
        self.descriptors
            .insert(descriptor.name().to_string(), Arc::clone(&descriptor));
        descriptor
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.descriptors.get(name).map(|d| Arc::clone(d.value()))
    }

    pub fn manager(&self) -> &Arc<IdentityMapManager> {
        &self.manager
    }

    // -- keyed object access ----------------------------------------------

    pub fn get(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
    ) -> Result<Option<Arc<dyn CacheObject>>, CacheError> {
        self.manager.get_from_identity_map(descriptor, key)
    }

    /// Cache `object` under `key` with the current wall-clock read time.
    pub fn put(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: CacheId,
        object: Arc<dyn CacheObject>,
        write_lock_value: Option<IdValue>,
    ) -> Result<Arc<CacheKeyEntry>, CacheError> {
        self.manager.put_in_identity_map(
            descriptor,
            key,
            object,
            write_lock_value,
            timestamp_millis(),
        )
    }

    pub fn remove(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
        expected: Option<&Arc<dyn CacheObject>>,
    ) -> Result<Option<Arc<CacheKeyEntry>>, CacheError> {
        self.manager.remove_from_identity_map(descriptor, key, expected)
    }

    pub fn contains(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
    ) -> Result<bool, CacheError> {
        self.manager.contains_key(descriptor, key, true)
    }

    pub fn acquire_lock(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
    ) -> Result<Arc<CacheKeyEntry>, CacheError> {
        self.manager.acquire_lock(descriptor, key)
    }

    /// Like [`acquire_lock`](Self::acquire_lock) but bounded by the
    /// session's configured lock timeout.
    pub fn acquire_lock_bounded(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        key: &CacheId,
    ) -> Result<Arc<CacheKeyEntry>, CacheError> {
        self.manager
            .acquire_lock_with_timeout(descriptor, key, self.manager.config().lock_timeout())
    }

    // -- maintenance ------------------------------------------------------

    pub fn invalidate_all(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        recurse: bool,
    ) -> Result<u64, CacheError> {
        self.manager.invalidate_all(descriptor, recurse)
    }

    pub fn clear_all(&self) {
        self.manager.initialize_all_identity_maps();
    }

    pub fn collect_locks(&self) -> LockReport {
        self.manager.collect_all_locks()
    }

    pub fn statistics(&self) -> CacheStatsSnapshot {
        self.manager.statistics()
    }

    /// Transactional snapshot: a new session owning deep-copied entry
    /// metadata, sharing the cached objects, and carrying the same
    /// descriptor registry.
    pub fn snapshot(&self) -> CacheSession {
        CacheSession {
            manager: Arc::new(self.manager.snapshot()),
            descriptors: Arc::clone(&self.descriptors),
        }
    }

    // -- query results ----------------------------------------------------

    pub fn get_query_result(
        &self,
        query: &QueryId,
        parameters: &CacheId,
        max_age_millis: Option<u64>,
    ) -> Option<CachedQueryResult> {
        self.manager
            .get_query_result(query, parameters, max_age_millis)
    }

    pub fn put_query_result(
        &self,
        query: QueryId,
        parameters: CacheId,
        result: CachedQueryResult,
    ) {
        self.manager
            .put_query_result(query, parameters, result, timestamp_millis());
    }
}
