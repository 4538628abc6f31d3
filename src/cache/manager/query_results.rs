//! Secondary cache of query results keyed by {query identity, parameters}
//!
//! Each query gets its own small bounded map from parameter tuple to
//! result. "No rows" is cached as a distinguished sentinel so it is never
//! confused with "not yet cached"; staleness is judged per entry against
//! its read time.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::cache::descriptor::TypeDescriptor;
use crate::cache::entry::CacheKeyEntry;
use crate::cache::invalidation::InvalidationState;
use crate::cache::map::{IdentityMap, LruIdentityMap};
use crate::cache::traits::{CacheObject, downcast_object};
use crate::cache::types::CacheId;

/// Identity of a cached query: its name when it has one, otherwise a
/// caller-supplied numeric identity standing in for the query object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryId {
    Named(String),
    Id(u64),
}

impl QueryId {
    pub fn named(name: impl Into<String>) -> Self {
        QueryId::Named(name.into())
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryId::Named(name) => write!(f, "{}", name),
            QueryId::Id(id) => write!(f, "query#{}", id),
        }
    }
}

/// A cached query outcome. `NoResult` is the stored sentinel for a query
/// that ran and returned no rows.
#[derive(Debug, Clone, Default)]
pub enum CachedQueryResult {
    #[default]
    NoResult,
    Objects(Vec<Arc<dyn CacheObject>>),
}

impl CachedQueryResult {
    pub fn is_empty(&self) -> bool {
        match self {
            CachedQueryResult::NoResult => true,
            CachedQueryResult::Objects(objects) => objects.is_empty(),
        }
    }
}

/// Query identity → bounded parameter-tuple map.
#[derive(Debug)]
pub(crate) struct QueryResultCache {
    capacity_per_query: usize,
    tables: DashMap<QueryId, Arc<LruIdentityMap>>,
}

impl QueryResultCache {
    pub(crate) fn new(capacity_per_query: usize) -> Self {
        QueryResultCache {
            capacity_per_query,
            tables: DashMap::new(),
        }
    }

    fn table_for(&self, query: &QueryId) -> Arc<LruIdentityMap> {
        Arc::clone(
            self.tables
                .entry(query.clone())
                .or_insert_with(|| {
                    let descriptor =
                        TypeDescriptor::new::<CachedQueryResult>(query.to_string()).into_arc();
                    Arc::new(LruIdentityMap::new(descriptor, self.capacity_per_query))
                })
                .value(),
        )
    }

    pub(crate) fn get(
        &self,
        query: &QueryId,
        parameters: &CacheId,
        max_age_millis: Option<u64>,
        now_millis: u64,
    ) -> Option<CachedQueryResult> {
        let table = Arc::clone(self.tables.get(query)?.value());
        let entry = table.get_cache_key(parameters)?;

        if entry.invalidation_state() == InvalidationState::Invalidated {
            return None;
        }
        if let Some(max_age) = max_age_millis {
            if now_millis.saturating_sub(entry.read_time_millis()) > max_age {
                entry.set_invalidation_state(InvalidationState::Invalidated);
                return None;
            }
        }

        let object = entry.object()?;
        downcast_object::<CachedQueryResult>(&object).cloned()
    }

    pub(crate) fn put(
        &self,
        query: QueryId,
        parameters: CacheId,
        result: CachedQueryResult,
        read_time_millis: u64,
    ) {
        let table = self.table_for(&query);
        table.put(parameters, Arc::new(result), None, read_time_millis);
    }

    /// Mark every cached result of one query stale without dropping the
    /// slots.
    pub(crate) fn invalidate(&self, query: &QueryId) {
        if let Some(table) = self.tables.get(query) {
            for entry in table.entries(false) {
                entry.set_invalidation_state(InvalidationState::Invalidated);
            }
        }
    }

    pub(crate) fn clear(&self, query: &QueryId) {
        self.tables.remove(query);
    }

    pub(crate) fn clear_all(&self) {
        self.tables.clear();
    }

    /// Deep-copy the other cache's tables into this one (entry metadata
    /// copied, result objects shared).
    pub(crate) fn adopt_snapshot(&self, source: &QueryResultCache) {
        for table in source.tables.iter() {
            let copied = table.value().snapshot();
            let lru = LruIdentityMap::new(
                Arc::clone(copied.descriptor()),
                source.capacity_per_query,
            );
            for entry in copied.entries(false) {
                if let Some(object) = entry.object() {
                    lru.put(
                        entry.key().clone(),
                        object,
                        entry.write_lock_value(),
                        entry.read_time_millis(),
                    );
                }
            }
            self.tables.insert(table.key().clone(), Arc::new(lru));
        }
    }

    pub(crate) fn query_count(&self) -> usize {
        self.tables.len()
    }
}
