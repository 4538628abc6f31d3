//! Type descriptors: the opaque metadata handle the cache receives per type
//!
//! A descriptor tells the cache everything it needs to know about one cached
//! type: its place in an inheritance hierarchy (subtypes share the root
//! type's map), the preferred map variant and capacity, and the invalidation
//! policy. The cache treats everything else about the type as opaque.

use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::cache::config::IdentityMapKind;
use crate::cache::invalidation::{InvalidationPolicy, NoExpiry};
use crate::cache::traits::CacheObject;

/// Metadata for one cached type.
///
/// Built once at registration and shared as `Arc<TypeDescriptor>`. The
/// subtype set grows as child descriptors register, so hierarchy links must
/// be established before the cache is used for those types.
pub struct TypeDescriptor {
    name: String,
    type_id: TypeId,
    parent: Option<Arc<TypeDescriptor>>,
    /// Type ids of every registered descendant, maintained transitively.
    subtypes: RwLock<HashSet<TypeId>>,
    map_kind: Option<IdentityMapKind>,
    initial_capacity: Option<usize>,
    invalidation_policy: Arc<dyn InvalidationPolicy>,
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("parent", &self.parent.as_ref().map(|p| p.name.clone()))
            .field("map_kind", &self.map_kind)
            .field("initial_capacity", &self.initial_capacity)
            .finish()
    }
}

impl TypeDescriptor {
    /// Descriptor for `T` with session defaults and no expiry.
    pub fn new<T: CacheObject>(name: impl Into<String>) -> Self {
        TypeDescriptor {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            parent: None,
            subtypes: RwLock::new(HashSet::new()),
            map_kind: None,
            initial_capacity: None,
            invalidation_policy: Arc::new(NoExpiry),
        }
    }

    /// Link this type under `parent` in an inheritance hierarchy. The
    /// type id (and any already-registered subtypes) propagate to every
    /// ancestor so `instanceof`-style checks stay transitive.
    pub fn with_parent(mut self, parent: &Arc<TypeDescriptor>) -> Self {
        let own_subtypes: Vec<TypeId> = self
            .subtypes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();

        let mut ancestor = Some(Arc::clone(parent));
        while let Some(current) = ancestor {
            current.register_subtype(self.type_id);
            for id in &own_subtypes {
                current.register_subtype(*id);
            }
            ancestor = current.parent.clone();
        }
        self.parent = Some(Arc::clone(parent));
        self
    }

    pub fn with_map_kind(mut self, kind: IdentityMapKind) -> Self {
        self.map_kind = Some(kind);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = Some(capacity);
        self
    }

    pub fn with_invalidation_policy(mut self, policy: Arc<dyn InvalidationPolicy>) -> Self {
        self.invalidation_policy = policy;
        self
    }

    pub fn into_arc(self) -> Arc<TypeDescriptor> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn parent(&self) -> Option<&Arc<TypeDescriptor>> {
        self.parent.as_ref()
    }

    pub fn has_inheritance(&self) -> bool {
        self.parent.is_some()
            || !self
                .subtypes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }

    /// The inheritance root: every subtype shares the root's identity map,
    /// because one data-source row maps to one cache slot regardless of
    /// declared subclass.
    pub fn root_of(this: &Arc<TypeDescriptor>) -> Arc<TypeDescriptor> {
        let mut current = Arc::clone(this);
        while let Some(parent) = current.parent.clone() {
            current = parent;
        }
        current
    }

    pub fn map_kind(&self) -> Option<IdentityMapKind> {
        self.map_kind
    }

    pub fn initial_capacity(&self) -> Option<usize> {
        self.initial_capacity
    }

    pub fn invalidation_policy(&self) -> &Arc<dyn InvalidationPolicy> {
        &self.invalidation_policy
    }

    /// Whether `type_id` is this type or a registered descendant.
    pub fn is_assignable_from(&self, type_id: TypeId) -> bool {
        self.type_id == type_id
            || self
                .subtypes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&type_id)
    }

    /// Runtime type check used by invalidation sweeps: exact match, or
    /// subtype match when `recurse` is set.
    pub fn matches_object(&self, object: &Arc<dyn CacheObject>, recurse: bool) -> bool {
        let object_type = object.as_any().type_id();
        if recurse {
            self.is_assignable_from(object_type)
        } else {
            self.type_id == object_type
        }
    }

    fn register_subtype(&self, type_id: TypeId) {
        self.subtypes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_id);
    }
}
