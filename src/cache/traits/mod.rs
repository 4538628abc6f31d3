//! Traits cached objects and their suppliers implement
//!
//! The cache stores type-erased objects behind `Arc<dyn CacheObject>`; the
//! blanket impl means any `'static + Send + Sync + Debug` type qualifies
//! without ceremony. Identity is the `Arc` allocation, runtime type is the
//! `Any` type id — both are what the manager's identity checks and
//! invalidation sweeps key on.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// A value the identity-map cache can hold.
///
/// Callers never implement this by hand; the blanket impl covers every
/// eligible type. `as_any` exists because trait upcasting to `dyn Any` must
/// go through a method on stable Rust.
pub trait CacheObject: Any + Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + Debug> CacheObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Downcast a cached object to a concrete type.
pub fn downcast_object<T: Any>(object: &Arc<dyn CacheObject>) -> Option<&T> {
    object.as_any().downcast_ref::<T>()
}

/// Whether two cached objects are the same allocation. Used by
/// identity-checked removal: a stale evictor must not remove a newer object
/// that raced into the same slot.
#[inline]
pub fn same_object(a: &Arc<dyn CacheObject>, b: &Arc<dyn CacheObject>) -> bool {
    Arc::ptr_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blanket_impl_admits_plain_types() {
        let object: Arc<dyn CacheObject> = Arc::new(42u32);
        assert_eq!(downcast_object::<u32>(&object), Some(&42));
        assert_eq!(downcast_object::<String>(&object), None);
    }

    #[test]
    fn identity_is_the_allocation_not_the_value() {
        let a: Arc<dyn CacheObject> = Arc::new("x".to_string());
        let b: Arc<dyn CacheObject> = Arc::new("x".to_string());
        let a2 = Arc::clone(&a);

        assert!(same_object(&a, &a2));
        assert!(!same_object(&a, &b));
    }
}
