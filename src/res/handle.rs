use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::registry::{ResourceKind, ResourceTypeId};
use super::resource::{Resource, ResourcePriority, ResourceState};

/// A typeless, non-owning reference to a resource.
///
/// Holding a handle participates in the referent's reference count:
/// cloning increments it, dropping decrements it. Handles never free
/// anything themselves; a zero reference count merely makes the resource
/// eligible for eviction. The embedded shared pointer guarantees the entry
/// a handle observes can never be freed out from under it, no matter how
/// eviction and drops interleave.
pub struct UntypedHandle {
    res: Arc<Resource>,
}

impl UntypedHandle {
    pub(crate) fn new(res: Arc<Resource>) -> Self {
        res.refcount.fetch_add(1, Ordering::SeqCst);
        UntypedHandle { res }
    }

    #[inline]
    pub(crate) fn resource(&self) -> &Arc<Resource> {
        &self.res
    }

    /// The unique identifier of the referenced resource.
    #[inline]
    pub fn id(&self) -> &str {
        self.res.id()
    }

    /// The concrete type the referenced resource was allocated as, which
    /// may be a derived type if an override redirected the request.
    #[inline]
    pub fn type_id(&self) -> ResourceTypeId {
        self.res.type_id()
    }

    /// The current loading state of the referenced resource.
    #[inline]
    pub fn state(&self) -> ResourceState {
        self.res.state()
    }

    /// The scheduling priority used when the referenced resource loads.
    #[inline]
    pub fn priority(&self) -> ResourcePriority {
        self.res.priority()
    }

    /// Adjusts the referenced resource's scheduling priority; the loading
    /// queue picks the change up on its next refresh.
    #[inline]
    pub fn set_priority(&self, priority: ResourcePriority) {
        self.res.set_priority(priority);
    }

    /// True if both handles reference the same resource instance.
    #[inline]
    pub fn ptr_eq(&self, other: &UntypedHandle) -> bool {
        Arc::ptr_eq(&self.res, &other.res)
    }
}

impl Clone for UntypedHandle {
    fn clone(&self) -> Self {
        UntypedHandle::new(self.res.clone())
    }
}

impl Drop for UntypedHandle {
    fn drop(&mut self) {
        let prev = self.res.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "resource '{}' refcount underflow", self.res.id());
    }
}

impl ::std::fmt::Debug for UntypedHandle {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "UntypedHandle({:?}, '{}')", self.type_id(), self.id())
    }
}

/// A typed, non-owning reference to a resource of kind `K`.
pub struct ResHandle<K: ResourceKind> {
    untyped: UntypedHandle,
    _marker: PhantomData<fn() -> K>,
}

impl<K: ResourceKind> ResHandle<K> {
    pub(crate) fn from_untyped(untyped: UntypedHandle) -> Self {
        ResHandle {
            untyped,
            _marker: PhantomData,
        }
    }

    /// Borrows the typeless view of this handle.
    #[inline]
    pub fn untyped(&self) -> &UntypedHandle {
        &self.untyped
    }

    /// Converts into the typeless view, keeping the reference alive.
    #[inline]
    pub fn into_untyped(self) -> UntypedHandle {
        self.untyped
    }

    #[inline]
    pub fn id(&self) -> &str {
        self.untyped.id()
    }

    #[inline]
    pub fn state(&self) -> ResourceState {
        self.untyped.state()
    }

    #[inline]
    pub fn priority(&self) -> ResourcePriority {
        self.untyped.priority()
    }

    #[inline]
    pub fn set_priority(&self, priority: ResourcePriority) {
        self.untyped.set_priority(priority);
    }

    #[inline]
    pub fn ptr_eq(&self, other: &ResHandle<K>) -> bool {
        self.untyped.ptr_eq(&other.untyped)
    }

    #[inline]
    pub(crate) fn resource(&self) -> &Arc<Resource> {
        self.untyped.resource()
    }
}

impl<K: ResourceKind> Clone for ResHandle<K> {
    fn clone(&self) -> Self {
        ResHandle {
            untyped: self.untyped.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K: ResourceKind> ::std::fmt::Debug for ResHandle<K> {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "ResHandle({:?}, '{}')", self.untyped.type_id(), self.id())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn refcount_follows_clones() {
        let res = Arc::new(Resource::new(
            ResourceTypeId::from_raw(0),
            "foo".into(),
            ResourcePriority::Medium,
            0,
        ));

        assert_eq!(res.refcount(), 0);

        let h1 = UntypedHandle::new(res.clone());
        assert_eq!(res.refcount(), 1);

        let h2 = h1.clone();
        assert_eq!(res.refcount(), 2);
        assert!(h1.ptr_eq(&h2));

        drop(h1);
        assert_eq!(res.refcount(), 1);
        drop(h2);
        assert_eq!(res.refcount(), 0);
    }
}
