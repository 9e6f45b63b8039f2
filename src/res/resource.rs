use std::any::Any;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::utils::HashValue;

use super::handle::UntypedHandle;
use super::registry::ResourceTypeId;

/// The type-erased, finalized content of a resource. Concrete types are
/// recovered at the typed acquire boundary.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// The loading state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResourceState {
    /// No content; the initial state and the state after unload/reload.
    Unloaded = 0,
    /// Sitting in the loading queue, or picked up by a load worker.
    QueuedForLoading = 1,
    /// The finalize step is running.
    ContentUpdating = 2,
    /// Content is available.
    Loaded = 3,
    /// The loader failed; consumers get the missing-fallback, if any.
    LoadedResourceMissing = 4,
}

impl ResourceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ResourceState::Unloaded,
            1 => ResourceState::QueuedForLoading,
            2 => ResourceState::ContentUpdating,
            3 => ResourceState::Loaded,
            _ => ResourceState::LoadedResourceMissing,
        }
    }

    /// True once loading came to an end, successfully or not.
    #[inline]
    pub fn is_settled(self) -> bool {
        self == ResourceState::Loaded || self == ResourceState::LoadedResourceMissing
    }
}

/// The scheduling priority of a resource. Lower values load sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResourcePriority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl ResourcePriority {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ResourcePriority::Critical,
            1 => ResourcePriority::High,
            2 => ResourcePriority::Medium,
            _ => ResourcePriority::Low,
        }
    }
}

/// Estimated memory usage of a loaded resource, in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub cpu: u64,
    pub gpu: u64,
}

/// Base flags of a resource, mostly used by the manager's bookkeeping.
pub mod flags {
    /// In the loading queue or picked up by a load worker.
    pub const QUEUED_FOR_LOADING: u32 = 1 << 0;
    /// Content can be reloaded from its source.
    pub const RELOADABLE: u32 = 1 << 1;
    /// A one-shot custom loader is pending for this resource.
    pub const HAS_CUSTOM_LOADER: u32 = 1 << 2;
    /// A loading fallback is available, instance or type level.
    pub const HAS_TYPE_FALLBACK: u32 = 1 << 3;
    /// `restore` clears this; blocks non-forced reloads.
    pub const PREVENT_FILE_RELOAD: u32 = 1 << 4;
    /// Created procedurally from a descriptor, not loaded from a source.
    pub const CREATED: u32 = 1 << 5;
}

/// A single loadable asset instance. At most one `Resource` exists per
/// `(type, id)`; the manager's table is the owning reference, handles and
/// worker jobs hold non-owning clones whose lifetime never outlasts the
/// content they observe.
pub struct Resource {
    type_id: ResourceTypeId,
    id: String,
    id_hash: HashValue<str>,

    state: AtomicU8,
    priority: AtomicU8,
    flags: AtomicU32,

    /// Number of live handles. Eviction eligibility, not deallocation.
    pub(crate) refcount: AtomicI32,
    /// Open `begin_acquire` guards; begin/end pairing checks in debug.
    pub(crate) lock_count: AtomicI32,

    /// Microseconds since the manager epoch of the last productive acquire.
    last_acquire: AtomicU64,

    memory_cpu: AtomicU64,
    memory_gpu: AtomicU64,

    content: Mutex<Option<ErasedValue>>,
    pub(crate) loading_fallback: Mutex<Option<UntypedHandle>>,
}

impl Resource {
    pub(crate) fn new(
        type_id: ResourceTypeId,
        id: String,
        priority: ResourcePriority,
        flags: u32,
    ) -> Self {
        let id_hash = HashValue::from(&id);

        Resource {
            type_id,
            id,
            id_hash,
            state: AtomicU8::new(ResourceState::Unloaded as u8),
            priority: AtomicU8::new(priority as u8),
            flags: AtomicU32::new(flags),
            refcount: AtomicI32::new(0),
            lock_count: AtomicI32::new(0),
            last_acquire: AtomicU64::new(0),
            memory_cpu: AtomicU64::new(0),
            memory_gpu: AtomicU64::new(0),
            content: Mutex::new(None),
            loading_fallback: Mutex::new(None),
        }
    }

    /// The concrete type this resource was allocated as.
    #[inline]
    pub fn type_id(&self) -> ResourceTypeId {
        self.type_id
    }

    /// The unique identifier of this resource.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn id_hash(&self) -> HashValue<str> {
        self.id_hash
    }

    #[inline]
    pub fn state(&self) -> ResourceState {
        ResourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: ResourceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn priority(&self) -> ResourcePriority {
        ResourcePriority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_priority(&self, priority: ResourcePriority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    /// Number of live handles referencing this resource.
    #[inline]
    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage {
            cpu: self.memory_cpu.load(Ordering::Relaxed),
            gpu: self.memory_gpu.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_memory_usage(&self, usage: MemoryUsage) {
        self.memory_cpu.store(usage.cpu, Ordering::Relaxed);
        self.memory_gpu.store(usage.gpu, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    #[inline]
    pub(crate) fn add_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn remove_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    /// Microseconds since the manager epoch of the last productive acquire.
    #[inline]
    pub fn last_acquire(&self) -> u64 {
        self.last_acquire.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn touch(&self, now_us: u64) {
        self.last_acquire.store(now_us, Ordering::Relaxed);
    }

    pub(crate) fn content(&self) -> Option<ErasedValue> {
        self.content.lock().unwrap().clone()
    }

    pub(crate) fn set_content(&self, value: ErasedValue) {
        *self.content.lock().unwrap() = Some(value);
    }

    pub(crate) fn take_content(&self) -> Option<ErasedValue> {
        self.content.lock().unwrap().take()
    }

    /// The sortable key used by the loading queue; smaller loads sooner.
    /// Recently acquired resources are favored over long-untouched ones.
    pub(crate) fn loading_priority(&self, now_us: u64) -> f32 {
        let base = self.priority() as u8 as f32 * 10.0;
        let idle = (now_us.saturating_sub(self.last_acquire()) as f32) / 1_000_000.0;
        base + idle.min(30.0)
    }
}

impl ::std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        f.debug_struct("Resource")
            .field("type_id", &self.type_id)
            .field("id", &self.id)
            .field("state", &self.state())
            .field("refcount", &self.refcount())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_roundtrip() {
        let res = Resource::new(
            ResourceTypeId::from_raw(0),
            "foo".into(),
            ResourcePriority::Medium,
            0,
        );

        assert_eq!(res.state(), ResourceState::Unloaded);
        res.set_state(ResourceState::QueuedForLoading);
        assert_eq!(res.state(), ResourceState::QueuedForLoading);
        assert!(!res.state().is_settled());
        res.set_state(ResourceState::Loaded);
        assert!(res.state().is_settled());
    }

    #[test]
    fn flags() {
        let res = Resource::new(
            ResourceTypeId::from_raw(0),
            "foo".into(),
            ResourcePriority::Medium,
            flags::RELOADABLE,
        );

        assert!(res.has_flag(flags::RELOADABLE));
        assert!(!res.has_flag(flags::QUEUED_FOR_LOADING));
        res.add_flag(flags::QUEUED_FOR_LOADING);
        assert!(res.has_flag(flags::QUEUED_FOR_LOADING));
        res.remove_flag(flags::QUEUED_FOR_LOADING);
        assert!(!res.has_flag(flags::QUEUED_FOR_LOADING));
    }

    #[test]
    fn queue_priority_favors_recent_and_critical() {
        let a = Resource::new(
            ResourceTypeId::from_raw(0),
            "a".into(),
            ResourcePriority::Critical,
            0,
        );
        let b = Resource::new(
            ResourceTypeId::from_raw(0),
            "b".into(),
            ResourcePriority::Low,
            0,
        );

        let now = 5_000_000;
        a.touch(now);
        b.touch(now);
        assert!(a.loading_priority(now) < b.loading_priority(now));

        let c = Resource::new(
            ResourceTypeId::from_raw(0),
            "c".into(),
            ResourcePriority::Low,
            0,
        );
        c.touch(0);
        assert!(b.loading_priority(now) < c.loading_priority(now));
    }
}
