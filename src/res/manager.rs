//! The resource manager facade and its shared state.
//!
//! `ResourceManager` is the owning handle created by the host; the thread
//! that creates it becomes the designated main context and must drive
//! `per_frame_update`. `ResourceManagerShared` is the clonable view that
//! every other system and worker thread talks to.
//!
//! One mutex guards all manager bookkeeping: the per-type resource tables,
//! the loading queue, type info, the override/named/custom-loader tables,
//! the deferred main-thread work lists and the sweep cursor. Finalized
//! content is owned by each resource itself, so acquiring loaded content
//! never takes this lock on the hot path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::errors::{ResourceError, Result};
use crate::sched::TaskScheduler;
use crate::utils::{FastHashMap, HashValue};

use super::events::{
    EventHub, ListenerId, ManagerEvent, ResourceEvent, ResourceEventKind,
};
use super::handle::{ResHandle, UntypedHandle};
use super::loading::PendingUpdate;
use super::queue::LoadingQueue;
use super::registry::{
    IdentityResolver, PathResolver, Register, ResourceKind, ResourceTypeId,
    ResourceTypeLoader, TypeDescriptor, TypeRegistry,
};
use super::resource::{flags, Resource, ResourceState};

/// Everything guarded by the manager lock.
pub(crate) struct ManagerState {
    pub registry: TypeRegistry,
    /// Per-type resource tables, keyed by hashed id. Ordered maps so the
    /// sweep cursor survives insertions and removals between calls.
    pub tables: BTreeMap<ResourceTypeId, BTreeMap<u64, Arc<Resource>>>,
    pub queue: LoadingQueue,
    /// One-shot loaders keyed by resource identity.
    pub custom_loaders: FastHashMap<(ResourceTypeId, u64), Arc<dyn ResourceTypeLoader>>,
    /// Lookup-name to canonical id redirections.
    pub named: FastHashMap<HashValue<str>, String>,
    pub default_loader: Option<Arc<dyn ResourceTypeLoader>>,
    pub resolver: Arc<dyn PathResolver>,
    /// Finalizes of main-thread-affine types, run by `per_frame_update`.
    pub deferred_main_updates: Vec<PendingUpdate>,
    /// Deallocations of main-thread-affine types, run by `per_frame_update`.
    pub deferred_main_unloads: Vec<Arc<Resource>>,
    /// Resume point of the budgeted sweep, strictly-after semantics.
    pub sweep_cursor: Option<(ResourceTypeId, u64)>,
    /// Per-frame `(budget, age threshold)` sweep policy, if enabled.
    pub auto_free: Option<(Duration, Duration)>,
    pub broadcast_exists: bool,
    next_unique_id: u64,
}

impl ManagerState {
    fn new() -> Self {
        ManagerState {
            registry: TypeRegistry::new(),
            tables: BTreeMap::new(),
            queue: LoadingQueue::new(),
            custom_loaders: FastHashMap::default(),
            named: FastHashMap::default(),
            default_loader: None,
            resolver: Arc::new(IdentityResolver),
            deferred_main_updates: Vec::new(),
            deferred_main_unloads: Vec::new(),
            sweep_cursor: None,
            auto_free: None,
            broadcast_exists: false,
            next_unique_id: 0,
        }
    }

    pub(crate) fn kind_id<K: ResourceKind>(&self) -> Result<ResourceTypeId> {
        self.registry
            .id_of::<K>()
            .ok_or_else(|| ResourceError::UnknownType.into())
    }

    pub(crate) fn find(&self, type_id: ResourceTypeId, hash: u64) -> Option<&Arc<Resource>> {
        self.tables.get(&type_id).and_then(|t| t.get(&hash))
    }

    pub(crate) fn table_mut(
        &mut self,
        type_id: ResourceTypeId,
    ) -> &mut BTreeMap<u64, Arc<Resource>> {
        self.tables.entry(type_id).or_insert_with(BTreeMap::new)
    }

    /// Applies named redirection, then file-system redirection; returns
    /// `(identity id, resolved id for override deciders)`.
    fn resolve_id(&self, id: &str) -> (String, String) {
        let identity = match self.named.get(&HashValue::from(id)) {
            Some(target) => target.clone(),
            None => id.to_string(),
        };
        let resolved = self.resolver.resolve_redirection(&identity);
        (identity, resolved)
    }
}

/// The shared half of the resource manager; clonable across threads.
pub struct ResourceManagerShared {
    pub(crate) me: Weak<ResourceManagerShared>,
    pub(crate) sched: Arc<dyn TaskScheduler>,
    pub(crate) epoch: Instant,
    main_thread: ThreadId,
    pub(crate) state: Mutex<ManagerState>,
    /// Signals load completions to blocking acquirers.
    pub(crate) load_signal: Condvar,
    pub(crate) events: EventHub,
    pub(crate) shutdown: AtomicBool,
    /// Remaining frames in which fallback acquires upgrade to blocking.
    pub(crate) force_no_fallback: AtomicU32,
    frame: AtomicU64,
    pub(crate) active_load_jobs: AtomicU32,
}

/// The owning half; create one per host, keep it on the main context.
pub struct ResourceManager {
    shared: Arc<ResourceManagerShared>,
}

impl ResourceManager {
    pub fn new(sched: Arc<dyn TaskScheduler>) -> Self {
        let shared = Arc::new_cyclic(|me| ResourceManagerShared {
            me: me.clone(),
            sched,
            epoch: Instant::now(),
            main_thread: thread::current().id(),
            state: Mutex::new(ManagerState::new()),
            load_signal: Condvar::new(),
            events: EventHub::new(),
            shutdown: AtomicBool::new(false),
            force_no_fallback: AtomicU32::new(0),
            frame: AtomicU64::new(0),
            active_load_jobs: AtomicU32::new(0),
        });

        info!("resource manager up");
        ResourceManager { shared }
    }

    #[inline]
    pub fn shared(&self) -> Arc<ResourceManagerShared> {
        self.shared.clone()
    }

    /// Runs the per-frame housekeeping; must be called from the thread
    /// that created the manager.
    pub fn per_frame_update(&self) {
        self.shared.per_frame_update();
    }

    /// Stops accepting work, drains in-flight loads and frees everything
    /// unreferenced. Call while engine systems still exist.
    pub fn on_engine_shutdown(&self) {
        self.shared.on_engine_shutdown();
    }

    /// Final teardown; frees every remaining resource and logs the ones
    /// still referenced.
    pub fn on_core_shutdown(&self) {
        self.shared.on_core_shutdown();
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if !self.shared.shutdown.load(Ordering::SeqCst) {
            self.shared.on_core_shutdown();
        }
    }
}

impl ::std::ops::Deref for ResourceManager {
    type Target = ResourceManagerShared;

    fn deref(&self) -> &ResourceManagerShared {
        &self.shared
    }
}

impl ResourceManagerShared {
    pub(crate) fn arc(&self) -> Arc<ResourceManagerShared> {
        self.me.upgrade().unwrap()
    }

    /// Microseconds since the manager was created.
    #[inline]
    pub(crate) fn now_us(&self) -> u64 {
        let elapsed = self.epoch.elapsed();
        elapsed.as_secs() * 1_000_000 + u64::from(elapsed.subsec_micros())
    }

    #[inline]
    pub(crate) fn on_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    fn guard_shutdown(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            Err(ResourceError::ShutDown.into())
        } else {
            Ok(())
        }
    }

    /// The single entry point that creates or finds a resource. Runs the
    /// whole identity pipeline: named redirection, file-system
    /// redirection, override resolution over the resolved id, hashed
    /// table lookup, allocation on miss.
    pub(crate) fn get_resource_locked(
        &self,
        state: &mut ManagerState,
        type_id: ResourceTypeId,
        id: &str,
        reloadable: bool,
        events: &mut Vec<ResourceEvent>,
    ) -> Result<UntypedHandle> {
        if id.is_empty() {
            return Err(ResourceError::EmptyResourceId.into());
        }

        let (identity, resolved) = state.resolve_id(id);
        let type_id = state.registry.resolve_override(type_id, &resolved);

        let info = state.registry.info(type_id);
        if info.is_abstract() {
            return Err(ResourceError::AbstractType(info.name).into());
        }

        let default_priority = info.default_priority;
        let has_type_fallback = info.loading_fallback.is_some();

        let hash = HashValue::from(&identity).raw();
        if let Some(res) = state.find(type_id, hash) {
            res.touch(self.now_us());
            return Ok(UntypedHandle::new(res.clone()));
        }

        let mut initial = 0;
        if reloadable {
            initial |= flags::RELOADABLE;
        }
        if has_type_fallback {
            initial |= flags::HAS_TYPE_FALLBACK;
        }

        let res = Arc::new(Resource::new(type_id, identity, default_priority, initial));
        res.touch(self.now_us());

        debug!("allocated resource '{}' ({:?})", res.id(), type_id);
        events.push(ResourceEvent::of(ResourceEventKind::Created, &res));

        let handle = UntypedHandle::new(res.clone());
        state.table_mut(type_id).insert(hash, res);
        Ok(handle)
    }

    /// Returns a handle to the resource with identifier `id`, allocating
    /// the entry on first request. Loading does not start here; it starts
    /// on the first acquire or preload.
    pub fn load<K: ResourceKind>(&self, id: &str) -> Result<ResHandle<K>> {
        self.guard_shutdown()?;

        let mut events = Vec::new();
        let handle = {
            let mut state = self.state.lock().unwrap();
            let type_id = state.kind_id::<K>()?;
            self.get_resource_locked(&mut state, type_id, id, true, &mut events)?
        };

        self.events.emit_resource_batch(events);
        Ok(ResHandle::from_untyped(handle))
    }

    /// Like [`load`](Self::load), additionally installing an
    /// instance-level loading fallback consulted before the type-level
    /// one.
    pub fn load_with_fallback<K: ResourceKind>(
        &self,
        id: &str,
        fallback: ResHandle<K>,
    ) -> Result<ResHandle<K>> {
        let handle = self.load::<K>(id)?;
        *handle.resource().loading_fallback.lock().unwrap() = Some(fallback.into_untyped());
        handle.resource().add_flag(flags::HAS_TYPE_FALLBACK);
        Ok(handle)
    }

    /// Creates a resource procedurally from a descriptor. The finalize
    /// step runs immediately on the calling thread; created resources
    /// never reload from a source.
    pub fn create<R: Register>(
        &self,
        id: &str,
        descriptor: R::Intermediate,
    ) -> Result<ResHandle<R>> {
        self.guard_shutdown()?;
        if id.is_empty() {
            return Err(ResourceError::EmptyResourceId.into());
        }

        let hash = HashValue::from(id).raw();
        let mut events = Vec::new();

        let (res, register, handle) = {
            let mut state = self.state.lock().unwrap();
            let type_id = state.kind_id::<R>()?;

            let info = state.registry.info(type_id);
            let register = match info.register.clone() {
                Some(register) => register,
                None => return Err(ResourceError::AbstractType(info.name).into()),
            };
            let priority = info.default_priority;

            if state.find(type_id, hash).is_some() {
                return Err(ResourceError::AlreadyCreated(id.to_string()).into());
            }

            let res = Arc::new(Resource::new(
                type_id,
                id.to_string(),
                priority,
                flags::CREATED,
            ));
            res.touch(self.now_us());
            events.push(ResourceEvent::of(ResourceEventKind::Created, &res));

            let handle = UntypedHandle::new(res.clone());
            state.table_mut(type_id).insert(hash, res.clone());
            (res, register, handle)
        };

        self.events.emit_resource_batch(events);

        match register.attach(self, id, Box::new(descriptor)) {
            Ok((value, usage)) => {
                res.set_content(value);
                res.set_memory_usage(usage);
                res.set_state(ResourceState::Loaded);
                self.events
                    .emit_resource(&ResourceEvent::of(ResourceEventKind::ContentUpdated, &res));
                Ok(ResHandle::from_untyped(handle))
            }
            Err(err) => {
                res.set_state(ResourceState::LoadedResourceMissing);
                Err(err)
            }
        }
    }

    /// Returns the already-created resource, or creates it from the
    /// descriptor.
    pub fn get_or_create<R: Register>(
        &self,
        id: &str,
        descriptor: R::Intermediate,
    ) -> Result<ResHandle<R>> {
        if let Some(handle) = self.get_existing::<R>(id) {
            return Ok(handle);
        }
        self.create::<R>(id, descriptor)
    }

    /// A handle to the resource if it already exists; never allocates.
    pub fn get_existing<K: ResourceKind>(&self, id: &str) -> Option<ResHandle<K>> {
        let state = self.state.lock().unwrap();
        let type_id = state.kind_id::<K>().ok()?;

        let (identity, resolved) = state.resolve_id(id);
        let type_id = state.registry.resolve_override(type_id, &resolved);

        let hash = HashValue::from(&identity).raw();
        state
            .find(type_id, hash)
            .map(|res| ResHandle::from_untyped(UntypedHandle::new(res.clone())))
    }

    #[inline]
    pub fn loading_state(&self, handle: &UntypedHandle) -> ResourceState {
        handle.state()
    }

    /// True while any load is queued, running on a worker, or waiting for
    /// main-thread finalization.
    pub fn is_any_loading_in_progress(&self) -> bool {
        if self.active_load_jobs.load(Ordering::SeqCst) > 0 {
            return true;
        }
        let state = self.state.lock().unwrap();
        !state.queue.is_empty() || !state.deferred_main_updates.is_empty()
    }

    /// For the next `frames` frames, acquires that would return a
    /// fallback block until real content is available instead.
    pub fn force_no_fallback(&self, frames: u32) {
        self.force_no_fallback.fetch_max(frames, Ordering::SeqCst);
    }

    /// Number of `per_frame_update` calls so far.
    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    pub fn generate_unique_resource_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_unique_id += 1;
        format!("{}-{}", prefix, state.next_unique_id)
    }

    // -------------------------------------------------------------------
    // registration

    pub fn register_type<R: Register>(
        &self,
        desc: TypeDescriptor,
        register: R,
    ) -> Result<ResourceTypeId> {
        let mut state = self.state.lock().unwrap();
        let id = state.registry.register(desc, register)?;
        info!("registered resource type '{}'", state.registry.info(id).name);
        Ok(id)
    }

    pub fn register_abstract_type<K: ResourceKind>(
        &self,
        desc: TypeDescriptor,
    ) -> Result<ResourceTypeId> {
        let mut state = self.state.lock().unwrap();
        let id = state.registry.register_abstract::<K>(desc)?;
        info!(
            "registered abstract resource type '{}'",
            state.registry.info(id).name
        );
        Ok(id)
    }

    /// Installs the loader that turns ids of this type into raw bytes.
    pub fn register_type_loader<K: ResourceKind>(
        &self,
        loader: Arc<dyn ResourceTypeLoader>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let type_id = state.kind_id::<K>()?;
        state.registry.info_mut(type_id).loader = Some(loader);
        Ok(())
    }

    /// The loader used by types without a loader of their own.
    pub fn set_default_loader(&self, loader: Option<Arc<dyn ResourceTypeLoader>>) {
        self.state.lock().unwrap().default_loader = loader;
    }

    pub fn set_path_resolver(&self, resolver: Arc<dyn PathResolver>) {
        self.state.lock().unwrap().resolver = resolver;
    }

    /// Requests of any ancestor type whose path-resolved id matches
    /// `decider` are redirected to `Derived`.
    pub fn register_override<Derived: ResourceKind>(
        &self,
        decider: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let derived = state.kind_id::<Derived>()?;
        state.registry.register_override(derived, Arc::new(decider));
        Ok(())
    }

    /// Registers `name` as an alias resolving to `target`.
    pub fn register_named(&self, name: &str, target: &str) {
        let mut state = self.state.lock().unwrap();
        state.named.insert(HashValue::from(name), target.to_string());
    }

    pub fn unregister_named(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.named.remove(&HashValue::from(name));
    }

    /// The resource substituted while instances of `K` are still loading.
    /// Affects resources allocated later and existing ones alike.
    pub fn set_type_loading_fallback<K: ResourceKind>(
        &self,
        fallback: Option<ResHandle<K>>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let type_id = state.kind_id::<K>()?;
        let has = fallback.is_some();
        state.registry.info_mut(type_id).loading_fallback =
            fallback.map(ResHandle::into_untyped);

        if let Some(table) = state.tables.get(&type_id) {
            for res in table.values() {
                if has {
                    res.add_flag(flags::HAS_TYPE_FALLBACK);
                } else {
                    res.remove_flag(flags::HAS_TYPE_FALLBACK);
                }
            }
        }
        Ok(())
    }

    /// The resource substituted when instances of `K` failed to load.
    pub fn set_type_missing_fallback<K: ResourceKind>(
        &self,
        fallback: Option<ResHandle<K>>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let type_id = state.kind_id::<K>()?;
        state.registry.info_mut(type_id).missing_fallback =
            fallback.map(ResHandle::into_untyped);
        Ok(())
    }

    /// Allows resources of type `Being` to acquire resources of type
    /// `Wants` during their finalize step. Call at startup, before loads
    /// of `Being` run.
    pub fn allow_nested_acquire<Being: ResourceKind, Wants: ResourceKind>(
        &self,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let being = state.kind_id::<Being>()?;
        let wants = state.kind_id::<Wants>()?;
        state.registry.add_nested_type(being, wants);
        Ok(())
    }

    /// Whether budgeted background sweeps may evict resources of `K`.
    pub fn set_incremental_unload<K: ResourceKind>(&self, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let type_id = state.kind_id::<K>()?;
        state.registry.info_mut(type_id).incremental_unload = enabled;
        Ok(())
    }

    /// Enables a per-frame budgeted sweep with the given budget and age
    /// threshold; `None` disables it.
    pub fn set_auto_free(&self, policy: Option<(Duration, Duration)>) {
        self.state.lock().unwrap().auto_free = policy;
    }

    // -------------------------------------------------------------------
    // events

    pub fn on_resource_event(
        &self,
        listener: impl FnMut(&ResourceEvent) + Send + 'static,
    ) -> ListenerId {
        self.events.subscribe_resource(Box::new(listener))
    }

    pub fn unsubscribe_resource_event(&self, id: ListenerId) {
        self.events.unsubscribe_resource(id);
    }

    pub fn on_manager_event(
        &self,
        listener: impl FnMut(&ManagerEvent) + Send + 'static,
    ) -> ListenerId {
        self.events.subscribe_manager(Box::new(listener))
    }

    pub fn unsubscribe_manager_event(&self, id: ListenerId) {
        self.events.unsubscribe_manager(id);
    }

    /// Broadcasts an `Exists` event for every live resource, so
    /// late-attaching observers can catch up.
    pub fn broadcast_exists_event(&self) {
        let mut events = Vec::new();
        {
            let state = self.state.lock().unwrap();
            for table in state.tables.values() {
                for res in table.values() {
                    events.push(ResourceEvent::of(ResourceEventKind::Exists, res));
                }
            }
        }
        self.events.emit_resource_batch(events);
    }

    /// When enabled, `per_frame_update` runs
    /// [`broadcast_exists_event`](Self::broadcast_exists_event) each
    /// frame.
    pub fn set_auto_broadcast_exists(&self, enabled: bool) {
        self.state.lock().unwrap().broadcast_exists = enabled;
    }

    // -------------------------------------------------------------------
    // lifecycle

    pub(crate) fn per_frame_update(&self) {
        debug_assert!(
            self.on_main_thread(),
            "per_frame_update must run on the thread that created the manager"
        );

        self.frame.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .force_no_fallback
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            });

        let now = self.now_us();
        let mut events = Vec::new();
        let (unloads, updates, auto) = {
            let mut state = self.state.lock().unwrap();

            if state.broadcast_exists {
                for table in state.tables.values() {
                    for res in table.values() {
                        events.push(ResourceEvent::of(ResourceEventKind::Exists, res));
                    }
                }
            }

            state.queue.tick(now);

            (
                ::std::mem::replace(&mut state.deferred_main_unloads, Vec::new()),
                ::std::mem::replace(&mut state.deferred_main_updates, Vec::new()),
                state.auto_free,
            )
        };

        self.events.emit_resource_batch(events);

        for res in unloads {
            self.deallocate_deferred(&res);
        }

        for update in updates {
            self.finalize_update(update);
        }

        if let Some((budget, threshold)) = auto {
            self.free_unused(budget, threshold);
        }

        self.kick_load_jobs();
    }

    pub(crate) fn on_engine_shutdown(&self) {
        info!("resource manager shutting down");
        self.events.emit_manager(&ManagerEvent::ManagerShuttingDown);

        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel_all_loads();

        let jobs = &self.active_load_jobs;
        self.sched
            .wait_for_condition(&|| jobs.load(Ordering::SeqCst) == 0);

        self.free_all_unused();
    }

    pub(crate) fn on_core_shutdown(&self) {
        if !self.shutdown.load(Ordering::SeqCst) {
            self.on_engine_shutdown();
        }
        self.force_free_all();
    }
}
