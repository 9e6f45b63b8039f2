//! The loading pipeline and the acquire protocol.
//!
//! Loading runs in two steps. Data-load worker jobs drain the queue: they
//! pick a loader (one-shot custom, then per-type, then default), produce
//! raw bytes and parse them into an intermediate, all without the manager
//! lock. The finalize step (`Register::attach`) then runs inline for
//! `AnyThread` types, or is deferred to the `per_frame_update` pump for
//! `MainThread` types.
//!
//! Blocking acquires never just park: when the target still sits in the
//! queue, the calling thread steals the entry and loads it itself, which
//! also sidesteps priority inversion against a busy worker pool.

use std::cell::RefCell;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::Result;

use super::events::{ManagerEvent, ResourceEvent, ResourceEventKind};
use super::handle::{ResHandle, UntypedHandle};
use super::manager::{ManagerState, ResourceManagerShared};
use super::registry::{
    ErasedRegister, ResourceKind, ResourceTypeId, ResourceTypeLoader, UpdateAffinity,
};
use super::resource::{flags, ErasedValue, Resource, ResourceState};

/// Concurrent data-load worker jobs.
const MAX_LOAD_JOBS: u32 = 4;

/// Referenced resources acquired within this window are re-queued right
/// after a reload unloads them.
const RELOAD_RECENCY_US: u64 = 30 * 1_000_000;

thread_local! {
    /// Identities of resources whose finalize step is running on this
    /// thread, innermost last.
    static UPDATING: RefCell<Vec<(ResourceTypeId, u64)>> = RefCell::new(Vec::new());
}

/// A parsed intermediate waiting for its main-thread finalize.
///
/// `std::any::Any` stays a fully-qualified path in this module: importing
/// the trait would make `res.type_id()` on an `Arc<Resource>` resolve to
/// `Any::type_id` instead of the inherent accessor.
pub(crate) struct PendingUpdate {
    pub res: Arc<Resource>,
    pub item: Box<dyn std::any::Any + Send>,
}

/// How `begin_acquire` behaves while the target is not loaded yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Drive loading to completion, cooperatively if possible.
    BlockTillLoaded,
    /// Substitute a fallback instead of blocking; falls back to blocking
    /// when no fallback is available or `force_no_fallback` is active.
    AllowLoadingFallback,
}

/// What an acquire actually returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireKind {
    /// The real content.
    Final,
    /// A stand-in while the target is still loading.
    LoadingFallback,
    /// The type's missing-fallback; the target failed to load.
    MissingFallback,
}

/// Scoped access to resource content; derefs to the content value and
/// releases the acquire lock on drop.
pub struct AcquireGuard<K: ResourceKind> {
    value: Arc<K::Value>,
    res: Arc<Resource>,
    kind: AcquireKind,
}

impl<K: ResourceKind> AcquireGuard<K> {
    #[inline]
    pub fn kind(&self) -> AcquireKind {
        self.kind
    }

    /// The identifier of the acquired resource. Note this names the
    /// target even when a fallback's content was substituted.
    #[inline]
    pub fn id(&self) -> &str {
        self.res.id()
    }
}

impl<K: ResourceKind> Deref for AcquireGuard<K> {
    type Target = K::Value;

    #[inline]
    fn deref(&self) -> &K::Value {
        &self.value
    }
}

impl<K: ResourceKind> Drop for AcquireGuard<K> {
    fn drop(&mut self) {
        let prev = self.res.lock_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unbalanced end_acquire for '{}'", self.res.id());
    }
}

#[inline]
fn identity(res: &Resource) -> (ResourceTypeId, u64) {
    (res.type_id(), res.id_hash().raw())
}

impl ResourceManagerShared {
    /// Queues the resource for asynchronous loading; a no-op if it is
    /// already queued, loading, or loaded.
    pub fn preload(&self, handle: &UntypedHandle) -> bool {
        self.internal_preload(handle.resource(), false)
    }

    /// Loads the resource on the calling thread, ahead of everything
    /// queued.
    pub fn force_load_now(&self, handle: &UntypedHandle) {
        let res = handle.resource();
        self.internal_preload(res, true);
        self.ensure_loaded(res);
    }

    pub(crate) fn internal_preload(&self, res: &Arc<Resource>, high_priority: bool) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        if res.has_flag(flags::CREATED) {
            return false;
        }

        {
            let mut state = self.state.lock().unwrap();
            if res.has_flag(flags::QUEUED_FOR_LOADING) {
                return false;
            }
            if res.state() != ResourceState::Unloaded {
                return false;
            }

            res.add_flag(flags::QUEUED_FOR_LOADING);
            res.set_state(ResourceState::QueuedForLoading);

            if high_priority {
                state.queue.push_front(res.clone());
            } else {
                let now = self.now_us();
                state.queue.push_back(res.clone(), now);
            }
        }

        self.kick_load_jobs();
        true
    }

    /// Spawns data-load worker jobs, up to [`MAX_LOAD_JOBS`], while the
    /// queue is non-empty.
    pub(crate) fn kick_load_jobs(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let pending = self.state.lock().unwrap().queue.len();
        let mut wanted = pending.min(MAX_LOAD_JOBS as usize) as u32;

        while wanted > 0 {
            let active = self.active_load_jobs.load(Ordering::SeqCst);
            if active >= MAX_LOAD_JOBS {
                return;
            }

            if self
                .active_load_jobs
                .compare_exchange(active, active + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let shared = self.arc();
                self.sched.spawn(Box::new(move || shared.run_load_worker()));
                wanted -= 1;
            }
        }
    }

    fn run_load_worker(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let entry = self.state.lock().unwrap().queue.pop_front();
            match entry {
                Some(entry) => self.process_resource(&entry.res),
                None => break,
            }
        }

        self.active_load_jobs.fetch_sub(1, Ordering::SeqCst);
        self.load_signal.notify_all();
    }

    fn pick_loader(
        &self,
        state: &mut ManagerState,
        res: &Arc<Resource>,
        consume_custom: bool,
    ) -> Option<Arc<dyn ResourceTypeLoader>> {
        let custom = if res.has_flag(flags::HAS_CUSTOM_LOADER) {
            if consume_custom {
                res.remove_flag(flags::HAS_CUSTOM_LOADER);
                state.custom_loaders.remove(&identity(res))
            } else {
                state.custom_loaders.get(&identity(res)).cloned()
            }
        } else {
            None
        };

        custom
            .or_else(|| state.registry.info(res.type_id()).loader.clone())
            .or_else(|| state.default_loader.clone())
    }

    /// Runs the data-load step for one dequeued resource, then finalizes
    /// or defers according to the type's affinity.
    pub(crate) fn process_resource(&self, res: &Arc<Resource>) {
        if self.shutdown.load(Ordering::SeqCst) {
            res.remove_flag(flags::QUEUED_FOR_LOADING);
            if res.state() == ResourceState::QueuedForLoading {
                res.set_state(ResourceState::Unloaded);
            }
            self.load_signal.notify_all();
            return;
        }

        let (loader, register, affinity) = {
            let mut state = self.state.lock().unwrap();
            let loader = self.pick_loader(&mut state, res, true);
            let info = state.registry.info(res.type_id());
            (loader, info.register.clone(), info.affinity)
        };

        let register = match register {
            Some(register) => register,
            None => {
                error!("resource '{}' has no register", res.id());
                self.mark_missing(res);
                return;
            }
        };

        let loader = match loader {
            Some(loader) => loader,
            None => {
                warn!("no loader available for resource '{}'", res.id());
                self.mark_missing(res);
                return;
            }
        };

        let outcome: Result<Box<dyn std::any::Any + Send>> = loader
            .load(res.id())
            .and_then(|bytes| register.parse(res.id(), &bytes));

        match outcome {
            Ok(item) => self.dispatch_update(
                PendingUpdate {
                    res: res.clone(),
                    item,
                },
                affinity,
            ),
            Err(err) => {
                warn!("loading resource '{}' failed: {}", res.id(), err);
                self.mark_missing(res);
            }
        }
    }

    fn dispatch_update(&self, update: PendingUpdate, affinity: UpdateAffinity) {
        match affinity {
            UpdateAffinity::AnyThread => self.finalize_update(update),
            UpdateAffinity::MainThread => {
                if self.on_main_thread() {
                    self.finalize_update(update);
                } else {
                    self.state.lock().unwrap().deferred_main_updates.push(update);
                    self.load_signal.notify_all();
                }
            }
        }
    }

    /// Runs the finalize step of a parsed intermediate on the current
    /// thread.
    pub(crate) fn finalize_update(&self, update: PendingUpdate) {
        let PendingUpdate { res, item } = update;

        let register = {
            let state = self.state.lock().unwrap();
            state.registry.info(res.type_id()).register.clone()
        };
        let register: Arc<dyn ErasedRegister> = match register {
            Some(register) => register,
            None => {
                self.mark_missing(&res);
                return;
            }
        };

        res.set_state(ResourceState::ContentUpdating);

        UPDATING.with(|stack| stack.borrow_mut().push(identity(&res)));
        let outcome = register.attach(self, res.id(), item);
        UPDATING.with(|stack| {
            stack.borrow_mut().pop();
        });

        match outcome {
            Ok((value, usage)) => {
                res.set_content(value);
                res.set_memory_usage(usage);
                res.remove_flag(flags::QUEUED_FOR_LOADING);
                res.set_state(ResourceState::Loaded);

                debug!("loaded resource '{}'", res.id());
                self.events
                    .emit_resource(&ResourceEvent::of(ResourceEventKind::ContentUpdated, &res));
            }
            Err(err) => {
                warn!("finalizing resource '{}' failed: {}", res.id(), err);
                self.mark_missing(&res);
                return;
            }
        }

        self.load_signal.notify_all();
    }

    fn mark_missing(&self, res: &Arc<Resource>) {
        res.remove_flag(flags::QUEUED_FOR_LOADING);
        res.set_state(ResourceState::LoadedResourceMissing);
        self.events
            .emit_resource(&ResourceEvent::of(ResourceEventKind::ContentUpdated, res));
        self.load_signal.notify_all();
    }

    /// Drives loading of `res` to a settled state. Steals the queue entry
    /// onto the calling thread when possible; otherwise waits for the
    /// completion signal.
    pub(crate) fn ensure_loaded(&self, res: &Arc<Resource>) {
        loop {
            if res.state().is_settled() {
                return;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            if res.state() == ResourceState::Unloaded
                && !res.has_flag(flags::QUEUED_FOR_LOADING)
            {
                self.internal_preload(res, true);
                continue;
            }

            let stolen = self.state.lock().unwrap().queue.remove(res);
            if stolen {
                self.process_resource(res);
                continue;
            }

            if self.on_main_thread() {
                let pending = {
                    let mut state = self.state.lock().unwrap();
                    state
                        .deferred_main_updates
                        .iter()
                        .position(|u| Arc::ptr_eq(&u.res, res))
                        .map(|idx| state.deferred_main_updates.remove(idx))
                };
                if let Some(update) = pending {
                    self.finalize_update(update);
                    continue;
                }
            }

            // in flight on another thread
            let state = self.state.lock().unwrap();
            if !res.state().is_settled() {
                let _ = self
                    .load_signal
                    .wait_timeout(state, Duration::from_millis(10))
                    .unwrap();
            }
        }
    }

    // -------------------------------------------------------------------
    // acquire

    /// Blocking acquire; see
    /// [`begin_acquire_with`](Self::begin_acquire_with).
    pub fn begin_acquire<K: ResourceKind>(&self, handle: &ResHandle<K>) -> AcquireGuard<K> {
        self.begin_acquire_with(handle, AcquireMode::BlockTillLoaded, None)
    }

    /// Acquires content for reading. `fallback` is the call-site
    /// fallback, consulted after the instance-level one and before the
    /// type-level one.
    ///
    /// Panics if the target ends up missing and its type has no
    /// missing-fallback.
    ///
    /// Blocking acquires of `MainThread`-affine types from other threads
    /// complete only while the main context keeps pumping
    /// `per_frame_update`.
    pub fn begin_acquire_with<K: ResourceKind>(
        &self,
        handle: &ResHandle<K>,
        mode: AcquireMode,
        fallback: Option<&ResHandle<K>>,
    ) -> AcquireGuard<K> {
        let res = handle.resource();
        self.check_nested_acquire(res);

        let mode = match mode {
            AcquireMode::AllowLoadingFallback
                if self.force_no_fallback.load(Ordering::SeqCst) > 0 =>
            {
                AcquireMode::BlockTillLoaded
            }
            mode => mode,
        };

        if res.state() == ResourceState::Loaded {
            if let Some(content) = res.content() {
                return self.make_guard(res, content, AcquireKind::Final);
            }
        }

        if mode == AcquireMode::AllowLoadingFallback {
            self.internal_preload(res, false);

            if res.state() != ResourceState::LoadedResourceMissing {
                if let Some(guard) = self.fallback_guard(res, fallback) {
                    return guard;
                }
                // no fallback anywhere: block after all
            }
        }

        // blocking path; the loop covers a concurrent reload unloading
        // content between the state check and the content read
        loop {
            match res.state() {
                ResourceState::Loaded => {
                    if let Some(content) = res.content() {
                        return self.make_guard(res, content, AcquireKind::Final);
                    }
                }
                ResourceState::LoadedResourceMissing => return self.missing_guard(res),
                _ => {}
            }

            if self.shutdown.load(Ordering::SeqCst) {
                return self.missing_guard(res);
            }

            self.internal_preload(res, true);
            self.ensure_loaded(res);
        }
    }

    /// Releases an acquire; equivalent to dropping the guard.
    pub fn end_acquire<K: ResourceKind>(&self, guard: AcquireGuard<K>) {
        drop(guard);
    }

    fn fallback_guard<K: ResourceKind>(
        &self,
        res: &Arc<Resource>,
        call_site: Option<&ResHandle<K>>,
    ) -> Option<AcquireGuard<K>> {
        let instance = res.loading_fallback.lock().unwrap().clone();
        if let Some(content) = loaded_content(instance.as_ref().map(UntypedHandle::resource)) {
            return Some(self.make_guard(res, content, AcquireKind::LoadingFallback));
        }

        if let Some(content) = loaded_content(call_site.map(ResHandle::resource)) {
            return Some(self.make_guard(res, content, AcquireKind::LoadingFallback));
        }

        let typed = {
            let state = self.state.lock().unwrap();
            state.registry.info(res.type_id()).loading_fallback.clone()
        };
        if let Some(content) = loaded_content(typed.as_ref().map(UntypedHandle::resource)) {
            return Some(self.make_guard(res, content, AcquireKind::LoadingFallback));
        }

        None
    }

    fn missing_guard<K: ResourceKind>(&self, res: &Arc<Resource>) -> AcquireGuard<K> {
        let fallback = {
            let state = self.state.lock().unwrap();
            state.registry.info(res.type_id()).missing_fallback.clone()
        };

        if let Some(content) = loaded_content(fallback.as_ref().map(UntypedHandle::resource)) {
            return self.make_guard(res, content, AcquireKind::MissingFallback);
        }

        error!(
            "resource '{}' ({:?}) is missing and no missing-fallback is set",
            res.id(),
            res.type_id()
        );
        panic!(
            "resource '{}' could not be loaded and its type has no missing fallback",
            res.id()
        );
    }

    fn make_guard<K: ResourceKind>(
        &self,
        res: &Arc<Resource>,
        content: ErasedValue,
        kind: AcquireKind,
    ) -> AcquireGuard<K> {
        res.touch(self.now_us());
        res.lock_count.fetch_add(1, Ordering::SeqCst);

        let value = match content.downcast::<K::Value>() {
            Ok(value) => value,
            Err(_) => panic!("content type mismatch acquiring resource '{}'", res.id()),
        };

        AcquireGuard {
            value,
            res: res.clone(),
            kind,
        }
    }

    fn check_nested_acquire(&self, res: &Arc<Resource>) {
        UPDATING.with(|stack| {
            let stack = stack.borrow();

            // the whole finalize chain, not just the innermost frame: a
            // transitive cycle back to any updating resource would wait
            // on itself forever
            assert!(
                !stack.contains(&identity(res)),
                "resource '{}' acquired during its own finalize",
                res.id()
            );

            #[cfg(debug_assertions)]
            {
                if let Some(&(type_id, _)) = stack.last() {
                    let mut state = self.state.lock().unwrap();
                    let allowed = state
                        .registry
                        .is_nested_acquire_allowed(type_id, res.type_id());
                    debug_assert!(
                        allowed,
                        "acquiring '{}' ({:?}) is not whitelisted while finalizing a resource of {:?}",
                        res.id(),
                        res.type_id(),
                        type_id
                    );
                }
            }
        });
    }

    // -------------------------------------------------------------------
    // reload

    /// Drops the resource's content and, when it is referenced and was
    /// acquired recently, queues it for loading again. Returns whether a
    /// reload actually happened.
    pub fn reload_resource(&self, handle: &UntypedHandle, force: bool) -> bool {
        self.reload_resource_inner(handle.resource(), force)
    }

    pub(crate) fn reload_resource_inner(&self, res: &Arc<Resource>, force: bool) -> bool {
        if res.has_flag(flags::CREATED) || !res.has_flag(flags::RELOADABLE) {
            return false;
        }
        if !force && res.has_flag(flags::PREVENT_FILE_RELOAD) {
            return false;
        }
        if res.has_flag(flags::QUEUED_FOR_LOADING)
            || res.state() == ResourceState::ContentUpdating
        {
            return false;
        }

        if !force {
            let loader = {
                let mut state = self.state.lock().unwrap();
                self.pick_loader(&mut state, res, false)
            };
            match loader {
                Some(loader) => {
                    if !loader.is_outdated(res.id()) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        let register = {
            let state = self.state.lock().unwrap();
            state.registry.info(res.type_id()).register.clone()
        };

        // flip the state before dropping content so blocking acquirers
        // re-queue instead of observing loaded-but-empty
        res.set_state(ResourceState::Unloaded);

        let mut events = Vec::new();
        if let Some(value) = res.take_content() {
            events.push(ResourceEvent::of(ResourceEventKind::ContentUnloading, res));
            if let Some(register) = &register {
                register.detach(res.id(), &value);
            }
        }
        self.events.emit_resource_batch(events);

        debug!("reloading resource '{}'", res.id());

        let recent =
            self.now_us().saturating_sub(res.last_acquire()) < RELOAD_RECENCY_US;
        if res.refcount() > 0 && recent {
            self.internal_preload(res, false);
        }

        true
    }

    /// Reloads every resource of type `K`; returns how many reloaded.
    pub fn reload_resources_of_type<K: ResourceKind>(&self, force: bool) -> Result<usize> {
        let targets = {
            let state = self.state.lock().unwrap();
            let type_id = state.kind_id::<K>()?;
            state
                .tables
                .get(&type_id)
                .map(|t| t.values().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        };

        let mut count = 0;
        for res in &targets {
            if self.reload_resource_inner(res, force) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Reloads every resource of every type; returns how many reloaded.
    pub fn reload_all(&self, force: bool) -> usize {
        self.events.emit_manager(&ManagerEvent::ReloadAllResources);

        let targets: Vec<_> = {
            let state = self.state.lock().unwrap();
            state
                .tables
                .values()
                .flat_map(|t| t.values().cloned())
                .collect()
        };

        let mut count = 0;
        for res in &targets {
            if self.reload_resource_inner(res, force) {
                count += 1;
            }
        }

        info!("reloaded {} of {} resources", count, targets.len());
        count
    }

    /// Installs a one-shot loader for this resource and reloads it; the
    /// loader is consumed by that load and regular file reloads stay
    /// blocked until [`restore`](Self::restore).
    pub fn update_with_custom_loader(
        &self,
        handle: &UntypedHandle,
        loader: Arc<dyn ResourceTypeLoader>,
    ) {
        let res = handle.resource();
        {
            let mut state = self.state.lock().unwrap();
            state.custom_loaders.insert(identity(res), loader);
        }
        res.add_flag(flags::HAS_CUSTOM_LOADER | flags::PREVENT_FILE_RELOAD);
        self.reload_resource_inner(res, true);
    }

    /// Removes any custom loader and reloads the resource from its
    /// regular source.
    pub fn restore(&self, handle: &UntypedHandle) -> bool {
        let res = handle.resource();
        {
            let mut state = self.state.lock().unwrap();
            state.custom_loaders.remove(&identity(res));
        }
        res.remove_flag(flags::HAS_CUSTOM_LOADER | flags::PREVENT_FILE_RELOAD);
        self.reload_resource_inner(res, true)
    }

    /// Shutdown path: empties the queue and force-clears the queued flag
    /// everywhere, dropping parsed intermediates that never finalized.
    pub(crate) fn cancel_all_loads(&self) {
        let mut state = self.state.lock().unwrap();

        for entry in state.queue.drain_all() {
            entry.res.remove_flag(flags::QUEUED_FOR_LOADING);
            if entry.res.state() == ResourceState::QueuedForLoading {
                entry.res.set_state(ResourceState::Unloaded);
            }
        }

        for update in ::std::mem::replace(&mut state.deferred_main_updates, Vec::new()) {
            update.res.remove_flag(flags::QUEUED_FOR_LOADING);
            if !update.res.state().is_settled() {
                update.res.set_state(ResourceState::Unloaded);
            }
        }

        for table in state.tables.values() {
            for res in table.values() {
                if res.has_flag(flags::QUEUED_FOR_LOADING) {
                    res.remove_flag(flags::QUEUED_FOR_LOADING);
                    if res.state() == ResourceState::QueuedForLoading {
                        res.set_state(ResourceState::Unloaded);
                    }
                }
            }
        }

        drop(state);
        self.load_signal.notify_all();
    }
}

fn loaded_content(res: Option<&Arc<Resource>>) -> Option<ErasedValue> {
    let res = res?;
    if res.state() == ResourceState::Loaded {
        res.content()
    } else {
        None
    }
}
