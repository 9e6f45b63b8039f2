//! Incremental eviction of unreferenced resources.
//!
//! Two entry points: `free_all_unused` frees everything unreferenced in
//! whole-table passes until no further progress, and `free_unused` is the
//! budgeted per-frame sweep, resumable across calls through a
//! `(type, hashed id)` cursor with strictly-after semantics. The ordered
//! tables make the cursor survive insertions and removals in between.
//!
//! A resource that cannot be freed right now (its queue entry was already
//! taken by a worker, or its type unloads on the main context only) is
//! silently deferred; nothing in the sweep ever blocks.

use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::events::{ResourceEvent, ResourceEventKind};
use super::manager::{ManagerState, ResourceManagerShared};
use super::registry::{ErasedRegister, ResourceTypeId, UpdateAffinity};
use super::resource::{flags, ErasedValue, Resource, ResourceState};

/// Detach work collected under the lock, executed after it drops.
type Detach = (Arc<dyn ErasedRegister>, String, ErasedValue);

enum Dealloc {
    Freed,
    Deferred,
}

#[inline]
fn duration_us(d: Duration) -> u64 {
    d.as_secs() * 1_000_000 + u64::from(d.subsec_micros())
}

impl ResourceManagerShared {
    /// Frees every unreferenced resource. Loops whole-table passes until
    /// a pass frees nothing, helping the load pipeline along when freeing
    /// is blocked by in-flight work. Returns how many were freed.
    pub fn free_all_unused(&self) -> usize {
        let mut total = 0;
        let mut help_rounds = 0;

        loop {
            let mut freed = 0;
            let mut deferred = false;
            let mut events = Vec::new();
            let mut detaches = Vec::new();

            {
                let mut state = self.state.lock().unwrap();
                let candidates: Vec<Arc<Resource>> = state
                    .tables
                    .values()
                    .flat_map(|t| t.values().cloned())
                    .collect();

                for res in candidates {
                    if res.refcount() != 0 {
                        continue;
                    }

                    match self.deallocate_locked(&mut state, &res, &mut events, &mut detaches)
                    {
                        Dealloc::Freed => freed += 1,
                        Dealloc::Deferred => deferred = true,
                    }
                }
            }

            run_detaches(detaches);
            self.events.emit_resource_batch(events);

            total += freed;
            if freed > 0 {
                continue;
            }

            if deferred && help_rounds < 16 {
                help_rounds += 1;
                let entry = self.state.lock().unwrap().queue.pop_front();
                match entry {
                    Some(entry) => self.process_resource(&entry.res),
                    None => thread::yield_now(),
                }
                continue;
            }

            break;
        }

        if total > 0 {
            debug!("freed {} unused resources", total);
        }
        total
    }

    /// The budgeted sweep: walks at most `budget` worth of table entries
    /// starting strictly after the persisted cursor, evicting entries that
    /// are unreferenced and untouched for longer than `age_threshold`.
    /// Types with incremental unload disabled are skipped wholesale.
    /// Returns how many were freed.
    pub fn free_unused(&self, budget: Duration, age_threshold: Duration) -> usize {
        let start = Instant::now();
        let threshold_us = duration_us(age_threshold);

        let mut freed = 0;
        let mut events = Vec::new();
        let mut detaches = Vec::new();

        loop {
            let now = self.now_us();
            let mut state = self.state.lock().unwrap();

            let next = next_entry(&state, state.sweep_cursor);
            let (type_id, hash, res) = match next {
                Some(entry) => entry,
                None => {
                    // full wrap; the next call starts over
                    state.sweep_cursor = None;
                    break;
                }
            };

            if !state.registry.info(type_id).incremental_unload {
                // fast-forward past this whole type
                state.sweep_cursor = Some((type_id, u64::MAX));
            } else {
                state.sweep_cursor = Some((type_id, hash));

                let idle = now.saturating_sub(res.last_acquire());
                if res.refcount() == 0 && idle > threshold_us {
                    if let Dealloc::Freed =
                        self.deallocate_locked(&mut state, &res, &mut events, &mut detaches)
                    {
                        freed += 1;
                    }
                }
            }

            drop(state);
            if start.elapsed() >= budget {
                break;
            }
        }

        run_detaches(detaches);
        self.events.emit_resource_batch(events);
        freed
    }

    /// Runs a deallocation that an earlier sweep deferred to the main
    /// context.
    pub(crate) fn deallocate_deferred(&self, res: &Arc<Resource>) {
        let mut events = Vec::new();
        let mut detaches = Vec::new();

        {
            let mut state = self.state.lock().unwrap();
            // a handle may have appeared in the meantime
            if res.refcount() != 0 {
                return;
            }
            let _ = self.deallocate_locked(&mut state, res, &mut events, &mut detaches);
        }

        run_detaches(detaches);
        self.events.emit_resource_batch(events);
    }

    /// Final teardown: frees every resource regardless of reference
    /// count, logging the ones still referenced.
    pub(crate) fn force_free_all(&self) {
        let mut events = Vec::new();
        let mut detaches = Vec::new();

        {
            let mut state = self.state.lock().unwrap();
            let tables = ::std::mem::replace(&mut state.tables, Default::default());

            // fallback handles, type-level and instance-level, are the
            // manager's own references; drop them before deciding what
            // the host leaked
            drop(state.registry.take_fallbacks());
            for table in tables.values() {
                for res in table.values() {
                    res.loading_fallback.lock().unwrap().take();
                }
            }

            for (type_id, table) in tables {
                let info = state.registry.info(type_id);
                let name = info.name;
                let register = info.register.clone();

                for (_, res) in table {
                    if res.refcount() > 0 {
                        error!(
                            "leaked resource '{}' of type '{}' ({} live handles)",
                            res.id(),
                            name,
                            res.refcount()
                        );
                    }

                    if let Some(value) = res.take_content() {
                        events.push(ResourceEvent::of(ResourceEventKind::ContentUnloading, &res));
                        if let Some(register) = register.clone() {
                            detaches.push((register, res.id().to_string(), value));
                        }
                    }

                    res.set_state(ResourceState::Unloaded);
                    events.push(ResourceEvent::of(ResourceEventKind::Deleted, &res));
                }
            }

            state.sweep_cursor = None;
        }

        run_detaches(detaches);
        self.events.emit_resource_batch(events);
    }

    /// Removes one unreferenced resource from the manager. Detach work is
    /// collected into `detaches` for execution after the lock drops.
    fn deallocate_locked(
        &self,
        state: &mut ManagerState,
        res: &Arc<Resource>,
        events: &mut Vec<ResourceEvent>,
        detaches: &mut Vec<Detach>,
    ) -> Dealloc {
        debug_assert_eq!(res.refcount(), 0);

        // an open acquire guard outlives its last handle; never free
        // content somebody still reads
        if res.lock_count.load(Ordering::SeqCst) != 0 {
            return Dealloc::Deferred;
        }

        if res.has_flag(flags::QUEUED_FOR_LOADING) {
            if state.queue.remove(res) {
                res.remove_flag(flags::QUEUED_FOR_LOADING);
                res.set_state(ResourceState::Unloaded);
            } else {
                // a worker already took the entry; try again later
                return Dealloc::Deferred;
            }
        }

        if res.state() == ResourceState::ContentUpdating {
            return Dealloc::Deferred;
        }

        let info = state.registry.info(res.type_id());
        if info.affinity == UpdateAffinity::MainThread && !self.on_main_thread() {
            if !state
                .deferred_main_unloads
                .iter()
                .any(|r| Arc::ptr_eq(r, res))
            {
                state.deferred_main_unloads.push(res.clone());
            }
            return Dealloc::Deferred;
        }

        if let Some(value) = res.take_content() {
            events.push(ResourceEvent::of(ResourceEventKind::ContentUnloading, res));
            if let Some(register) = info.register.clone() {
                detaches.push((register, res.id().to_string(), value));
            }
        }

        res.set_state(ResourceState::Unloaded);
        events.push(ResourceEvent::of(ResourceEventKind::Deleted, res));

        if let Some(table) = state.tables.get_mut(&res.type_id()) {
            table.remove(&res.id_hash().raw());
        }

        Dealloc::Freed
    }
}

fn run_detaches(detaches: Vec<Detach>) {
    for (register, id, value) in detaches {
        register.detach(&id, &value);
    }
}

/// The first table entry strictly after `cursor`, in `(type, hashed id)`
/// order.
fn next_entry(
    state: &ManagerState,
    cursor: Option<(ResourceTypeId, u64)>,
) -> Option<(ResourceTypeId, u64, Arc<Resource>)> {
    let (type_lower, cursor) = match cursor {
        Some((t, h)) => (Included(t), Some((t, h))),
        None => (Unbounded, None),
    };

    for (&type_id, table) in state.tables.range((type_lower, Unbounded)) {
        let hash_lower = match cursor {
            Some((t, h)) if t == type_id => Excluded(h),
            _ => Unbounded,
        };

        if let Some((&hash, res)) = table.range((hash_lower, Unbounded)).next() {
            return Some((type_id, hash, res.clone()));
        }
    }

    None
}
