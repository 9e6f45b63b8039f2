//! Observer hub for resource and manager lifecycle events.
//!
//! Listeners run on whatever thread triggered the event. Events are
//! buffered while the manager lock is held and delivered only after it
//! drops, and the listener list is detached from the hub for the duration
//! of a delivery, so a listener may call back into the manager and the
//! hub freely: it can load, subscribe, or unsubscribe itself from inside
//! the callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::registry::ResourceTypeId;
use super::resource::{Resource, ResourceState};

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEventKind {
    /// A resource entry was allocated.
    Created,
    /// A resource entry was removed from the manager.
    Deleted,
    /// Content finished loading, or loading came to a failed end.
    ContentUpdated,
    /// Content is about to be unloaded.
    ContentUnloading,
    /// Existence broadcast for already-present resources.
    Exists,
}

#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub kind: ResourceEventKind,
    pub type_id: ResourceTypeId,
    pub id: String,
    pub state: ResourceState,
}

impl ResourceEvent {
    pub(crate) fn of(kind: ResourceEventKind, res: &Resource) -> Self {
        ResourceEvent {
            kind,
            type_id: res.type_id(),
            id: res.id().to_string(),
            state: res.state(),
        }
    }
}

/// Manager-wide lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    ManagerShuttingDown,
    ReloadAllResources,
}

/// Identifies a subscription; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type ResourceListener = Box<dyn FnMut(&ResourceEvent) + Send>;
type ManagerListener = Box<dyn FnMut(&ManagerEvent) + Send>;

struct ListenerSet<L> {
    listeners: Vec<(ListenerId, L)>,
    /// Ids unsubscribed while their listener was detached for delivery;
    /// applied when the batch is merged back.
    retired: Vec<ListenerId>,
}

impl<L> ListenerSet<L> {
    fn new() -> Self {
        ListenerSet {
            listeners: Vec::new(),
            retired: Vec::new(),
        }
    }

    fn remove(&mut self, id: ListenerId) {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        if self.listeners.len() == before {
            self.retired.push(id);
        }
    }
}

/// Invokes `deliver` on every listener with the set detached from the
/// hub, so callbacks can re-enter it.
fn emit<L, F>(set: &Mutex<ListenerSet<L>>, mut deliver: F)
where
    F: FnMut(&mut L),
{
    let mut taken = ::std::mem::replace(&mut set.lock().unwrap().listeners, Vec::new());
    for (_, listener) in taken.iter_mut() {
        deliver(listener);
    }

    let mut guard = set.lock().unwrap();
    taken.retain(|(id, _)| {
        match guard.retired.iter().position(|r| r == id) {
            Some(pos) => {
                guard.retired.swap_remove(pos);
                false
            }
            None => true,
        }
    });

    // subscriptions made during delivery line up behind the batch
    let fresh = ::std::mem::replace(&mut guard.listeners, taken);
    guard.listeners.extend(fresh);
}

pub(crate) struct EventHub {
    resource_listeners: Mutex<ListenerSet<ResourceListener>>,
    manager_listeners: Mutex<ListenerSet<ManagerListener>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        EventHub {
            resource_listeners: Mutex::new(ListenerSet::new()),
            manager_listeners: Mutex::new(ListenerSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn fresh_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe_resource(&self, listener: ResourceListener) -> ListenerId {
        let id = self.fresh_id();
        self.resource_listeners
            .lock()
            .unwrap()
            .listeners
            .push((id, listener));
        id
    }

    pub fn unsubscribe_resource(&self, id: ListenerId) {
        self.resource_listeners.lock().unwrap().remove(id);
    }

    pub fn subscribe_manager(&self, listener: ManagerListener) -> ListenerId {
        let id = self.fresh_id();
        self.manager_listeners
            .lock()
            .unwrap()
            .listeners
            .push((id, listener));
        id
    }

    pub fn unsubscribe_manager(&self, id: ListenerId) {
        self.manager_listeners.lock().unwrap().remove(id);
    }

    pub fn emit_resource(&self, event: &ResourceEvent) {
        emit(&self.resource_listeners, |listener| listener(event));
    }

    /// Delivers a batch collected while the manager lock was held.
    pub fn emit_resource_batch(&self, events: Vec<ResourceEvent>) {
        if events.is_empty() {
            return;
        }

        emit(&self.resource_listeners, |listener| {
            for event in &events {
                listener(event);
            }
        });
    }

    pub fn emit_manager(&self, event: &ManagerEvent) {
        emit(&self.manager_listeners, |listener| listener(event));
    }
}

// keep the hub out of accidental debug dumps of the manager
impl ::std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "EventHub")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::res::resource::ResourcePriority;
    use std::sync::Arc;

    #[test]
    fn subscribe_emit_unsubscribe() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let id = hub.subscribe_resource(Box::new(move |e| {
            sink.lock().unwrap().push(e.kind);
        }));

        let res = Resource::new(
            ResourceTypeId::from_raw(0),
            "foo".into(),
            ResourcePriority::Medium,
            0,
        );

        hub.emit_resource(&ResourceEvent::of(ResourceEventKind::Created, &res));
        hub.emit_resource_batch(vec![
            ResourceEvent::of(ResourceEventKind::ContentUpdated, &res),
            ResourceEvent::of(ResourceEventKind::Deleted, &res),
        ]);

        hub.unsubscribe_resource(id);
        hub.emit_resource(&ResourceEvent::of(ResourceEventKind::Exists, &res));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ResourceEventKind::Created,
                ResourceEventKind::ContentUpdated,
                ResourceEventKind::Deleted,
            ]
        );
    }

    #[test]
    fn listeners_may_reenter_the_hub() {
        let hub = Arc::new(EventHub::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let res = Resource::new(
            ResourceTypeId::from_raw(0),
            "foo".into(),
            ResourcePriority::Medium,
            0,
        );

        // on the first event: emit a nested event, subscribe a second
        // listener, then unsubscribe itself
        let my_id = Arc::new(Mutex::new(None));
        let slot = my_id.clone();
        let inner_hub = hub.clone();
        let inner_seen = seen.clone();
        let id = hub.subscribe_resource(Box::new(move |e| {
            inner_seen
                .lock()
                .unwrap()
                .push(("first".to_string(), e.kind));

            if e.kind == ResourceEventKind::Created {
                inner_hub.emit_resource(&ResourceEvent {
                    kind: ResourceEventKind::Exists,
                    type_id: e.type_id,
                    id: e.id.clone(),
                    state: e.state,
                });

                let sink = inner_seen.clone();
                inner_hub.subscribe_resource(Box::new(move |e| {
                    sink.lock().unwrap().push(("second".to_string(), e.kind));
                }));

                inner_hub.unsubscribe_resource(slot.lock().unwrap().unwrap());
            }
        }));
        *my_id.lock().unwrap() = Some(id);

        hub.emit_resource(&ResourceEvent::of(ResourceEventKind::Created, &res));
        hub.emit_resource(&ResourceEvent::of(ResourceEventKind::Deleted, &res));

        // the first listener saw only the event that triggered it: the
        // nested emit skipped the detached batch, and the unsubscribe
        // took effect for everything after. The listener subscribed
        // during delivery receives later events.
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("first".to_string(), ResourceEventKind::Created),
                ("second".to_string(), ResourceEventKind::Deleted),
            ]
        );
    }
}
