//! The runtime resource manager.
//!
//! Every loadable asset is owned by the manager for its entire lifetime:
//! entries are created on demand, loaded asynchronously in priority order,
//! substituted by fallbacks while loading or after a failed load, evicted
//! incrementally in the background, and torn down safely with work still
//! in flight.
//!
//! # Identity
//!
//! A resource is identified by its type and its id string; at most one
//! live instance exists per identity. Requests pass through named
//! redirection, file-system redirection and type-override resolution
//! before the table lookup, so distinct request spellings of the same
//! asset converge on one instance.
//!
//! # Loading
//!
//! Handles are cheap and inert; loading starts on the first acquire or
//! preload. Queued resources are ordered by a priority key combining the
//! priority class with time since last use, kept sorted amortizedly (one
//! bounded refresh-and-bubble step per frame). Data-load workers parse
//! content off the manager lock; the finalize step runs inline or on the
//! main context, depending on the type's update affinity.
//!
//! Acquires either block until real content is available (cooperatively,
//! by stealing the queue entry onto the calling thread) or substitute a
//! fallback, resolved instance first, then call-site, then type. A
//! resource whose load failed yields its type's missing-fallback, and
//! panics the acquire if there is none.
//!
//! # Eviction
//!
//! Dropping handles only makes a resource eligible; actual freeing
//! happens in explicit whole-table passes or in the budgeted, cursor-
//! resumable background sweep that `per_frame_update` can drive
//! automatically.

pub mod events;
pub mod handle;
pub mod loading;
pub mod manager;
pub mod registry;
pub mod resource;

mod queue;
mod sweep;

pub use self::events::{ListenerId, ManagerEvent, ResourceEvent, ResourceEventKind};
pub use self::handle::{ResHandle, UntypedHandle};
pub use self::loading::{AcquireGuard, AcquireKind, AcquireMode};
pub use self::manager::{ResourceManager, ResourceManagerShared};
pub use self::registry::{
    IdentityResolver, PathResolver, Register, ResourceKind, ResourceTypeId,
    ResourceTypeLoader, TypeDescriptor, UpdateAffinity,
};
pub use self::resource::{MemoryUsage, ResourcePriority, ResourceState};
