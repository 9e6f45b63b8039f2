pub use crate::errors::{ResourceError, Result};
pub use crate::res::{
    AcquireGuard, AcquireKind, AcquireMode, ManagerEvent, MemoryUsage, Register,
    ResHandle, ResourceEvent, ResourceEventKind, ResourceKind, ResourceManager,
    ResourceManagerShared, ResourcePriority, ResourceState, ResourceTypeId,
    ResourceTypeLoader, TypeDescriptor, UntypedHandle, UpdateAffinity,
};
pub use crate::sched::{TaskScheduler, ThreadPool};
