//! The per-type metadata the manager consults: registered kinds and their
//! `Register` implementations, type loaders, override redirections, and
//! the nested-acquire dependency closure.
//!
//! Rust has no runtime reflection, so the type hierarchy lives here as an
//! explicit registration table: every resource kind is registered once and
//! receives a `ResourceTypeId`; parent links model the derivation chains
//! that overrides and derived-type expansion walk. Overrides can only
//! redirect to strictly-derived types and a parent must be registered
//! before its children, so override chains cannot cycle by construction.

use std::any::{Any, TypeId};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::errors::Result;
use crate::utils::{FastHashMap, FastHashSet};

use super::handle::UntypedHandle;
use super::manager::ResourceManagerShared;
use super::resource::{ErasedValue, MemoryUsage, ResourcePriority};

/// Identifies a registered resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceTypeId(u32);

impl ResourceTypeId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        ResourceTypeId(raw)
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which threads the finalize step of a type may run on.
///
/// Types whose content touches thread-affine state (a graphics context,
/// usually) declare `MainThread`; their finalize work is deferred to the
/// host's `per_frame_update` pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAffinity {
    AnyThread,
    MainThread,
}

/// Static registration data for one resource type.
pub struct TypeDescriptor {
    pub name: &'static str,
    /// The base type this one derives from, if any. Must already be
    /// registered.
    pub parent: Option<ResourceTypeId>,
    pub default_priority: ResourcePriority,
    /// Whether budgeted background sweeps may consider this type.
    pub incremental_unload: bool,
    pub affinity: UpdateAffinity,
}

impl Default for TypeDescriptor {
    fn default() -> Self {
        TypeDescriptor {
            name: "<unnamed>",
            parent: None,
            default_priority: ResourcePriority::Medium,
            incremental_unload: true,
            affinity: UpdateAffinity::AnyThread,
        }
    }
}

/// A marker for a resource kind and the content type its finalize step
/// produces. Abstract bases implement only this; concrete kinds also
/// implement [`Register`].
///
/// A derived kind substituted for a base by override resolution must
/// produce the same `Value` as that base; the typed acquire path asserts
/// this when recovering the concrete content type.
pub trait ResourceKind: Send + Sync + 'static {
    type Value: Send + Sync + 'static;
}

/// The per-type content pipeline: `load` parses raw bytes into an
/// intermediate on a data-load worker, `attach` finalizes it into the
/// live content (honoring the type's [`UpdateAffinity`]), `detach` is the
/// unload hook.
///
/// `attach` may acquire resources of other types through `env`, but only
/// types whitelisted via `allow_nested_acquire`; anything else is a
/// programming error caught by debug assertions.
pub trait Register: ResourceKind {
    type Intermediate: Send + 'static;

    /// Parses raw bytes into an intermediate representation. Runs on a
    /// data-load worker; must not require thread-affine state.
    fn load(&self, id: &str, bytes: &[u8]) -> Result<Self::Intermediate>;

    /// Finalizes an intermediate into the live content.
    fn attach(
        &self,
        env: &ResourceManagerShared,
        id: &str,
        item: Self::Intermediate,
    ) -> Result<Self::Value>;

    /// Called when content is unloaded; default does nothing.
    fn detach(&self, _id: &str, _value: &Self::Value) {}

    /// Reports the memory footprint of finalized content.
    fn memory_usage(&self, _value: &Self::Value) -> MemoryUsage {
        MemoryUsage::default()
    }
}

/// The pluggable strategy that turns a resource id into raw bytes for one
/// resource type. Runs on data-load workers; implementations must not
/// require thread-affine state.
pub trait ResourceTypeLoader: Send + Sync + 'static {
    fn load(&self, id: &str) -> Result<Vec<u8>>;

    /// Whether the backing content changed since it was last loaded; used
    /// by non-forced reloads. Defaults to always outdated.
    fn is_outdated(&self, _id: &str) -> bool {
        true
    }
}

/// Resolves file-system-level redirections of resource ids before
/// override deciders see them.
pub trait PathResolver: Send + Sync + 'static {
    fn resolve_redirection(&self, id: &str) -> String;
}

/// The default resolver; ids resolve to themselves.
pub struct IdentityResolver;

impl PathResolver for IdentityResolver {
    fn resolve_redirection(&self, id: &str) -> String {
        id.to_string()
    }
}

/// Object-safe access to a `Register`, with the concrete types erased at
/// the table boundary.
pub(crate) trait ErasedRegister: Send + Sync {
    fn parse(&self, id: &str, bytes: &[u8]) -> Result<Box<dyn Any + Send>>;

    fn attach(
        &self,
        env: &ResourceManagerShared,
        id: &str,
        item: Box<dyn Any + Send>,
    ) -> Result<(ErasedValue, MemoryUsage)>;

    fn detach(&self, id: &str, value: &ErasedValue);
}

struct TypedRegister<R: Register>(R);

impl<R: Register> ErasedRegister for TypedRegister<R> {
    fn parse(&self, id: &str, bytes: &[u8]) -> Result<Box<dyn Any + Send>> {
        let item = self.0.load(id, bytes)?;
        Ok(Box::new(item))
    }

    fn attach(
        &self,
        env: &ResourceManagerShared,
        id: &str,
        item: Box<dyn Any + Send>,
    ) -> Result<(ErasedValue, MemoryUsage)> {
        let item = match item.downcast::<R::Intermediate>() {
            Ok(item) => *item,
            Err(_) => panic!("intermediate payload type mismatch for resource '{}'", id),
        };

        let value = self.0.attach(env, id, item)?;
        let usage = self.0.memory_usage(&value);
        Ok((Arc::new(value), usage))
    }

    fn detach(&self, id: &str, value: &ErasedValue) {
        if let Some(value) = value.downcast_ref::<R::Value>() {
            self.0.detach(id, value);
        }
    }
}

type Decider = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
struct OverrideEntry {
    derived: ResourceTypeId,
    decider: Decider,
}

pub(crate) struct TypeInfo {
    pub(crate) name: &'static str,
    parent: Option<ResourceTypeId>,
    children: Vec<ResourceTypeId>,
    pub(crate) default_priority: ResourcePriority,
    pub(crate) incremental_unload: bool,
    pub(crate) affinity: UpdateAffinity,

    pub(crate) register: Option<Arc<dyn ErasedRegister>>,
    pub(crate) loader: Option<Arc<dyn ResourceTypeLoader>>,

    pub(crate) loading_fallback: Option<UntypedHandle>,
    pub(crate) missing_fallback: Option<UntypedHandle>,

    overrides: Vec<OverrideEntry>,

    nested_types: SmallVec<[ResourceTypeId; 4]>,
    nested_closure: Option<Vec<ResourceTypeId>>,
}

impl TypeInfo {
    fn new(desc: TypeDescriptor, register: Option<Arc<dyn ErasedRegister>>) -> Self {
        TypeInfo {
            name: desc.name,
            parent: desc.parent,
            children: Vec::new(),
            default_priority: desc.default_priority,
            incremental_unload: desc.incremental_unload,
            affinity: desc.affinity,
            register,
            loader: None,
            loading_fallback: None,
            missing_fallback: None,
            overrides: Vec::new(),
            nested_types: SmallVec::new(),
            nested_closure: None,
        }
    }

    #[inline]
    pub(crate) fn is_abstract(&self) -> bool {
        self.register.is_none()
    }
}

/// The registration table mapping resource kinds to their metadata.
pub(crate) struct TypeRegistry {
    types: Vec<TypeInfo>,
    by_rust_type: FastHashMap<TypeId, ResourceTypeId>,
}

impl TypeRegistry {
    pub(crate) fn new() -> Self {
        TypeRegistry {
            types: Vec::new(),
            by_rust_type: FastHashMap::default(),
        }
    }

    fn insert<K: ResourceKind>(
        &mut self,
        desc: TypeDescriptor,
        register: Option<Arc<dyn ErasedRegister>>,
    ) -> Result<ResourceTypeId> {
        if let Some(parent) = desc.parent {
            ensure!(
                parent.index() < self.types.len(),
                "parent type {:?} of '{}' is not registered",
                parent,
                desc.name
            );
        }

        ensure!(
            !self.by_rust_type.contains_key(&TypeId::of::<K>()),
            "resource kind '{}' is already registered",
            desc.name
        );

        let id = ResourceTypeId(self.types.len() as u32);
        if let Some(parent) = desc.parent {
            self.types[parent.index()].children.push(id);
        }

        self.types.push(TypeInfo::new(desc, register));
        self.by_rust_type.insert(TypeId::of::<K>(), id);
        Ok(id)
    }

    pub(crate) fn register<R: Register>(
        &mut self,
        desc: TypeDescriptor,
        register: R,
    ) -> Result<ResourceTypeId> {
        self.insert::<R>(desc, Some(Arc::new(TypedRegister(register))))
    }

    pub(crate) fn register_abstract<K: ResourceKind>(
        &mut self,
        desc: TypeDescriptor,
    ) -> Result<ResourceTypeId> {
        self.insert::<K>(desc, None)
    }

    pub(crate) fn id_of<K: ResourceKind>(&self) -> Option<ResourceTypeId> {
        self.by_rust_type.get(&TypeId::of::<K>()).cloned()
    }

    #[inline]
    pub(crate) fn info(&self, id: ResourceTypeId) -> &TypeInfo {
        &self.types[id.index()]
    }

    #[inline]
    pub(crate) fn info_mut(&mut self, id: ResourceTypeId) -> &mut TypeInfo {
        &mut self.types[id.index()]
    }

    /// True if `id` equals `base` or transitively derives from it.
    pub(crate) fn is_derived_from(&self, id: ResourceTypeId, base: ResourceTypeId) -> bool {
        let mut cursor = Some(id);
        while let Some(t) = cursor {
            if t == base {
                return true;
            }
            cursor = self.types[t.index()].parent;
        }
        false
    }

    /// `id` plus every type transitively derived from it.
    fn derived_set(&self, id: ResourceTypeId, out: &mut Vec<ResourceTypeId>) {
        out.push(id);
        for &child in &self.types[id.index()].children {
            self.derived_set(child, out);
        }
    }

    /// Registers `decider` as an override redirecting every ancestor of
    /// `derived` to `derived` when the decider matches the path-resolved
    /// resource id.
    pub(crate) fn register_override(
        &mut self,
        derived: ResourceTypeId,
        decider: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    ) {
        let entry = OverrideEntry { derived, decider };

        let mut cursor = self.types[derived.index()].parent;
        while let Some(parent) = cursor {
            self.types[parent.index()].overrides.push(entry.clone());
            cursor = self.types[parent.index()].parent;
        }
    }

    /// Walks the override chain for `type_id` against the path-resolved
    /// id; the first matching decider redirects and resolution continues
    /// from the redirected type.
    pub(crate) fn resolve_override(
        &self,
        mut type_id: ResourceTypeId,
        resolved_id: &str,
    ) -> ResourceTypeId {
        loop {
            let mut redirected = false;

            for entry in &self.types[type_id.index()].overrides {
                if (entry.decider)(resolved_id) {
                    type_id = entry.derived;
                    redirected = true;
                    break;
                }
            }

            if !redirected {
                return type_id;
            }
        }
    }

    /// Whitelists `wants` for synchronous acquisition while a resource of
    /// type `being_updated` runs its finalize step. Must happen before the
    /// first nested-acquire query against `being_updated`.
    pub(crate) fn add_nested_type(
        &mut self,
        being_updated: ResourceTypeId,
        wants: ResourceTypeId,
    ) {
        let info = &mut self.types[being_updated.index()];
        assert!(
            info.nested_closure.is_none(),
            "nested-acquire whitelist of '{}' was queried already; register whitelists at startup",
            info.name
        );

        if !info.nested_types.contains(&wants) {
            info.nested_types.push(wants);
        }
    }

    /// Whether a resource of type `being_updated` may acquire a resource
    /// of type `wants` during its finalize step. The transitive closure is
    /// computed on first query and memoized.
    pub(crate) fn is_nested_acquire_allowed(
        &mut self,
        being_updated: ResourceTypeId,
        wants: ResourceTypeId,
    ) -> bool {
        if self.types[being_updated.index()].nested_closure.is_none() {
            let closure = self.compute_nested_closure(being_updated);
            self.types[being_updated.index()].nested_closure = Some(closure);
        }

        self.types[being_updated.index()]
            .nested_closure
            .as_ref()
            .unwrap()
            .binary_search(&wants)
            .is_ok()
    }

    /// Takes every type-level fallback handle out of the registry, so the
    /// handles they hold stop counting as references. Teardown only.
    pub(crate) fn take_fallbacks(&mut self) -> Vec<UntypedHandle> {
        let mut out = Vec::new();
        for info in &mut self.types {
            out.extend(info.loading_fallback.take());
            out.extend(info.missing_fallback.take());
        }
        out
    }

    /// Reachability over the type-level whitelist graph: direct nested
    /// types, expanded to their derived sets, then each visited type's own
    /// whitelist until fixpoint. Cycles among whitelists are fine; the
    /// visited set keeps the expansion from recursing.
    fn compute_nested_closure(&self, being_updated: ResourceTypeId) -> Vec<ResourceTypeId> {
        let mut todo = Vec::new();
        let mut visited = FastHashSet::default();
        let mut deps = Vec::new();

        for &nested in &self.types[being_updated.index()].nested_types {
            self.derived_set(nested, &mut todo);
        }

        while let Some(t) = todo.pop() {
            if !visited.insert(t) {
                continue;
            }

            deps.push(t);

            for &nested in &self.types[t.index()].nested_types {
                if !visited.contains(&nested) {
                    self.derived_set(nested, &mut todo);
                }
            }
        }

        deps.sort();
        deps
    }
}
