use failure::Fail;

pub type Result<T> = ::std::result::Result<T, ::failure::Error>;

/// The error categories surfaced by the resource manager itself. Loaders
/// and registers report arbitrary `failure::Error`s; these are the
/// manager-level failures callers may want to match on.
#[derive(Debug, Fail)]
pub enum ResourceError {
    /// No resource type has been registered for the requested kind. The
    /// manager never substitutes silently.
    #[fail(display = "no resource type registered for this kind")]
    UnknownType,

    /// The resolved resource type is abstract and cannot be allocated.
    #[fail(display = "resource type '{}' is abstract and cannot be allocated", _0)]
    AbstractType(&'static str),

    /// Resource identifiers must not be empty.
    #[fail(display = "resource id must not be empty")]
    EmptyResourceId,

    /// A resource with this id already went through `create`.
    #[fail(display = "resource '{}' has already been created", _0)]
    AlreadyCreated(String),

    /// The manager has been shut down; no new work is accepted.
    #[fail(display = "resource manager has been shut down")]
    ShutDown,
}
