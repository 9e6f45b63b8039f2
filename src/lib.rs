//! # Quarry
//!
//! Quarry is a runtime resource manager for game engines: creation on
//! demand, priority-ordered asynchronous loading, fallback substitution,
//! incremental background eviction, type-override redirection and safe
//! shutdown, behind typed handles.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use quarry::prelude::*;
//!
//! struct Text;
//!
//! impl ResourceKind for Text {
//!     type Value = String;
//! }
//!
//! impl Register for Text {
//!     type Intermediate = String;
//!
//!     fn load(&self, _id: &str, bytes: &[u8]) -> Result<String> {
//!         Ok(String::from_utf8_lossy(bytes).into_owned())
//!     }
//!
//!     fn attach(
//!         &self,
//!         _env: &ResourceManagerShared,
//!         _id: &str,
//!         item: String,
//!     ) -> Result<String> {
//!         Ok(item)
//!     }
//! }
//!
//! struct FsLoader;
//!
//! impl ResourceTypeLoader for FsLoader {
//!     fn load(&self, id: &str) -> Result<Vec<u8>> {
//!         Ok(::std::fs::read(id)?)
//!     }
//! }
//!
//! let manager = ResourceManager::new(Arc::new(ThreadPool::new(4)));
//! manager.register_type(
//!     TypeDescriptor { name: "Text", ..Default::default() },
//!     Text,
//! ).unwrap();
//! manager.register_type_loader::<Text>(Arc::new(FsLoader)).unwrap();
//!
//! let handle = manager.load::<Text>("hello.txt").unwrap();
//! let text = manager.begin_acquire(&handle);
//! println!("{}", *text);
//! ```

#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;

pub mod errors;
pub mod prelude;
pub mod res;
pub mod sched;
pub mod utils;
