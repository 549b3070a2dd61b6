//! NApp system for the Kyco controller.
//!
//! NApps live in two root directories, one for core NApps and one for
//! ordinary NApps. Each immediate subdirectory is a NApp named after the
//! directory and holding a `napp.toml` entry file that selects either a
//! catalog factory or a shared library exporting a descriptor.
//!
//! The [`NAppManager`] resolves the entry, instantiates the NApp with the
//! producers it is entitled to, merges its listeners into the shared
//! registry and removes them again on unload.

pub mod builtin;
pub mod catalog;
pub mod loader;
pub mod manager;
pub mod manifest;

pub use catalog::NAppCatalog;
pub use loader::{load_library, LibraryEntry};
pub use manager::{NAppInfo, NAppLifecycleEvent, NAppManager};
pub use manifest::{EntrySource, NAppManifest, MANIFEST_FILE};
