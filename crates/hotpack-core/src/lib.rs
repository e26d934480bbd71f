//! Hot-reloadable content package loader.
//!
//! This crate loads compiled content packages into the running process,
//! resolves their module and native dependencies across isolated load
//! contexts, negotiates third-party versions against a package store, and
//! unloads packages deterministically so they can be rebuilt and swapped.

pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod host;
pub mod manifest;
pub mod module;
pub mod native;
pub mod platform;
pub mod registry;
pub mod repository;
pub mod shadow;
pub mod version;
pub mod watcher;

pub use config::{FrameworkPolicy, HostConfig};
pub use context::{
    ContextEvent, ContextId, ContextListener, ContextState, LoadContext, Resolution,
    ResolutionSource,
};
pub use descriptor::{PackageDescriptor, PackageEvent, PackageListener, TypeDescriptor};
pub use error::{Error, Result};
pub use host::PackageHost;
pub use manifest::{ManifestInfo, PackageReference};
pub use module::{
    ExportedType, LibraryModuleLoader, LoadedModule, ModuleDependency, ModuleExports,
    ModuleLoader, ModuleNode, NativeHandle, NodeId, ScanOptions, SlotSchema,
};
pub use native::NativeLibraryResolver;
pub use registry::Registry;
pub use repository::{PackageRepositoryResolver, ResolvedPackage};
pub use shadow::ShadowCopyManager;
pub use watcher::PackageWatcher;

/// Re-exports commonly used types.
pub mod prelude {
    // Configuration
    pub use crate::config::{defaults, env_vars, HostConfig};

    // Error handling
    pub use crate::error::{Error, Result};

    // Packages
    pub use crate::descriptor::{PackageDescriptor, PackageEvent, TypeDescriptor};
    pub use crate::host::PackageHost;
    pub use crate::manifest::{matches, ManifestInfo, PackageReference};

    // Loading
    pub use crate::context::{ContextState, LoadContext, Resolution};
    pub use crate::module::{LibraryModuleLoader, ModuleLoader};
    pub use crate::registry::Registry;
}
