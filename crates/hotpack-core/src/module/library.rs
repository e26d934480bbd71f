//! Module loader backed by `libloading`.

use std::path::{Path, PathBuf};

use hotpack_abi::{ExportsFn, EXPORTS_SYMBOL};
use libloading::{Library, Symbol};

use super::{LoadedModule, ModuleExports, ModuleLoader, NativeHandle};
use crate::error::{Error, Result};
use crate::platform;

/// A shared library mapped with `libloading`.
pub struct LibraryModule {
    exports: ModuleExports,
    path: PathBuf,
    /// Declared after `exports`; the table must never outlive the mapping
    _library: Library,
}

impl LoadedModule for LibraryModule {
    fn name(&self) -> &str {
        &self.exports.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn exports(&self) -> &ModuleExports {
        &self.exports
    }
}

/// Production [`ModuleLoader`]: maps shared libraries and reads their
/// discovery table.
#[derive(Debug, Clone, Default)]
pub struct LibraryModuleLoader {
    _private: (),
}

impl LibraryModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate_path(path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(Error::load_failed(format!(
                "Module not found: {}",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(Error::load_failed(format!(
                "Path is not a file: {}",
                path.display()
            )));
        }
        if !platform::CURRENT.is_loadable(path) {
            return Err(Error::load_failed(format!(
                "Invalid extension for {}, expected .{}",
                path.display(),
                platform::CURRENT.library_extension()
            )));
        }
        Ok(())
    }
}

impl ModuleLoader for LibraryModuleLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModule>> {
        Self::validate_path(path)?;

        let library = unsafe {
            Library::new(path).map_err(|e| {
                Error::load_failed(format!("Failed to load {}: {}", path.display(), e))
            })?
        };

        let exports = {
            let entry: Symbol<ExportsFn> = unsafe {
                library.get(EXPORTS_SYMBOL.as_bytes()).map_err(|e| {
                    Error::invalid_module(format!(
                        "{} has no {} entry point: {}",
                        path.display(),
                        EXPORTS_SYMBOL,
                        e
                    ))
                })?
            };

            let raw = unsafe { entry() };
            if raw.is_null() {
                return Err(Error::invalid_module(format!(
                    "{} returned a null export table",
                    path.display()
                )));
            }
            unsafe { ModuleExports::from_raw(&*raw)? }
        };

        tracing::debug!(
            module = %exports.name,
            path = %path.display(),
            types = exports.types.len(),
            "Mapped module"
        );

        Ok(Box::new(LibraryModule {
            exports,
            path: path.to_path_buf(),
            _library: library,
        }))
    }

    fn load_native(&self, path: &Path) -> Result<NativeHandle> {
        let library = unsafe {
            Library::new(path).map_err(|e| {
                Error::load_failed(format!("Failed to map {}: {}", path.display(), e))
            })?
        };
        Ok(NativeHandle::new(path, Some(library)))
    }
}
