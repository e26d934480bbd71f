//! Resolution of unmanaged libraries imported by modules.

use std::path::{Path, PathBuf};

use crate::platform::{self, Platform};

/// Resolves unmanaged library names relative to a package directory.
#[derive(Debug, Clone)]
pub struct NativeLibraryResolver {
    search_dir: Option<PathBuf>,
    platform: Platform,
}

impl NativeLibraryResolver {
    /// Resolver rooted at `search_dir` (the shadow directory when one exists).
    pub fn new(search_dir: Option<PathBuf>) -> Self {
        Self {
            search_dir,
            platform: platform::CURRENT.clone(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn search_dir(&self) -> Option<&Path> {
        self.search_dir.as_deref()
    }

    /// Locate the file for `name`.
    ///
    /// Order: `name` verbatim when it is an absolute path, then
    /// `<dir>/<name>.<ext>`, then the platform folder `<dir>/<rid>/<name>.<ext>`.
    /// On Unix the `lib<name>` spelling is tried at each location. A miss is
    /// logged and reported as `None`.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let verbatim = Path::new(name);
        if verbatim.is_absolute() {
            if verbatim.is_file() {
                return Some(verbatim.to_path_buf());
            }
            tracing::warn!(library = name, "Native library not found");
            return None;
        }

        if let Some(dir) = &self.search_dir {
            let platform_dir = dir.join(self.platform.identifier());
            for base in [dir.as_path(), platform_dir.as_path()] {
                for file_name in self.platform.library_file_names(name) {
                    let candidate = base.join(&file_name);
                    if candidate.is_file() {
                        tracing::debug!(
                            library = name,
                            path = %candidate.display(),
                            "Resolved native library"
                        );
                        return Some(candidate);
                    }
                }
            }
        }

        tracing::warn!(
            library = name,
            dir = ?self.search_dir,
            "Native library not found"
        );
        None
    }
}
