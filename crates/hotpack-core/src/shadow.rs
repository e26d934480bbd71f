//! Shadow copies of package artifacts.
//!
//! A non-read-only package is copied into a fresh scratch directory before
//! its context maps anything, so the running instance never sees a rebuild
//! that lands in the package directory while it is loaded.

use std::path::{Path, PathBuf};

use crate::config::defaults::MANIFEST_FILE_NAME;
use crate::context::ContextId;
use crate::error::{Error, Result};
use crate::platform::{self, Platform};

/// Creates and removes shadow directories under one root.
#[derive(Debug, Clone)]
pub struct ShadowCopyManager {
    root: PathBuf,
    excluded_dirs: Vec<String>,
    platform: Platform,
}

impl ShadowCopyManager {
    pub fn new(root: impl Into<PathBuf>, excluded_dirs: Vec<String>) -> Self {
        Self {
            root: root.into(),
            excluded_dirs,
            platform: platform::CURRENT.clone(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy the artifacts of `package_dir` into a new scratch directory.
    pub fn create(
        &self,
        package_dir: &Path,
        package_name: &str,
        context: ContextId,
    ) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let target = self
            .root
            .join(sanitize(package_name))
            .join(format!("{}-{}", stamp, context.0));

        std::fs::create_dir_all(&target).map_err(|e| {
            Error::load_failed(format!(
                "Cannot create shadow directory {}: {}",
                target.display(),
                e
            ))
        })?;

        let copied = self.copy_filtered(package_dir, &target)?;
        tracing::debug!(
            package = package_name,
            source = %package_dir.display(),
            shadow = %target.display(),
            files = copied,
            "Created shadow copy"
        );
        Ok(target)
    }

    /// Whether a file belongs in a shadow copy.
    pub fn is_artifact(&self, path: &Path) -> bool {
        let is_manifest = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.eq_ignore_ascii_case(MANIFEST_FILE_NAME))
            .unwrap_or(false);
        is_manifest || self.platform.is_loadable(path) || platform::is_symbol_file(path)
    }

    /// Whether a subfolder is skipped entirely.
    pub fn is_excluded_dir(&self, name: &str) -> bool {
        name.starts_with('.')
            || self
                .excluded_dirs
                .iter()
                .any(|d| d.eq_ignore_ascii_case(name))
    }

    fn copy_filtered(&self, source: &Path, target: &Path) -> Result<usize> {
        let mut copied = 0;
        for entry in std::fs::read_dir(source)?.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if path.is_dir() {
                if self.is_excluded_dir(name) {
                    continue;
                }
                let sub_target = target.join(name);
                if platform::is_platform_folder(name) {
                    copied += copy_verbatim(&path, &sub_target)?;
                } else {
                    let count = self.copy_filtered(&path, &sub_target)?;
                    copied += count;
                }
            } else if self.is_artifact(&path) {
                std::fs::create_dir_all(target)?;
                std::fs::copy(&path, target.join(name))?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Remove a shadow directory. Paths outside the root are left alone.
    pub fn remove(&self, shadow_dir: &Path) {
        if !shadow_dir.starts_with(&self.root) {
            tracing::warn!(
                path = %shadow_dir.display(),
                "Refusing to remove directory outside the shadow root"
            );
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(shadow_dir) {
            tracing::warn!(path = %shadow_dir.display(), "Failed to remove shadow copy: {}", e);
        }
    }

    /// Remove shadow directories not listed in `keep`.
    ///
    /// Used at startup to clear leftovers of earlier processes.
    pub fn purge_stale(&self, keep: &[PathBuf]) -> usize {
        let Ok(packages) = std::fs::read_dir(&self.root) else {
            return 0;
        };
        let mut removed = 0;
        for package in packages.flatten() {
            let Ok(copies) = std::fs::read_dir(package.path()) else {
                continue;
            };
            for copy in copies.flatten() {
                let path = copy.path();
                if path.is_dir() && !keep.contains(&path) {
                    self.remove(&path);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, root = %self.root.display(), "Purged stale shadow copies");
        }
        removed
    }
}

fn copy_verbatim(source: &Path, target: &Path) -> Result<usize> {
    std::fs::create_dir_all(target)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(source)?.flatten() {
        let path = entry.path();
        let dest = target.join(entry.file_name());
        if path.is_dir() {
            copied += copy_verbatim(&path, &dest)?;
        } else {
            std::fs::copy(&path, &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Os;

    fn manager(root: &Path) -> ShadowCopyManager {
        ShadowCopyManager::new(root, vec!["obj".into(), "bin".into(), "src".into()])
            .with_platform(Platform::new(Os::Linux, "x64"))
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, path.to_string_lossy().as_bytes()).unwrap();
    }

    #[test]
    fn test_copy_filters_artifacts() {
        let package = tempfile::tempdir().unwrap();
        let shadow_root = tempfile::tempdir().unwrap();
        let p = package.path();

        touch(&p.join("Editor.so"));
        touch(&p.join("Editor.pdb"));
        touch(&p.join(MANIFEST_FILE_NAME));
        touch(&p.join("README.md"));
        touch(&p.join("obj/Debug/Editor.so"));
        touch(&p.join(".git/HEAD.so"));
        touch(&p.join("src/lib.rs"));
        touch(&p.join("plugins/Extra.so"));
        touch(&p.join("plugins/notes.txt"));
        touch(&p.join("win-x64/native/fast.dll"));
        touch(&p.join("win-x64/LICENSE"));

        let shadow = manager(shadow_root.path())
            .create(p, "Editor", ContextId(3))
            .unwrap();

        assert!(shadow.starts_with(shadow_root.path().join("Editor")));
        assert!(shadow.join("Editor.so").is_file());
        assert!(shadow.join("Editor.pdb").is_file());
        assert!(shadow.join(MANIFEST_FILE_NAME).is_file());
        assert!(shadow.join("plugins/Extra.so").is_file());
        assert!(shadow.join("win-x64/native/fast.dll").is_file());
        assert!(shadow.join("win-x64/LICENSE").is_file());

        assert!(!shadow.join("README.md").exists());
        assert!(!shadow.join("obj").exists());
        assert!(!shadow.join(".git").exists());
        assert!(!shadow.join("src").exists());
        assert!(!shadow.join("plugins/notes.txt").exists());
    }

    #[test]
    fn test_copies_are_isolated() {
        let package = tempfile::tempdir().unwrap();
        let shadow_root = tempfile::tempdir().unwrap();
        let binary = package.path().join("Core.so");
        std::fs::write(&binary, b"v1").unwrap();

        let manager = manager(shadow_root.path());
        let first = manager.create(package.path(), "Core", ContextId(1)).unwrap();
        std::fs::write(&binary, b"v2").unwrap();
        let second = manager.create(package.path(), "Core", ContextId(2)).unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(first.join("Core.so")).unwrap(), b"v1");
        assert_eq!(std::fs::read(second.join("Core.so")).unwrap(), b"v2");
    }

    #[test]
    fn test_remove_and_purge() {
        let package = tempfile::tempdir().unwrap();
        let shadow_root = tempfile::tempdir().unwrap();
        touch(&package.path().join("Core.so"));

        let manager = manager(shadow_root.path());
        let a = manager.create(package.path(), "Core", ContextId(1)).unwrap();
        let b = manager.create(package.path(), "Core", ContextId(2)).unwrap();

        manager.remove(&a);
        assert!(!a.exists());

        let outside = tempfile::tempdir().unwrap();
        manager.remove(outside.path());
        assert!(outside.path().exists());

        let c = manager.create(package.path(), "Core", ContextId(3)).unwrap();
        assert_eq!(manager.purge_stale(&[c.clone()]), 1);
        assert!(!b.exists());
        assert!(c.exists());
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Lib.Math"), "Lib.Math");
        assert_eq!(sanitize("a/b\\c d"), "a_b_c_d");
    }
}
