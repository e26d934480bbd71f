//! Version and framework negotiation against the third-party package store.
//!
//! Store layout: `<root>/<name-lowercase>/<version>/lib/<framework>/<name>.<ext>`.
//!
//! Version selection, first non-empty tier wins:
//! 1. exact `major.minor.build` folder
//! 2. same major and minor, nearest build
//! 3. same major, nearest minor
//! 4. any parseable version, nearest major
//! 5. the lexicographically first folder
//!
//! Within a tier candidates are ordered by distance to the request and
//! equal distances go to the higher version.

use std::cmp::{Ordering, Reverse};
use std::path::{Path, PathBuf};

use semver::Version;

use crate::config::FrameworkPolicy;
use crate::platform::{self, Platform};
use crate::version;

/// Folder under a version directory that holds framework folders.
const LIB_DIR: &str = "lib";

/// A binary chosen from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub package_dir: PathBuf,
    /// Version folder name as found on disk
    pub version: String,
    pub framework: String,
    pub path: PathBuf,
}

/// Resolves dependency names against an external versioned package store.
#[derive(Debug, Clone)]
pub struct PackageRepositoryResolver {
    root: PathBuf,
    frameworks: FrameworkPolicy,
    platform: Platform,
}

impl PackageRepositoryResolver {
    pub fn new(root: impl Into<PathBuf>, frameworks: FrameworkPolicy) -> Self {
        Self {
            root: root.into(),
            frameworks,
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

    /// Find the binary for `name`, optionally near `requested`.
    pub fn resolve(&self, name: &str, requested: Option<&Version>) -> Option<ResolvedPackage> {
        let Some(package_dir) = self.find_package_dir(name) else {
            tracing::debug!(dependency = name, store = %self.root.display(), "No package folder");
            return None;
        };

        let Some((version, version_dir)) = self.find_version_dir(&package_dir, requested) else {
            tracing::warn!(
                dependency = name,
                package = %package_dir.display(),
                "Package has no usable version folder"
            );
            return None;
        };

        let Some((framework, framework_dir)) = self.find_framework_dir(&version_dir) else {
            tracing::warn!(
                dependency = name,
                version = %version,
                "No compatible framework folder"
            );
            return None;
        };

        let package_name = package_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(name)
            .to_string();
        let Some(path) = self
            .find_binary(&framework_dir, name)
            .or_else(|| self.find_binary(&framework_dir, &package_name))
        else {
            tracing::warn!(
                dependency = name,
                dir = %framework_dir.display(),
                "Framework folder has no matching binary"
            );
            return None;
        };

        if let Some(requested) = requested {
            if version::short_string(requested) != version {
                tracing::info!(
                    dependency = name,
                    requested = %requested,
                    selected = %version,
                    "Using nearest available version"
                );
            }
        }

        Some(ResolvedPackage {
            package_dir,
            version,
            framework,
            path,
        })
    }

    /// Package folder by exact lowercase name, else by dotted-prefix match.
    pub fn find_package_dir(&self, name: &str) -> Option<PathBuf> {
        let lower = name.to_lowercase();
        let exact = self.root.join(&lower);
        if exact.is_dir() {
            return Some(exact);
        }

        let mut matches: Vec<(String, PathBuf)> = std::fs::read_dir(&self.root)
            .ok()?
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let dir_name = e.file_name().to_str()?.to_lowercase();
                let related = lower.starts_with(&format!("{}.", dir_name))
                    || dir_name.starts_with(&format!("{}.", lower));
                related.then(|| (dir_name, e.path()))
            })
            .collect();

        // Longest common prefix first, then name order for determinism.
        matches.sort_by(|a, b| {
            let la = common_prefix_len(&a.0, &lower);
            let lb = common_prefix_len(&b.0, &lower);
            lb.cmp(&la).then_with(|| a.0.cmp(&b.0))
        });
        matches.into_iter().next().map(|(_, path)| path)
    }

    /// Version folder closest to `requested`.
    pub fn find_version_dir(
        &self,
        package_dir: &Path,
        requested: Option<&Version>,
    ) -> Option<(String, PathBuf)> {
        let available = subdir_names(package_dir);
        let chosen = select_version(&available, requested)?;
        let path = package_dir.join(&chosen);
        Some((chosen, path))
    }

    /// Best framework folder under `<version_dir>/lib`.
    pub fn find_framework_dir(&self, version_dir: &Path) -> Option<(String, PathBuf)> {
        let lib_dir = version_dir.join(LIB_DIR);
        let available = subdir_names(&lib_dir);
        let chosen = select_framework(&available, &self.frameworks)?;
        let path = lib_dir.join(&chosen);
        Some((chosen, path))
    }

    fn find_binary(&self, dir: &Path, name: &str) -> Option<PathBuf> {
        for file_name in self.platform.library_file_names(name) {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        // Store folders are lowercase while binaries keep their casing.
        std::fs::read_dir(dir)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| self.platform.is_loadable(p))
            .find(|p| {
                platform::module_name_of(p)
                    .map(|stem| platform::stem_matches(&stem, name))
                    .unwrap_or(false)
            })
    }
}

/// Choose a version folder name.
///
/// Without a requested version the highest parseable version wins.
pub fn select_version(available: &[String], requested: Option<&Version>) -> Option<String> {
    if available.is_empty() {
        return None;
    }

    let parsed: Vec<(&String, Version)> = available
        .iter()
        .filter_map(|name| version::parse_lenient(name).ok().map(|v| (name, v)))
        .collect();

    let Some(requested) = requested else {
        return parsed
            .iter()
            .max_by(|a, b| a.1.cmp(&b.1))
            .map(|(name, _)| (*name).clone())
            .or_else(|| lexicographic_first(available));
    };

    let exact = version::short_string(requested);
    if let Some(name) = available.iter().find(|n| **n == exact) {
        return Some(name.clone());
    }

    let tiers: [&dyn Fn(&Version) -> bool; 3] = [
        &|v: &Version| v.major == requested.major && v.minor == requested.minor,
        &|v: &Version| v.major == requested.major,
        &|_: &Version| true,
    ];

    for in_tier in tiers {
        let best = parsed
            .iter()
            .filter(|(_, v)| in_tier(v))
            .min_by(|a, b| compare_nearest(&a.1, &b.1, requested));
        if let Some((name, _)) = best {
            return Some((*name).clone());
        }
    }

    lexicographic_first(available)
}

/// Order by distance to `requested` (major, then minor, then build), then
/// prefer the higher version.
fn compare_nearest(a: &Version, b: &Version, requested: &Version) -> Ordering {
    let key = |v: &Version| {
        (
            v.major.abs_diff(requested.major),
            v.minor.abs_diff(requested.minor),
            v.patch.abs_diff(requested.patch),
            Reverse(v.clone()),
        )
    };
    key(a).cmp(&key(b))
}

/// Choose a framework folder.
///
/// Preferred folders in priority order, then the highest generic-standard
/// folder, then the highest legacy folder.
pub fn select_framework(available: &[String], policy: &FrameworkPolicy) -> Option<String> {
    for preferred in &policy.preferred {
        if let Some(found) = available.iter().find(|a| a.eq_ignore_ascii_case(preferred)) {
            return Some(found.clone());
        }
    }

    let standard_prefix = policy.standard_prefix.to_lowercase();
    let standard = available
        .iter()
        .filter_map(|name| {
            let suffix = name.to_lowercase().strip_prefix(&standard_prefix)?.to_string();
            version::parse_lenient(&suffix).ok().map(|v| (name, v))
        })
        .max_by(|a, b| a.1.cmp(&b.1));
    if let Some((name, _)) = standard {
        return Some(name.clone());
    }

    let mut legacy: Vec<&String> = available
        .iter()
        .filter(|name| {
            let lower = name.to_lowercase();
            policy
                .legacy_prefixes
                .iter()
                .any(|p| lower.starts_with(&p.to_lowercase()))
        })
        .collect();
    legacy.sort();
    legacy.last().map(|name| (*name).clone())
}

fn lexicographic_first(available: &[String]) -> Option<String> {
    available.iter().min().cloned()
}

fn subdir_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    names
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}
