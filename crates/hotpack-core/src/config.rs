//! Host configuration.
//!
//! Defaults come from the constants below, a TOML file may override any of
//! them, and the environment variables in [`env_vars`] override the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default values.
pub mod defaults {
    /// Manifest file every package directory carries.
    pub const MANIFEST_FILE_NAME: &str = "package-info.json";
    /// Debounce window for rebuild events.
    pub const WATCH_DEBOUNCE_MS: u64 = 500;
    /// Framework folders tried first, in priority order.
    pub const PREFERRED_FRAMEWORKS: &[&str] = &["net8.0", "net7.0", "net6.0"];
    /// Prefix of generic-standard framework folders.
    pub const STANDARD_FRAMEWORK_PREFIX: &str = "netstandard";
    /// Prefixes of legacy framework folders, used as a last resort.
    pub const LEGACY_FRAMEWORK_PREFIXES: &[&str] = &["net4"];
    /// Package subfolders never copied into a shadow directory.
    pub const SHADOW_EXCLUDED_DIRS: &[&str] = &["bin", "obj", "target", "src", "Resources"];
    /// Version substituted for malformed version strings.
    pub const FALLBACK_VERSION: &str = "1.0.0";
}

/// Environment variable names.
pub mod env_vars {
    pub const STORE: &str = "HOTPACK_STORE";
    pub const SHADOW_DIR: &str = "HOTPACK_SHADOW_DIR";
    pub const SHADOW_COPY: &str = "HOTPACK_SHADOW_COPY";
    pub const LOG_JSON: &str = "HOTPACK_LOG_JSON";
}

/// Framework folder selection policy for the package store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkPolicy {
    /// Exact framework folder names, highest priority first
    pub preferred: Vec<String>,
    /// Generic-standard folders (`<prefix><version>`), highest version wins
    pub standard_prefix: String,
    /// Legacy folders, accepted when nothing else matches
    pub legacy_prefixes: Vec<String>,
}

impl Default for FrameworkPolicy {
    fn default() -> Self {
        Self {
            preferred: defaults::PREFERRED_FRAMEWORKS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            standard_prefix: defaults::STANDARD_FRAMEWORK_PREFIX.to_string(),
            legacy_prefixes: defaults::LEGACY_FRAMEWORK_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Configuration consumed by [`crate::Registry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Root of the third-party package store
    pub store_root: Option<PathBuf>,
    /// Where shadow copies are created
    pub shadow_root: PathBuf,
    /// Copy non-read-only packages before loading them
    pub shadow_copy: bool,
    /// Recurse into subfolders when scanning for sibling modules
    pub scan_subdirectories: bool,
    /// Modules the host already provides; never loaded from disk
    pub core_modules: Vec<String>,
    pub frameworks: FrameworkPolicy,
    pub shadow_excluded_dirs: Vec<String>,
    pub watch_debounce_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            store_root: dirs::home_dir().map(|home| home.join(".hotpack").join("store")),
            shadow_root: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("hotpack")
                .join("shadow"),
            shadow_copy: true,
            scan_subdirectories: true,
            core_modules: Vec::new(),
            frameworks: FrameworkPolicy::default(),
            shadow_excluded_dirs: defaults::SHADOW_EXCLUDED_DIRS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            watch_debounce_ms: defaults::WATCH_DEBOUNCE_MS,
        }
    }
}

impl HostConfig {
    /// Load a TOML config file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(store) = lookup(env_vars::STORE) {
            self.store_root = Some(PathBuf::from(store));
        }
        if let Some(shadow) = lookup(env_vars::SHADOW_DIR) {
            self.shadow_root = PathBuf::from(shadow);
        }
        if let Some(enabled) = lookup(env_vars::SHADOW_COPY).and_then(|v| v.parse().ok()) {
            self.shadow_copy = enabled;
        }
    }

    pub fn with_store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.store_root = Some(root.into());
        self
    }

    pub fn with_shadow_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.shadow_root = root.into();
        self
    }

    pub fn with_shadow_copy(mut self, enabled: bool) -> Self {
        self.shadow_copy = enabled;
        self
    }

    pub fn with_core_module(mut self, name: impl Into<String>) -> Self {
        self.core_modules.push(name.into());
        self
    }
}
