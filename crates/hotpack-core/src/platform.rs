//! Host platform identification and loadable-file classification.

use std::path::Path;

use once_cell::sync::Lazy;

/// Platform-identifier folder names a package may ship native binaries in.
pub const KNOWN_PLATFORMS: &[&str] = &[
    "win-x64",
    "win-x86",
    "win-arm64",
    "linux-x64",
    "linux-arm64",
    "linux-musl-x64",
    "linux-musl-arm64",
    "osx-x64",
    "osx-arm64",
];

/// Extensions of debug-symbol files that travel with a binary.
pub const SYMBOL_EXTENSIONS: &[&str] = &["pdb", "dwp", "debug", "dSYM"];

/// The platform this process runs on.
pub static CURRENT: Lazy<Platform> = Lazy::new(Platform::detect);

/// Operating system + architecture of a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: Os,
    pub arch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Windows,
    Linux,
    MacOs,
    Other,
}

impl Platform {
    /// Detect the platform from the compile target.
    pub fn detect() -> Self {
        let os = match std::env::consts::OS {
            "windows" => Os::Windows,
            "linux" => Os::Linux,
            "macos" => Os::MacOs,
            _ => Os::Other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "x64",
            "x86" => "x86",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            os,
            arch: arch.to_string(),
        }
    }

    pub fn new(os: Os, arch: impl Into<String>) -> Self {
        Self {
            os,
            arch: arch.into(),
        }
    }

    /// Platform identifier, e.g. `linux-x64`.
    pub fn identifier(&self) -> String {
        let os = match self.os {
            Os::Windows => "win",
            Os::Linux => "linux",
            Os::MacOs => "osx",
            Os::Other => "unknown",
        };
        format!("{}-{}", os, self.arch)
    }

    /// Extension of loadable libraries on this platform, without the dot.
    pub fn library_extension(&self) -> &'static str {
        match self.os {
            Os::Windows => "dll",
            Os::MacOs => "dylib",
            Os::Linux | Os::Other => "so",
        }
    }

    /// Candidate file names for a library called `name`.
    pub fn library_file_names(&self, name: &str) -> Vec<String> {
        let ext = self.library_extension();
        let mut names = vec![format!("{}.{}", name, ext)];
        if self.os != Os::Windows && !name.starts_with("lib") {
            names.push(format!("lib{}.{}", name, ext));
        }
        names
    }

    /// Whether `path` carries this platform's library extension.
    pub fn is_loadable(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(self.library_extension()))
            .unwrap_or(false)
    }

    /// Whether a folder should be scanned for this platform.
    ///
    /// Folders named after another known platform are skipped; everything
    /// else, including this platform's own folder, is scanned.
    pub fn accepts_folder(&self, folder_name: &str) -> bool {
        !is_platform_folder(folder_name) || folder_name.eq_ignore_ascii_case(&self.identifier())
    }
}

/// Whether a folder name is a platform identifier.
pub fn is_platform_folder(name: &str) -> bool {
    KNOWN_PLATFORMS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(name))
}

/// Whether a path is a debug-symbol file.
pub fn is_symbol_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| SYMBOL_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// File stem of a library path, the key candidates are indexed by.
pub fn module_name_of(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    Some(stem.to_string())
}

/// Whether a library file stem satisfies a request for `name`.
pub fn stem_matches(stem: &str, name: &str) -> bool {
    stem.eq_ignore_ascii_case(name)
        || stem
            .strip_prefix("lib")
            .map(|s| s.eq_ignore_ascii_case(name))
            .unwrap_or(false)
}
