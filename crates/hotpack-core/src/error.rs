//! Unified error handling for hotpack.
//!
//! Failures caused by untrusted input (manifests, on-disk package layout) are
//! logged and recovered by the public entry points; the variants here are what
//! those entry points log, and what the internal-invariant checks return.

use std::path::PathBuf;

/// Unified error type for hotpack.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Initialization was attempted twice.
    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    /// An operation needed state that was never initialized.
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// A module or package failed to load.
    #[error("Load failed: {0}")]
    LoadFailed(String),

    /// The package manifest is missing or malformed.
    #[error("Manifest error in {path}: {message}")]
    Manifest { path: PathBuf, message: String },

    /// A loaded module exports an unusable table.
    #[error("Invalid module: {0}")]
    InvalidModule(String),

    /// Module ABI version mismatch.
    #[error("ABI version mismatch: expected {expected}, found {found}")]
    AbiMismatch { expected: u32, found: u32 },

    /// A dependency could not be found in any search tier.
    #[error("Unresolved dependency: {0}")]
    Unresolved(String),

    /// `begin_unload` was called on a context that is already unloading.
    #[error("Invalid unload: {0}")]
    UnloadMisuse(String),

    /// A version string could not be parsed.
    #[error("Invalid version '{0}'")]
    VersionParse(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// File watching errors.
    #[error("Watch error: {0}")]
    Watch(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<notify::Error> for Error {
    fn from(e: notify::Error) -> Self {
        Error::Watch(e.to_string())
    }
}

impl From<libloading::Error> for Error {
    fn from(e: libloading::Error) -> Self {
        Error::LoadFailed(e.to_string())
    }
}

// Convenience constructors for common errors
impl Error {
    pub fn load_failed(msg: impl Into<String>) -> Self {
        Self::LoadFailed(msg.into())
    }

    pub fn invalid_module(msg: impl Into<String>) -> Self {
        Self::InvalidModule(msg.into())
    }

    pub fn manifest(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn unresolved(name: impl Into<String>) -> Self {
        Self::Unresolved(name.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error reports a violated internal invariant rather than
    /// bad external input.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::AlreadyInitialized(_) | Error::NotInitialized(_) | Error::UnloadMisuse(_)
        )
    }
}
