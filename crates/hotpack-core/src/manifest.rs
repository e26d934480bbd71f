//! Package manifest (`package-info.json`).
//!
//! The manifest is produced by an external build step; this crate only reads
//! it. Field names on disk are PascalCase and must not change.

use std::path::{Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::defaults::MANIFEST_FILE_NAME;
use crate::error::{Error, Result};
use crate::version;

/// On-disk manifest layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawManifest {
    assembly_file_name: String,
    #[serde(default)]
    home_id: Option<Uuid>,
    root_namespace: String,
    #[serde(default)]
    editor_version: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    is_editor_only: bool,
    #[serde(default)]
    operator_packages: Vec<RawPackageReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPackageReference {
    identity: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    resources_only: bool,
}

/// Package-level dependency declared in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReference {
    /// Root namespace of the referenced package
    pub identity: String,
    pub version: Version,
    /// The reference only needs the package's resources, not its code
    pub resources_only: bool,
}

impl PackageReference {
    pub fn new(identity: impl Into<String>, version: Version) -> Self {
        Self {
            identity: identity.into(),
            version,
            resources_only: false,
        }
    }
}

/// Parsed, immutable package manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestInfo {
    /// Root module file name without the platform extension
    pub assembly_file_name: String,
    pub home_id: Uuid,
    pub root_namespace: String,
    pub editor_version: Version,
    pub version: Version,
    pub is_editor_only: bool,
    pub package_references: Vec<PackageReference>,
}

impl ManifestInfo {
    /// Path of the manifest inside a package directory.
    pub fn path_in(directory: &Path) -> PathBuf {
        directory.join(MANIFEST_FILE_NAME)
    }

    /// Read and parse the manifest of a package directory.
    pub fn read(directory: &Path) -> Result<Self> {
        let path = Self::path_in(directory);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::manifest(&path, format!("cannot read: {}", e)))?;
        Self::parse(&content).map_err(|e| match e {
            Error::Serialization(msg) => Error::manifest(&path, msg),
            other => other,
        })
    }

    /// Parse manifest JSON.
    ///
    /// Malformed version strings fall back to `1.0.0` with a warning; a
    /// missing `AssemblyFileName` or `RootNamespace` is an error.
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawManifest = serde_json::from_str(content)?;

        if raw.assembly_file_name.trim().is_empty() {
            return Err(Error::Serialization("AssemblyFileName is empty".into()));
        }
        if raw.root_namespace.trim().is_empty() {
            return Err(Error::Serialization("RootNamespace is empty".into()));
        }

        let package_references = raw
            .operator_packages
            .into_iter()
            .map(|r| PackageReference {
                version: r
                    .version
                    .as_deref()
                    .map(|v| version::parse_or_default(v, "OperatorPackages.Version"))
                    .unwrap_or_else(version::fallback),
                identity: r.identity,
                resources_only: r.resources_only,
            })
            .collect();

        Ok(Self {
            assembly_file_name: raw.assembly_file_name,
            home_id: raw.home_id.unwrap_or_else(Uuid::nil),
            root_namespace: raw.root_namespace,
            editor_version: raw
                .editor_version
                .as_deref()
                .map(|v| version::parse_or_default(v, "EditorVersion"))
                .unwrap_or_else(version::fallback),
            version: raw
                .version
                .as_deref()
                .map(|v| version::parse_or_default(v, "Version"))
                .unwrap_or_else(version::fallback),
            is_editor_only: raw.is_editor_only,
            package_references,
        })
    }

    /// Serialize back to the on-disk layout.
    pub fn to_json(&self) -> Result<String> {
        let raw = RawManifest {
            assembly_file_name: self.assembly_file_name.clone(),
            home_id: Some(self.home_id),
            root_namespace: self.root_namespace.clone(),
            editor_version: Some(self.editor_version.to_string()),
            version: Some(self.version.to_string()),
            is_editor_only: self.is_editor_only,
            operator_packages: self
                .package_references
                .iter()
                .map(|r| RawPackageReference {
                    identity: r.identity.clone(),
                    version: Some(r.version.to_string()),
                    resources_only: r.resources_only,
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&raw)?)
    }
}

/// Whether an on-disk package satisfies a declared reference.
///
/// The identity must equal the package's root namespace, the major versions
/// must agree and the package must be at least the requested version.
pub fn matches(reference: &PackageReference, manifest: &ManifestInfo) -> bool {
    reference.identity == manifest.root_namespace
        && manifest.version.major == reference.version.major
        && manifest.version >= reference.version
}
