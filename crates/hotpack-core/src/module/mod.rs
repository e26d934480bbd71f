//! Loaded modules and their export tables.
//!
//! A module is one loadable binary. The host reads its discovery table once
//! at load time into an owned [`ModuleExports`]; nothing is looked up by
//! symbol name afterwards except through the factory pointers it carries.

use std::fmt;
use std::path::Path;

use hotpack_abi::{raw_slice, FactoryFn, RawModuleExports, RawSlot, RawStr, ABI_VERSION};
use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::version;

pub mod library;
pub mod node;

pub use library::LibraryModuleLoader;
pub use node::{ModuleNode, NodeId, ScanOptions};

/// Input or output slot of an exported type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSchema {
    pub id: Uuid,
    pub name: String,
    pub value_type: String,
}

/// One instantiable type exported by a module.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExportedType {
    pub content_id: Uuid,
    pub type_name: String,
    pub namespace: String,
    #[serde(default)]
    pub inputs: Vec<SlotSchema>,
    #[serde(default)]
    pub outputs: Vec<SlotSchema>,
    /// Valid only while the exporting module is loaded
    #[serde(skip)]
    pub factory: Option<FactoryFn>,
}

impl fmt::Debug for ExportedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedType")
            .field("content_id", &self.content_id)
            .field("type_name", &self.type_name)
            .field("namespace", &self.namespace)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

/// Module-level dependency declared by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDependency {
    pub name: String,
    #[serde(default)]
    pub version: Option<Version>,
}

impl ModuleDependency {
    pub fn new(name: impl Into<String>, version: Option<Version>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// Owned copy of a module's discovery table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleExports {
    pub name: String,
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub types: Vec<ExportedType>,
    #[serde(default)]
    pub dependencies: Vec<ModuleDependency>,
    #[serde(default)]
    pub native_imports: Vec<String>,
}

impl ModuleExports {
    /// Exports of a module the host provides itself.
    pub fn host(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Copy a raw discovery table into owned values.
    ///
    /// # Safety
    /// Every pointer in `raw` must be valid for the advertised length.
    pub unsafe fn from_raw(raw: &RawModuleExports) -> Result<Self> {
        if raw.abi_version != ABI_VERSION {
            return Err(Error::AbiMismatch {
                expected: ABI_VERSION,
                found: raw.abi_version,
            });
        }

        let name = required_str(&raw.name, "name")?;
        let module_version = optional_str(&raw.version, "version")?
            .map(|v| version::parse_or_default(&v, "module version"));

        let mut types = Vec::with_capacity(raw.types_len);
        for entry in raw_slice(raw.types, raw.types_len) {
            let content_id = required_str(&entry.content_id, "content_id")?;
            types.push(ExportedType {
                content_id: Uuid::parse_str(&content_id).map_err(|e| {
                    Error::invalid_module(format!("content id '{}': {}", content_id, e))
                })?,
                type_name: required_str(&entry.type_name, "type_name")?,
                namespace: optional_str(&entry.namespace, "namespace")?.unwrap_or_default(),
                inputs: slots(raw_slice(entry.inputs, entry.inputs_len))?,
                outputs: slots(raw_slice(entry.outputs, entry.outputs_len))?,
                factory: entry.factory,
            });
        }

        let mut dependencies = Vec::with_capacity(raw.dependencies_len);
        for dep in raw_slice(raw.dependencies, raw.dependencies_len) {
            dependencies.push(ModuleDependency {
                name: required_str(&dep.name, "dependency name")?,
                version: optional_str(&dep.version, "dependency version")?
                    .map(|v| version::parse_or_default(&v, "dependency version")),
            });
        }

        let mut native_imports = Vec::with_capacity(raw.native_imports_len);
        for native in raw_slice(raw.native_imports, raw.native_imports_len) {
            native_imports.push(required_str(native, "native import")?);
        }

        Ok(Self {
            name,
            version: module_version,
            types,
            dependencies,
            native_imports,
        })
    }
}

unsafe fn required_str(raw: &RawStr, field: &str) -> Result<String> {
    match optional_str(raw, field)? {
        Some(s) => Ok(s),
        None => Err(Error::invalid_module(format!("missing field '{}'", field))),
    }
}

unsafe fn optional_str(raw: &RawStr, field: &str) -> Result<Option<String>> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.as_str()
        .map(|s| Some(s.to_string()))
        .map_err(|e| Error::invalid_module(format!("invalid UTF-8 in '{}': {}", field, e)))
}

unsafe fn slots(raw: &[RawSlot]) -> Result<Vec<SlotSchema>> {
    raw.iter()
        .map(|slot| {
            let id = required_str(&slot.id, "slot id")?;
            Ok(SlotSchema {
                id: Uuid::parse_str(&id)
                    .map_err(|e| Error::invalid_module(format!("slot id '{}': {}", id, e)))?,
                name: required_str(&slot.name, "slot name")?,
                value_type: optional_str(&slot.value_type, "slot value type")?.unwrap_or_default(),
            })
        })
        .collect()
}

/// A module mapped into the process.
///
/// Dropping the value unmaps the module.
pub trait LoadedModule: Send + Sync {
    /// Declared module name.
    fn name(&self) -> &str;

    /// File the module was loaded from.
    fn path(&self) -> &Path;

    /// Discovery table read at load time.
    fn exports(&self) -> &ModuleExports;
}

/// Maps module files into the process.
pub trait ModuleLoader: Send + Sync {
    /// Load the module at `path`.
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModule>>;

    /// Map an unmanaged library that a module imports.
    ///
    /// The returned handle keeps the library mapped until dropped.
    fn load_native(&self, path: &Path) -> Result<NativeHandle>;
}

/// Handle to an unmanaged library mapped on behalf of a module.
pub struct NativeHandle {
    pub path: std::path::PathBuf,
    _library: Option<libloading::Library>,
}

impl NativeHandle {
    pub fn new(path: impl Into<std::path::PathBuf>, library: Option<libloading::Library>) -> Self {
        Self {
            path: path.into(),
            _library: library,
        }
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("path", &self.path)
            .field("mapped", &self._library.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpack_abi::{RawDependency, RawTypeEntry};

    hotpack_abi::export_module! {
        name: "Lib.Math",
        version: "1.2",
        types: [
            RawTypeEntry::new(
                "5f3c1c9e-52b4-4cb4-9d0d-6c0f5f0d7a11",
                "Add",
                "Lib.Math",
                &[
                    RawSlot::new("9a1e0d1c-0000-4000-8000-000000000001", "A", "f32"),
                    RawSlot::new("9a1e0d1c-0000-4000-8000-000000000002", "B", "f32"),
                ],
                &[RawSlot::new("9a1e0d1c-0000-4000-8000-000000000003", "Result", "f32")],
                None,
            ),
        ],
        dependencies: [("Lib.Core", "1.0.0"), ("Lib.Any", "")],
        native_imports: ["fastmath"],
    }

    #[test]
    fn test_from_raw_exported_table() {
        let exports = unsafe { ModuleExports::from_raw(&*hotpack_module_exports()) }.unwrap();

        assert_eq!(exports.name, "Lib.Math");
        assert_eq!(exports.version, Some(Version::new(1, 2, 0)));
        assert_eq!(exports.types.len(), 1);
        assert_eq!(exports.types[0].type_name, "Add");
        assert_eq!(exports.types[0].inputs.len(), 2);
        assert_eq!(exports.types[0].outputs[0].name, "Result");
        assert_eq!(
            exports.dependencies,
            vec![
                ModuleDependency::new("Lib.Core", Some(Version::new(1, 0, 0))),
                ModuleDependency::new("Lib.Any", None),
            ]
        );
        assert_eq!(exports.native_imports, vec!["fastmath"]);
    }

    #[test]
    fn test_abi_mismatch() {
        let mut raw = RawModuleExports::new("Old", "1.0.0", &[], &[], &[]);
        raw.abi_version = ABI_VERSION + 1;
        let err = unsafe { ModuleExports::from_raw(&raw) }.unwrap_err();
        assert!(matches!(err, Error::AbiMismatch { .. }));
    }

    #[test]
    fn test_invalid_content_id() {
        static TYPES: [RawTypeEntry; 1] =
            [RawTypeEntry::new("not-a-uuid", "Broken", "X", &[], &[], None)];
        static DEPS: [RawDependency; 0] = [];
        let raw = RawModuleExports::new("X", "1.0.0", &TYPES, &DEPS, &[]);
        let err = unsafe { ModuleExports::from_raw(&raw) }.unwrap_err();
        assert!(matches!(err, Error::InvalidModule(_)));
    }
}
