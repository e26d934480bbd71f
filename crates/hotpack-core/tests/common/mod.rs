//! Shared fixtures for integration tests.
//!
//! Modules are JSON files carrying the platform library extension; the
//! [`JsonModuleLoader`] reads them in place of mapping real libraries.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hotpack_core::config::HostConfig;
use hotpack_core::error::{Error, Result};
use hotpack_core::module::{
    ExportedType, LoadedModule, ModuleDependency, ModuleExports, ModuleLoader, NativeHandle,
};
use hotpack_core::platform;
use parking_lot::Mutex;
use semver::Version;
use tempfile::TempDir;
use uuid::Uuid;

pub struct JsonModule {
    exports: ModuleExports,
    path: PathBuf,
}

impl LoadedModule for JsonModule {
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

/// Reads module descriptions from JSON and counts loads per file stem.
#[derive(Default)]
pub struct JsonModuleLoader {
    loads: Mutex<HashMap<String, usize>>,
    natives: Mutex<Vec<PathBuf>>,
}

impl JsonModuleLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn loads_of(&self, stem: &str) -> usize {
        self.loads.lock().get(stem).copied().unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.loads.lock().values().sum()
    }

    pub fn natives(&self) -> Vec<PathBuf> {
        self.natives.lock().clone()
    }
}

impl ModuleLoader for JsonModuleLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModule>> {
        if !platform::CURRENT.is_loadable(path) {
            return Err(Error::load_failed(format!("not a module: {}", path.display())));
        }
        let content = std::fs::read_to_string(path)?;
        let exports: ModuleExports = serde_json::from_str(&content)
            .map_err(|e| Error::invalid_module(format!("{}: {}", path.display(), e)))?;

        let stem = platform::module_name_of(path).unwrap_or_default();
        *self.loads.lock().entry(stem).or_default() += 1;

        Ok(Box::new(JsonModule {
            exports,
            path: path.to_path_buf(),
        }))
    }

    fn load_native(&self, path: &Path) -> Result<NativeHandle> {
        self.natives.lock().push(path.to_path_buf());
        Ok(NativeHandle::new(path, None))
    }
}

/// Module description builder.
#[derive(Debug, Clone)]
pub struct ModuleSpec {
    exports: ModuleExports,
}

impl ModuleSpec {
    pub fn new(name: &str) -> Self {
        Self {
            exports: ModuleExports::host(name),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.exports.version = Some(Version::parse(version).unwrap());
        self
    }

    pub fn depends_on(mut self, name: &str, version: Option<&str>) -> Self {
        self.exports.dependencies.push(ModuleDependency::new(
            name,
            version.map(|v| Version::parse(v).unwrap()),
        ));
        self
    }

    pub fn imports_native(mut self, name: &str) -> Self {
        self.exports.native_imports.push(name.to_string());
        self
    }

    pub fn exports_type(mut self, content_id: &str, type_name: &str) -> Self {
        let namespace = self.exports.name.clone();
        self.exports.types.push(ExportedType {
            content_id: Uuid::parse_str(content_id).unwrap(),
            type_name: type_name.to_string(),
            namespace,
            inputs: Vec::new(),
            outputs: Vec::new(),
            factory: None,
        });
        self
    }

    pub fn file_name(&self) -> String {
        lib_file(&self.exports.name)
    }

    /// Write the module into `dir`; returns the file path.
    pub fn write_to(&self, dir: &Path) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(self.file_name());
        std::fs::write(&path, serde_json::to_string_pretty(&self.exports).unwrap()).unwrap();
        path
    }
}

pub fn lib_file(name: &str) -> String {
    format!("{}.{}", name, platform::CURRENT.library_extension())
}

/// Temporary package root, store and shadow root.
pub struct Fixture {
    _root: TempDir,
    pub packages: PathBuf,
    pub store: PathBuf,
    pub shadow: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let packages = root.path().join("packages");
        let store = root.path().join("store");
        let shadow = root.path().join("shadow");
        for dir in [&packages, &store, &shadow] {
            std::fs::create_dir_all(dir).unwrap();
        }
        Self {
            _root: root,
            packages,
            store,
            shadow,
        }
    }

    pub fn config(&self) -> HostConfig {
        HostConfig {
            store_root: Some(self.store.clone()),
            shadow_root: self.shadow.clone(),
            shadow_copy: true,
            core_modules: vec!["HostApi".to_string()],
            ..HostConfig::default()
        }
    }

    /// Write a package whose root module is `module`.
    ///
    /// `references` are `(identity, version)` package references.
    pub fn package(
        &self,
        module: &ModuleSpec,
        version: &str,
        references: &[(&str, &str)],
    ) -> PathBuf {
        let name = module.exports.name.clone();
        let dir = self.packages.join(&name);
        module.write_to(&dir);

        let references: Vec<serde_json::Value> = references
            .iter()
            .map(|(identity, version)| {
                serde_json::json!({
                    "Identity": identity,
                    "Version": version,
                    "ResourcesOnly": false,
                })
            })
            .collect();
        let manifest = serde_json::json!({
            "AssemblyFileName": name,
            "HomeId": Uuid::new_v4(),
            "RootNamespace": name,
            "EditorVersion": "4.0.0",
            "Version": version,
            "IsEditorOnly": false,
            "OperatorPackages": references,
        });
        std::fs::write(
            dir.join("package-info.json"),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
        dir
    }

    /// Place a module in the store under `<package>/<version>/lib/<framework>/`.
    pub fn store_module(
        &self,
        package: &str,
        version: &str,
        framework: &str,
        module: &ModuleSpec,
    ) -> PathBuf {
        let dir = self
            .store
            .join(package.to_lowercase())
            .join(version)
            .join("lib")
            .join(framework);
        module.write_to(&dir)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hotpack_core=debug")
        .with_test_writer()
        .try_init();
}
