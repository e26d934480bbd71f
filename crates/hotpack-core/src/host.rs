//! Host-side package set.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::HostConfig;
use crate::descriptor::PackageDescriptor;
use crate::error::{Error, Result};
use crate::manifest::PackageReference;
use crate::module::ModuleLoader;
use crate::registry::Registry;

/// Registered packages keyed by name, plus the registry they load into.
pub struct PackageHost {
    registry: Arc<Registry>,
    packages: RwLock<BTreeMap<String, Arc<PackageDescriptor>>>,
}

impl PackageHost {
    pub fn new(config: HostConfig, loader: Arc<dyn ModuleLoader>) -> Self {
        Self::with_registry(Registry::new(config, loader))
    }

    pub fn with_registry(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            packages: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Register the package in `directory`. Names must be unique.
    pub fn register(
        &self,
        directory: impl Into<PathBuf>,
        read_only: bool,
    ) -> Result<Arc<PackageDescriptor>> {
        let descriptor = PackageDescriptor::new(Arc::clone(&self.registry));
        descriptor.initialize(directory, read_only)?;
        let name = descriptor.name();

        let mut packages = self.packages.write();
        if packages.contains_key(&name) {
            return Err(Error::AlreadyInitialized(format!(
                "package '{}' is already registered",
                name
            )));
        }
        packages.insert(name.clone(), Arc::clone(&descriptor));
        tracing::debug!(package = %name, read_only, "Registered package");
        Ok(descriptor)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PackageDescriptor>> {
        self.packages.read().get(name).cloned()
    }

    pub fn packages(&self) -> Vec<Arc<PackageDescriptor>> {
        self.packages.read().values().cloned().collect()
    }

    /// First registered package satisfying `reference`.
    pub fn find_for_reference(
        &self,
        reference: &PackageReference,
    ) -> Option<Arc<PackageDescriptor>> {
        self.packages()
            .into_iter()
            .find(|descriptor| descriptor.matches(reference))
    }

    /// Load a package, loading the registered packages it references first.
    pub fn load(&self, name: &str) -> bool {
        let mut visiting = HashSet::new();
        self.load_with(name, &mut visiting)
    }

    fn load_with(&self, name: &str, visiting: &mut HashSet<String>) -> bool {
        let Some(descriptor) = self.get(name) else {
            tracing::warn!(package = name, "Package is not registered");
            return false;
        };
        if !visiting.insert(name.to_string()) {
            return descriptor.is_loaded();
        }

        if let Some(info) = descriptor.try_get_release_info() {
            for reference in info.package_references.iter().filter(|r| !r.resources_only) {
                match self.find_for_reference(reference) {
                    Some(dependency) if dependency.name() != name => {
                        if !self.load_with(&dependency.name(), visiting) {
                            tracing::warn!(
                                package = name,
                                dependency = %reference.identity,
                                "Referenced package failed to load"
                            );
                        }
                    }
                    Some(_) => {}
                    None => tracing::debug!(
                        package = name,
                        dependency = %reference.identity,
                        "Reference not satisfied by a registered package"
                    ),
                }
            }
        }

        descriptor.try_load_types()
    }

    /// Load every registered package. Returns how many succeeded.
    pub fn load_all(&self) -> usize {
        let names: Vec<String> = self.packages.read().keys().cloned().collect();
        names.iter().filter(|name| self.load(name)).count()
    }

    /// Unload a package and, through the cascade, everything depending on it.
    pub fn unload(&self, name: &str) -> bool {
        match self.get(name) {
            Some(descriptor) => {
                descriptor.unload();
                true
            }
            None => false,
        }
    }

    /// Unload a package, then load it again together with every package the
    /// cascade took down.
    pub fn reload(&self, name: &str) -> bool {
        let loaded_before: Vec<String> = self
            .packages()
            .into_iter()
            .filter(|d| d.is_loaded())
            .map(|d| d.name())
            .collect();

        if !self.unload(name) {
            return false;
        }

        let cascaded: Vec<String> = loaded_before
            .into_iter()
            .filter(|other| other != name)
            .filter(|other| self.get(other).map(|d| !d.is_loaded()).unwrap_or(false))
            .collect();

        tracing::info!(package = name, cascaded = cascaded.len(), "Reloading package");
        let reloaded = self.load(name);
        for other in &cascaded {
            self.load(other);
        }
        reloaded
    }

    /// Unload everything. Descriptors stay registered.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

impl std::fmt::Debug for PackageHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageHost")
            .field("packages", &self.packages.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
