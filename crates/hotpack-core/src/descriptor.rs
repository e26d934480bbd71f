//! Per-package handle.
//!
//! A descriptor owns at most one [`LoadContext`] at a time, extracts the
//! exported type table from its root module, and tells collaborators when
//! the package's code appears or goes away.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::context::{ContextEvent, ContextId, LoadContext};
use crate::error::{Error, Result};
use crate::manifest::{self, ManifestInfo, PackageReference};
use crate::module::{ExportedType, SlotSchema};
use crate::registry::Registry;
use hotpack_abi::FactoryFn;

/// Lifecycle notification for collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageEvent {
    /// The type table is populated
    Loaded,
    /// The context finished unloading; instances built from it are invalid
    Unloaded,
    /// The descriptor is reset and can be loaded again
    UnloadComplete,
}

pub type PackageListener = Arc<dyn Fn(&PackageDescriptor, PackageEvent) + Send + Sync>;

/// An instantiable type exported by a package.
#[derive(Clone)]
pub struct TypeDescriptor {
    pub content_id: Uuid,
    pub type_name: String,
    pub namespace: String,
    pub inputs: Vec<SlotSchema>,
    pub outputs: Vec<SlotSchema>,
    /// Valid until the package unloads
    pub factory: Option<FactoryFn>,
}

impl TypeDescriptor {
    fn from_export(export: &ExportedType) -> Self {
        Self {
            content_id: export.content_id,
            type_name: export.type_name.clone(),
            namespace: export.namespace.clone(),
            inputs: export.inputs.clone(),
            outputs: export.outputs.clone(),
            factory: export.factory,
        }
    }

    /// `Namespace.TypeName`, or the bare type name without a namespace.
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}.{}", self.namespace, self.type_name)
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("content_id", &self.content_id)
            .field("name", &self.full_name())
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

#[derive(Default)]
struct DescriptorState {
    directory: Option<PathBuf>,
    name: String,
    read_only: bool,
    manifest: Option<ManifestInfo>,
    context: Option<Arc<LoadContext>>,
    /// Context handed to `begin_unload` whose completion is still pending
    unloading: Option<ContextId>,
    types: HashMap<Uuid, TypeDescriptor>,
    namespaces: BTreeSet<String>,
    /// Cached outcome of the last type extraction
    load_result: Option<bool>,
}

/// Handle to one content package.
pub struct PackageDescriptor {
    this: Weak<PackageDescriptor>,
    registry: Arc<Registry>,
    state: Mutex<DescriptorState>,
    listeners: Mutex<Vec<PackageListener>>,
}

impl PackageDescriptor {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry,
            state: Mutex::new(DescriptorState::default()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Bind the descriptor to a package directory. Fails on a second call.
    pub fn initialize(&self, directory: impl Into<PathBuf>, read_only: bool) -> Result<()> {
        let directory = directory.into();
        let mut state = self.state.lock();
        if let Some(existing) = &state.directory {
            return Err(Error::AlreadyInitialized(format!(
                "package descriptor already bound to {}",
                existing.display()
            )));
        }
        state.name = directory
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        state.directory = Some(directory);
        state.read_only = read_only;
        Ok(())
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn directory(&self) -> Option<PathBuf> {
        self.state.lock().directory.clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().context.is_some()
    }

    pub fn context(&self) -> Option<Arc<LoadContext>> {
        self.state.lock().context.clone()
    }

    /// The parsed manifest, read from disk on first use.
    ///
    /// A missing or malformed manifest is logged and reported as `None`.
    pub fn try_get_release_info(&self) -> Option<ManifestInfo> {
        let mut state = self.state.lock();
        if let Some(info) = &state.manifest {
            return Some(info.clone());
        }
        let directory = state.directory.clone()?;
        match ManifestInfo::read(&directory) {
            Ok(info) => {
                state.manifest = Some(info.clone());
                Some(info)
            }
            Err(e) => {
                tracing::warn!(package = %state.name, "Cannot read manifest: {}", e);
                None
            }
        }
    }

    /// Whether this package satisfies `reference`.
    pub fn matches(&self, reference: &PackageReference) -> bool {
        self.try_get_release_info()
            .map(|info| manifest::matches(reference, &info))
            .unwrap_or(false)
    }

    /// Load the package and extract its type table.
    ///
    /// Idempotent: once an extraction has run, later calls return its cached
    /// outcome without touching the disk. A failure to build the context is
    /// not cached and the next call retries. A failed extraction leaves the
    /// context loaded with an empty table.
    pub fn try_load_types(&self) -> bool {
        let mut state = self.state.lock();
        if let Some(result) = state.load_result {
            return result;
        }
        let Some(directory) = state.directory.clone() else {
            tracing::error!("{}", Error::NotInitialized("package descriptor".into()));
            return false;
        };

        if state.context.is_none() {
            match LoadContext::create(&self.registry, &directory, state.read_only) {
                Ok(context) if context.state().is_terminal() => {
                    tracing::error!(
                        package = %state.name,
                        context = %context.id(),
                        "Context unloaded before it could be used"
                    );
                    return false;
                }
                Ok(context) => {
                    let this = self.this.clone();
                    context.subscribe(Arc::new(move |context: &LoadContext, event: ContextEvent| {
                        if event == ContextEvent::Unloaded {
                            if let Some(descriptor) = this.upgrade() {
                                descriptor.on_context_unloaded(context.id());
                            }
                        }
                    }));
                    state.context = Some(context);
                }
                Err(e) => {
                    tracing::error!(package = %state.name, "Failed to load package: {}", e);
                    return false;
                }
            }
        }

        let Some(context) = state.context.clone() else {
            return false;
        };
        let result = match extract_types(&context) {
            Ok((types, namespaces)) => {
                tracing::info!(
                    package = %state.name,
                    context = %context.id(),
                    types = types.len(),
                    "Package loaded"
                );
                state.types = types;
                state.namespaces = namespaces;
                true
            }
            Err(e) => {
                tracing::error!(package = %state.name, "Type extraction failed: {}", e);
                state.types.clear();
                state.namespaces.clear();
                false
            }
        };
        state.load_result = Some(result);
        drop(state);

        if result {
            self.fire(PackageEvent::Loaded);
        }
        result
    }

    /// Unload the package's context. No-op when nothing is loaded.
    ///
    /// Completion events fire before this returns. The descriptor can be
    /// loaded again afterwards.
    pub fn unload(&self) {
        let context = {
            let mut state = self.state.lock();
            let Some(context) = state.context.take() else {
                return;
            };
            state.unloading = Some(context.id());
            context
        };

        // Already unloading through a dependency; completion events arrive
        // through the subscription.
        if context.state().is_terminal() {
            let mut state = self.state.lock();
            state.types.clear();
            state.namespaces.clear();
            state.load_result = None;
            return;
        }
        if let Err(e) = context.begin_unload() {
            tracing::warn!(context = %context.id(), "Unload request ignored: {}", e);
        }
    }

    fn on_context_unloaded(&self, id: ContextId) {
        {
            let mut state = self.state.lock();
            let current = state.context.as_ref().map(|c| c.id()) == Some(id);
            let pending = state.unloading == Some(id);
            if !current && !pending {
                return;
            }
            if current {
                state.context = None;
            }
            state.unloading = None;
            state.types.clear();
            state.namespaces.clear();
            state.manifest = None;
            state.load_result = None;
            tracing::info!(package = %state.name, context = %id, "Package unloaded");
        }

        self.fire(PackageEvent::Unloaded);
        self.fire(PackageEvent::UnloadComplete);
    }

    /// Snapshot of the type table.
    pub fn types(&self) -> HashMap<Uuid, TypeDescriptor> {
        self.state.lock().types.clone()
    }

    pub fn get_type(&self, content_id: &Uuid) -> Option<TypeDescriptor> {
        self.state.lock().types.get(content_id).cloned()
    }

    pub fn namespaces(&self) -> BTreeSet<String> {
        self.state.lock().namespaces.clone()
    }

    pub fn on_event(&self, listener: PackageListener) {
        self.listeners.lock().push(listener);
    }

    fn fire(&self, event: PackageEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(self, event);
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_in(&self, path: &Path) -> bool {
        self.directory()
            .map(|dir| path.starts_with(dir))
            .unwrap_or(false)
    }
}

impl fmt::Debug for PackageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PackageDescriptor")
            .field("name", &state.name)
            .field("directory", &state.directory)
            .field("read_only", &state.read_only)
            .field("loaded", &state.context.is_some())
            .field("types", &state.types.len())
            .finish()
    }
}

type TypeTable = (HashMap<Uuid, TypeDescriptor>, BTreeSet<String>);

fn extract_types(context: &LoadContext) -> Result<TypeTable> {
    let root = context
        .root()
        .ok_or_else(|| Error::NotInitialized(format!("root module of {}", context.name())))?;

    let mut types = HashMap::new();
    let mut namespaces = BTreeSet::new();
    for export in &root.exports().types {
        if export.content_id.is_nil() {
            return Err(Error::invalid_module(format!(
                "{} exports {} with a nil content id",
                root.name(),
                export.type_name
            )));
        }
        let descriptor = TypeDescriptor::from_export(export);
        if let Some(previous) = types.insert(export.content_id, descriptor) {
            return Err(Error::invalid_module(format!(
                "{} exports {} and {} under the same content id {}",
                root.name(),
                previous.type_name,
                export.type_name,
                export.content_id
            )));
        }
        if !export.namespace.is_empty() {
            namespaces.insert(export.namespace.clone());
        }
    }
    Ok((types, namespaces))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::module::{LoadedModule, ModuleLoader, NativeHandle};

    struct NoLoader;

    impl ModuleLoader for NoLoader {
        fn load(&self, path: &Path) -> Result<Box<dyn LoadedModule>> {
            Err(Error::load_failed(path.display().to_string()))
        }

        fn load_native(&self, path: &Path) -> Result<NativeHandle> {
            Ok(NativeHandle::new(path, None))
        }
    }

    fn registry() -> Arc<Registry> {
        let config = HostConfig {
            store_root: None,
            ..HostConfig::default().with_shadow_copy(false)
        };
        Registry::new(config, Arc::new(NoLoader))
    }

    #[test]
    fn test_initialize_twice() {
        let descriptor = PackageDescriptor::new(registry());
        descriptor.initialize("/packages/Editor", false).unwrap();
        assert_eq!(descriptor.name(), "Editor");
        assert!(!descriptor.is_read_only());

        let err = descriptor.initialize("/packages/Other", true).unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized(_)));
        assert_eq!(descriptor.directory(), Some(PathBuf::from("/packages/Editor")));
    }

    #[test]
    fn test_load_before_initialize() {
        let descriptor = PackageDescriptor::new(registry());
        assert!(!descriptor.try_load_types());
        assert!(descriptor.try_get_release_info().is_none());
    }

    #[test]
    fn test_missing_manifest_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = PackageDescriptor::new(registry());
        descriptor.initialize(dir.path(), true).unwrap();

        assert!(!descriptor.try_load_types());
        assert!(!descriptor.is_loaded());

        std::fs::write(
            dir.path().join("package-info.json"),
            r#"{ "AssemblyFileName": "Pkg", "RootNamespace": "Pkg" }"#,
        )
        .unwrap();
        assert!(descriptor.try_get_release_info().is_some());
        // the root binary is still missing, so the retry fails again
        assert!(!descriptor.try_load_types());
    }

    #[test]
    fn test_unload_without_context() {
        let descriptor = PackageDescriptor::new(registry());
        descriptor.unload();
        assert!(!descriptor.is_loaded());
    }

    #[test]
    fn test_full_name() {
        let export = ExportedType {
            content_id: Uuid::new_v4(),
            type_name: "Add".into(),
            namespace: "Lib.Math".into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            factory: None,
        };
        assert_eq!(TypeDescriptor::from_export(&export).full_name(), "Lib.Math.Add");

        let bare = ExportedType {
            namespace: String::new(),
            ..export
        };
        assert_eq!(TypeDescriptor::from_export(&bare).full_name(), "Add");
    }
}
