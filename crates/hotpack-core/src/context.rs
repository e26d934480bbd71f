//! Load contexts: isolated resolution domains.
//!
//! A package context owns one root module node and every node loaded on its
//! behalf. Lifecycle: `Created -> Loaded -> Unloading -> Unloaded`, one way
//! only; reloading a package builds a new context.
//!
//! Dependency lookup, first match wins:
//! 1. host-provided core modules
//! 2. this context's tree (linked nodes, then sibling candidates)
//! 3. other live contexts (linked nodes across all of them, the third-party
//!    cache, then sibling candidates across all of them)
//! 4. the third-party package store
//!
//! A hit in another context records a dependency edge. When a context starts
//! unloading, every context with an edge onto it starts unloading too, before
//! the first one releases its modules.
//!
//! Lock order: a node's link lock may be held while a context lock is taken,
//! never the reverse. No context lock is held while another context is
//! notified.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use semver::Version;

use crate::error::{Error, Result};
use crate::manifest::ManifestInfo;
use crate::module::{ModuleNode, NativeHandle};
use crate::native::NativeLibraryResolver;
use crate::registry::Registry;

/// Name of the shared context third-party binaries live in.
pub const THIRD_PARTY_CONTEXT: &str = "third-party";

/// Identifier of a load context, unique within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Lifecycle state. Ordered; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextState {
    Created,
    Loaded,
    Unloading,
    Unloaded,
}

impl ContextState {
    /// `Unloading` or `Unloaded`.
    pub fn is_terminal(self) -> bool {
        self >= ContextState::Unloading
    }
}

/// Notification delivered to context listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    /// Dependents have been told to unload; modules are still mapped
    Unloading,
    /// Every module and native handle has been released
    Unloaded,
}

pub type ContextListener = Arc<dyn Fn(&LoadContext, ContextEvent) + Send + Sync>;

/// Search tier a dependency was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Core,
    Own,
    Context(ContextId),
    ThirdPartyCache,
    Repository,
}

/// Outcome of a dependency lookup.
#[derive(Debug, Clone)]
pub enum Resolution {
    Found {
        node: Arc<ModuleNode>,
        source: ResolutionSource,
    },
    /// Nothing matched; the requester's own root is handed back
    Fallback(Arc<ModuleNode>),
    /// Nothing matched and the requester has no root
    Unresolved,
}

impl Resolution {
    pub fn node(&self) -> Option<&Arc<ModuleNode>> {
        match self {
            Resolution::Found { node, .. } | Resolution::Fallback(node) => Some(node),
            Resolution::Unresolved => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found { .. })
    }

    pub fn source(&self) -> Option<ResolutionSource> {
        match self {
            Resolution::Found { source, .. } => Some(*source),
            _ => None,
        }
    }
}

struct Hit {
    node: Arc<ModuleNode>,
    source: ResolutionSource,
    owner: Option<Arc<LoadContext>>,
    /// Loaded by this lookup; its own dependencies are not linked yet
    fresh: bool,
}

struct ContextInner {
    state: ContextState,
    root: Option<Arc<ModuleNode>>,
    /// Every node loaded into this context
    modules: Vec<Arc<ModuleNode>>,
    natives: Vec<NativeHandle>,
    dependencies: BTreeMap<ContextId, Arc<LoadContext>>,
    dependents: Vec<(ContextId, Weak<LoadContext>)>,
    listeners: Vec<ContextListener>,
}

impl ContextInner {
    fn new(state: ContextState) -> Self {
        Self {
            state,
            root: None,
            modules: Vec::new(),
            natives: Vec::new(),
            dependencies: BTreeMap::new(),
            dependents: Vec::new(),
            listeners: Vec::new(),
        }
    }
}

/// An isolated resolution domain.
pub struct LoadContext {
    id: ContextId,
    name: String,
    registry: Arc<Registry>,
    package_dir: Option<PathBuf>,
    /// Where module files are read from: the shadow copy or the package
    load_dir: Option<PathBuf>,
    shadow_dir: Option<PathBuf>,
    inner: Mutex<ContextInner>,
}

impl LoadContext {
    /// Build a context for the package in `package_dir` and load its root.
    ///
    /// Non-read-only packages are shadow copied first when the registry has
    /// shadow copying enabled. The root's declared dependencies, native
    /// imports and package references are linked before this returns;
    /// unresolved ones are logged and do not fail construction.
    pub fn create(
        registry: &Arc<Registry>,
        package_dir: &Path,
        read_only: bool,
    ) -> Result<Arc<Self>> {
        let manifest = ManifestInfo::read(package_dir)?;
        let id = registry.next_context_id();
        let name = manifest.root_namespace.clone();

        let shadow_dir = match registry.shadow() {
            Some(shadow) if !read_only => Some(shadow.create(package_dir, &name, id)?),
            _ => None,
        };
        let cleanup = scopeguard::guard(shadow_dir.clone(), |dir| {
            if let (Some(dir), Some(shadow)) = (dir, registry.shadow()) {
                shadow.remove(&dir);
            }
        });

        let load_dir = shadow_dir
            .clone()
            .unwrap_or_else(|| package_dir.to_path_buf());
        let root_path = registry
            .scan_options()
            .platform
            .library_file_names(&manifest.assembly_file_name)
            .into_iter()
            .map(|file| load_dir.join(file))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                Error::load_failed(format!(
                    "Root module {} not found in {}",
                    manifest.assembly_file_name,
                    load_dir.display()
                ))
            })?;

        let context = Arc::new(Self {
            id,
            name,
            registry: Arc::clone(registry),
            package_dir: Some(package_dir.to_path_buf()),
            load_dir: Some(load_dir),
            shadow_dir,
            inner: Mutex::new(ContextInner::new(ContextState::Created)),
        });

        let root = context.load_module(&root_path)?;
        {
            let mut inner = context.inner.lock();
            inner.root = Some(Arc::clone(&root));
            inner.state = ContextState::Loaded;
        }
        registry.register(&context);
        let _ = scopeguard::ScopeGuard::into_inner(cleanup);

        tracing::info!(
            context = %context.id,
            package = %context.name,
            root = %root_path.display(),
            shadow = context.shadow_dir.is_some(),
            "Context loaded"
        );

        context.link_dependencies(&root);
        for reference in manifest
            .package_references
            .iter()
            .filter(|r| !r.resources_only)
        {
            context.resolve(&reference.identity, Some(&reference.version));
        }

        // A dependency may have cascaded its unload into us while we linked.
        if context.state().is_terminal() {
            return Err(Error::load_failed(format!(
                "Context {} ({}) was unloaded by a dependency while loading",
                context.id, context.name
            )));
        }

        Ok(context)
    }

    /// The context third-party binaries are loaded into. It has no root and
    /// no package directory.
    pub(crate) fn shared(registry: &Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            id: registry.next_context_id(),
            name: THIRD_PARTY_CONTEXT.to_string(),
            registry: Arc::clone(registry),
            package_dir: None,
            load_dir: None,
            shadow_dir: None,
            inner: Mutex::new(ContextInner::new(ContextState::Loaded)),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ContextState {
        self.inner.lock().state
    }

    pub fn root(&self) -> Option<Arc<ModuleNode>> {
        self.inner.lock().root.clone()
    }

    pub fn package_dir(&self) -> Option<&Path> {
        self.package_dir.as_deref()
    }

    pub fn load_dir(&self) -> Option<&Path> {
        self.load_dir.as_deref()
    }

    pub fn shadow_dir(&self) -> Option<&Path> {
        self.shadow_dir.as_deref()
    }

    /// Whether this is the shared third-party context.
    pub fn is_shared(&self) -> bool {
        self.package_dir.is_none()
    }

    /// Nodes loaded into this context.
    pub fn modules(&self) -> Vec<Arc<ModuleNode>> {
        self.inner.lock().modules.clone()
    }

    /// Contexts this one has a dependency edge onto.
    pub fn dependency_ids(&self) -> Vec<ContextId> {
        self.inner.lock().dependencies.keys().copied().collect()
    }

    /// Contexts with a dependency edge onto this one.
    pub fn dependent_ids(&self) -> Vec<ContextId> {
        self.inner
            .lock()
            .dependents
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether this context depends on `target`, directly or transitively.
    pub fn depends_on(&self, target: ContextId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = self.dependency_snapshot();
        while let Some(context) = stack.pop() {
            if context.id == target {
                return true;
            }
            if visited.insert(context.id) {
                stack.extend(context.dependency_snapshot());
            }
        }
        false
    }

    fn dependency_snapshot(&self) -> Vec<Arc<LoadContext>> {
        self.inner.lock().dependencies.values().cloned().collect()
    }

    /// Register a listener for unload notifications.
    pub fn subscribe(&self, listener: ContextListener) {
        self.inner.lock().listeners.push(listener);
    }

    /// Resolve `name` on behalf of this context's root.
    ///
    /// Never fails outright: when every tier misses, the error is logged and
    /// the root itself comes back as [`Resolution::Fallback`].
    pub fn resolve(self: &Arc<Self>, name: &str, version: Option<&Version>) -> Resolution {
        let anchor = self.root();
        self.resolve_from(anchor.as_ref(), name, version)
    }

    /// Like [`resolve`](Self::resolve), but a miss in every tier is an
    /// [`Error::Unresolved`] instead of a fallback to the root.
    pub fn require(
        self: &Arc<Self>,
        name: &str,
        version: Option<&Version>,
    ) -> Result<Arc<ModuleNode>> {
        match self.resolve(name, version) {
            Resolution::Found { node, .. } => Ok(node),
            Resolution::Fallback(_) | Resolution::Unresolved => Err(Error::unresolved(name)),
        }
    }

    fn resolve_from(
        self: &Arc<Self>,
        anchor: Option<&Arc<ModuleNode>>,
        name: &str,
        version: Option<&Version>,
    ) -> Resolution {
        if let Some(hit) = self.search(anchor, name, version) {
            let Hit {
                node,
                source,
                owner,
                fresh,
            } = hit;

            if let Some(anchor) = anchor {
                anchor.add_reference_to(&node);
            }
            if let Some(owner) = &owner {
                if owner.id != self.id {
                    self.add_dependency(owner);
                }
                if fresh {
                    owner.link_dependencies(&node);
                }
            }

            tracing::debug!(
                context = %self.id,
                dependency = name,
                source = ?source,
                node = %node.id(),
                "Resolved dependency"
            );
            return Resolution::Found { node, source };
        }

        tracing::error!(
            context = %self.id,
            package = %self.name,
            version = ?version.map(ToString::to_string),
            "{}",
            Error::unresolved(name)
        );
        match self.root() {
            Some(root) => Resolution::Fallback(root),
            None => Resolution::Unresolved,
        }
    }

    fn search(
        self: &Arc<Self>,
        anchor: Option<&Arc<ModuleNode>>,
        name: &str,
        version: Option<&Version>,
    ) -> Option<Hit> {
        if let Some(node) = self.registry.find_core(name) {
            return Some(Hit {
                node,
                source: ResolutionSource::Core,
                owner: None,
                fresh: false,
            });
        }

        let roots = self.search_roots(anchor);
        for root in &roots {
            if let Some(node) = root.try_find_existing(name) {
                let owner = self.owner_of(&node);
                return Some(Hit {
                    node,
                    source: ResolutionSource::Own,
                    owner,
                    fresh: false,
                });
            }
        }
        for root in &roots {
            if let Some(node) = self.load_unreferenced(root, name) {
                return Some(Hit {
                    node,
                    source: ResolutionSource::Own,
                    owner: Some(Arc::clone(self)),
                    fresh: true,
                });
            }
        }

        // Third-party binaries never reach into package contexts.
        let others: Vec<Arc<LoadContext>> = if self.is_shared() {
            Vec::new()
        } else {
            self.registry
                .live_contexts()
                .into_iter()
                .filter(|other| {
                    other.id != self.id
                        && other.state() == ContextState::Loaded
                        && !other.depends_on(self.id)
                })
                .collect()
        };

        for other in &others {
            if let Some(node) = other.find_existing(name) {
                let owner = other.owner_of(&node);
                return Some(Hit {
                    node,
                    source: ResolutionSource::Context(other.id),
                    owner,
                    fresh: false,
                });
            }
        }
        if let Some(node) = self.registry.cached_third_party(name) {
            let owner = self.owner_of(&node);
            return Some(Hit {
                node,
                source: ResolutionSource::ThirdPartyCache,
                owner,
                fresh: false,
            });
        }
        for other in &others {
            let Some(root) = other.root() else {
                continue;
            };
            if let Some(node) = other.load_unreferenced(&root, name) {
                return Some(Hit {
                    node,
                    source: ResolutionSource::Context(other.id),
                    owner: Some(Arc::clone(other)),
                    fresh: true,
                });
            }
        }

        self.load_from_repository(name, version)
    }

    fn load_from_repository(&self, name: &str, version: Option<&Version>) -> Option<Hit> {
        let resolved = self.registry.repository()?.resolve(name, version)?;
        let third_party = self.registry.third_party_context();

        let _guard = self.registry.repository_load_lock();
        if let Some(node) = self.registry.cached_third_party(name) {
            return Some(Hit {
                node,
                source: ResolutionSource::ThirdPartyCache,
                owner: Some(third_party),
                fresh: false,
            });
        }
        // Prefix matches can map two names onto one binary.
        if let Some(node) = third_party
            .modules()
            .into_iter()
            .find(|node| node.path() == Some(resolved.path.as_path()))
        {
            self.registry.cache_third_party(name, &node);
            return Some(Hit {
                node,
                source: ResolutionSource::ThirdPartyCache,
                owner: Some(third_party),
                fresh: false,
            });
        }

        match third_party.load_module(&resolved.path) {
            Ok(node) => {
                self.registry.cache_third_party(name, &node);
                tracing::info!(
                    dependency = name,
                    version = %resolved.version,
                    framework = %resolved.framework,
                    path = %resolved.path.display(),
                    "Loaded third-party module"
                );
                Some(Hit {
                    node,
                    source: ResolutionSource::Repository,
                    owner: Some(third_party),
                    fresh: true,
                })
            }
            Err(e) => {
                tracing::warn!(
                    dependency = name,
                    path = %resolved.path.display(),
                    "Failed to load third-party module: {}",
                    e
                );
                None
            }
        }
    }

    fn search_roots(&self, anchor: Option<&Arc<ModuleNode>>) -> Vec<Arc<ModuleNode>> {
        let mut roots: Vec<Arc<ModuleNode>> = self.root().into_iter().collect();
        if let Some(anchor) = anchor {
            if !roots.iter().any(|r| r.id() == anchor.id()) && anchor.owner() == Some(self.id) {
                roots.push(Arc::clone(anchor));
            }
        }
        roots
    }

    /// Linked node answering to `name`. The context name matches its root.
    fn find_existing(&self, name: &str) -> Option<Arc<ModuleNode>> {
        let root = self.root()?;
        if self.name.eq_ignore_ascii_case(name) {
            return Some(root);
        }
        root.try_find_existing(name)
    }

    fn load_unreferenced(&self, node: &Arc<ModuleNode>, name: &str) -> Option<Arc<ModuleNode>> {
        match node.try_find_unreferenced(name, self.registry.scan_options(), |path| {
            self.load_module(path)
        }) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    context = %self.id,
                    dependency = name,
                    "Failed to load sibling module: {}",
                    e
                );
                None
            }
        }
    }

    fn owner_of(self: &Arc<Self>, node: &ModuleNode) -> Option<Arc<LoadContext>> {
        match node.owner()? {
            id if id == self.id => Some(Arc::clone(self)),
            id => self.registry.find_context(id),
        }
    }

    /// Map `path` and add the node to this context's arena.
    fn load_module(&self, path: &Path) -> Result<Arc<ModuleNode>> {
        if self.state().is_terminal() {
            return Err(Error::load_failed(format!(
                "Context {} is unloading, refusing to load {}",
                self.id,
                path.display()
            )));
        }

        let module = self.registry.loader().load(path)?;
        let node = ModuleNode::loaded(self.registry.next_node_id(), self.id, module);

        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            drop(inner);
            node.release();
            return Err(Error::load_failed(format!(
                "Context {} started unloading while {} was loading",
                self.id,
                path.display()
            )));
        }
        inner.modules.push(Arc::clone(&node));
        drop(inner);

        tracing::debug!(
            context = %self.id,
            module = %node.name(),
            node = %node.id(),
            "Loaded module"
        );
        Ok(node)
    }

    /// Resolve the declared dependencies and native imports of `node`.
    fn link_dependencies(self: &Arc<Self>, node: &Arc<ModuleNode>) {
        for dependency in &node.exports().dependencies {
            if node.answers_to(&dependency.name) {
                continue;
            }
            self.resolve_from(Some(node), &dependency.name, dependency.version.as_ref());
        }
        for import in &node.exports().native_imports {
            let dir = self
                .load_dir
                .clone()
                .or_else(|| node.path().and_then(Path::parent).map(Path::to_path_buf));
            self.map_native(dir, import);
        }
    }

    /// Resolve and map an unmanaged library relative to this context's
    /// directory. Returns the mapped path.
    pub fn load_native(&self, name: &str) -> Option<PathBuf> {
        self.map_native(self.load_dir.clone(), name)
    }

    fn map_native(&self, search_dir: Option<PathBuf>, name: &str) -> Option<PathBuf> {
        let resolver = NativeLibraryResolver::new(search_dir)
            .with_platform(self.registry.scan_options().platform.clone());
        let path = resolver.resolve(name)?;

        if self.inner.lock().natives.iter().any(|h| h.path == path) {
            return Some(path);
        }
        match self.registry.loader().load_native(&path) {
            Ok(handle) => {
                let mut inner = self.inner.lock();
                if inner.state.is_terminal() {
                    return None;
                }
                inner.natives.push(handle);
                Some(path)
            }
            Err(e) => {
                tracing::warn!(
                    context = %self.id,
                    library = name,
                    "Failed to map native library: {}",
                    e
                );
                None
            }
        }
    }

    /// Number of native libraries held by this context.
    pub fn native_count(&self) -> usize {
        self.inner.lock().natives.len()
    }

    /// Record that this context depends on `other`. Idempotent.
    ///
    /// Refused when `other` already depends on this context or is unloading.
    fn add_dependency(self: &Arc<Self>, other: &Arc<LoadContext>) -> bool {
        if other.id == self.id {
            return false;
        }
        if other.depends_on(self.id) {
            tracing::debug!(
                context = %self.id,
                dependency = %other.id,
                "Skipping dependency edge that would create a cycle"
            );
            return false;
        }

        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() || inner.dependencies.contains_key(&other.id) {
                return false;
            }
            inner.dependencies.insert(other.id, Arc::clone(other));
        }

        let accepted = {
            let mut other_inner = other.inner.lock();
            if other_inner.state.is_terminal() {
                false
            } else {
                other_inner
                    .dependents
                    .push((self.id, Arc::downgrade(self)));
                true
            }
        };

        if accepted {
            tracing::debug!(context = %self.id, dependency = %other.id, "Registered dependency");
        } else {
            self.inner.lock().dependencies.remove(&other.id);
            tracing::warn!(
                context = %self.id,
                dependency = %other.id,
                "Dependency is already unloading"
            );
        }
        accepted
    }

    fn remove_dependent(&self, id: ContextId) {
        self.inner.lock().dependents.retain(|(dep, _)| *dep != id);
    }

    /// Start unloading this context and every context that depends on it.
    ///
    /// One-shot: a second call fails with [`Error::UnloadMisuse`], unless the
    /// registry is shutting down, in which case it is logged and ignored.
    /// Runs to completion before returning; all module and native handles are
    /// released and the shadow directory is removed.
    pub fn begin_unload(self: &Arc<Self>) -> Result<()> {
        self.unload(false)
    }

    fn unload(self: &Arc<Self>, cascaded: bool) -> Result<()> {
        let (dependencies, root, dependents, listeners) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                if cascaded {
                    return Ok(());
                }
                if self.registry.is_shutting_down() {
                    tracing::debug!(context = %self.id, "Repeated unload during shutdown ignored");
                    return Ok(());
                }
                return Err(Error::UnloadMisuse(format!(
                    "context {} ({}) is already {:?}",
                    self.id, self.name, inner.state
                )));
            }
            inner.state = ContextState::Unloading;
            (
                std::mem::take(&mut inner.dependencies),
                inner.root.take(),
                std::mem::take(&mut inner.dependents),
                inner.listeners.clone(),
            )
        };

        tracing::info!(
            context = %self.id,
            package = %self.name,
            dependents = dependents.len(),
            "Unloading context"
        );

        for dependency in dependencies.values() {
            dependency.remove_dependent(self.id);
        }
        drop(dependencies);
        self.registry.unregister(self.id);
        drop(root);

        for (id, dependent) in dependents {
            let Some(dependent) = dependent.upgrade() else {
                continue;
            };
            tracing::debug!(context = %self.id, dependent = %id, "Cascading unload");
            if let Err(e) = dependent.unload(true) {
                tracing::warn!(dependent = %id, "Cascaded unload failed: {}", e);
            }
        }

        self.notify(&listeners, ContextEvent::Unloading);

        let (modules, natives) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.modules),
                std::mem::take(&mut inner.natives),
            )
        };
        let released = modules.iter().filter(|node| node.release()).count();
        drop(modules);
        drop(natives);

        self.inner.lock().state = ContextState::Unloaded;
        if let (Some(dir), Some(shadow)) = (&self.shadow_dir, self.registry.shadow()) {
            shadow.remove(dir);
        }

        tracing::info!(context = %self.id, package = %self.name, released, "Context unloaded");
        self.notify(&listeners, ContextEvent::Unloaded);
        Ok(())
    }

    fn notify(&self, listeners: &[ContextListener], event: ContextEvent) {
        for listener in listeners {
            listener(self, event);
        }
    }
}

impl fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("load_dir", &self.load_dir)
            .finish()
    }
}
