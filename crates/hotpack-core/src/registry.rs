//! Process-wide loader state.
//!
//! One `Registry` is constructed at startup and shared by every context and
//! descriptor. It owns the host-provided core modules, the list of live
//! contexts, the third-party cache and its shared context, and the shutdown
//! flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::HostConfig;
use crate::context::{ContextId, LoadContext};
use crate::module::{ModuleLoader, ModuleNode, NodeId, ScanOptions};
use crate::repository::PackageRepositoryResolver;
use crate::shadow::ShadowCopyManager;

#[derive(Default)]
struct ThirdParty {
    context: Option<Arc<LoadContext>>,
    /// Keyed by lowercase dependency name
    cache: HashMap<String, Arc<ModuleNode>>,
}

/// Shared loader state.
pub struct Registry {
    config: HostConfig,
    loader: Arc<dyn ModuleLoader>,
    core_nodes: Vec<Arc<ModuleNode>>,
    live: Mutex<Vec<(ContextId, Weak<LoadContext>)>>,
    third_party: Mutex<ThirdParty>,
    /// Serializes store loads so one version is mapped once
    repository_load: Mutex<()>,
    repository: Option<PackageRepositoryResolver>,
    shadow: Option<ShadowCopyManager>,
    scan: ScanOptions,
    next_context: AtomicU64,
    next_node: AtomicU64,
    shutting_down: AtomicBool,
}

impl Registry {
    pub fn new(config: HostConfig, loader: Arc<dyn ModuleLoader>) -> Arc<Self> {
        let next_node = AtomicU64::new(1);
        let core_nodes = config
            .core_modules
            .iter()
            .map(|name| ModuleNode::host(NodeId(next_node.fetch_add(1, Ordering::Relaxed)), name))
            .collect();

        let repository = config
            .store_root
            .as_ref()
            .map(|root| PackageRepositoryResolver::new(root, config.frameworks.clone()));

        let shadow = config.shadow_copy.then(|| {
            let manager =
                ShadowCopyManager::new(&config.shadow_root, config.shadow_excluded_dirs.clone());
            manager.purge_stale(&[]);
            manager
        });

        let scan = ScanOptions {
            recurse: config.scan_subdirectories,
            ..ScanOptions::default()
        };

        tracing::debug!(
            core_modules = config.core_modules.len(),
            store = ?config.store_root,
            shadow_copy = config.shadow_copy,
            "Registry created"
        );

        Arc::new(Self {
            config,
            loader,
            core_nodes,
            live: Mutex::new(Vec::new()),
            third_party: Mutex::new(ThirdParty::default()),
            repository_load: Mutex::new(()),
            repository,
            shadow,
            scan,
            next_context: AtomicU64::new(1),
            next_node,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn loader(&self) -> &Arc<dyn ModuleLoader> {
        &self.loader
    }

    pub fn scan_options(&self) -> &ScanOptions {
        &self.scan
    }

    pub fn repository(&self) -> Option<&PackageRepositoryResolver> {
        self.repository.as_ref()
    }

    pub fn shadow(&self) -> Option<&ShadowCopyManager> {
        self.shadow.as_ref()
    }

    pub(crate) fn next_context_id(&self) -> ContextId {
        ContextId(self.next_context.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_node_id(&self) -> NodeId {
        NodeId(self.next_node.fetch_add(1, Ordering::Relaxed))
    }

    /// Host-provided module answering to `name`.
    pub fn find_core(&self, name: &str) -> Option<Arc<ModuleNode>> {
        self.core_nodes
            .iter()
            .find(|node| node.answers_to(name))
            .cloned()
    }

    pub(crate) fn register(&self, context: &Arc<LoadContext>) {
        let mut live = self.live.lock();
        live.retain(|(_, weak)| weak.strong_count() > 0);
        live.push((context.id(), Arc::downgrade(context)));
    }

    pub(crate) fn unregister(&self, id: ContextId) {
        self.live.lock().retain(|(live_id, _)| *live_id != id);
    }

    /// Snapshot of the live package contexts.
    ///
    /// The lock is released before the caller searches any of them.
    pub fn live_contexts(&self) -> Vec<Arc<LoadContext>> {
        self.live
            .lock()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    /// Live context (or the third-party context) with the given id.
    pub fn find_context(&self, id: ContextId) -> Option<Arc<LoadContext>> {
        let live = self
            .live
            .lock()
            .iter()
            .find(|(live_id, _)| *live_id == id)
            .and_then(|(_, weak)| weak.upgrade());
        live.or_else(|| {
            self.third_party
                .lock()
                .context
                .as_ref()
                .filter(|context| context.id() == id)
                .cloned()
        })
    }

    pub fn cached_third_party(&self, name: &str) -> Option<Arc<ModuleNode>> {
        self.third_party
            .lock()
            .cache
            .get(&name.to_lowercase())
            .cloned()
    }

    pub(crate) fn cache_third_party(&self, name: &str, node: &Arc<ModuleNode>) {
        self.third_party
            .lock()
            .cache
            .insert(name.to_lowercase(), Arc::clone(node));
    }

    /// The shared context third-party binaries are loaded into.
    pub fn third_party_context(self: &Arc<Self>) -> Arc<LoadContext> {
        let mut third_party = self.third_party.lock();
        if let Some(context) = &third_party.context {
            return Arc::clone(context);
        }
        let context = LoadContext::shared(self);
        third_party.context = Some(Arc::clone(&context));
        context
    }

    pub(crate) fn repository_load_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.repository_load.lock()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Unload every context and drop the third-party cache.
    ///
    /// Repeated unload requests issued while this runs are no-ops.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let contexts = self.live_contexts();
        tracing::info!(contexts = contexts.len(), "Shutting down registry");

        for context in contexts {
            if let Err(e) = context.begin_unload() {
                tracing::warn!(context = %context.id(), "Unload during shutdown failed: {}", e);
            }
        }

        let third_party = {
            let mut third_party = self.third_party.lock();
            third_party.cache.clear();
            third_party.context.take()
        };
        if let Some(context) = third_party {
            if let Err(e) = context.begin_unload() {
                tracing::warn!("Third-party context unload failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("core_nodes", &self.core_nodes.len())
            .field("live", &self.live.lock().len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
