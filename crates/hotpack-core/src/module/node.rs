//! Module nodes: one loaded module plus its reference graph.
//!
//! A node keeps two disjoint collections:
//! - `references`: nodes it is linked to (a DAG)
//! - `candidates`: sibling files next to its binary that have not been
//!   loaded yet, scanned lazily on the first unreferenced lookup
//!
//! An entry moves from `candidates` to `references` at most once.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{LoadedModule, ModuleExports};
use crate::context::ContextId;
use crate::error::Result;
use crate::platform::{self, Platform};

/// Maximum folder depth of the sibling scan.
const MAX_SCAN_DEPTH: usize = 8;

/// Identifier of a module node, unique within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// How sibling candidates are discovered.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub recurse: bool,
    pub platform: Platform,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recurse: true,
            platform: platform::CURRENT.clone(),
        }
    }
}

#[derive(Default)]
struct Links {
    references: Vec<Arc<ModuleNode>>,
    /// `None` until the first scan; keyed by file name
    candidates: Option<BTreeMap<String, PathBuf>>,
}

/// One module plus its discovered reference graph.
pub struct ModuleNode {
    id: NodeId,
    name: String,
    path: Option<PathBuf>,
    owner: Option<ContextId>,
    exports: ModuleExports,
    handle: Mutex<Option<Box<dyn LoadedModule>>>,
    links: Mutex<Links>,
}

impl ModuleNode {
    /// Wrap a module loaded into context `owner`.
    pub fn loaded(id: NodeId, owner: ContextId, module: Box<dyn LoadedModule>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: module.name().to_string(),
            path: Some(module.path().to_path_buf()),
            owner: Some(owner),
            exports: module.exports().clone(),
            handle: Mutex::new(Some(module)),
            links: Mutex::new(Links::default()),
        })
    }

    /// A module the host already provides. It has no file and no owner.
    pub fn host(id: NodeId, name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            id,
            exports: ModuleExports::host(name.clone()),
            name,
            path: None,
            owner: None,
            handle: Mutex::new(None),
            links: Mutex::new(Links {
                references: Vec::new(),
                candidates: Some(BTreeMap::new()),
            }),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Context that owns the module, `None` for host modules.
    pub fn owner(&self) -> Option<ContextId> {
        self.owner
    }

    pub fn exports(&self) -> &ModuleExports {
        &self.exports
    }

    pub fn file_name(&self) -> Option<String> {
        self.path
            .as_ref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(|n| n.to_string())
    }

    /// Whether the module is still mapped (always true for host modules).
    pub fn is_loaded(&self) -> bool {
        self.owner.is_none() || self.handle.lock().is_some()
    }

    /// Whether this node answers to `name`.
    pub fn answers_to(&self, name: &str) -> bool {
        if self.name.eq_ignore_ascii_case(name) {
            return true;
        }
        self.path
            .as_deref()
            .and_then(platform::module_name_of)
            .map(|stem| platform::stem_matches(&stem, name))
            .unwrap_or(false)
    }

    /// Snapshot of the linked references.
    pub fn references(&self) -> Vec<Arc<ModuleNode>> {
        self.links.lock().references.clone()
    }

    /// Snapshot of the unreferenced candidates, `None` before the first scan.
    pub fn candidates(&self) -> Option<BTreeMap<String, PathBuf>> {
        self.links.lock().candidates.clone()
    }

    /// Link `other` as a reference of this node.
    ///
    /// Idempotent. Self-edges and edges that would close a cycle are refused.
    /// Returns whether a new edge was added.
    pub fn add_reference_to(&self, other: &Arc<ModuleNode>) -> bool {
        if other.id == self.id {
            return false;
        }
        if other.reaches(self.id) {
            tracing::debug!(
                from = %self.name,
                to = %other.name,
                "Skipping reference that would create a cycle"
            );
            return false;
        }

        let mut links = self.links.lock();
        if let (Some(candidates), Some(file)) = (links.candidates.as_mut(), other.file_name()) {
            candidates.remove(&file);
        }
        if links.references.iter().any(|r| r.id == other.id) {
            return false;
        }
        links.references.push(Arc::clone(other));
        true
    }

    /// Depth-first search for `name` over this node and its references.
    ///
    /// Unreferenced candidates are not consulted.
    pub fn try_find_existing(self: &Arc<Self>, name: &str) -> Option<Arc<ModuleNode>> {
        let mut visited = HashSet::new();
        Self::find_existing_in(self, name, &mut visited)
    }

    fn find_existing_in(
        node: &Arc<ModuleNode>,
        name: &str,
        visited: &mut HashSet<NodeId>,
    ) -> Option<Arc<ModuleNode>> {
        if !visited.insert(node.id) {
            return None;
        }
        if node.answers_to(name) {
            return Some(Arc::clone(node));
        }
        for child in node.references() {
            if let Some(found) = Self::find_existing_in(&child, name, visited) {
                return Some(found);
            }
        }
        None
    }

    /// Whether `target` is reachable from this node (including itself).
    fn reaches(&self, target: NodeId) -> bool {
        if self.id == target {
            return true;
        }
        let mut visited = HashSet::new();
        let mut stack = self.references();
        while let Some(node) = stack.pop() {
            if node.id == target {
                return true;
            }
            if visited.insert(node.id) {
                stack.extend(node.references());
            }
        }
        false
    }

    /// Load a sibling file answering to `name` and link it.
    ///
    /// The sibling scan runs once per node. A matching candidate is handed to
    /// `load`, which maps it into the owning context; on success the new node
    /// moves from the candidates to the references. Only this node's own
    /// candidates are searched, never those of its references.
    pub fn try_find_unreferenced<F>(
        &self,
        name: &str,
        options: &ScanOptions,
        load: F,
    ) -> Result<Option<Arc<ModuleNode>>>
    where
        F: FnOnce(&Path) -> Result<Arc<ModuleNode>>,
    {
        let mut links = self.links.lock();

        if links.candidates.is_none() {
            let scanned = self.scan_candidates(&links.references, options);
            tracing::debug!(
                module = %self.name,
                candidates = scanned.len(),
                "Scanned sibling modules"
            );
            links.candidates = Some(scanned);
        }

        let found = links.candidates.as_ref().and_then(|candidates| {
            candidates
                .iter()
                .find(|(_, path)| {
                    platform::module_name_of(path)
                        .map(|stem| platform::stem_matches(&stem, name))
                        .unwrap_or(false)
                })
                .map(|(file, path)| (file.clone(), path.clone()))
        });

        let Some((file, path)) = found else {
            return Ok(None);
        };

        let node = load(&path)?;
        if let Some(candidates) = links.candidates.as_mut() {
            candidates.remove(&file);
        }
        if !links.references.iter().any(|r| r.id == node.id) {
            links.references.push(Arc::clone(&node));
        }
        Ok(Some(node))
    }

    fn scan_candidates(
        &self,
        references: &[Arc<ModuleNode>],
        options: &ScanOptions,
    ) -> BTreeMap<String, PathBuf> {
        let mut candidates = BTreeMap::new();
        let (Some(own_path), Some(dir)) = (self.path.as_deref(), self.path().and_then(Path::parent))
        else {
            return candidates;
        };

        let referenced: HashSet<String> = references.iter().filter_map(|r| r.file_name()).collect();
        scan_dir(dir, own_path, &referenced, options, 0, &mut candidates);
        candidates
    }

    /// Unmap the module. Returns whether a handle was released.
    pub(crate) fn release(&self) -> bool {
        let released = self.handle.lock().take().is_some();
        if released {
            self.links.lock().references.clear();
        }
        released
    }
}

fn scan_dir(
    dir: &Path,
    own_path: &Path,
    referenced: &HashSet<String>,
    options: &ScanOptions,
    depth: usize,
    candidates: &mut BTreeMap<String, PathBuf>,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };

        if path.is_dir() {
            if options.recurse
                && depth < MAX_SCAN_DEPTH
                && !file_name.starts_with('.')
                && options.platform.accepts_folder(&file_name)
            {
                subdirs.push(path);
            }
            continue;
        }

        if !options.platform.is_loadable(&path)
            || path == own_path
            || referenced.contains(&file_name)
        {
            continue;
        }
        candidates.entry(file_name).or_insert(path);
    }

    subdirs.sort();
    for subdir in subdirs {
        scan_dir(&subdir, own_path, referenced, options, depth + 1, candidates);
    }
}

impl fmt::Debug for ModuleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path)
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleExports;

    struct StubModule {
        exports: ModuleExports,
        path: PathBuf,
    }

    impl LoadedModule for StubModule {
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

    fn node(id: u64, path: &Path) -> Arc<ModuleNode> {
        let name = platform::module_name_of(path).unwrap();
        ModuleNode::loaded(
            NodeId(id),
            ContextId(1),
            Box::new(StubModule {
                exports: ModuleExports::host(name),
                path: path.to_path_buf(),
            }),
        )
    }

    fn lib(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(format!("{}.{}", name, platform::CURRENT.library_extension()));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, name).unwrap();
        path
    }

    #[test]
    fn test_add_reference_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = node(1, &lib(dir.path(), "Root"));
        let child = node(2, &lib(dir.path(), "Child"));

        assert!(root.add_reference_to(&child));
        assert!(!root.add_reference_to(&child));
        assert_eq!(root.references().len(), 1);
    }

    #[test]
    fn test_add_reference_refuses_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let a = node(1, &lib(dir.path(), "A"));
        let b = node(2, &lib(dir.path(), "B"));
        let c = node(3, &lib(dir.path(), "C"));

        assert!(a.add_reference_to(&b));
        assert!(b.add_reference_to(&c));
        assert!(!c.add_reference_to(&a));
        assert!(!a.add_reference_to(&a));
    }

    #[test]
    fn test_find_existing_is_depth_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = node(1, &lib(dir.path(), "Root"));
        let a = node(2, &lib(dir.path(), "A"));
        let deep = node(3, &lib(dir.path(), "Deep"));
        root.add_reference_to(&a);
        a.add_reference_to(&deep);

        assert_eq!(root.try_find_existing("deep").unwrap().id(), NodeId(3));
        assert_eq!(root.try_find_existing("Root").unwrap().id(), NodeId(1));
        assert!(root.try_find_existing("Missing").is_none());
        // candidates are never scanned by the existing lookup
        assert!(root.candidates().is_none());
    }

    #[test]
    fn test_unreferenced_moves_to_references_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = node(1, &lib(dir.path(), "Root"));
        let sibling_path = lib(dir.path(), "Sibling");
        let options = ScanOptions::default();

        let mut loads = 0;
        let found = root
            .try_find_unreferenced("Sibling", &options, |path| {
                loads += 1;
                Ok(node(2, path))
            })
            .unwrap()
            .unwrap();
        assert_eq!(found.path(), Some(sibling_path.as_path()));
        assert_eq!(loads, 1);

        let candidates = root.candidates().unwrap();
        assert!(candidates.is_empty());
        assert_eq!(root.references().len(), 1);

        let again = root
            .try_find_unreferenced("Sibling", &options, |_| panic!("must not reload"))
            .unwrap();
        assert!(again.is_none());
        assert_eq!(root.try_find_existing("Sibling").unwrap().id(), NodeId(2));
    }

    #[test]
    fn test_scan_excludes_own_path_and_foreign_platforms() {
        let dir = tempfile::tempdir().unwrap();
        let root = node(1, &lib(dir.path(), "Root"));
        lib(&dir.path().join("plugins"), "Nested");
        lib(&dir.path().join(platform::CURRENT.identifier()), "NativeHere");
        let foreign = if platform::CURRENT.identifier() == "win-x64" {
            "linux-x64"
        } else {
            "win-x64"
        };
        lib(&dir.path().join(foreign), "NativeElsewhere");
        lib(&dir.path().join(".git"), "Hidden");

        let _ = root
            .try_find_unreferenced("nothing", &ScanOptions::default(), |_| unreachable!())
            .unwrap();
        let names: Vec<String> = root
            .candidates()
            .unwrap()
            .keys()
            .map(|k| k.split('.').next().unwrap().to_string())
            .collect();

        assert!(names.contains(&"Nested".to_string()));
        assert!(names.contains(&"NativeHere".to_string()));
        assert!(!names.contains(&"NativeElsewhere".to_string()));
        assert!(!names.contains(&"Hidden".to_string()));
        assert!(!names.contains(&"Root".to_string()));
    }

    #[test]
    fn test_scan_without_recursion() {
        let dir = tempfile::tempdir().unwrap();
        let root = node(1, &lib(dir.path(), "Root"));
        lib(&dir.path().join("plugins"), "Nested");
        let options = ScanOptions {
            recurse: false,
            ..ScanOptions::default()
        };

        let found = root
            .try_find_unreferenced("Nested", &options, |_| unreachable!())
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_add_reference_consumes_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let root = node(1, &lib(dir.path(), "Root"));
        let sibling = lib(dir.path(), "Sibling");
        let _ = root
            .try_find_unreferenced("nothing", &ScanOptions::default(), |_| unreachable!())
            .unwrap();
        assert_eq!(root.candidates().unwrap().len(), 1);

        root.add_reference_to(&node(7, &sibling));
        assert!(root.candidates().unwrap().is_empty());
    }

    #[test]
    fn test_release_unmaps_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = node(1, &lib(dir.path(), "Root"));
        assert!(root.is_loaded());
        assert!(root.release());
        assert!(!root.is_loaded());
        assert!(!root.release());
    }

    #[test]
    fn test_host_node() {
        let core = ModuleNode::host(NodeId(9), "std");
        assert!(core.is_loaded());
        assert!(core.owner().is_none());
        assert!(core.answers_to("STD"));
        let found = core
            .try_find_unreferenced("std", &ScanOptions::default(), |_| unreachable!())
            .unwrap();
        assert!(found.is_none());
    }
}
