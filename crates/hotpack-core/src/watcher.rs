//! Rebuild watching.
//!
//! Watches the directories of registered non-read-only packages and reloads
//! a package once its binaries or manifest stop changing for the debounce
//! window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::defaults::MANIFEST_FILE_NAME;
use crate::error::Result;
use crate::host::PackageHost;
use crate::platform::{self, Platform};

/// How often the worker wakes up to flush debounced events.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A watched package directory.
#[derive(Debug, Clone)]
pub struct WatchedPackage {
    pub name: String,
    pub directory: PathBuf,
}

/// Reloads packages when they are rebuilt. Dropping the watcher stops it.
pub struct PackageWatcher {
    _watcher: RecommendedWatcher,
    packages: Vec<WatchedPackage>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl PackageWatcher {
    /// Start watching every registered non-read-only package of `host`.
    pub fn start(host: Arc<PackageHost>) -> Result<Self> {
        let packages: Vec<WatchedPackage> = host
            .packages()
            .into_iter()
            .filter(|d| !d.is_read_only())
            .filter_map(|d| {
                let directory = d.directory()?;
                Some(WatchedPackage {
                    name: d.name(),
                    directory: directory.canonicalize().unwrap_or(directory),
                })
            })
            .collect();

        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        for package in &packages {
            watcher.watch(&package.directory, RecursiveMode::Recursive)?;
            tracing::debug!(
                package = %package.name,
                dir = %package.directory.display(),
                "Watching package"
            );
        }

        let config = host.registry().config();
        let filter = EventFilter {
            platform: platform::CURRENT.clone(),
            excluded_dirs: config.shadow_excluded_dirs.clone(),
        };
        let debounce = Duration::from_millis(config.watch_debounce_ms);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let packages = packages.clone();
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("hotpack-watcher".into())
                .spawn(move || run(host, packages, filter, rx, debounce, stop))?
        };

        tracing::info!(packages = packages.len(), "Package watcher started");
        Ok(Self {
            _watcher: watcher,
            packages,
            stop,
            worker: Some(worker),
        })
    }

    pub fn packages(&self) -> &[WatchedPackage] {
        &self.packages
    }
}

impl Drop for PackageWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(
    host: Arc<PackageHost>,
    packages: Vec<WatchedPackage>,
    filter: EventFilter,
    rx: Receiver<notify::Result<Event>>,
    debounce: Duration,
    stop: Arc<AtomicBool>,
) {
    let mut pending: HashMap<String, Instant> = HashMap::new();

    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(event)) => {
                if !is_rebuild_event(&event.kind) {
                    continue;
                }
                for path in &event.paths {
                    if !filter.is_relevant(path) {
                        continue;
                    }
                    if let Some(name) = package_for(&packages, path) {
                        pending.insert(name.to_string(), Instant::now());
                    }
                }
            }
            Ok(Err(e)) => tracing::warn!("File watch error: {}", e),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let ready: Vec<String> = pending
            .iter()
            .filter(|(_, changed)| changed.elapsed() >= debounce)
            .map(|(name, _)| name.clone())
            .collect();
        for name in ready {
            pending.remove(&name);
            tracing::info!(package = %name, "Package changed on disk");
            if !host.reload(&name) {
                tracing::warn!(package = %name, "Reload after rebuild failed");
            }
        }
    }
    tracing::debug!("Package watcher stopped");
}

fn is_rebuild_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Decides which changed files warrant a reload.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub platform: Platform,
    pub excluded_dirs: Vec<String>,
}

impl EventFilter {
    /// Loadable binaries and manifests outside hidden or build folders.
    pub fn is_relevant(&self, path: &Path) -> bool {
        let in_excluded = path.parent().into_iter().flat_map(Path::components).any(|c| {
            let part = c.as_os_str().to_string_lossy();
            (part.starts_with('.') && part.len() > 1 && part != "..")
                || self
                    .excluded_dirs
                    .iter()
                    .any(|d| d.eq_ignore_ascii_case(&part))
        });
        if in_excluded {
            return false;
        }

        let is_manifest = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.eq_ignore_ascii_case(MANIFEST_FILE_NAME))
            .unwrap_or(false);
        is_manifest || self.platform.is_loadable(path)
    }
}

/// Package whose directory contains `path`; the deepest directory wins.
pub fn package_for<'a>(packages: &'a [WatchedPackage], path: &Path) -> Option<&'a str> {
    packages
        .iter()
        .filter(|p| path.starts_with(&p.directory))
        .max_by_key(|p| p.directory.components().count())
        .map(|p| p.name.as_str())
}
