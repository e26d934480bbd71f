//! Package descriptor lifecycle.

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Fixture, JsonModuleLoader, ModuleSpec};
use hotpack_core::error::Result;
use hotpack_core::module::{LoadedModule, ModuleLoader, NativeHandle};
use hotpack_core::{
    platform, ContextEvent, LoadContext, PackageDescriptor, PackageEvent, Registry,
};
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

const ADD_ID: &str = "5f3c1c9e-52b4-4cb4-9d0d-6c0f5f0d7a11";
const MUL_ID: &str = "5f3c1c9e-52b4-4cb4-9d0d-6c0f5f0d7a12";

fn math_module() -> ModuleSpec {
    ModuleSpec::new("Lib.Math")
        .version("1.0.0")
        .exports_type(ADD_ID, "Add")
        .exports_type(MUL_ID, "Multiply")
}

#[test]
fn test_try_load_types_is_idempotent() {
    common::init_tracing();
    let fixture = Fixture::new();
    let dir = fixture.package(&math_module(), "1.0.0", &[]);
    let loader = JsonModuleLoader::new();
    let registry = Registry::new(fixture.config(), loader.clone());

    let descriptor = PackageDescriptor::new(registry);
    descriptor.initialize(&dir, false).unwrap();

    assert!(descriptor.try_load_types());
    assert!(descriptor.try_load_types());
    assert_eq!(loader.loads_of("Lib.Math"), 1);

    let types = descriptor.types();
    assert_eq!(types.len(), 2);
    let add = descriptor.get_type(&Uuid::parse_str(ADD_ID).unwrap()).unwrap();
    assert_eq!(add.full_name(), "Lib.Math.Add");
    assert!(descriptor.namespaces().contains("Lib.Math"));
}

#[test]
fn test_extraction_failure_is_cached() {
    let fixture = Fixture::new();
    let broken = ModuleSpec::new("Broken")
        .exports_type(ADD_ID, "First")
        .exports_type(ADD_ID, "Second");
    let dir = fixture.package(&broken, "1.0.0", &[]);
    let loader = JsonModuleLoader::new();
    let registry = Registry::new(fixture.config(), loader.clone());

    let descriptor = PackageDescriptor::new(registry);
    descriptor.initialize(&dir, true).unwrap();

    assert!(!descriptor.try_load_types());
    assert!(!descriptor.try_load_types());
    assert_eq!(loader.loads_of("Broken"), 1);
    // loaded but inert
    assert!(descriptor.is_loaded());
    assert!(descriptor.types().is_empty());
}

#[test]
fn test_unload_fires_events_and_allows_reload() {
    let fixture = Fixture::new();
    let dir = fixture.package(&math_module(), "1.0.0", &[]);
    let loader = JsonModuleLoader::new();
    let registry = Registry::new(fixture.config(), loader.clone());

    let descriptor = PackageDescriptor::new(registry);
    descriptor.initialize(&dir, false).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    descriptor.on_event(Arc::new(move |d: &PackageDescriptor, event: PackageEvent| {
        seen.lock().push((event, d.is_loaded()));
    }));

    assert!(descriptor.try_load_types());
    let context = descriptor.context().unwrap();
    descriptor.unload();

    assert!(!descriptor.is_loaded());
    assert!(descriptor.types().is_empty());
    assert!(context.state().is_terminal());
    assert_eq!(
        *events.lock(),
        vec![
            (PackageEvent::Loaded, true),
            (PackageEvent::Unloaded, false),
            (PackageEvent::UnloadComplete, false),
        ]
    );

    // unloading again is a no-op
    descriptor.unload();
    assert_eq!(events.lock().len(), 3);

    assert!(descriptor.try_load_types());
    assert_eq!(loader.loads_of("Lib.Math"), 2);
    assert_ne!(descriptor.context().unwrap().id(), context.id());
}

#[test]
fn test_release_info_is_cached() {
    let fixture = Fixture::new();
    let dir = fixture.package(&math_module(), "1.4.0", &[("Core", "1.2.0")]);
    let registry = Registry::new(fixture.config(), JsonModuleLoader::new());

    let descriptor = PackageDescriptor::new(registry);
    descriptor.initialize(&dir, true).unwrap();

    let info = descriptor.try_get_release_info().unwrap();
    assert_eq!(info.root_namespace, "Lib.Math");
    assert_eq!(info.package_references.len(), 1);

    std::fs::remove_file(dir.join("package-info.json")).unwrap();
    assert!(descriptor.try_get_release_info().is_some());
}

#[test]
fn test_malformed_manifest() {
    let fixture = Fixture::new();
    let dir = fixture.package(&math_module(), "1.0.0", &[]);
    std::fs::write(dir.join("package-info.json"), "{ not json").unwrap();
    let registry = Registry::new(fixture.config(), JsonModuleLoader::new());

    let descriptor = PackageDescriptor::new(registry);
    descriptor.initialize(&dir, true).unwrap();

    assert!(descriptor.try_get_release_info().is_none());
    assert!(!descriptor.try_load_types());
}

/// Holds loads of one module until the gate opens.
struct GatedLoader {
    inner: Arc<JsonModuleLoader>,
    gated: &'static str,
    entered: AtomicBool,
    open: Mutex<bool>,
    opened: Condvar,
}

impl GatedLoader {
    fn new(inner: Arc<JsonModuleLoader>, gated: &'static str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gated,
            entered: AtomicBool::new(false),
            open: Mutex::new(false),
            opened: Condvar::new(),
        })
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

impl ModuleLoader for GatedLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModule>> {
        if platform::module_name_of(path).as_deref() == Some(self.gated) {
            self.entered.store(true, Ordering::SeqCst);
            let mut open = self.open.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
        }
        self.inner.load(path)
    }

    fn load_native(&self, path: &Path) -> Result<NativeHandle> {
        self.inner.load_native(path)
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_cascade_during_load_leaves_descriptor_retryable() {
    let fixture = Fixture::new();
    let core_dir = fixture.package(&ModuleSpec::new("Core"), "1.0.0", &[]);
    let editor = ModuleSpec::new("Editor")
        .depends_on("Core", None)
        .depends_on("Trigger", None)
        .exports_type(ADD_ID, "Add");
    let editor_dir = fixture.package(&editor, "1.0.0", &[]);
    ModuleSpec::new("Trigger").write_to(&editor_dir);

    let json = JsonModuleLoader::new();
    let loader = GatedLoader::new(json.clone(), "Trigger");
    let registry = Registry::new(fixture.config(), loader.clone());
    let core = LoadContext::create(&registry, &core_dir, true).unwrap();

    let descriptor = PackageDescriptor::new(Arc::clone(&registry));
    descriptor.initialize(&editor_dir, true).unwrap();

    let loading = {
        let descriptor = Arc::clone(&descriptor);
        std::thread::spawn(move || descriptor.try_load_types())
    };
    wait_until("the sibling load", || loader.entered.load(Ordering::SeqCst));

    // Editor already holds an edge onto Core, so this cascades into it.
    let unloading = {
        let core = Arc::clone(&core);
        std::thread::spawn(move || core.begin_unload())
    };
    wait_until("the cascade", || {
        registry.live_contexts().iter().all(|c| c.name() != "Editor")
    });
    loader.open();

    assert!(!loading.join().unwrap());
    unloading.join().unwrap().unwrap();
    assert!(!descriptor.is_loaded());
    assert!(descriptor.types().is_empty());

    descriptor.unload();
    assert!(descriptor.try_load_types());
    assert!(descriptor.is_loaded());
    assert_eq!(descriptor.types().len(), 1);
    assert_eq!(json.loads_of("Editor"), 2);
}

#[test]
fn test_unload_while_context_is_cascading() {
    let fixture = Fixture::new();
    let core_dir = fixture.package(&ModuleSpec::new("Core"), "1.0.0", &[]);
    let math_dir = fixture.package(&math_module().depends_on("Core", None), "1.0.0", &[]);
    let loader = JsonModuleLoader::new();
    let registry = Registry::new(fixture.config(), loader.clone());
    let core = LoadContext::create(&registry, &core_dir, true).unwrap();

    let descriptor = PackageDescriptor::new(Arc::clone(&registry));
    descriptor.initialize(&math_dir, true).unwrap();
    assert!(descriptor.try_load_types());

    let seen_types = Arc::new(Mutex::new(None));
    {
        let descriptor = Arc::clone(&descriptor);
        let seen_types = Arc::clone(&seen_types);
        descriptor.context().unwrap().subscribe(Arc::new(
            move |_: &LoadContext, event: ContextEvent| {
                if event == ContextEvent::Unloading {
                    descriptor.unload();
                    *seen_types.lock() = Some(descriptor.types().len());
                }
            },
        ));
    }

    core.begin_unload().unwrap();
    assert_eq!(*seen_types.lock(), Some(0));
    assert!(!descriptor.is_loaded());

    assert!(descriptor.try_load_types());
    assert_eq!(descriptor.types().len(), 2);
    assert_eq!(loader.loads_of("Lib.Math"), 2);
}
