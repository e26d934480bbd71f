//! hotpack command-line interface.
//!
//! Inspect package manifests, load packages into a host, query the
//! third-party store and watch package directories for rebuilds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hotpack_core::config::env_vars;
use hotpack_core::version;
use hotpack_core::{
    HostConfig, LibraryModuleLoader, ManifestInfo, PackageHost, PackageRepositoryResolver,
    PackageWatcher, SlotSchema,
};

#[derive(Parser, Debug)]
#[command(name = "hotpack")]
#[command(author, version, about = "Hot-reloadable content package loader", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a package manifest
    Inspect {
        /// Package directory
        dir: PathBuf,
    },

    /// Load packages and list the types they export
    Load {
        /// Package directories
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        /// Load in place without shadow copies
        #[arg(long)]
        read_only: bool,
    },

    /// Resolve a third-party module against the package store
    Resolve {
        /// Module name
        name: String,

        /// Requested version
        #[arg(long)]
        version: Option<String>,

        /// Package store root (overrides configuration)
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Load packages and reload them when they are rebuilt
    Watch {
        /// Package directories
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if args.verbose { "hotpack=debug" } else { "hotpack=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(default_level)
                .add_directive(tracing::Level::WARN.into())
        });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Inspect { dir } => run_inspect(&dir),
        Command::Load { dirs, read_only } => run_load(config, &dirs, read_only),
        Command::Resolve {
            name,
            version,
            store,
        } => run_resolve(config, &name, version.as_deref(), store),
        Command::Watch { dirs } => run_watch(config, &dirs),
    }
}

fn load_config(path: Option<&Path>) -> Result<HostConfig> {
    match path {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(HostConfig::from_env()),
    }
}

fn run_inspect(dir: &Path) -> Result<()> {
    let manifest = ManifestInfo::read(dir)
        .with_context(|| format!("Failed to read manifest in {}", dir.display()))?;

    println!("Package:        {}", dir.display());
    println!("RootNamespace:  {}", manifest.root_namespace);
    println!("AssemblyFile:   {}", manifest.assembly_file_name);
    println!("Version:        {}", manifest.version);
    println!("EditorVersion:  {}", manifest.editor_version);
    println!("HomeId:         {}", manifest.home_id);
    println!("EditorOnly:     {}", manifest.is_editor_only);

    if manifest.package_references.is_empty() {
        println!("References:     none");
    } else {
        println!("References:");
        for reference in &manifest.package_references {
            let suffix = if reference.resources_only { " (resources only)" } else { "" };
            println!("  {} {}{}", reference.identity, reference.version, suffix);
        }
    }
    Ok(())
}

fn build_host(config: HostConfig, dirs: &[PathBuf], read_only: bool) -> Result<Arc<PackageHost>> {
    let host = Arc::new(PackageHost::new(config, Arc::new(LibraryModuleLoader::new())));
    for dir in dirs {
        host.register(dir, read_only)
            .with_context(|| format!("Failed to register {}", dir.display()))?;
    }
    Ok(host)
}

fn print_packages(host: &PackageHost) {
    for package in host.packages() {
        let status = if package.is_loaded() { "loaded" } else { "failed" };
        println!("{} [{}]", package.name(), status);

        let mut types: Vec<_> = package.types().into_values().collect();
        types.sort_by(|a, b| a.full_name().cmp(&b.full_name()));
        for ty in types {
            println!(
                "  {}  {}  ({} -> {})",
                ty.content_id,
                ty.full_name(),
                slot_list(&ty.inputs),
                slot_list(&ty.outputs)
            );
        }
    }
}

fn slot_list(slots: &[SlotSchema]) -> String {
    slots
        .iter()
        .map(|slot| format!("{}: {}", slot.name, slot.value_type))
        .collect::<Vec<_>>()
        .join(", ")
}

fn run_load(config: HostConfig, dirs: &[PathBuf], read_only: bool) -> Result<()> {
    let host = build_host(config, dirs, read_only)?;
    let loaded = host.load_all();
    print_packages(&host);
    host.shutdown();

    if loaded < dirs.len() {
        bail!("{} of {} packages failed to load", dirs.len() - loaded, dirs.len());
    }
    Ok(())
}

fn run_resolve(
    config: HostConfig,
    name: &str,
    requested: Option<&str>,
    store: Option<PathBuf>,
) -> Result<()> {
    let Some(root) = store.or(config.store_root) else {
        bail!("No package store configured; pass --store or set {}", env_vars::STORE);
    };
    let requested = requested
        .map(version::parse_lenient)
        .transpose()
        .context("Invalid version")?;

    let resolver = PackageRepositoryResolver::new(root, config.frameworks);
    let Some(resolved) = resolver.resolve(name, requested.as_ref()) else {
        bail!("{} not found in {}", name, resolver.root().display());
    };

    println!("{}", resolved.path.display());
    println!("  version:   {}", resolved.version);
    println!("  framework: {}", resolved.framework);
    Ok(())
}

fn run_watch(config: HostConfig, dirs: &[PathBuf]) -> Result<()> {
    let host = build_host(config, dirs, false)?;
    let loaded = host.load_all();
    tracing::info!("Loaded {} of {} packages", loaded, dirs.len());
    print_packages(&host);

    let watcher = PackageWatcher::start(Arc::clone(&host)).context("Failed to start watcher")?;
    for package in watcher.packages() {
        tracing::info!("Watching {} at {}", package.name, package.directory.display());
    }

    // runs until the process is terminated
    loop {
        std::thread::park();
    }
}
