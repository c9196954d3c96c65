//! `webdeps`: vendor ES module packages from CDN registries.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use webdeps_cli::config::{self, WebdepsConfig};
use webdeps_cli::install::Installer;
use webdeps_cli::lock::IoLock;
use webdeps_cli::manifest::Manifest;
use webdeps_cli::package::{parse_request, Layout, PackageRequest};
use webdeps_cli::registry::Backend;
use webdeps_cli::store::Store;

/// Vendor browser-ready ES modules and keep an import map
#[derive(Debug, Parser)]
#[command(name = "webdeps", version, about)]
struct Cli {
    /// Probe only this registry (pika or unpkg)
    #[arg(long, short = 'r', global = true)]
    registry: Option<String>,
    /// Output directory, relative to the project root
    #[arg(long, global = true)]
    out_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install every entry of package.json webDependencies
    Install,
    /// Install packages and record them in webDependencies
    Add {
        /// Packages as name[/target][@version]
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Remove packages, their files and import map entries
    Remove {
        /// Packages as name[/target][@version]
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// List vendored packages
    List,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config();
    let project_root = std::env::current_dir().unwrap_or_else(|e| fail("webdeps", e));
    let out_dir = cli
        .out_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(config::output_dir(&cfg)));
    let layout = Layout::new(project_root, out_dir);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| fail("webdeps", e));
    let manifest = Manifest::new(layout.manifest_path(), IoLock::new());

    match cli.command {
        Command::Install => {
            let installer = installer(&cfg, cli.registry.as_deref(), layout, "install");
            runtime.block_on(cmd_install(&installer, &manifest));
        }
        Command::Add { packages } => {
            let requests = parse_requests(&packages, "add");
            let installer = installer(&cfg, cli.registry.as_deref(), layout, "add");
            runtime.block_on(cmd_add(&installer, &manifest, requests));
        }
        Command::Remove { packages } => {
            let requests = parse_requests(&packages, "remove");
            let installer = installer(&cfg, cli.registry.as_deref(), layout, "remove");
            runtime.block_on(cmd_remove(&installer, &manifest, requests));
        }
        Command::List => cmd_list(layout.output_dir()),
    }
}

/// Structured diagnostics go to stderr, filtered by `WEBDEPS_LOG`.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("WEBDEPS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn fail(command: &str, error: impl Display) -> ! {
    eprintln!("webdeps {command}: {error}");
    std::process::exit(1);
}

fn installer(cfg: &WebdepsConfig, pinned: Option<&str>, layout: Layout, command: &str) -> Installer {
    let pinned = pinned.map(|name| {
        Backend::from_name(name).unwrap_or_else(|| {
            eprintln!("webdeps {command}: unknown registry '{name}'");
            eprintln!("Known registries: pika, unpkg");
            std::process::exit(1);
        })
    });
    let registries = config::build_registries(cfg, pinned).unwrap_or_else(|e| fail(command, e));
    Installer::new(registries, layout, IoLock::new())
}

fn parse_requests(packages: &[String], command: &str) -> Vec<PackageRequest> {
    packages
        .iter()
        .map(|p| parse_request(p).unwrap_or_else(|e| fail(command, e)))
        .collect()
}

// ── Commands ────────────────────────────────────────────────────────────

fn cmd_list(output_dir: &Path) {
    let packages = Store::with_root(output_dir.to_path_buf()).list_packages();
    if packages.is_empty() {
        println!("No packages installed.");
        return;
    }
    for pkg in &packages {
        println!("{}@{}", pkg.name, pkg.version);
    }
}

async fn cmd_install(installer: &Installer, manifest: &Manifest) {
    let requests = manifest
        .read_requests()
        .await
        .unwrap_or_else(|e| fail("install", e));
    if requests.is_empty() {
        println!("Nothing to install.");
        return;
    }
    let total = requests.len();
    let installed = install_requests(installer, requests, "install").await;
    println!("Installed {} of {total} package(s).", installed.len());
    if installed.len() < total {
        std::process::exit(1);
    }
}

async fn cmd_add(installer: &Installer, manifest: &Manifest, requests: Vec<PackageRequest>) {
    let total = requests.len();
    let installed = install_requests(installer, requests, "add").await;
    if !installed.is_empty() {
        if let Err(e) = manifest.add_entries(&installed).await {
            fail("add", e);
        }
    }
    for request in &installed {
        println!("Added {request} to package.json");
    }
    if installed.len() < total {
        std::process::exit(1);
    }
}

async fn cmd_remove(installer: &Installer, manifest: &Manifest, requests: Vec<PackageRequest>) {
    let total = requests.len();
    let mut removed = Vec::new();
    // Sequential: removals prune shared directories.
    for request in requests {
        match installer.remove(request.clone()).await {
            Ok(outcome) => {
                if outcome.removal.owner_retained {
                    println!(
                        "  removed {} (still imported by another package, files kept)",
                        outcome.request
                    );
                } else {
                    println!("  removed {}", outcome.request);
                }
                removed.push(outcome.request);
            }
            Err(e) => eprintln!("webdeps remove: {request}: {e}"),
        }
    }
    if !removed.is_empty() {
        match manifest.remove_entries(&removed).await {
            Ok(keys) => {
                for key in keys {
                    println!("Removed {key} from package.json");
                }
            }
            Err(e) => fail("remove", e),
        }
    }
    if removed.len() < total {
        std::process::exit(1);
    }
}

/// Install `requests` concurrently, reporting each outcome. Returns the
/// requests that succeeded, pinned to their installed versions.
async fn install_requests(
    installer: &Installer,
    requests: Vec<PackageRequest>,
    command: &str,
) -> Vec<PackageRequest> {
    let mut installed = Vec::new();
    for (request, result) in installer.install_all(requests).await {
        match result {
            Ok(package) => {
                println!(
                    "  installed {} ({} module(s))",
                    package.request,
                    package.modules.len()
                );
                installed.push(package.request);
            }
            Err(e) => eprintln!("webdeps {command}: {request}: {e}"),
        }
    }
    installed
}
