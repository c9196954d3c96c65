//! Package installation and removal.
//!
//! [`Installer::install`] drives one root package through the pipeline:
//!
//! 1. select the first registry that has the package
//! 2. resolve the concrete version
//! 3. describe the root module (import name, storage, entrypoint)
//! 4. resolve the module dependency graph
//! 5. expand into one descriptor per graph edge
//! 6. persist each descriptor's import map fragment
//! 7. download, rewrite and write each distinct module file
//!
//! Every stage finishes for all items before the next one starts.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::convert::Infallible;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::import_map::{ImportMap, ImportMapError, ImportMapStore, Removal};
use crate::lock::IoLock;
use crate::package::{import_name, Layout, PackageDescriptor, PackageRequest};
use crate::pipeline::Pipeline;
use crate::registry::{Registry, RegistryError};
use crate::resolver::{self, join_specifier, DependencyGraph, ResolveError};
use crate::rewrite::{self, RewriteError};
use crate::store::{Store, StoreError};

/// Errors that abort one root package.
#[derive(Debug)]
pub enum InstallError {
    Registry(RegistryError),
    /// The root module could not be resolved.
    Resolve {
        entrypoint: String,
        source: ResolveError,
    },
    /// A downloaded module could not be rewritten.
    Rewrite {
        entrypoint: String,
        source: RewriteError<Infallible>,
    },
    /// Creating a directory or writing a module failed.
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },
    ImportMap(ImportMapError),
    Store(StoreError),
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry(e) => write!(f, "{e}"),
            Self::Resolve { entrypoint, source } => {
                write!(f, "cannot resolve {entrypoint}: {source}")
            }
            Self::Rewrite { entrypoint, source } => {
                write!(f, "cannot rewrite {entrypoint}: {source}")
            }
            Self::Filesystem { path, source } => write!(f, "{}: {source}", path.display()),
            Self::ImportMap(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InstallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Registry(e) => Some(e),
            Self::Resolve { source, .. } => Some(source),
            Self::Rewrite { source, .. } => Some(source),
            Self::Filesystem { source, .. } => Some(source),
            Self::ImportMap(e) => Some(e),
            Self::Store(e) => Some(e),
        }
    }
}

impl From<RegistryError> for InstallError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<ImportMapError> for InstallError {
    fn from(e: ImportMapError) -> Self {
        Self::ImportMap(e)
    }
}

impl From<StoreError> for InstallError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// A request with the registry that serves it.
#[derive(Debug, Clone)]
pub struct SelectedPackage {
    pub request: PackageRequest,
    pub registry: Arc<Registry>,
}

/// A selected package with its concrete version.
#[derive(Debug, Clone)]
pub struct VersionedPackage {
    pub request: PackageRequest,
    pub registry: Arc<Registry>,
    pub version: String,
}

/// A root descriptor with its resolved module graph.
#[derive(Debug, Clone)]
pub struct GraphedPackage {
    pub root: Arc<PackageDescriptor>,
    pub graph: DependencyGraph,
}

/// The outcome of installing one root package.
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    /// The request with its version pinned to what was installed.
    pub request: PackageRequest,
    /// Every module file written, root first.
    pub modules: Vec<Arc<PackageDescriptor>>,
}

impl InstalledPackage {
    #[must_use]
    pub fn root(&self) -> Option<&PackageDescriptor> {
        self.modules.iter().map(AsRef::as_ref).find(|m| m.is_root())
    }
}

/// The outcome of removing one root package.
#[derive(Debug, Clone)]
pub struct RemovedPackage {
    /// The request with the version that was removed.
    pub request: PackageRequest,
    pub removal: Removal,
    /// Files and directories deleted from the output directory.
    pub paths: Vec<PathBuf>,
}

/// Installs packages into one project's output directory.
#[derive(Debug)]
pub struct Installer {
    registries: Vec<Arc<Registry>>,
    layout: Layout,
    store: Store,
    import_map: ImportMapStore,
}

impl Installer {
    /// `registries` are probed in order. `import_map_lock` guards the
    /// project's import map and must be shared by everything writing it.
    #[must_use]
    pub fn new(registries: Vec<Arc<Registry>>, layout: Layout, import_map_lock: IoLock) -> Self {
        let store = Store::with_root(layout.output_dir().to_path_buf());
        let import_map = ImportMapStore::new(layout.import_map_path(), import_map_lock);
        Self {
            registries,
            layout,
            store,
            import_map,
        }
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn import_map(&self) -> &ImportMapStore {
        &self.import_map
    }

    /// Install every request concurrently. One failing root does not affect
    /// the others.
    pub async fn install_all(
        &self,
        requests: Vec<PackageRequest>,
    ) -> Vec<(PackageRequest, Result<InstalledPackage, InstallError>)> {
        join_all(requests.into_iter().map(|request| async move {
            let result = self.install(request.clone()).await;
            (request, result)
        }))
        .await
    }

    /// Install one root package and everything it imports.
    ///
    /// Modules below the root that cannot be fetched or parsed are skipped
    /// with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError`] if no registry has the package, the root
    /// cannot be resolved, or a module cannot be persisted.
    pub async fn install(&self, request: PackageRequest) -> Result<InstalledPackage, InstallError> {
        let mut seen = HashSet::new();
        let modules = Pipeline::new(vec![request.clone()])
            .map(|request| self.select_registry(request))
            .await?
            .map(|selected| self.resolve_version(selected))
            .await?
            .map(|versioned| async move { Ok::<_, InstallError>(self.describe_root(versioned)) })
            .await?
            .map(|root| self.dependency_graph(root))
            .await?
            .inspect(|graphed| {
                debug!(
                    package = %graphed.root.name,
                    modules = graphed.graph.len(),
                    skipped = graphed.graph.failures().len(),
                    "resolved module graph"
                );
            })
            .flat_map(|graphed| async move {
                Ok::<_, InstallError>(self.child_packages(graphed).await)
            })
            .await?
            .map(|descriptor| self.persist_import_map(descriptor))
            .await?
            .filter(|descriptor| seen.insert(descriptor.storage.path.clone()))
            .map(|descriptor| self.download(descriptor))
            .await?
            .inspect(|module| {
                info!(
                    package = %module.name,
                    version = %module.version,
                    path = %module.storage.relative_path,
                    "installed module"
                );
            })
            .into_items();

        let version = modules
            .iter()
            .find(|m| m.is_root())
            .map(|m| m.version.clone());
        Ok(InstalledPackage {
            request: request.with_version(version),
            modules,
        })
    }

    /// Remove a root package: its import map entry, every module only it
    /// kept alive, and the directories left empty.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Store`] when the installed version is missing
    /// or ambiguous, or on filesystem and import map failures.
    pub async fn remove(&self, request: PackageRequest) -> Result<RemovedPackage, InstallError> {
        let version = match &request.version {
            Some(version) => version.clone(),
            None => self.store.local_version(&request.name)?,
        };
        let target = request.target.as_deref();
        let name = import_name(&request.name, target);
        let storage = self.layout.storage(&request.name, target, &version);

        let removal = self
            .import_map
            .remove_dependency(&name, &storage.relative_dir)
            .await?;

        let mut files: BTreeSet<&str> = removal.orphaned.iter().map(String::as_str).collect();
        if !removal.retained.contains(&storage.relative_path) {
            files.insert(&storage.relative_path);
        }
        let mut paths = Vec::new();
        for file in files {
            paths.extend(self.store.remove_file(&self.layout.path_for(file)).await?);
        }
        info!(package = %request.name, %version, removed = paths.len(), "removed package");

        Ok(RemovedPackage {
            request: request.with_version(Some(version)),
            removal,
            paths,
        })
    }

    async fn select_registry(
        &self,
        request: PackageRequest,
    ) -> Result<SelectedPackage, InstallError> {
        let target = request.target.as_deref();
        let version = request.version.as_deref();
        for registry in &self.registries {
            if registry.exists(&request.name, target, version).await {
                debug!(package = %request, registry = registry.name(), "selected registry");
                return Ok(SelectedPackage {
                    registry: Arc::clone(registry),
                    request,
                });
            }
        }
        Err(RegistryError::NotFound {
            name: request.to_string(),
        }
        .into())
    }

    async fn resolve_version(
        &self,
        selected: SelectedPackage,
    ) -> Result<VersionedPackage, InstallError> {
        let SelectedPackage { request, registry } = selected;
        let version = registry
            .version(
                &request.name,
                request.target.as_deref(),
                request.version.as_deref(),
            )
            .await?;
        Ok(VersionedPackage {
            request,
            registry,
            version,
        })
    }

    fn describe_root(&self, versioned: VersionedPackage) -> Arc<PackageDescriptor> {
        let VersionedPackage {
            request,
            registry,
            version,
        } = versioned;
        // The requested version keeps the root fetch shared with the probe.
        let entrypoint = registry.entrypoint(
            &request.name,
            request.target.as_deref(),
            request.version.as_deref(),
        );
        Arc::new(PackageDescriptor::new(
            &self.layout,
            registry,
            request.name,
            request.target,
            version,
            entrypoint,
        ))
    }

    async fn dependency_graph(
        &self,
        root: Arc<PackageDescriptor>,
    ) -> Result<GraphedPackage, InstallError> {
        let mut graph = resolver::resolve(root.registry.as_ref(), &root.entrypoint).await;
        if let Some(source) = graph.take_failure(&root.entrypoint) {
            return Err(InstallError::Resolve {
                entrypoint: root.entrypoint.clone(),
                source,
            });
        }
        Ok(GraphedPackage { root, graph })
    }

    /// The root followed by one descriptor per distinct graph edge, each
    /// parented to the descriptor of the module importing it.
    ///
    /// Modules whose identity cannot be read back from the registry are
    /// dropped with their edges.
    async fn child_packages(&self, graphed: GraphedPackage) -> Vec<Arc<PackageDescriptor>> {
        let GraphedPackage { root, graph } = graphed;
        let root = &root;

        let described = join_all(graph.entrypoints().map(|entrypoint| async move {
            if entrypoint == root.entrypoint {
                return Some((entrypoint, Arc::clone(root)));
            }
            match root.registry.resolve_import(entrypoint).await {
                Ok(resolved) => {
                    let descriptor = PackageDescriptor::resolved(
                        &self.layout,
                        Arc::clone(&root.registry),
                        resolved,
                        entrypoint.to_string(),
                    );
                    Some((entrypoint, Arc::new(descriptor)))
                }
                Err(error) => {
                    warn!(package = %root.name, %entrypoint, %error, "skipping module");
                    None
                }
            }
        }))
        .await;
        let modules: HashMap<&str, Arc<PackageDescriptor>> =
            described.into_iter().flatten().collect();

        let mut edges = HashSet::new();
        let mut packages = vec![Arc::clone(root)];
        for (referrer, children) in graph.iter() {
            let Some(parent) = modules.get(referrer) else {
                continue;
            };
            for child in children {
                if !edges.insert((referrer, child.as_str())) {
                    continue;
                }
                if let Some(module) = modules.get(child.as_str()) {
                    let descriptor = PackageDescriptor::clone(module).with_parent(Arc::clone(parent));
                    packages.push(Arc::new(descriptor));
                }
            }
        }
        packages
    }

    async fn persist_import_map(
        &self,
        descriptor: Arc<PackageDescriptor>,
    ) -> Result<Arc<PackageDescriptor>, InstallError> {
        self.import_map
            .persist(&ImportMap::fragment(&descriptor))
            .await?;
        Ok(descriptor)
    }

    /// Fetch the module, rewrite its specifiers to import names and write
    /// it to its local path.
    async fn download(
        &self,
        descriptor: Arc<PackageDescriptor>,
    ) -> Result<Arc<PackageDescriptor>, InstallError> {
        let module = descriptor.registry.load(&descriptor.entrypoint).await?;
        let registry = descriptor.registry.as_ref();
        let entrypoint = descriptor.entrypoint.as_str();
        let location = module.location.as_str();

        let text = rewrite::rewrite(&module.source, |specifier: String| async move {
            let joined = join_specifier(location, &specifier);
            match registry.resolve_import(&joined).await {
                Ok(resolved) => Ok::<_, Infallible>(resolved.import_name()),
                Err(error) => {
                    warn!(module = %entrypoint, %specifier, %error, "leaving specifier unchanged");
                    Ok(specifier)
                }
            }
        })
        .await
        .map_err(|source| InstallError::Rewrite {
            entrypoint: descriptor.entrypoint.clone(),
            source,
        })?;

        let storage = &descriptor.storage;
        tokio::fs::create_dir_all(&storage.dir)
            .await
            .map_err(|source| InstallError::Filesystem {
                path: storage.dir.clone(),
                source,
            })?;
        tokio::fs::write(&storage.path, text)
            .await
            .map_err(|source| InstallError::Filesystem {
                path: storage.path.clone(),
                source,
            })?;
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Backend;

    fn installer(dir: &std::path::Path) -> Installer {
        // Nothing listens on port 9; every fetch fails fast.
        let registry = Registry::with_base(
            Backend::Pika,
            "http://127.0.0.1:9/",
            Some(std::time::Duration::from_secs(2)),
        )
        .unwrap();
        Installer::new(
            vec![Arc::new(registry)],
            Layout::new(dir, "web_modules"),
            IoLock::new(),
        )
    }

    #[tokio::test]
    async fn unknown_package_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = installer(dir.path())
            .install("left-pad".parse().unwrap())
            .await
            .unwrap_err();
        assert!(
            matches!(err, InstallError::Registry(RegistryError::NotFound { .. })),
            "got {err}"
        );
    }

    #[tokio::test]
    async fn install_all_isolates_roots() {
        let dir = tempfile::tempdir().unwrap();
        let results = installer(dir.path())
            .install_all(vec!["a".parse().unwrap(), "b".parse().unwrap()])
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.name, "a");
        assert!(results.iter().all(|(_, r)| r.is_err()));
    }

    #[tokio::test]
    async fn remove_requires_installed_version() {
        let dir = tempfile::tempdir().unwrap();
        let err = installer(dir.path())
            .remove("left-pad".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::Store(StoreError::NotInstalled { .. })
        ));
    }

    #[tokio::test]
    async fn remove_deletes_root_file_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(dir.path());
        let layout = installer.layout().clone();

        let files = [
            "/web_modules/app/1.0.0/app.js",
            "/web_modules/dep/2.0.0/dep.js",
            "/web_modules/keep/1.0.0/keep.js",
        ];
        for file in files {
            let path = layout.path_for(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, "export {};\n").unwrap();
        }
        let map: ImportMap = serde_json::from_value(serde_json::json!({
            "imports": {
                "app": files[0],
                "keep": files[2]
            },
            "scopes": {
                "/web_modules/app/1.0.0/": {"dep": files[1]}
            }
        }))
        .unwrap();
        installer.import_map().persist(&map).await.unwrap();

        let removed = installer.remove("app".parse().unwrap()).await.unwrap();
        assert_eq!(removed.request.version.as_deref(), Some("1.0.0"));
        assert!(!layout.path_for(files[0]).exists());
        assert!(!layout.path_for(files[1]).exists());
        assert!(!dir.path().join("web_modules").join("app").exists());
        assert!(layout.path_for(files[2]).exists());

        let after = installer.import_map().read().await;
        assert_eq!(after.imports.keys().collect::<Vec<_>>(), ["keep"]);
        assert!(after.scopes.is_empty());
    }
}
