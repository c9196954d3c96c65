//! Local vendored module store (`{project}/web_modules/`).

use std::fmt;
use std::path::{Path, PathBuf};

/// Errors from local store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Filesystem failure at `path`.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// More than one version of `name` is installed.
    VersionAmbiguous { name: String, versions: Vec<String> },
    /// `name` is not installed.
    NotInstalled { name: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::VersionAmbiguous { name, versions } => write!(
                f,
                "multiple versions of {name} are installed ({}); specify one with {name}@<version>",
                versions.join(", ")
            ),
            Self::NotInstalled { name } => write!(f, "{name} is not installed"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A vendored package version discovered in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPackage {
    /// Package name, e.g. `left-pad` or `@scope/pkg`.
    pub name: String,
    /// Installed version string, e.g. `1.3.0`.
    pub version: String,
    /// Path to the package version directory.
    pub path: PathBuf,
}

/// The output directory holding vendored modules.
///
/// Layout on disk:
/// ```text
/// {root}/{name}/{version}/{module}.js
/// {root}/@{scope}/{name}/{version}/{module}.js
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open a store at `root`.
    #[must_use]
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Return the directory for a package name and version.
    ///
    /// `@scope/pkg` at `1.0.0` returns `<root>/@scope/pkg/1.0.0`.
    #[must_use]
    pub fn package_dir(&self, name: &str, version: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in name.split('/') {
            path = path.join(part);
        }
        path.join(version)
    }

    /// Return `true` if `name@version` is present in the store.
    #[must_use]
    pub fn is_installed(&self, name: &str, version: &str) -> bool {
        self.package_dir(name, version).is_dir()
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List every package version directory holding at least one `.js` file.
    #[must_use]
    pub fn list_packages(&self) -> Vec<StoredPackage> {
        let mut packages = Vec::new();
        collect_packages(&self.root, &self.root, &mut packages);
        packages.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        packages
    }

    /// Versions of `name` present in the store, sorted.
    #[must_use]
    pub fn versions(&self, name: &str) -> Vec<String> {
        let mut dir = self.root.clone();
        for part in name.split('/') {
            dir = dir.join(part);
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut versions: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_owned))
            .collect();
        versions.sort_by(|a, b| match (semver::Version::parse(a), semver::Version::parse(b)) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => a.cmp(b),
        });
        versions
    }

    /// The single installed version of `name`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotInstalled`] when no version is present,
    /// [`StoreError::VersionAmbiguous`] when more than one is.
    pub fn local_version(&self, name: &str) -> Result<String, StoreError> {
        let mut versions = self.versions(name);
        match versions.len() {
            0 => Err(StoreError::NotInstalled {
                name: name.to_string(),
            }),
            1 => Ok(versions.remove(0)),
            _ => Err(StoreError::VersionAmbiguous {
                name: name.to_string(),
                versions,
            }),
        }
    }

    /// Delete `file` and every directory above it left empty, stopping at the
    /// store root. Returns the removed paths; a file that is already gone is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be removed.
    pub async fn remove_file(&self, file: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let mut removed = Vec::new();
        match tokio::fs::remove_file(file).await {
            Ok(()) => removed.push(file.to_path_buf()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Io {
                    path: file.to_path_buf(),
                    source,
                })
            }
        }

        let mut dir = file.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            // Fails on non-empty directories, which ends the prune.
            if tokio::fs::remove_dir(current).await.is_err() {
                break;
            }
            removed.push(current.to_path_buf());
            dir = current.parent();
        }
        Ok(removed)
    }
}

/// Recursively walk `dir`, collecting version directories that contain a
/// `.js` file. `root` is the store root used to compute relative paths.
fn collect_packages(root: &Path, dir: &Path, packages: &mut Vec<StoredPackage>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut has_module = false;
    let mut subdirs = Vec::new();

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if path.extension().is_some_and(|ext| ext == "js") {
            has_module = true;
        }
    }

    if has_module {
        if let Ok(rel) = dir.strip_prefix(root) {
            let parts: Vec<&str> = rel
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect();
            let named = match parts.as_slice() {
                [name, version] => Some(((*name).to_string(), *version)),
                [scope, name, version] if scope.starts_with('@') => {
                    Some((format!("{scope}/{name}"), *version))
                }
                _ => None,
            };
            if let Some((name, version)) = named {
                packages.push(StoredPackage {
                    name,
                    version: version.to_string(),
                    path: dir.to_path_buf(),
                });
            }
        }
    }

    for subdir in subdirs {
        collect_packages(root, &subdir, packages);
    }
}
