//! Package requests, local storage layout and resolved package descriptors.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::registry::{Registry, ResolvedImport};

/// A package request string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError {
    pub input: String,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid package `{}`: expected name[/target][@version]",
            self.input
        )
    }
}

impl std::error::Error for RequestError {}

/// A requested package: `name[/target][@version]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRequest {
    /// Package name, `@scope/pkg` for scoped packages.
    pub name: String,
    /// Sub-path inside the package.
    pub target: Option<String>,
    /// Requested version; `None` means latest.
    pub version: Option<String>,
}

impl PackageRequest {
    /// The `webDependencies` key form: `name[/target]`.
    #[must_use]
    pub fn key(&self) -> String {
        match &self.target {
            Some(target) => format!("{}/{target}", self.name),
            None => self.name.clone(),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }
}

impl fmt::Display for PackageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())?;
        if let Some(version) = &self.version {
            write!(f, "@{version}")?;
        }
        Ok(())
    }
}

impl FromStr for PackageRequest {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_request(s)
    }
}

/// Normalize a version string: empty, `*` and `latest` mean "latest".
#[must_use]
pub fn normalize_version(version: &str) -> Option<String> {
    let version = version.trim();
    match version {
        "" | "*" | "latest" => None,
        v => Some(v.to_string()),
    }
}

/// Parse `name[/target][@version]`.
///
/// A leading `@` belongs to a scoped name (`@scope/pkg`); only a later `@`
/// introduces a version.
///
/// # Errors
///
/// Returns [`RequestError`] if the name is empty or a scope has no package.
pub fn parse_request(input: &str) -> Result<PackageRequest, RequestError> {
    let err = || RequestError {
        input: input.to_string(),
    };
    let trimmed = input.trim();

    let (spec, version) = match trimmed.rfind('@') {
        Some(idx) if idx > 0 => (&trimmed[..idx], normalize_version(&trimmed[idx + 1..])),
        _ => (trimmed, None),
    };

    let mut parts = spec.splitn(if spec.starts_with('@') { 3 } else { 2 }, '/');
    let name = if spec.starts_with('@') {
        let scope = parts.next().unwrap_or_default();
        let pkg = parts.next().unwrap_or_default();
        if scope.len() < 2 || pkg.is_empty() {
            return Err(err());
        }
        format!("{scope}/{pkg}")
    } else {
        parts.next().unwrap_or_default().to_string()
    };
    if name.is_empty() {
        return Err(err());
    }
    let target = parts
        .next()
        .map(|t| t.trim_matches('/'))
        .filter(|t| !t.is_empty())
        .map(str::to_owned);

    Ok(PackageRequest {
        name,
        target,
        version,
    })
}

/// File stem of the last path segment (`dist/index.js` → `index`).
#[must_use]
pub fn file_stem(path: &str) -> &str {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
}

/// The name other modules import a package by: `name/target` when the
/// target's stem differs from the package name, otherwise `name`.
#[must_use]
pub fn import_name(name: &str, target: Option<&str>) -> String {
    match target {
        Some(target) if file_stem(target) != name => format!("{name}/{target}"),
        _ => name.to_string(),
    }
}

impl ResolvedImport {
    /// See [`import_name`].
    #[must_use]
    pub fn import_name(&self) -> String {
        import_name(&self.name, self.target.as_deref())
    }
}

/// Where a project keeps its vendored modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    project_root: PathBuf,
    output_dir: PathBuf,
    /// Output directory as a URL path relative to the project root,
    /// without leading or trailing `/`.
    url_root: String,
}

impl Layout {
    /// `output_dir` is taken relative to `project_root` unless absolute.
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>, output_dir: impl AsRef<Path>) -> Self {
        let project_root = project_root.into();
        let output_dir = project_root.join(output_dir.as_ref());
        let relative = output_dir
            .strip_prefix(&project_root)
            .unwrap_or(&output_dir);
        let url_root = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        Self {
            project_root,
            output_dir,
            url_root,
        }
    }

    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    #[must_use]
    pub fn import_map_path(&self) -> PathBuf {
        self.output_dir.join("import-map.json")
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.project_root.join("package.json")
    }

    /// Storage locations for one module of `name@version`.
    #[must_use]
    pub fn storage(&self, name: &str, target: Option<&str>, version: &str) -> LocalStorage {
        let mut dir = self.output_dir.clone();
        for part in name.split('/') {
            dir.push(part);
        }
        dir.push(version);

        let file_name = format!("{}.js", file_stem(target.unwrap_or(name)));
        let relative_dir = if self.url_root.is_empty() {
            format!("/{name}/{version}/")
        } else {
            format!("/{}/{name}/{version}/", self.url_root)
        };

        LocalStorage {
            path: dir.join(&file_name),
            dir,
            relative_path: format!("{relative_dir}{file_name}"),
            relative_dir,
        }
    }

    /// Map a relative URL path produced by [`Layout::storage`] back to disk.
    #[must_use]
    pub fn path_for(&self, relative_path: &str) -> PathBuf {
        let mut path = self.project_root.clone();
        for part in relative_path.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }
}

/// On-disk and URL locations of one vendored module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalStorage {
    /// `{out}/{name}/{version}`
    pub dir: PathBuf,
    /// `{out}/{name}/{version}/{stem}.js`
    pub path: PathBuf,
    /// `/{out}/{name}/{version}/`
    pub relative_dir: String,
    /// `/{out}/{name}/{version}/{stem}.js`
    pub relative_path: String,
}

/// A fully resolved package module, ready to be downloaded and mapped.
#[derive(Debug, Clone)]
pub struct PackageDescriptor {
    pub name: String,
    pub target: Option<String>,
    pub version: String,
    pub import_name: String,
    pub registry: Arc<Registry>,
    pub entrypoint: String,
    pub storage: LocalStorage,
    /// The descriptor of the module importing this one; `None` for a root
    /// package.
    pub parent: Option<Arc<PackageDescriptor>>,
}

impl PackageDescriptor {
    #[must_use]
    pub fn new(
        layout: &Layout,
        registry: Arc<Registry>,
        name: String,
        target: Option<String>,
        version: String,
        entrypoint: String,
    ) -> Self {
        let storage = layout.storage(&name, target.as_deref(), &version);
        Self {
            import_name: import_name(&name, target.as_deref()),
            name,
            target,
            version,
            registry,
            entrypoint,
            storage,
            parent: None,
        }
    }

    /// Descriptor for a module reached at `entrypoint` and identified as
    /// `resolved`.
    #[must_use]
    pub fn resolved(
        layout: &Layout,
        registry: Arc<Registry>,
        resolved: ResolvedImport,
        entrypoint: String,
    ) -> Self {
        Self::new(
            layout,
            registry,
            resolved.name,
            resolved.target,
            resolved.version,
            entrypoint,
        )
    }

    #[must_use]
    pub fn with_parent(mut self, parent: Arc<PackageDescriptor>) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}
