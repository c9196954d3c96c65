//! CDN registry adapters.
//!
//! Each [`Backend`] knows how to build request paths for a package, how the
//! CDN signals a missing package in a response body, and how to read the
//! canonical name, version and file back out of the final response URL.
//! [`Registry`] pairs a backend with a memoizing [`CdnClient`].

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::client::{CdnClient, FetchError};
use crate::resolver::{LoadedModule, SourceLoader};

/// Errors from registry operations.
#[derive(Debug, Clone)]
pub enum RegistryError {
    /// The fetch for `path` failed.
    Http {
        registry: &'static str,
        path: String,
        message: String,
    },
    /// The response for `path` did not match the backend's URL pattern.
    Malformed {
        registry: &'static str,
        path: String,
    },
    /// No configured registry has the package.
    NotFound { name: String },
    /// The registry resolved `name` to something that is not a version.
    InvalidVersion {
        registry: &'static str,
        name: String,
        version: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http {
                registry,
                path,
                message,
            } => write!(f, "{registry}: cannot fetch {path}: {message}"),
            Self::Malformed { registry, path } => {
                write!(f, "{registry}: malformed package response for {path}")
            }
            Self::NotFound { name } => write!(f, "package {name} not found in any registry"),
            Self::InvalidVersion {
                registry,
                name,
                version,
            } => write!(f, "{registry}: {name} resolved to invalid version `{version}`"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// The supported CDN backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Resolved URLs look like `/-/{name}@v{version}-{hash}/.../{file}`.
    Pika,
    /// Resolved URLs look like `/{name}@{version}/{target}`.
    Unpkg,
}

static PIKA_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/-/((?:@[^/]+/)?[^/@]+)@v([^/]+)-([^/-]+)/(?:.*/)?([^/]+)$")
        .expect("pika path pattern compiles")
});

static UNPKG_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/((?:@[^/]+/)?[^/@]+)@([^/]+)(?:/(.*))?$")
        .expect("unpkg path pattern compiles")
});

impl Backend {
    /// Default probe order.
    pub const ALL: [Backend; 2] = [Backend::Pika, Backend::Unpkg];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Pika => "pika",
            Self::Unpkg => "unpkg",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    #[must_use]
    pub fn default_base(self) -> &'static str {
        match self {
            Self::Pika => "https://cdn.pika.dev/",
            Self::Unpkg => "https://unpkg.com/",
        }
    }

    /// Request path for a package. `None` for `version` means latest.
    #[must_use]
    pub fn entrypoint(self, name: &str, target: Option<&str>, version: Option<&str>) -> String {
        let mut path = format!("./{name}");
        match (self, version) {
            (Self::Pika, Some(v)) => path.push_str(&format!("@v{v}")),
            (Self::Unpkg, Some(v)) => path.push_str(&format!("@{v}")),
            (_, None) => {}
        }
        match (self, target) {
            (_, Some(t)) => {
                path.push('/');
                path.push_str(t.trim_start_matches("./").trim_start_matches('/'));
            }
            (Self::Pika, None) => path.push('/'),
            (Self::Unpkg, None) => {}
        }
        path
    }

    /// First-line substrings marking an error payload.
    #[must_use]
    pub fn failure_markers(self) -> &'static [&'static str] {
        match self {
            Self::Pika => &["Not Found", "Error:"],
            Self::Unpkg => &["Cannot find"],
        }
    }

    /// Recover the canonical package identity from a final response path.
    #[must_use]
    pub fn parse_response_path(self, path: &str) -> Option<ResolvedImport> {
        match self {
            Self::Pika => {
                let caps = PIKA_PATH.captures(path)?;
                Some(ResolvedImport {
                    name: caps[1].to_string(),
                    version: caps[2].to_string(),
                    target: Some(caps[4].to_string()),
                })
            }
            Self::Unpkg => {
                let caps = UNPKG_PATH.captures(path)?;
                Some(ResolvedImport {
                    name: caps[1].to_string(),
                    version: caps[2].to_string(),
                    target: caps
                        .get(3)
                        .map(|m| m.as_str())
                        .filter(|t| !t.is_empty())
                        .map(str::to_owned),
                })
            }
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Canonical identity of a fetched module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImport {
    pub name: String,
    pub target: Option<String>,
    pub version: String,
}

/// A backend bound to a memoizing client.
#[derive(Debug)]
pub struct Registry {
    backend: Backend,
    client: CdnClient,
}

impl Registry {
    #[must_use]
    pub fn new(backend: Backend, client: CdnClient) -> Self {
        Self { backend, client }
    }

    /// Create a registry for `backend` at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Http`] if `base` is not a valid URL.
    pub fn with_base(
        backend: Backend,
        base: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, RegistryError> {
        let client = CdnClient::with_base(base, timeout).map_err(|e| RegistryError::Http {
            registry: backend.name(),
            path: base.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::new(backend, client))
    }

    #[must_use]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    #[must_use]
    pub fn entrypoint(&self, name: &str, target: Option<&str>, version: Option<&str>) -> String {
        self.backend.entrypoint(name, target, version)
    }

    /// Probe whether the registry serves the package.
    ///
    /// Only the first line of the body is inspected; the HTTP status is
    /// ignored. A failed fetch counts as absent.
    pub async fn exists(&self, name: &str, target: Option<&str>, version: Option<&str>) -> bool {
        let path = self.entrypoint(name, target, version);
        match self.client.fetch(&path).await {
            Ok(module) => {
                let first_line = module.first_line();
                let found = !self
                    .backend
                    .failure_markers()
                    .iter()
                    .any(|marker| first_line.contains(marker));
                debug!(registry = self.name(), %path, found, "probe");
                found
            }
            Err(e) => {
                debug!(registry = self.name(), %path, error = %e, "probe failed");
                false
            }
        }
    }

    /// Resolve an optional version to the concrete version the CDN serves.
    ///
    /// # Errors
    ///
    /// Fails if the fetch fails, the response URL is malformed, or the
    /// resolved version is not a semantic version.
    pub async fn version(
        &self,
        name: &str,
        target: Option<&str>,
        version: Option<&str>,
    ) -> Result<String, RegistryError> {
        let path = self.entrypoint(name, target, version);
        let resolved = self.resolve_import(&path).await?;
        if semver::Version::parse(&resolved.version).is_err() {
            return Err(RegistryError::InvalidVersion {
                registry: self.name(),
                name: name.to_string(),
                version: resolved.version,
            });
        }
        Ok(resolved.version)
    }

    /// Module text at `entrypoint` together with where it was served from,
    /// after redirects and any `x-import-url` hop.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Http`] if the fetch fails.
    pub async fn load(&self, entrypoint: &str) -> Result<LoadedModule, RegistryError> {
        let module = self
            .client
            .fetch(entrypoint)
            .await
            .map_err(|e| self.http_error(entrypoint, &e))?;
        Ok(LoadedModule {
            source: module.source.clone(),
            location: self.client.location(&module),
        })
    }

    /// Fetch `specifier` and read its canonical identity from the final
    /// response URL.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Malformed`] if the final URL does not match
    /// the backend's pattern.
    pub async fn resolve_import(&self, specifier: &str) -> Result<ResolvedImport, RegistryError> {
        let module = self
            .client
            .fetch(specifier)
            .await
            .map_err(|e| self.http_error(specifier, &e))?;
        self.backend
            .parse_response_path(&module.response_path)
            .ok_or_else(|| RegistryError::Malformed {
                registry: self.name(),
                path: specifier.to_string(),
            })
    }

    fn http_error(&self, path: &str, e: &FetchError) -> RegistryError {
        RegistryError::Http {
            registry: self.name(),
            path: path.to_string(),
            message: e.to_string(),
        }
    }
}

impl SourceLoader for Registry {
    async fn load(&self, entrypoint: &str) -> Result<LoadedModule, RegistryError> {
        Registry::load(self, entrypoint).await
    }
}
