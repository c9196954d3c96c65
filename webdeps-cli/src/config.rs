//! Global configuration for webdeps (`~/.webdeps/config.toml`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::registry::{Backend, Registry, RegistryError};

/// Default output directory, relative to the project root.
pub const DEFAULT_OUTPUT_DIR: &str = "web_modules";

/// Default per-fetch timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Top-level configuration loaded from `~/.webdeps/config.toml`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WebdepsConfig {
    /// Backend probe order.
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
    /// Per-backend overrides, keyed by backend name.
    #[serde(default)]
    pub registries: Option<BTreeMap<String, RemoteRegistry>>,
    #[serde(default)]
    pub output: Option<OutputConfig>,
    #[serde(default)]
    pub http: Option<HttpConfig>,
}

/// Registry selection.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Backend names in the order they are probed (default: pika, unpkg).
    pub order: Option<Vec<String>>,
}

/// A backend override.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteRegistry {
    /// Base URL requests are joined against.
    pub base: String,
}

/// Output location.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Vendored module directory, relative to the project root.
    pub dir: Option<String>,
}

/// HTTP settings.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Per-fetch timeout; `0` disables it.
    #[serde(default, rename = "timeout-secs")]
    pub timeout_secs: Option<u64>,
}

/// Load the global configuration from `~/.webdeps/config.toml`.
///
/// Returns a default (empty) config if the file does not exist or cannot be
/// parsed.
#[must_use]
pub fn load_config() -> WebdepsConfig {
    let Some(path) = config_path() else {
        return WebdepsConfig::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => toml::from_str(&text).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "ignoring unparsable config");
            WebdepsConfig::default()
        }),
        Err(_) => WebdepsConfig::default(),
    }
}

/// Backends in configured probe order. Unknown names are skipped.
#[must_use]
pub fn registry_order(config: &WebdepsConfig) -> Vec<Backend> {
    let Some(order) = config.registry.as_ref().and_then(|r| r.order.as_ref()) else {
        return Backend::ALL.to_vec();
    };
    let mut backends = Vec::new();
    for name in order {
        match Backend::from_name(name) {
            Some(backend) if !backends.contains(&backend) => backends.push(backend),
            Some(_) => {}
            None => warn!(registry = %name, "unknown registry in config"),
        }
    }
    backends
}

/// Base URL for `backend`, from config or the compiled-in default.
#[must_use]
pub fn registry_base(config: &WebdepsConfig, backend: Backend) -> String {
    config
        .registries
        .as_ref()
        .and_then(|regs| regs.get(backend.name()))
        .map_or_else(|| backend.default_base().to_string(), |r| r.base.clone())
}

/// Output directory relative to the project root.
#[must_use]
pub fn output_dir(config: &WebdepsConfig) -> String {
    config
        .output
        .as_ref()
        .and_then(|o| o.dir.clone())
        .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string())
}

/// Per-fetch timeout; `None` when disabled.
#[must_use]
pub fn http_timeout(config: &WebdepsConfig) -> Option<Duration> {
    let secs = config
        .http
        .as_ref()
        .and_then(|h| h.timeout_secs)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Build the registries to probe: `pinned` alone if given, otherwise the
/// configured order.
///
/// # Errors
///
/// Returns [`RegistryError`] if a configured base URL is invalid.
pub fn build_registries(
    config: &WebdepsConfig,
    pinned: Option<Backend>,
) -> Result<Vec<Arc<Registry>>, RegistryError> {
    let backends = pinned.map_or_else(|| registry_order(config), |b| vec![b]);
    let timeout = http_timeout(config);
    backends
        .into_iter()
        .map(|backend| {
            Registry::with_base(backend, &registry_base(config, backend), timeout).map(Arc::new)
        })
        .collect()
}

/// Return the path to `~/.webdeps/config.toml`, or `None` if `$HOME` is unset.
fn config_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".webdeps").join("config.toml"))
}
