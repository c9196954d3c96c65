//! `package.json` `webDependencies` reading and writing.
//!
//! Only the `webDependencies` object is touched; every other field and the
//! key order of the document are preserved.

use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::warn;

use crate::lock::IoLock;
use crate::package::{normalize_version, parse_request, PackageRequest};

/// Manifest field listing the web packages to vendor.
pub const WEB_DEPENDENCIES: &str = "webDependencies";

/// Errors that can occur when reading, parsing, or writing `package.json`.
#[derive(Debug)]
pub enum ManifestError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Serialize(serde_json::Error),
    /// The manifest has no `webDependencies` object.
    MissingWebDependencies,
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "cannot read package.json: {e}"),
            Self::Parse(e) => write!(f, "invalid package.json: {e}"),
            Self::Serialize(e) => write!(f, "cannot serialize package.json: {e}"),
            Self::MissingWebDependencies => {
                write!(f, "{WEB_DEPENDENCIES} is missing in package.json")
            }
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) | Self::Serialize(e) => Some(e),
            Self::MissingWebDependencies => None,
        }
    }
}

impl From<std::io::Error> for ManifestError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The project manifest, guarded by its own lock.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    lock: IoLock,
}

impl Manifest {
    #[must_use]
    pub fn new(path: PathBuf, lock: IoLock) -> Self {
        Self { path, lock }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flatten `webDependencies` into package requests.
    ///
    /// A manifest without `webDependencies` yields no requests and a
    /// warning. Entries whose key is not a package name are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the file cannot be read or parsed.
    pub async fn read_requests(&self) -> Result<Vec<PackageRequest>, ManifestError> {
        self.lock.dispatch(|| self.read_requests_locked()).await
    }

    async fn read_requests_locked(&self) -> Result<Vec<PackageRequest>, ManifestError> {
        let doc = self.read_document().await?;
        let deps = match web_dependencies(&doc) {
            Ok(deps) => deps,
            Err(ManifestError::MissingWebDependencies) => {
                warn!(path = %self.path.display(), "{WEB_DEPENDENCIES} is missing in package.json");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        Ok(deps
            .iter()
            .filter_map(|(key, version)| match parse_request(key) {
                Ok(request) => {
                    Some(request.with_version(version.as_str().and_then(normalize_version)))
                }
                Err(e) => {
                    warn!(%key, "skipping {WEB_DEPENDENCIES} entry: {e}");
                    None
                }
            })
            .collect())
    }

    /// Insert or update one `webDependencies` entry per request.
    ///
    /// Requests without a version are recorded as `latest`. A missing
    /// manifest is created.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the file cannot be read or written.
    pub async fn add_entries(&self, requests: &[PackageRequest]) -> Result<(), ManifestError> {
        self.modify(|deps| {
            for request in requests {
                let version = request.version.as_deref().unwrap_or("latest");
                deps.insert(request.key(), Value::String(version.to_string()));
            }
        })
        .await
    }

    /// Remove the `webDependencies` entries of `requests`, returning the keys
    /// that were present.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the file cannot be read or written.
    pub async fn remove_entries(
        &self,
        requests: &[PackageRequest],
    ) -> Result<Vec<String>, ManifestError> {
        let mut removed = Vec::new();
        self.modify(|deps| {
            for request in requests {
                let key = request.key();
                if deps.shift_remove(&key).is_some() {
                    removed.push(key);
                }
            }
        })
        .await?;
        Ok(removed)
    }

    async fn modify(
        &self,
        edit: impl FnOnce(&mut Map<String, Value>),
    ) -> Result<(), ManifestError> {
        self.lock.dispatch(|| self.modify_locked(edit)).await
    }

    async fn modify_locked(
        &self,
        edit: impl FnOnce(&mut Map<String, Value>),
    ) -> Result<(), ManifestError> {
        let mut doc = match self.read_document().await {
            Ok(doc) => doc,
            Err(ManifestError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Value::Object(Map::new())
            }
            Err(e) => return Err(e),
        };
        let Value::Object(root) = &mut doc else {
            return Err(ManifestError::MissingWebDependencies);
        };
        let deps = root
            .entry(WEB_DEPENDENCIES)
            .or_insert_with(|| Value::Object(Map::new()));
        if !deps.is_object() {
            *deps = Value::Object(Map::new());
        }
        if let Value::Object(deps) = deps {
            edit(deps);
        }
        self.write_document(&doc).await
    }

    async fn read_document(&self) -> Result<Value, ManifestError> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        serde_json::from_str(&text).map_err(ManifestError::Parse)
    }

    async fn write_document(&self, doc: &Value) -> Result<(), ManifestError> {
        let mut text = serde_json::to_string_pretty(doc).map_err(ManifestError::Serialize)?;
        text.push('\n');
        tokio::fs::write(&self.path, text).await?;
        Ok(())
    }
}

fn web_dependencies(doc: &Value) -> Result<&Map<String, Value>, ManifestError> {
    doc.get(WEB_DEPENDENCIES)
        .and_then(Value::as_object)
        .ok_or(ManifestError::MissingWebDependencies)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_with(text: &str) -> (tempfile::TempDir, Manifest) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.json");
        std::fs::write(&path, text).unwrap();
        (dir, Manifest::new(path, IoLock::new()))
    }

    #[tokio::test]
    async fn reads_requests() {
        let (_dir, manifest) = manifest_with(
            r#"{
  "name": "app",
  "webDependencies": {
    "left-pad": "1.3.0",
    "lit-html/directives/repeat.js": "*",
    "@scope/pkg": "latest"
  }
}"#,
        );
        let requests = manifest.read_requests().await.unwrap();
        let rendered: Vec<_> = requests.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            ["left-pad@1.3.0", "lit-html/directives/repeat.js", "@scope/pkg"]
        );
    }

    #[tokio::test]
    async fn missing_web_dependencies_is_empty() {
        let (_dir, manifest) = manifest_with(r#"{"name": "app"}"#);
        assert!(manifest.read_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_manifest_is_an_error() {
        let (_dir, manifest) = manifest_with("{ nope");
        assert!(matches!(
            manifest.read_requests().await,
            Err(ManifestError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn add_preserves_other_fields_and_order() {
        let (_dir, manifest) = manifest_with(
            r#"{"name": "app", "version": "1.0.0", "webDependencies": {"b": "1.0.0"}, "private": true}"#,
        );
        manifest
            .add_entries(&[parse_request("a@2.0.0").unwrap(), parse_request("b@1.1.0").unwrap()])
            .await
            .unwrap();

        let text = std::fs::read_to_string(manifest.path()).unwrap();
        assert_eq!(
            text,
            r#"{
  "name": "app",
  "version": "1.0.0",
  "webDependencies": {
    "b": "1.1.0",
    "a": "2.0.0"
  },
  "private": true
}
"#
        );
    }

    #[tokio::test]
    async fn add_creates_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::new(dir.path().join("package.json"), IoLock::new());
        manifest
            .add_entries(&[parse_request("left-pad").unwrap()])
            .await
            .unwrap();
        let requests = manifest.read_requests().await.unwrap();
        assert_eq!(requests, [parse_request("left-pad").unwrap()]);
    }

    #[tokio::test]
    async fn remove_reports_present_keys() {
        let (_dir, manifest) =
            manifest_with(r#"{"webDependencies": {"left-pad": "1.3.0", "react": "16.13.1"}}"#);
        let removed = manifest
            .remove_entries(&[
                parse_request("left-pad").unwrap(),
                parse_request("vue").unwrap(),
            ])
            .await
            .unwrap();
        assert_eq!(removed, ["left-pad"]);
        let left: Vec<_> = manifest
            .read_requests()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(left, ["react"]);
    }

    #[tokio::test]
    async fn concurrent_adds_lose_nothing() {
        let (_dir, manifest) = manifest_with(r#"{"webDependencies": {}}"#);
        let requests: Vec<_> = (0..6)
            .map(|i| parse_request(&format!("pkg{i}@1.0.{i}")).unwrap())
            .collect();
        let results = futures::future::join_all(
            requests
                .iter()
                .map(|r| manifest.add_entries(std::slice::from_ref(r))),
        )
        .await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(manifest.read_requests().await.unwrap().len(), 6);
    }
}
