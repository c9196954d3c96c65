//! Browser import map construction and persistence.
//!
//! Every installed module contributes a fragment: root packages map their
//! import name in `imports`, modules imported by another module map it in the
//! scope of the importer's directory. Fragments are deep-merged into
//! `{out}/import-map.json` under an [`IoLock`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::lock::IoLock;
use crate::package::PackageDescriptor;

/// Errors from import map persistence.
#[derive(Debug)]
pub enum ImportMapError {
    /// Reading or writing the map failed.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The merged map could not be serialized.
    Serialize(serde_json::Error),
}

impl fmt::Display for ImportMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Serialize(e) => write!(f, "cannot serialize import map: {e}"),
        }
    }
}

impl std::error::Error for ImportMapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialize(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for ImportMapError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize(e)
    }
}

/// Import name → URL path.
pub type Imports = BTreeMap<String, String>;

/// An import map document (or fragment of one).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMap {
    #[serde(default)]
    pub imports: Imports,
    #[serde(default)]
    pub scopes: BTreeMap<String, Imports>,
}

impl ImportMap {
    /// The fragment one descriptor contributes.
    #[must_use]
    pub fn fragment(descriptor: &PackageDescriptor) -> Self {
        let entry = Imports::from([(
            descriptor.import_name.clone(),
            descriptor.storage.relative_path.clone(),
        )]);
        match &descriptor.parent {
            None => Self {
                imports: entry,
                scopes: BTreeMap::new(),
            },
            Some(parent) => Self {
                imports: Imports::new(),
                scopes: BTreeMap::from([(parent.storage.relative_dir.clone(), entry)]),
            },
        }
    }

    /// Every URL path the map points at.
    #[must_use]
    pub fn paths(&self) -> BTreeSet<String> {
        self.imports
            .values()
            .chain(self.scopes.values().flat_map(BTreeMap::values))
            .cloned()
            .collect()
    }
}

/// Merge `source` into `target`.
///
/// Objects merge key by key, recursing where both sides hold an object.
/// Arrays concatenate. Anything else is overwritten by `source`.
pub fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() || existing.is_array() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(source)) => target.extend(source),
        (target, source) => *target = source,
    }
}

/// Directory part of a URL path, with trailing `/`.
#[must_use]
pub fn parent_dir(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..=idx])
}

/// Result of [`ImportMapStore::remove_dependency`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    /// The removed top-level mapping, if the name was mapped.
    pub import: Option<String>,
    /// Scope directories that were dropped.
    pub scopes: Vec<String>,
    /// Paths no longer referenced anywhere in the map.
    pub orphaned: BTreeSet<String>,
    /// Paths still referenced after the removal.
    pub retained: BTreeSet<String>,
    /// Whether the owner's scope is still reachable from another import.
    pub owner_retained: bool,
}

/// The persisted import map of one output directory.
#[derive(Debug, Clone)]
pub struct ImportMapStore {
    path: PathBuf,
    lock: IoLock,
}

impl ImportMapStore {
    #[must_use]
    pub fn new(path: PathBuf, lock: IoLock) -> Self {
        Self { path, lock }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current map. A missing or unparsable file is an empty map.
    pub async fn read(&self) -> ImportMap {
        let value = read_value(&self.path).await;
        serde_json::from_value(value).unwrap_or_default()
    }

    /// Deep-merge `fragment` into the persisted map.
    ///
    /// # Errors
    ///
    /// Returns [`ImportMapError`] if the directory or file cannot be written.
    pub async fn persist(&self, fragment: &ImportMap) -> Result<(), ImportMapError> {
        let patch = serde_json::to_value(fragment)?;
        self.lock
            .dispatch(|| async {
                let mut current = read_value(&self.path).await;
                if !current.is_object() {
                    current = Value::Object(serde_json::Map::new());
                }
                deep_merge(&mut current, patch);
                self.write_value(&current).await
            })
            .await?;
        debug!(path = %self.path.display(), "import map updated");
        Ok(())
    }

    /// Remove `import_name` from `imports` and drop everything it alone kept
    /// alive.
    ///
    /// Reachability starts at the remaining top-level imports: a mapped path
    /// makes the scope of its directory reachable, whose paths make further
    /// scopes reachable. Unreachable scopes are dropped and their paths are
    /// reported as orphaned. `owner_dir` is the removed package's directory.
    ///
    /// # Errors
    ///
    /// Returns [`ImportMapError`] if the file cannot be written.
    pub async fn remove_dependency(
        &self,
        import_name: &str,
        owner_dir: &str,
    ) -> Result<Removal, ImportMapError> {
        self.lock
            .dispatch(|| self.remove_locked(import_name, owner_dir))
            .await
    }

    async fn remove_locked(
        &self,
        import_name: &str,
        owner_dir: &str,
    ) -> Result<Removal, ImportMapError> {
        let mut current = read_value(&self.path).await;
        let mut map: ImportMap = serde_json::from_value(current.clone()).unwrap_or_default();
        let before = map.paths();

        let import = map.imports.remove(import_name);
        let reachable_dirs = reachable_scopes(&map);
        let dropped: Vec<String> = map
            .scopes
            .keys()
            .filter(|dir| !reachable_dirs.contains(dir.as_str()))
            .cloned()
            .collect();
        for dir in &dropped {
            map.scopes.remove(dir);
        }
        let retained = map.paths();

        // Write back through the raw document so unknown fields survive.
        if let Value::Object(doc) = &mut current {
            doc.insert("imports".into(), serde_json::to_value(&map.imports)?);
            doc.insert("scopes".into(), serde_json::to_value(&map.scopes)?);
        } else {
            current = serde_json::to_value(&map)?;
        }
        self.write_value(&current).await?;

        Ok(Removal {
            import,
            scopes: dropped,
            orphaned: before.difference(&retained).cloned().collect(),
            owner_retained: reachable_dirs.contains(owner_dir),
            retained,
        })
    }

    async fn write_value(&self, value: &Value) -> Result<(), ImportMapError> {
        let io_err = |source| ImportMapError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        }
        let mut text = serde_json::to_string_pretty(value)?;
        text.push('\n');
        tokio::fs::write(&self.path, text).await.map_err(io_err)
    }
}

async fn read_value(path: &Path) -> Value {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            debug!(path = %path.display(), error = %e, "ignoring unparsable import map");
            Value::Object(serde_json::Map::new())
        }),
        Err(_) => Value::Object(serde_json::Map::new()),
    }
}

fn reachable_scopes(map: &ImportMap) -> BTreeSet<String> {
    let mut reachable = BTreeSet::new();
    let mut pending: Vec<&str> = map.imports.values().map(|p| parent_dir(p)).collect();
    while let Some(dir) = pending.pop() {
        if !reachable.insert(dir.to_string()) {
            continue;
        }
        if let Some(imports) = map.scopes.get(dir) {
            pending.extend(imports.values().map(|p| parent_dir(p)));
        }
    }
    reachable
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> ImportMap {
        serde_json::from_value(value).unwrap()
    }

    // ── merging ─────────────────────────────────────────────────────────

    #[test]
    fn merge_imports_and_scopes() {
        let mut target = json!({"imports": {"a": "/x"}, "scopes": {}});
        deep_merge(&mut target, json!({"imports": {}, "scopes": {"/d/": {"b": "/y"}}}));
        let expected = json!({"imports": {"a": "/x"}, "scopes": {"/d/": {"b": "/y"}}});
        assert_eq!(target, expected);

        deep_merge(&mut target, json!({"imports": {}, "scopes": {"/d/": {"b": "/y"}}}));
        assert_eq!(target, expected);
    }

    #[test]
    fn merge_overwrites_scalars_and_concatenates_arrays() {
        let mut target = json!({"a": 1, "list": [1], "nested": {"k": "old", "keep": true}});
        deep_merge(
            &mut target,
            json!({"a": 2, "list": [2], "nested": {"k": "new"}}),
        );
        assert_eq!(
            target,
            json!({"a": 2, "list": [1, 2], "nested": {"k": "new", "keep": true}})
        );
    }

    #[test]
    fn parent_dirs() {
        assert_eq!(parent_dir("/web_modules/a/1.0.0/a.js"), "/web_modules/a/1.0.0/");
        assert_eq!(parent_dir("a.js"), "");
    }

    // ── persistence ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn read_treats_missing_and_garbage_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("import-map.json");
        let store = ImportMapStore::new(path.clone(), IoLock::new());
        assert_eq!(store.read().await, ImportMap::default());

        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(store.read().await, ImportMap::default());

        store
            .persist(&map(json!({"imports": {"a": "/x"}})))
            .await
            .unwrap();
        assert_eq!(store.read().await.imports["a"], "/x");
    }

    #[tokio::test]
    async fn concurrent_persists_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImportMapStore::new(dir.path().join("out").join("import-map.json"), IoLock::new());

        let fragments: Vec<ImportMap> = (0..8)
            .map(|i| {
                if i % 2 == 0 {
                    map(json!({"imports": {format!("pkg{i}"): format!("/p{i}.js")}}))
                } else {
                    map(json!({"scopes": {"/d/": {format!("pkg{i}"): format!("/p{i}.js")}}}))
                }
            })
            .collect();
        let results =
            futures::future::join_all(fragments.iter().map(|f| store.persist(f))).await;
        assert!(results.iter().all(Result::is_ok));

        let merged = store.read().await;
        assert_eq!(merged.imports.len(), 4);
        assert_eq!(merged.scopes["/d/"].len(), 4);
    }

    #[tokio::test]
    async fn persist_keeps_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("import-map.json");
        std::fs::write(&path, r#"{"integrity": {"/x": "sha384-abc"}}"#).unwrap();
        let store = ImportMapStore::new(path.clone(), IoLock::new());
        store
            .persist(&map(json!({"imports": {"a": "/x"}})))
            .await
            .unwrap();
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["integrity"]["/x"], "sha384-abc");
        assert_eq!(raw["imports"]["a"], "/x");
    }

    // ── removal ─────────────────────────────────────────────────────────

    async fn store_with(value: Value) -> (tempfile::TempDir, ImportMapStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ImportMapStore::new(dir.path().join("import-map.json"), IoLock::new());
        store.persist(&map(value)).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn removal_drops_exclusive_dependencies() {
        let (_dir, store) = store_with(json!({
            "imports": {
                "app": "/m/app/1.0.0/app.js",
                "other": "/m/other/1.0.0/other.js"
            },
            "scopes": {
                "/m/app/1.0.0/": {"dep": "/m/dep/1.0.0/dep.js", "shared": "/m/shared/1.0.0/shared.js"},
                "/m/dep/1.0.0/": {"leaf": "/m/leaf/1.0.0/leaf.js"},
                "/m/other/1.0.0/": {"shared": "/m/shared/1.0.0/shared.js"}
            }
        }))
        .await;

        let removal = store.remove_dependency("app", "/m/app/1.0.0/").await.unwrap();
        assert_eq!(removal.import.as_deref(), Some("/m/app/1.0.0/app.js"));
        assert!(!removal.owner_retained);
        assert_eq!(removal.scopes, ["/m/app/1.0.0/", "/m/dep/1.0.0/"]);
        let orphaned: Vec<_> = removal.orphaned.iter().map(String::as_str).collect();
        assert_eq!(
            orphaned,
            ["/m/app/1.0.0/app.js", "/m/dep/1.0.0/dep.js", "/m/leaf/1.0.0/leaf.js"]
        );
        assert!(removal.retained.contains("/m/shared/1.0.0/shared.js"));

        let after = store.read().await;
        assert_eq!(
            after,
            map(json!({
                "imports": {"other": "/m/other/1.0.0/other.js"},
                "scopes": {"/m/other/1.0.0/": {"shared": "/m/shared/1.0.0/shared.js"}}
            }))
        );
    }

    #[tokio::test]
    async fn removal_keeps_scope_still_reachable_elsewhere() {
        let (_dir, store) = store_with(json!({
            "imports": {
                "lib": "/m/lib/1.0.0/lib.js",
                "app": "/m/app/1.0.0/app.js"
            },
            "scopes": {
                "/m/app/1.0.0/": {"lib": "/m/lib/1.0.0/lib.js"},
                "/m/lib/1.0.0/": {"tslib": "/m/tslib/2.0.0/tslib.js"}
            }
        }))
        .await;

        let removal = store.remove_dependency("lib", "/m/lib/1.0.0/").await.unwrap();
        assert!(removal.owner_retained);
        assert!(removal.scopes.is_empty());
        assert!(removal.orphaned.is_empty());
        assert!(store.read().await.scopes.contains_key("/m/lib/1.0.0/"));
    }

    #[tokio::test]
    async fn removing_unknown_name_changes_nothing() {
        let (_dir, store) = store_with(json!({"imports": {"a": "/m/a/1/a.js"}})).await;
        let removal = store.remove_dependency("nope", "/m/nope/1/").await.unwrap();
        assert_eq!(removal.import, None);
        assert!(removal.orphaned.is_empty());
        assert_eq!(store.read().await.imports.len(), 1);
    }
}
