//! Module dependency graph resolution.
//!
//! Starting from a root entrypoint, fetches each module's source, extracts
//! its specifiers and recurses into every child concurrently. An entrypoint
//! is fetched and parsed at most once per resolution, which is what makes
//! diamond and cyclic graphs terminate.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;

use futures::future::{join_all, FutureExt as _, LocalBoxFuture};
use indexmap::IndexMap;
use tracing::{debug, warn};
use url::Url;

use crate::imports;
use crate::registry::RegistryError;
use crate::walker::{self, ParseError};

/// Module text and the location it was served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub source: String,
    /// Request path or URL the text was finally served from. Relative
    /// specifiers inside the module resolve against it.
    pub location: String,
}

/// Source of module text for the resolver.
#[allow(
    async_fn_in_trait,
    reason = "loaders are driven on a single-threaded runtime, no Send bound needed"
)]
pub trait SourceLoader {
    /// Fetch the module at `entrypoint`.
    async fn load(&self, entrypoint: &str) -> Result<LoadedModule, RegistryError>;
}

/// Why one entrypoint could not be resolved.
#[derive(Debug, Clone)]
pub enum ResolveError {
    /// The module was fetched but does not parse.
    Parse {
        entrypoint: String,
        source: ParseError,
    },
    /// The module could not be fetched.
    Registry(RegistryError),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { entrypoint, source } => write!(f, "{entrypoint}: {source}"),
            Self::Registry(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse { source, .. } => Some(source),
            Self::Registry(e) => Some(e),
        }
    }
}

impl From<RegistryError> for ResolveError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

/// An entrypoint that was skipped during resolution.
#[derive(Debug, Clone)]
pub struct ResolveFailure {
    pub entrypoint: String,
    pub error: ResolveError,
}

/// Entrypoint → referenced entrypoints, in discovery order.
///
/// Child lists hold specifiers as they will be fetched: relative specifiers
/// are already joined against the location their referrer was served from. A child that failed to
/// resolve still appears in its referrer's list but has no key of its own;
/// its failure is recorded in [`DependencyGraph::failures`].
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: IndexMap<String, Vec<String>>,
    failures: Vec<ResolveFailure>,
}

impl DependencyGraph {
    #[must_use]
    pub fn get(&self, entrypoint: &str) -> Option<&[String]> {
        self.edges.get(entrypoint).map(Vec::as_slice)
    }

    #[must_use]
    pub fn contains(&self, entrypoint: &str) -> bool {
        self.edges.contains_key(entrypoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> + '_ {
        self.edges.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn entrypoints(&self) -> impl Iterator<Item = &str> + '_ {
        self.edges.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    #[must_use]
    pub fn failures(&self) -> &[ResolveFailure] {
        &self.failures
    }

    /// Remove and return the failure recorded for `entrypoint`.
    pub fn take_failure(&mut self, entrypoint: &str) -> Option<ResolveError> {
        let idx = self
            .failures
            .iter()
            .position(|f| f.entrypoint == entrypoint)?;
        Some(self.failures.remove(idx).error)
    }
}

#[derive(Default)]
struct State {
    seen: HashSet<String>,
    edges: IndexMap<String, Vec<String>>,
    failures: Vec<ResolveFailure>,
}

/// Build the graph of every module reachable from `root`.
///
/// Returns once every reachable entrypoint has settled. Entrypoints that
/// fail to fetch or parse are skipped and reported through
/// [`DependencyGraph::failures`]; if the root itself fails the graph is
/// empty.
pub async fn resolve<L: SourceLoader>(loader: &L, root: &str) -> DependencyGraph {
    let state = RefCell::new(State::default());
    visit(loader, &state, root.to_string()).await;
    let State {
        edges, failures, ..
    } = state.into_inner();
    DependencyGraph { edges, failures }
}

fn visit<'a, L: SourceLoader>(
    loader: &'a L,
    state: &'a RefCell<State>,
    entrypoint: String,
) -> LocalBoxFuture<'a, ()> {
    async move {
        {
            let mut state = state.borrow_mut();
            if !state.seen.insert(entrypoint.clone()) {
                return;
            }
            // Reserve the key so discovery order is kept.
            state.edges.insert(entrypoint.clone(), Vec::new());
        }
        debug!(%entrypoint, "resolving module");

        let children = match children_of(loader, &entrypoint).await {
            Ok(children) => children,
            Err(error) => {
                warn!(%entrypoint, %error, "skipping unresolvable module");
                let mut state = state.borrow_mut();
                state.edges.shift_remove(&entrypoint);
                state.failures.push(ResolveFailure { entrypoint, error });
                return;
            }
        };

        if let Some(slot) = state.borrow_mut().edges.get_mut(&entrypoint) {
            slot.clone_from(&children);
        }
        join_all(
            children
                .into_iter()
                .map(|child| visit(loader, state, child)),
        )
        .await;
    }
    .boxed_local()
}

async fn children_of<L: SourceLoader>(
    loader: &L,
    entrypoint: &str,
) -> Result<Vec<String>, ResolveError> {
    let module = loader.load(entrypoint).await?;
    let walk = walker::walk(&module.source).map_err(|source| ResolveError::Parse {
        entrypoint: entrypoint.to_string(),
        source,
    })?;
    Ok(imports::dependencies(&walk)
        .into_iter()
        .map(|dep| join_specifier(&module.location, &dep.specifier))
        .collect())
}

/// Whether `specifier` is path-relative (`./x`, `../x`, `.` or `..`).
#[must_use]
pub fn is_relative(specifier: &str) -> bool {
    specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier == "."
        || specifier == ".."
}

/// Resolve `specifier` against the location of `referrer`.
///
/// Bare and absolute specifiers are returned unchanged.
#[must_use]
pub fn join_specifier(referrer: &str, specifier: &str) -> String {
    if !is_relative(specifier) {
        return specifier.to_string();
    }
    if let Ok(joined) = Url::parse(referrer).and_then(|base| base.join(specifier)) {
        return joined.into();
    }
    let dir = referrer.rfind('/').map_or("", |idx| &referrer[..=idx]);
    normalize(&format!("{dir}{specifier}"))
}

fn normalize(path: &str) -> String {
    let (prefix, rest) = if let Some(rest) = path.strip_prefix('/') {
        ("/", rest)
    } else if let Some(rest) = path.strip_prefix("./") {
        ("./", rest)
    } else {
        ("", path)
    };
    let trailing = rest.ends_with('/')
        || rest.ends_with("/.")
        || rest.ends_with("/..")
        || rest == "."
        || rest == "..";

    let mut segments: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = format!("{prefix}{}", segments.join("/"));
    if trailing && !segments.is_empty() {
        out.push('/');
    }
    if out.is_empty() {
        out.push_str("./");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory loader counting fetches per entrypoint.
    #[derive(Default)]
    struct MapLoader {
        modules: HashMap<String, String>,
        /// entrypoint -> location it redirects to
        redirects: HashMap<String, String>,
        loads: RefCell<HashMap<String, usize>>,
    }

    impl MapLoader {
        fn with(mut self, entrypoint: &str, text: &str) -> Self {
            self.modules.insert(entrypoint.to_string(), text.to_string());
            self
        }

        fn redirect(mut self, entrypoint: &str, location: &str) -> Self {
            self.redirects
                .insert(entrypoint.to_string(), location.to_string());
            self
        }

        fn loads(&self, entrypoint: &str) -> usize {
            self.loads.borrow().get(entrypoint).copied().unwrap_or(0)
        }
    }

    impl SourceLoader for MapLoader {
        async fn load(&self, entrypoint: &str) -> Result<LoadedModule, RegistryError> {
            *self
                .loads
                .borrow_mut()
                .entry(entrypoint.to_string())
                .or_default() += 1;
            tokio::task::yield_now().await;
            let location = self
                .redirects
                .get(entrypoint)
                .map_or(entrypoint, String::as_str);
            let source = self
                .modules
                .get(location)
                .cloned()
                .ok_or_else(|| RegistryError::Http {
                    registry: "test",
                    path: entrypoint.to_string(),
                    message: "404".into(),
                })?;
            Ok(LoadedModule {
                source,
                location: location.to_string(),
            })
        }
    }

    // ── graph resolution ────────────────────────────────────────────────

    #[tokio::test]
    async fn leaf_package_graph() {
        let loader = MapLoader::default().with("./left-pad/", "export default function leftPad() {}\n");
        let graph = resolve(&loader, "./left-pad/").await;
        let edges: Vec<_> = graph.iter().collect();
        assert_eq!(edges, [("./left-pad/", &[][..])]);
        assert!(graph.failures().is_empty());
    }

    #[tokio::test]
    async fn fan_in_fetches_once() {
        let loader = MapLoader::default()
            .with("root", "import 'a';\nimport 'b';\nimport 'shared';\n")
            .with("a", "import 'shared';\n")
            .with("b", "export * from 'shared';\n")
            .with("shared", "export const x = 1;\n");
        let graph = resolve(&loader, "root").await;

        assert_eq!(graph.len(), 4);
        for entrypoint in ["root", "a", "b", "shared"] {
            assert_eq!(loader.loads(entrypoint), 1, "{entrypoint} fetched once");
        }
        assert_eq!(graph.get("a").unwrap(), ["shared"]);
        assert_eq!(graph.entrypoints().next(), Some("root"));
    }

    #[tokio::test]
    async fn cycle_terminates_with_both_edges() {
        let loader = MapLoader::default()
            .with("a", "import 'b';\nexport const a = 1;\n")
            .with("b", "import 'a';\nexport const b = 2;\n");
        let graph = resolve(&loader, "a").await;

        assert_eq!(graph.get("a").unwrap(), ["b"]);
        assert_eq!(graph.get("b").unwrap(), ["a"]);
        assert_eq!(loader.loads("a"), 1);
        assert_eq!(loader.loads("b"), 1);
    }

    #[tokio::test]
    async fn relative_children_are_joined_to_referrer() {
        let loader = MapLoader::default()
            .with("/-/lib@v1.0.0-abc/dist/index.js", "import './util.js';\nimport('../extra/x.js');\n")
            .with("/-/lib@v1.0.0-abc/dist/util.js", "")
            .with("/-/lib@v1.0.0-abc/extra/x.js", "");
        let graph = resolve(&loader, "/-/lib@v1.0.0-abc/dist/index.js").await;

        assert_eq!(
            graph.get("/-/lib@v1.0.0-abc/dist/index.js").unwrap(),
            ["/-/lib@v1.0.0-abc/dist/util.js", "/-/lib@v1.0.0-abc/extra/x.js"]
        );
        assert_eq!(graph.len(), 3);
    }

    #[tokio::test]
    async fn relative_children_follow_redirects() {
        let loader = MapLoader::default()
            .redirect("./left-pad", "/left-pad@1.3.0/index.js")
            .with("/left-pad@1.3.0/index.js", "import './util.js';\n")
            .with("/left-pad@1.3.0/util.js", "");
        let graph = resolve(&loader, "./left-pad").await;

        assert_eq!(graph.get("./left-pad").unwrap(), ["/left-pad@1.3.0/util.js"]);
        assert!(graph.contains("/left-pad@1.3.0/util.js"));
        assert_eq!(loader.loads("./util.js"), 0);
        assert!(graph.failures().is_empty());
    }

    #[tokio::test]
    async fn failing_child_is_skipped_and_reported() {
        let loader = MapLoader::default()
            .with("root", "import 'missing';\nimport 'broken';\nimport 'ok';\n")
            .with("broken", "export {")
            .with("ok", "");
        let mut graph = resolve(&loader, "root").await;

        assert_eq!(graph.get("root").unwrap(), ["missing", "broken", "ok"]);
        assert!(graph.contains("ok"));
        assert!(!graph.contains("missing"));
        assert!(!graph.contains("broken"));
        assert_eq!(graph.failures().len(), 2);
        assert!(matches!(
            graph.take_failure("broken"),
            Some(ResolveError::Parse { .. })
        ));
        assert!(matches!(
            graph.take_failure("missing"),
            Some(ResolveError::Registry(_))
        ));
    }

    #[tokio::test]
    async fn root_failure_leaves_empty_graph() {
        let loader = MapLoader::default();
        let mut graph = resolve(&loader, "nope").await;
        assert!(graph.is_empty());
        assert!(graph.take_failure("nope").is_some());
        assert!(graph.take_failure("nope").is_none());
    }

    #[tokio::test]
    async fn duplicate_specifiers_fetch_once() {
        let loader = MapLoader::default()
            .with("root", "import a from 'dep';\nimport { b } from 'dep';\n")
            .with("dep", "");
        let graph = resolve(&loader, "root").await;
        assert_eq!(graph.get("root").unwrap(), ["dep", "dep"]);
        assert_eq!(loader.loads("dep"), 1);
    }

    // ── specifier joining ───────────────────────────────────────────────

    #[test]
    fn bare_and_absolute_pass_through() {
        assert_eq!(join_specifier("./lib/index.js", "react"), "react");
        assert_eq!(join_specifier("./lib/index.js", "/-/x.js"), "/-/x.js");
        assert_eq!(
            join_specifier("./lib/index.js", "https://cdn.example/x.js"),
            "https://cdn.example/x.js"
        );
    }

    #[test]
    fn joins_relative_against_directory() {
        assert_eq!(join_specifier("./left-pad/", "./index.js"), "./left-pad/index.js");
        assert_eq!(join_specifier("./lib/a/b.js", "../c.js"), "./lib/c.js");
        assert_eq!(join_specifier("/-/p@v1-h/x.js", "./y.js"), "/-/p@v1-h/y.js");
        assert_eq!(join_specifier("lib/a.js", "./b.js"), "lib/b.js");
        assert_eq!(join_specifier("a.js", "./b.js"), "./b.js");
    }

    #[test]
    fn directory_specifiers_keep_trailing_slash() {
        assert_eq!(join_specifier("./lib/a/b.js", "."), "./lib/a/");
        assert_eq!(join_specifier("./lib/a/b.js", ".."), "./lib/");
        assert_eq!(join_specifier("./lib/a/b.js", "./sub/"), "./lib/a/sub/");
    }

    #[test]
    fn parent_beyond_root_is_clamped() {
        assert_eq!(join_specifier("/a.js", "../../b.js"), "/b.js");
    }

    #[test]
    fn absolute_referrer_uses_url_join() {
        assert_eq!(
            join_specifier("https://cdn.example/pkg/a.js", "./b.js"),
            "https://cdn.example/pkg/b.js"
        );
    }

    #[test]
    fn relative_detection() {
        assert!(is_relative("./a"));
        assert!(is_relative("../a"));
        assert!(is_relative("."));
        assert!(!is_relative(".hidden"));
        assert!(!is_relative("a/./b"));
    }
}
