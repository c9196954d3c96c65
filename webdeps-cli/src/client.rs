//! HTTP client for CDN module fetches.
//!
//! Every request is memoized by its absolute URL for the lifetime of the
//! client, so one process run never fetches the same URL twice. Requests run
//! on the blocking pool via [`tokio::task::spawn_blocking`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::debug;
use ureq::ResponseExt as _;
use url::Url;

/// Header some CDNs use to point at the authoritative module URL.
pub const IMPORT_URL_HEADER: &str = "x-import-url";

/// Errors from CDN fetches.
#[derive(Debug, Clone)]
pub enum FetchError {
    /// The base URL or a request path could not form a URL.
    InvalidUrl { input: String, message: String },
    /// The request failed below HTTP (connection, timeout, body read).
    Http { url: String, message: String },
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl { input, message } => write!(f, "invalid URL `{input}`: {message}"),
            Self::Http { url, message } => write!(f, "HTTP error fetching {url}: {message}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// A fetched module response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedModule {
    /// Response body.
    pub source: String,
    /// Final URL after redirects and any `x-import-url` hop.
    pub url: String,
    /// Path component of [`FetchedModule::url`].
    pub response_path: String,
    /// HTTP status of the final response. Informational only.
    pub status: u16,
}

impl FetchedModule {
    /// The first line of the response body.
    #[must_use]
    pub fn first_line(&self) -> &str {
        self.source.lines().next().unwrap_or("")
    }
}

type Cell = Arc<OnceCell<Arc<FetchedModule>>>;

/// A memoizing client bound to one CDN base URL.
#[derive(Debug)]
pub struct CdnClient {
    base: Url,
    agent: ureq::Agent,
    cache: Mutex<HashMap<String, Cell>>,
}

impl CdnClient {
    /// Create a client for `base`. A `timeout` of `None` disables the
    /// per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidUrl`] if `base` is not an absolute URL.
    pub fn with_base(base: &str, timeout: Option<Duration>) -> Result<Self, FetchError> {
        let mut normalized = base.to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base = Url::parse(&normalized).map_err(|e| FetchError::InvalidUrl {
            input: base.to_string(),
            message: e.to_string(),
        })?;

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(timeout)
            .build()
            .into();

        Ok(Self {
            base,
            agent,
            cache: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Resolve a request path (`./name/`, `/-/x.js`, `https://...`) against
    /// the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidUrl`] if the path cannot be joined.
    pub fn url_for(&self, path: &str) -> Result<Url, FetchError> {
        self.base.join(path).map_err(|e| FetchError::InvalidUrl {
            input: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Where `module` was served from, as a request path for this client.
    ///
    /// Same-origin responses give the absolute path (`/-/x@v1.0.0-abc/x.js`),
    /// anything else the full URL.
    #[must_use]
    pub fn location(&self, module: &FetchedModule) -> String {
        match Url::parse(&module.url) {
            Ok(url) if url.origin() == self.base.origin() => module.response_path.clone(),
            _ => module.url.clone(),
        }
    }

    /// Fetch `path`, following redirects and at most one `x-import-url` hop.
    ///
    /// Concurrent callers asking for the same URL share a single request.
    /// Failures are not cached.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on URL or transport failure. HTTP error
    /// statuses are not errors.
    pub async fn fetch(&self, path: &str) -> Result<Arc<FetchedModule>, FetchError> {
        let url = self.url_for(path)?;
        let cell = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cache.entry(url.to_string()).or_default())
        };

        if let Some(hit) = cell.get() {
            debug!(url = %url, "fetch cache hit");
            return Ok(Arc::clone(hit));
        }

        let module = cell
            .get_or_try_init(|| async {
                let agent = self.agent.clone();
                let request = url.clone();
                tokio::task::spawn_blocking(move || fetch_blocking(&agent, request))
                    .await
                    .map_err(|e| FetchError::Http {
                        url: url.to_string(),
                        message: e.to_string(),
                    })?
                    .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(module))
    }
}

fn fetch_blocking(agent: &ureq::Agent, url: Url) -> Result<FetchedModule, FetchError> {
    let first = get(agent, &url)?;
    let Some(import_url) = first.import_url else {
        return Ok(first.module);
    };

    let final_base = Url::parse(&first.module.url).unwrap_or(url);
    let next = final_base
        .join(&import_url)
        .map_err(|e| FetchError::InvalidUrl {
            input: import_url.clone(),
            message: e.to_string(),
        })?;
    debug!(from = %first.module.url, to = %next, "following x-import-url");
    Ok(get(agent, &next)?.module)
}

struct Response {
    module: FetchedModule,
    import_url: Option<String>,
}

fn get(agent: &ureq::Agent, url: &Url) -> Result<Response, FetchError> {
    debug!(url = %url, "fetch");
    let http_err = |e: ureq::Error| FetchError::Http {
        url: url.to_string(),
        message: e.to_string(),
    };

    let mut resp = agent.get(url.as_str()).call().map_err(http_err)?;
    let status = resp.status().as_u16();
    let final_uri = resp.get_uri().clone();
    let import_url = resp
        .headers()
        .get(IMPORT_URL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let source = resp.body_mut().read_to_string().map_err(http_err)?;

    Ok(Response {
        module: FetchedModule {
            source,
            url: final_uri.to_string(),
            response_path: final_uri.path().to_string(),
            status,
        },
        import_url,
    })
}
