//! # SwKit Net
//!
//! The request/response model the worker intercepts, and the [`Fetcher`] seam
//! it uses to reach the network.
//!
//! ## Design Goals
//!
//! 1. **Cheap clones**: response bodies are shared [`Bytes`], so a response can be
//!    cloned into a cache and still returned to the page.
//! 2. **Failure means transport failure**: a 404 or 500 is a successful fetch;
//!    only connection-level problems are errors.
//! 3. **Swappable network**: [`HttpFetcher`] for real traffic, [`RouteFetcher`]
//!    for tests and offline simulation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use swkit_common::{Result, SwKitError};
use tracing::{debug, info, trace};
use url::Url;

pub mod route;

pub use route::RouteFetcher;

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as the page's fetch machinery reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Cross-origin allowed with CORS.
    #[default]
    Cors,
    /// Opaque cross-origin.
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Parse `url` and create a GET request for it.
    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| SwKitError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this is a full-page navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Bytes,
    /// Whether this response was served from a cache namespace.
    pub from_cache: bool,
}

impl Response {
    /// Create a network response.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    /// Create a `200 OK` response.
    pub fn ok_with_body(url: Url, body: impl Into<Bytes>) -> Self {
        Self::new(url, StatusCode::OK, body)
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Mark as served from cache.
    pub fn cached(mut self) -> Self {
        self.from_cache = true;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Only plain `200 OK` responses are ever written to a cache.
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK
    }

    /// Borrow the body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Get the body as bytes.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| SwKitError::network_with_source("response body is not UTF-8", e))
    }
}

/// Anything that can perform a network fetch.
///
/// A returned `Err` means the network could not produce a response at all.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("SwKit/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Fetcher backed by a reqwest client.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| SwKitError::network_with_source("failed to build HTTP client", e))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    fn map_error(&self, url: &Url, err: reqwest::Error) -> SwKitError {
        if err.is_timeout() {
            SwKitError::Timeout(self.config.default_timeout)
        } else {
            SwKitError::network_with_source(format!("fetch {url} failed"), err)
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| self.map_error(&request.url, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_error(&request.url, e))?;

        trace!(url = %url, status = %status, body_len = body.len(), "Response received");

        Ok(Response {
            url,
            status,
            headers,
            body,
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com/api/items?page=2").unwrap();
        let request = Request::get(url.clone()).header(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("application/json"),
        );

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert!(!request.is_navigation());
    }

    #[test]
    fn test_navigate_request() {
        let request = Request::navigate(Url::parse("https://app.test/dashboard").unwrap());
        assert!(request.is_navigation());
        assert_eq!(request.method, Method::GET);
    }

    #[test]
    fn test_parse_rejects_relative_url() {
        assert!(matches!(
            Request::parse("/relative"),
            Err(SwKitError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_only_200_is_cacheable() {
        let url = Url::parse("https://app.test/logo.png").unwrap();
        assert!(Response::ok_with_body(url.clone(), "png").is_cacheable());
        assert!(!Response::new(url.clone(), StatusCode::NO_CONTENT, "").is_cacheable());
        assert!(Response::new(url.clone(), StatusCode::NO_CONTENT, "").ok());
        assert!(!Response::new(url, StatusCode::NOT_FOUND, "").ok());
    }

    #[test]
    fn test_response_clone_shares_body() {
        let url = Url::parse("https://app.test/app.js").unwrap();
        let original = Response::ok_with_body(url, "console.log(1)");
        let copy = original.clone().cached();

        assert_eq!(copy.body(), original.body());
        assert!(copy.from_cache);
        assert!(!original.from_cache);
    }

    #[tokio::test]
    async fn test_http_fetcher_returns_body_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[1,2,3]"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/api/projects", server.uri())).unwrap();
        let response = fetcher.fetch(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().unwrap(), "[1,2,3]");
        assert!(!response.from_cache);
    }

    #[tokio::test]
    async fn test_http_fetcher_error_status_is_not_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/api/down", server.uri())).unwrap();
        let response = fetcher.fetch(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!response.is_cacheable());
    }

    #[tokio::test]
    async fn test_http_fetcher_connection_refused_is_network_failure() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let fetcher = HttpFetcher::new(LoaderConfig {
            default_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        let request = Request::parse(&format!("{uri}/gone")).unwrap();
        let err = fetcher.fetch(&request).await.unwrap_err();

        assert!(err.is_network_failure());
    }
}
