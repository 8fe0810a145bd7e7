//! Retrieval strategies.
//!
//! Within one request every cache and network step runs strictly in sequence.
//! Across requests nothing is coordinated: two concurrent misses for the same
//! URL both fetch, and the later write wins.

use std::sync::Arc;
use std::time::Duration;

use http::Method;
use swkit_cache::Caches;
use swkit_common::{maybe_with_timeout, Result};
use swkit_net::{Fetcher, Request, Response};
use tracing::{debug, error, warn};
use url::Url;

use crate::classify::RequestClass;
use crate::config::CacheNames;

/// Strategy applied to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Cache, then network (static assets).
    CacheFirst,
    /// Network, then cache (API calls).
    NetworkFirst,
    /// Network, then the precached offline document (navigations).
    NetworkWithOfflineFallback,
}

impl Strategy {
    /// Strategy for a request class; `None` means do not intercept.
    pub fn for_class(class: RequestClass) -> Option<Self> {
        match class {
            RequestClass::Passthrough => None,
            RequestClass::Api => Some(Self::NetworkFirst),
            RequestClass::Navigation => Some(Self::NetworkWithOfflineFallback),
            RequestClass::StaticAsset => Some(Self::CacheFirst),
        }
    }
}

/// Executes strategies against the cache storage and the network.
pub struct StrategyEngine {
    caches: Caches,
    fetcher: Arc<dyn Fetcher>,
    names: CacheNames,
    offline_url: Url,
    timeout: Option<Duration>,
}

impl StrategyEngine {
    pub fn new(
        caches: Caches,
        fetcher: Arc<dyn Fetcher>,
        names: CacheNames,
        offline_url: Url,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            caches,
            fetcher,
            names,
            offline_url,
            timeout,
        }
    }

    /// Run `strategy` for `request`.
    pub async fn execute(&self, strategy: Strategy, request: &Request) -> Result<Response> {
        match strategy {
            Strategy::CacheFirst => self.cache_first(request).await,
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::NetworkWithOfflineFallback => self.navigate(request).await,
        }
    }

    /// Serve from the deployment's caches; on a miss fetch and store into the
    /// runtime namespace. Network failures on a miss propagate.
    pub async fn cache_first(&self, request: &Request) -> Result<Response> {
        if is_cacheable_request(request) {
            for name in [&self.names.runtime, &self.names.precache] {
                if let Some(hit) = self.lookup(name, request).await {
                    debug!(url = %request.url, cache = %name, "Cache hit");
                    return Ok(hit);
                }
            }
        }

        match self.fetch(request).await {
            Ok(response) => {
                self.store(&self.names.runtime, request, &response).await;
                Ok(response)
            }
            Err(e) => {
                error!(url = %request.url, error = %e, "Fetch failed");
                Err(e)
            }
        }
    }

    /// Fetch and refresh the API namespace; on network failure serve the last
    /// stored response, or propagate the failure if there is none.
    pub async fn network_first(&self, request: &Request) -> Result<Response> {
        match self.fetch(request).await {
            Ok(response) => {
                self.store(&self.names.api, request, &response).await;
                Ok(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network request failed, trying cache");
                if is_cacheable_request(request) {
                    if let Some(stale) = self.lookup(&self.names.api, request).await {
                        return Ok(stale);
                    }
                }
                Err(e)
            }
        }
    }

    /// Fetch a document; on network failure serve the offline page regardless
    /// of which URL was requested.
    pub async fn navigate(&self, request: &Request) -> Result<Response> {
        match self.fetch(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Navigation failed, serving offline page");
                let offline = Request::get(self.offline_url.clone());
                match self.lookup(&self.names.precache, &offline).await {
                    Some(page) => Ok(page),
                    None => Err(e),
                }
            }
        }
    }

    async fn fetch(&self, request: &Request) -> Result<Response> {
        maybe_with_timeout(self.timeout, self.fetcher.fetch(request)).await
    }

    /// Cache reads never fail the request: an unreadable entry is a miss.
    async fn lookup(&self, namespace: &str, request: &Request) -> Option<Response> {
        match self.caches.match_in(namespace, request).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(cache = namespace, url = %request.url, error = %e, "Cache read failed");
                None
            }
        }
    }

    /// Cache writes never fail the request: errors are logged and dropped.
    async fn store(&self, namespace: &str, request: &Request, response: &Response) {
        if !is_cacheable_request(request) || !response.is_cacheable() {
            return;
        }
        let result = match self.caches.open(namespace).await {
            Ok(cache) => cache.put(request, response).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(cache = namespace, url = %request.url, error = %e, "Cache write failed");
        }
    }
}

/// Only GET requests have cacheable semantics.
fn is_cacheable_request(request: &Request) -> bool {
    request.method == Method::GET
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use swkit_cache::MemoryBackend;
    use swkit_net::RouteFetcher;

    use crate::config::WorkerConfig;

    struct Harness {
        engine: StrategyEngine,
        caches: Caches,
        fetcher: Arc<RouteFetcher>,
        names: CacheNames,
    }

    fn harness_with(fetcher: RouteFetcher, caches: Caches, timeout: Option<Duration>) -> Harness {
        let config = WorkerConfig::for_origin(base());
        let names = config.cache_names();
        let fetcher = Arc::new(fetcher);
        let engine = StrategyEngine::new(
            caches.clone(),
            fetcher.clone(),
            names.clone(),
            config.resolve(&config.offline_page).unwrap(),
            timeout,
        );
        Harness {
            engine,
            caches,
            fetcher,
            names,
        }
    }

    fn harness(fetcher: RouteFetcher) -> Harness {
        harness_with(fetcher, Caches::in_memory(), None)
    }

    fn base() -> Url {
        Url::parse("https://app.test/").unwrap()
    }

    fn get(path: &str) -> Request {
        Request::get(base().join(path).unwrap())
    }

    #[test]
    fn test_strategy_for_class() {
        assert_eq!(Strategy::for_class(RequestClass::Passthrough), None);
        assert_eq!(
            Strategy::for_class(RequestClass::Api),
            Some(Strategy::NetworkFirst)
        );
        assert_eq!(
            Strategy::for_class(RequestClass::StaticAsset),
            Some(Strategy::CacheFirst)
        );
    }

    #[tokio::test]
    async fn test_cache_first_miss_then_hit() {
        let h = harness(RouteFetcher::new(base()).with_route("/logo.png", "png-bytes"));

        let first = h.engine.cache_first(&get("/logo.png")).await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(h.fetcher.calls(), 1);
        let runtime = h.caches.open(&h.names.runtime).await.unwrap();
        assert_eq!(runtime.keys().await.unwrap().len(), 1);

        let second = h.engine.cache_first(&get("/logo.png")).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.body(), first.body());
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_first_serves_precached_asset() {
        let h = harness(RouteFetcher::new(base()));
        let request = get("/manifest.json");
        h.caches
            .open(&h.names.precache)
            .await
            .unwrap()
            .put(&request, &Response::ok_with_body(request.url.clone(), "{}"))
            .await
            .unwrap();

        let response = h.engine.cache_first(&request).await.unwrap();
        assert!(response.from_cache);
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_first_does_not_store_errors() {
        let h = harness(RouteFetcher::new(base()));

        let response = h.engine.cache_first(&get("/missing.css")).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!h.caches.has(&h.names.runtime).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_first_offline_miss_propagates() {
        let h = harness(RouteFetcher::new(base()).with_route("/app.js", "js"));
        h.fetcher.set_offline(true);

        let err = h.engine.cache_first(&get("/app.js")).await.unwrap_err();
        assert!(err.is_network_failure());
    }

    #[tokio::test]
    async fn test_network_first_refreshes_cache() {
        let h = harness(RouteFetcher::new(base()).with_route("/api/projects", "[1]"));
        let request = get("/api/projects");

        let response = h.engine.network_first(&request).await.unwrap();
        assert_eq!(response.text().unwrap(), "[1]");

        h.fetcher.set_route("/api/projects", "[1,2]").await;
        h.engine.network_first(&request).await.unwrap();

        let stored = h
            .caches
            .open(&h.names.api)
            .await
            .unwrap()
            .match_request(&request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.text().unwrap(), "[1,2]");
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_stale_entry() {
        let h = harness(RouteFetcher::new(base()).with_route("/api/projects", "[1]"));
        let request = get("/api/projects");
        h.engine.network_first(&request).await.unwrap();

        h.fetcher.set_offline(true);
        let stale = h.engine.network_first(&request).await.unwrap();
        assert!(stale.from_cache);
        assert_eq!(stale.text().unwrap(), "[1]");
    }

    #[tokio::test]
    async fn test_network_first_without_entry_fails() {
        let h = harness(RouteFetcher::new(base()));
        h.fetcher.set_offline(true);

        let err = h.engine.network_first(&get("/api/never")).await.unwrap_err();
        assert!(err.is_network_failure());
    }

    #[tokio::test]
    async fn test_network_first_requires_200_before_caching() {
        let h = harness(RouteFetcher::new(base()).with_status(
            "/api/broken",
            StatusCode::INTERNAL_SERVER_ERROR,
            "oops",
        ));

        let response = h.engine.network_first(&get("/api/broken")).await.unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!h.caches.has(&h.names.api).await.unwrap());
    }

    #[tokio::test]
    async fn test_post_is_never_cached() {
        let h = harness(RouteFetcher::new(base()).with_route("/api/items", "created"));
        let post = Request::post(base().join("/api/items").unwrap(), "{}".into());

        h.engine.network_first(&post).await.unwrap();
        assert!(!h.caches.has(&h.names.api).await.unwrap());
    }

    #[tokio::test]
    async fn test_navigation_falls_back_to_offline_page() {
        let h = harness(RouteFetcher::new(base()));
        let offline = get("/offline.html");
        h.caches
            .open(&h.names.precache)
            .await
            .unwrap()
            .put(&offline, &Response::ok_with_body(offline.url.clone(), "offline!"))
            .await
            .unwrap();
        h.fetcher.set_offline(true);

        for path in ["/", "/dashboard", "/projects/42?tab=logs"] {
            let nav = Request::navigate(base().join(path).unwrap());
            let response = h.engine.navigate(&nav).await.unwrap();
            assert_eq!(response.text().unwrap(), "offline!");
        }
    }

    #[tokio::test]
    async fn test_navigation_online_is_not_cached() {
        let h = harness(RouteFetcher::new(base()).with_route("/dashboard", "dash"));

        let response = h
            .engine
            .navigate(&Request::navigate(base().join("/dashboard").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.text().unwrap(), "dash");
        assert!(h.caches.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_returns_response() {
        let h = harness_with(
            RouteFetcher::new(base()).with_route("/big.bin", vec![0u8; 512]),
            Caches::new(MemoryBackend::with_quota(64)),
            None,
        );

        let response = h.engine.cache_first(&get("/big.bin")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body().len(), 512);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_network_failure() {
        let h = harness_with(
            RouteFetcher::new(base())
                .with_route("/api/slow", "late")
                .with_delay(Duration::from_secs(30)),
            Caches::in_memory(),
            Some(Duration::from_secs(1)),
        );
        let request = get("/api/slow");
        h.caches
            .open(&h.names.api)
            .await
            .unwrap()
            .put(&request, &Response::ok_with_body(request.url.clone(), "cached"))
            .await
            .unwrap();

        let response = h.engine.network_first(&request).await.unwrap();
        assert_eq!(response.text().unwrap(), "cached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_strategies_over_sqlite_storage() {
        let dir = tempfile::tempdir().unwrap();
        let caches = Caches::persistent(Some(dir.path().join("caches.db").as_path())).unwrap();
        let h = harness_with(
            RouteFetcher::new(base())
                .with_route("/app.js", "js")
                .with_route("/styles.css", "css")
                .with_route("/api/projects", "[1]"),
            caches,
            None,
        );
        let offline = get("/offline.html");
        h.caches
            .open(&h.names.precache)
            .await
            .unwrap()
            .put(&offline, &Response::ok_with_body(offline.url.clone(), "offline!"))
            .await
            .unwrap();

        let (js_req, css_req, api_req) = (get("/app.js"), get("/styles.css"), get("/api/projects"));
        let (js, css, api) = tokio::join!(
            h.engine.cache_first(&js_req),
            h.engine.cache_first(&css_req),
            h.engine.network_first(&api_req),
        );
        assert_eq!(js.unwrap().text().unwrap(), "js");
        assert_eq!(css.unwrap().text().unwrap(), "css");
        assert_eq!(api.unwrap().text().unwrap(), "[1]");

        h.fetcher.set_offline(true);
        let js = h.engine.cache_first(&get("/app.js")).await.unwrap();
        assert!(js.from_cache);
        let api = h.engine.network_first(&get("/api/projects")).await.unwrap();
        assert!(api.from_cache);
        assert_eq!(api.text().unwrap(), "[1]");

        let nav = Request::navigate(base().join("/projects/7").unwrap());
        let page = h.engine.navigate(&nav).await.unwrap();
        assert_eq!(page.text().unwrap(), "offline!");
    }
}
