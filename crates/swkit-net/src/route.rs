//! In-memory fetcher with fixed routes.
//!
//! Serves canned responses keyed by absolute URL, can be switched offline, and
//! counts every call it receives. Unknown URLs answer `404 Not Found`, the way a
//! real server would.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::StatusCode;
use swkit_common::{Result, SwKitError};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::{Fetcher, Request, Response};

#[derive(Debug, Clone)]
enum Route {
    Respond { status: StatusCode, body: Bytes },
    Fail,
}

/// Route-table fetcher.
pub struct RouteFetcher {
    base: Url,
    routes: RwLock<HashMap<String, Route>>,
    offline: AtomicBool,
    delay: Option<Duration>,
    calls: AtomicUsize,
    calls_by_url: Mutex<HashMap<String, usize>>,
}

impl RouteFetcher {
    /// Create a fetcher resolving relative routes against `base`.
    pub fn new(base: Url) -> Self {
        Self {
            base,
            routes: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
            delay: None,
            calls: AtomicUsize::new(0),
            calls_by_url: Mutex::new(HashMap::new()),
        }
    }

    /// Answer `path` with `200 OK` and `body`.
    pub fn with_route(self, path: &str, body: impl Into<Bytes>) -> Self {
        self.with_status(path, StatusCode::OK, body)
    }

    /// Answer `path` with the given status and body.
    pub fn with_status(mut self, path: &str, status: StatusCode, body: impl Into<Bytes>) -> Self {
        let key = self.key(path);
        self.routes.get_mut().insert(
            key,
            Route::Respond {
                status,
                body: body.into(),
            },
        );
        self
    }

    /// Make `path` fail at the transport level even while online.
    pub fn with_failure(mut self, path: &str) -> Self {
        let key = self.key(path);
        self.routes.get_mut().insert(key, Route::Fail);
        self
    }

    /// Delay every answer by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace (or add) a `200 OK` route at runtime.
    pub async fn set_route(&self, path: &str, body: impl Into<Bytes>) {
        let key = self.key(path);
        self.routes.write().await.insert(
            key,
            Route::Respond {
                status: StatusCode::OK,
                body: body.into(),
            },
        );
    }

    /// Switch the whole network on or off.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total number of fetches attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of fetches attempted for `path`.
    pub fn calls_for(&self, path: &str) -> usize {
        let key = self.key(path);
        self.calls_by_url
            .lock()
            .map(|counts| counts.get(&key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn key(&self, path: &str) -> String {
        self.base
            .join(path)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| path.to_string())
    }
}

#[async_trait]
impl Fetcher for RouteFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let key = request.url.to_string();
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut counts) = self.calls_by_url.lock() {
            *counts.entry(key.clone()).or_insert(0) += 1;
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            trace!(url = %key, "Route fetcher offline");
            return Err(SwKitError::network(format!("{key}: network unreachable")));
        }

        let route = self.routes.read().await.get(&key).cloned();
        match route {
            Some(Route::Respond { status, body }) => {
                Ok(Response::new(request.url.clone(), status, body))
            }
            Some(Route::Fail) => Err(SwKitError::network(format!("{key}: connection reset"))),
            None => Ok(Response::new(
                request.url.clone(),
                StatusCode::NOT_FOUND,
                Bytes::new(),
            )),
        }
    }
}
