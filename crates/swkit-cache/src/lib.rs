//! # SwKit Cache
//!
//! Durable, namespaced storage of request/response pairs.
//!
//! ## Features
//!
//! - **Namespaces**: `caches.open()`, `caches.delete()`, `caches.keys()`
//! - **Entries**: `cache.match()`, `cache.put()`, `cache.addAll()`
//! - **Backends**: in-memory and SQLite, behind [`CacheBackend`]
//! - **Estimates**: approximate usage against an optional quota
//!
//! ## Architecture
//!
//! ```text
//! Caches (origin-wide)
//!     └── Cache (one namespace, e.g. "vibecode-runtime-v1")
//!             └── CacheKey (method + URL) → CacheEntry
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use swkit_common::{Result, SwKitError};
use swkit_net::{Fetcher, Request, Response};
use tracing::{debug, info};
use url::Url;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

// ==================== Keys & Entries ====================

/// Canonical lookup key: method plus full URL, query included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Create a key.
    pub fn new(method: &Method, url: &Url) -> Self {
        Self {
            method: method.as_str().to_string(),
            url: url.as_str().to_string(),
        }
    }

    /// Key for a request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    /// Key for a plain GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in wire order. Repeated names keep every value and
    /// values are kept as raw bytes.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage under the request's key.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            url: request.url.as_str().to_string(),
            method: request.method.as_str().to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: now_millis(),
        }
    }

    /// The key this entry is stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Approximate stored size in bytes.
    pub fn size(&self) -> u64 {
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        (self.body.len() + self.url.len() + self.method.len() + headers) as u64
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url).map_err(|e| {
            SwKitError::storage_with_source(format!("corrupt cached url {}", self.url), e)
        })?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| SwKitError::storage_with_source("corrupt cached status", e))?;

        let mut response = Response::new(url, status, self.body.clone()).cached();
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| SwKitError::storage_with_source("corrupt cached header name", e))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| SwKitError::storage_with_source("corrupt cached header value", e))?;
            response.headers.append(name, value);
        }
        Ok(response)
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ==================== Estimate ====================

/// Approximate storage usage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StorageEstimate {
    /// Bytes used.
    pub usage: u64,
    /// Bytes available in total (0 when unknown).
    pub quota: u64,
    /// `usage / quota` as a percentage, rounded to two decimals.
    pub percentage: f64,
}

impl StorageEstimate {
    /// Compute an estimate from raw numbers.
    pub fn new(usage: u64, quota: u64) -> Self {
        let percentage = if quota > 0 {
            let raw = usage as f64 / quota as f64 * 100.0;
            (raw * 100.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            usage,
            quota,
            percentage,
        }
    }

    /// The all-zero estimate reported when storage cannot be queried.
    pub fn unavailable() -> Self {
        Self::default()
    }
}

// ==================== Backend ====================

/// Raw namespaced storage.
///
/// Writes are last-write-wins per key; concurrent callers need no extra
/// coordination.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create the namespace if absent.
    async fn open(&self, namespace: &str) -> Result<()>;

    /// Whether the namespace exists.
    async fn has(&self, namespace: &str) -> Result<bool>;

    /// Remove a namespace and all its entries.
    async fn delete_namespace(&self, namespace: &str) -> Result<bool>;

    /// All namespaces currently stored.
    async fn namespaces(&self) -> Result<BTreeSet<String>>;

    /// Exact lookup.
    async fn get(&self, namespace: &str, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Insert or overwrite, creating the namespace if needed.
    async fn put(&self, namespace: &str, entry: CacheEntry) -> Result<()>;

    /// Insert every entry, or none of them.
    async fn put_all(&self, namespace: &str, entries: Vec<CacheEntry>) -> Result<()>;

    /// Remove one entry.
    async fn delete_entry(&self, namespace: &str, key: &CacheKey) -> Result<bool>;

    /// Keys stored in a namespace, sorted.
    async fn keys(&self, namespace: &str) -> Result<Vec<CacheKey>>;

    /// Bytes used across all namespaces.
    async fn usage(&self) -> Result<u64>;

    /// Byte quota, if one is enforced.
    fn quota(&self) -> Option<u64>;
}

pub(crate) fn quota_exceeded(quota: u64, needed: u64) -> SwKitError {
    SwKitError::storage(format!(
        "quota exceeded: {needed} bytes needed, {quota} bytes allowed"
    ))
}

/// Default on-disk location for the SQLite backend.
pub fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("swkit")
        .join("caches.db")
}

// ==================== Cache Storage ====================

/// Origin-wide cache storage (the `caches` global).
#[derive(Clone)]
pub struct Caches {
    backend: Arc<dyn CacheBackend>,
}

impl Caches {
    /// Wrap a backend.
    pub fn new(backend: impl CacheBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Unbounded in-memory storage.
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// SQLite storage at `path`, or at [`default_cache_path`] when `None`.
    pub fn persistent(path: Option<&Path>) -> Result<Self> {
        let backend = match path {
            Some(path) => SqliteBackend::open(path)?,
            None => SqliteBackend::open(&default_cache_path())?,
        };
        Ok(Self::new(backend))
    }

    /// Open a cache (creates it if it doesn't exist).
    pub async fn open(&self, name: &str) -> Result<Cache> {
        self.backend.open(name).await?;
        Ok(Cache {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
        })
    }

    /// Check if a cache exists.
    pub async fn has(&self, name: &str) -> Result<bool> {
        self.backend.has(name).await
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let deleted = self.backend.delete_namespace(name).await?;
        if deleted {
            debug!(cache = name, "Cache deleted");
        }
        Ok(deleted)
    }

    /// Get all cache names.
    pub async fn keys(&self) -> Result<BTreeSet<String>> {
        self.backend.namespaces().await
    }

    /// Match within one cache, without creating it.
    pub async fn match_in(&self, name: &str, request: &Request) -> Result<Option<Response>> {
        match self
            .backend
            .get(name, &CacheKey::from_request(request))
            .await?
        {
            Some(entry) => entry.to_response().map(Some),
            None => Ok(None),
        }
    }

    /// Match across all caches, in name order.
    pub async fn match_any(&self, request: &Request) -> Result<Option<Response>> {
        let key = CacheKey::from_request(request);
        for name in self.backend.namespaces().await? {
            if let Some(entry) = self.backend.get(&name, &key).await? {
                return entry.to_response().map(Some);
            }
        }
        Ok(None)
    }

    /// Delete every cache. Returns how many were removed.
    pub async fn clear_all(&self) -> Result<usize> {
        let mut removed = 0;
        for name in self.backend.namespaces().await? {
            if self.backend.delete_namespace(&name).await? {
                removed += 1;
            }
        }
        info!(removed, "All caches cleared");
        Ok(removed)
    }

    /// Approximate usage and quota.
    pub async fn estimate(&self) -> Result<StorageEstimate> {
        let usage = self.backend.usage().await?;
        Ok(StorageEstimate::new(usage, self.backend.quota().unwrap_or(0)))
    }
}

// ==================== Cache ====================

/// One open namespace.
#[derive(Clone)]
pub struct Cache {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl Cache {
    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>> {
        self.match_key(&CacheKey::from_request(request)).await
    }

    async fn match_key(&self, key: &CacheKey) -> Result<Option<Response>> {
        match self.backend.get(&self.name, key).await? {
            Some(entry) => entry.to_response().map(Some),
            None => Ok(None),
        }
    }

    /// Store a copy of `response` under the request's key.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<()> {
        let entry = CacheEntry::from_response(request, response);
        debug!(cache = %self.name, key = %entry.key(), bytes = entry.body.len(), "Cache put");
        self.backend.put(&self.name, entry).await
    }

    /// Fetch every request and store all responses, or store nothing.
    ///
    /// Fails if any fetch fails or answers anything other than `200 OK`.
    pub async fn add_all(&self, fetcher: &dyn Fetcher, requests: &[Request]) -> Result<()> {
        let fetches = requests.iter().map(|request| async move {
            let response = fetcher.fetch(request).await?;
            if !response.is_cacheable() {
                return Err(SwKitError::network(format!(
                    "{} answered {}",
                    request.url, response.status
                )));
            }
            Ok(CacheEntry::from_response(request, &response))
        });

        let entries = futures::future::try_join_all(fetches).await?;
        self.backend.put_all(&self.name, entries).await
    }

    /// Delete an entry.
    pub async fn delete(&self, request: &Request) -> Result<bool> {
        self.backend
            .delete_entry(&self.name, &CacheKey::from_request(request))
            .await
    }

    /// Get all keys.
    pub async fn keys(&self) -> Result<Vec<CacheKey>> {
        self.backend.keys(&self.name).await
    }
}
