//! Worker configuration
//!
//! Bumping `version` is the whole deployment story: every cache name embeds it,
//! so a new version writes fresh namespaces and activation garbage-collects the
//! old ones.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use swkit_common::{Result, SwKitError};
use url::Url;

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// The application's own origin
    pub origin: Url,

    /// Prefix shared by every cache name
    pub cache_prefix: String,

    /// Deployment version tag embedded in cache names
    pub version: String,

    /// Paths fetched and stored at install time
    pub precache_manifest: Vec<String>,

    /// Document served when a navigation fails
    pub offline_page: String,

    /// Substrings marking external/API requests
    pub api_patterns: Vec<String>,

    /// Optional deadline for each network fetch, in milliseconds
    pub network_timeout_ms: Option<u64>,

    /// Leave the waiting state as soon as install succeeds
    pub skip_waiting_on_install: bool,

    /// Push notification presentation
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub icon: String,
    pub badge: String,
    /// Vibration pattern in milliseconds
    pub vibrate: Vec<u32>,
}

/// The three namespaces owned by one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
    pub precache: String,
    pub runtime: String,
    pub api: String,
}

impl CacheNames {
    /// Whether `name` belongs to this deployment.
    pub fn contains(&self, name: &str) -> bool {
        name == self.precache || name == self.runtime || name == self.api
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.precache, &self.runtime, &self.api]
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost/").expect("static origin URL is valid"),
            cache_prefix: "vibecode".to_string(),
            version: "v1".to_string(),
            precache_manifest: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/offline.html".to_string(),
            ],
            offline_page: "/offline.html".to_string(),
            api_patterns: vec!["/api/".to_string(), "base44.app".to_string()],
            network_timeout_ms: None,
            skip_waiting_on_install: false,
            notification: NotificationConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/icon-72x72.png".to_string(),
            vibrate: vec![200, 100, 200],
        }
    }
}

impl WorkerConfig {
    /// Default configuration for an application served from `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Parse a JSON configuration, filling omitted fields with defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SwKitError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check invariants the worker relies on.
    pub fn validate(&self) -> Result<()> {
        if self.cache_prefix.trim().is_empty() {
            return Err(SwKitError::config("cache_prefix must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(SwKitError::config("version must not be empty"));
        }
        if let Some(path) = self.precache_manifest.iter().find(|p| !p.starts_with('/')) {
            return Err(SwKitError::config(format!(
                "precache path {path:?} must be absolute"
            )));
        }
        if !self.precache_manifest.contains(&self.offline_page) {
            return Err(SwKitError::config(format!(
                "offline page {} is not precached",
                self.offline_page
            )));
        }
        if self.network_timeout_ms == Some(0) {
            return Err(SwKitError::config("network_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Cache names for this deployment.
    pub fn cache_names(&self) -> CacheNames {
        CacheNames {
            precache: format!("{}-{}", self.cache_prefix, self.version),
            runtime: format!("{}-runtime-{}", self.cache_prefix, self.version),
            api: format!("{}-api-{}", self.cache_prefix, self.version),
        }
    }

    /// Network deadline, if configured.
    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_ms.map(Duration::from_millis)
    }

    /// Resolve an app-relative path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| SwKitError::InvalidUrl(format!("{path}: {e}")))
    }
}
