//! In-memory cache backend.

use std::collections::BTreeSet;

use async_trait::async_trait;
use hashbrown::HashMap;
use swkit_common::Result;
use tokio::sync::RwLock;

use crate::{quota_exceeded, CacheBackend, CacheEntry, CacheKey};

type Namespace = HashMap<CacheKey, CacheEntry>;

/// Cache storage held in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    caches: RwLock<HashMap<String, Namespace>>,
    quota: Option<u64>,
}

impl MemoryBackend {
    /// Create unbounded storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage that rejects writes beyond `quota` bytes.
    pub fn with_quota(quota: u64) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            quota: Some(quota),
        }
    }

    fn total(caches: &HashMap<String, Namespace>) -> u64 {
        caches
            .values()
            .flat_map(|ns| ns.values())
            .map(CacheEntry::size)
            .sum()
    }

    fn check_quota(
        &self,
        caches: &HashMap<String, Namespace>,
        namespace: &str,
        incoming: &[CacheEntry],
    ) -> Result<()> {
        let Some(quota) = self.quota else {
            return Ok(());
        };
        let replaced: u64 = caches
            .get(namespace)
            .map(|ns| {
                incoming
                    .iter()
                    .filter_map(|e| ns.get(&e.key()))
                    .map(CacheEntry::size)
                    .sum()
            })
            .unwrap_or(0);
        let added: u64 = incoming.iter().map(CacheEntry::size).sum();
        let needed = Self::total(caches) - replaced + added;
        if needed > quota {
            return Err(quota_exceeded(quota, needed));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self, namespace: &str) -> Result<()> {
        self.caches
            .write()
            .await
            .entry(namespace.to_string())
            .or_default();
        Ok(())
    }

    async fn has(&self, namespace: &str) -> Result<bool> {
        Ok(self.caches.read().await.contains_key(namespace))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool> {
        Ok(self.caches.write().await.remove(namespace).is_some())
    }

    async fn namespaces(&self) -> Result<BTreeSet<String>> {
        Ok(self.caches.read().await.keys().cloned().collect())
    }

    async fn get(&self, namespace: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self
            .caches
            .read()
            .await
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn put(&self, namespace: &str, entry: CacheEntry) -> Result<()> {
        self.put_all(namespace, vec![entry]).await
    }

    async fn put_all(&self, namespace: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut caches = self.caches.write().await;
        self.check_quota(&caches, namespace, &entries)?;

        let ns = caches.entry(namespace.to_string()).or_default();
        for entry in entries {
            ns.insert(entry.key(), entry);
        }
        Ok(())
    }

    async fn delete_entry(&self, namespace: &str, key: &CacheKey) -> Result<bool> {
        Ok(self
            .caches
            .write()
            .await
            .get_mut(namespace)
            .map(|ns| ns.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<CacheKey>> {
        let caches = self.caches.read().await;
        let mut keys: Vec<CacheKey> = caches
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn usage(&self) -> Result<u64> {
        Ok(Self::total(&*self.caches.read().await))
    }

    fn quota(&self) -> Option<u64> {
        self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swkit_common::SwKitError;

    fn entry(url: &str, body: &[u8]) -> CacheEntry {
        CacheEntry {
            url: url.to_string(),
            method: "GET".to_string(),
            status: 200,
            headers: Vec::new(),
            body: body.to_vec(),
            cached_at: 0,
        }
    }

    #[tokio::test]
    async fn test_namespaces() {
        let backend = MemoryBackend::new();
        assert!(!backend.has("v1").await.unwrap());

        backend.open("v1").await.unwrap();
        assert!(backend.has("v1").await.unwrap());

        assert!(backend.delete_namespace("v1").await.unwrap());
        assert!(!backend.delete_namespace("v1").await.unwrap());
        assert!(backend.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_creates_namespace() {
        let backend = MemoryBackend::new();
        let e = entry("https://app.test/a.js", b"a");
        backend.put("runtime", e.clone()).await.unwrap();

        assert!(backend.has("runtime").await.unwrap());
        assert_eq!(backend.get("runtime", &e.key()).await.unwrap(), Some(e.clone()));
        assert!(backend.delete_entry("runtime", &e.key()).await.unwrap());
        assert!(backend.get("runtime", &e.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_rejects_write() {
        let backend = MemoryBackend::with_quota(64);
        let err = backend
            .put("runtime", entry("https://app.test/big.bin", &[0u8; 128]))
            .await
            .unwrap_err();

        assert!(matches!(err, SwKitError::Storage { .. }));
        assert_eq!(backend.usage().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quota_counts_overwrite_once() {
        let first = entry("https://app.test/a", &[0u8; 20]);
        let backend = MemoryBackend::with_quota(first.size() + 5);

        backend.put("runtime", first.clone()).await.unwrap();
        // Same key, same size: replaces rather than adds.
        backend.put("runtime", first).await.unwrap();
    }
}
