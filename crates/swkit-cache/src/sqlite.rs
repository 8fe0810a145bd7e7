//! SQLite cache backend.
//!
//! Entries survive process restarts. Each namespace is a row in `namespaces`;
//! deleting it cascades to its entries.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use swkit_common::{Result, SwKitError};
use tracing::{debug, info};

use crate::{now_millis, quota_exceeded, CacheBackend, CacheEntry, CacheKey};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Cache storage in a SQLite database file.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    quota: Option<u64>,
}

impl SqliteBackend {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| SwKitError::storage_with_source("failed to open cache database", e))?;
        Self::from_connection(conn)
    }

    /// Reject writes that would grow usage beyond `quota` bytes.
    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(storage_err)?;

        let table_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
                [],
                |row| row.get::<_, i32>(0).map(|count| count > 0),
            )
            .map_err(storage_err)?;

        let version: i32 = if table_exists {
            conn.query_row(
                "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?
            .unwrap_or(0)
        } else {
            0
        };

        if version < SCHEMA_VERSION {
            create_schema_v1(&conn)?;
            info!(version = SCHEMA_VERSION, "Cache database schema created");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            quota: None,
        })
    }

    /// Run `f` against the connection on the blocking pool so the async
    /// executor keeps serving other requests.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| SwKitError::internal("cache database lock poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| SwKitError::internal(format!("cache database task failed: {e}")))?
    }
}

fn storage_err(e: rusqlite::Error) -> SwKitError {
    SwKitError::storage_with_source("cache database error", e)
}

fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS namespaces (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            namespace TEXT NOT NULL REFERENCES namespaces(name) ON DELETE CASCADE,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            size INTEGER NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, method, url)
        );
        "#,
    )
    .map_err(|e| SwKitError::storage_with_source("failed to create cache schema", e))?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![SCHEMA_VERSION, now_millis() as i64],
    )
    .map_err(storage_err)?;

    Ok(())
}

fn ensure_namespace(conn: &Connection, namespace: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO namespaces (name, created_at) VALUES (?, ?)",
        params![namespace, now_millis() as i64],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn total_usage(conn: &Connection) -> Result<u64> {
    let total: i64 = conn
        .query_row("SELECT COALESCE(SUM(size), 0) FROM entries", [], |row| {
            row.get(0)
        })
        .map_err(storage_err)?;
    Ok(total.max(0) as u64)
}

fn insert_entry(tx: &Transaction<'_>, namespace: &str, entry: &CacheEntry) -> Result<()> {
    let headers = serde_json::to_string(&entry.headers)?;
    tx.execute(
        "INSERT OR REPLACE INTO entries
            (namespace, method, url, status, headers, body, size, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            namespace,
            entry.method,
            entry.url,
            entry.status,
            headers,
            entry.body,
            entry.size() as i64,
            entry.cached_at as i64,
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    async fn open(&self, namespace: &str) -> Result<()> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| ensure_namespace(conn, &namespace)).await
    }

    async fn has(&self, namespace: &str) -> Result<bool> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM namespaces WHERE name = ?",
                    [&namespace],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(count > 0)
        })
        .await
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute("DELETE FROM namespaces WHERE name = ?", [&namespace])
                .map_err(storage_err)?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn namespaces(&self) -> Result<BTreeSet<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM namespaces")
                .map_err(storage_err)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(storage_err)?
                .collect::<std::result::Result<BTreeSet<_>, _>>()
                .map_err(storage_err)?;
            Ok(names)
        })
        .await
    }

    async fn get(&self, namespace: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let namespace = namespace.to_string();
        let key = key.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT status, headers, body, cached_at FROM entries
                     WHERE namespace = ? AND method = ? AND url = ?",
                    params![namespace, key.method, key.url],
                    |row| {
                        Ok((
                            row.get::<_, u16>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(storage_err)?;

            let Some((status, headers, body, cached_at)) = row else {
                return Ok(None);
            };
            Ok(Some(CacheEntry {
                url: key.url,
                method: key.method,
                status,
                headers: serde_json::from_str(&headers)?,
                body,
                cached_at: cached_at.max(0) as u64,
            }))
        })
        .await
    }

    async fn put(&self, namespace: &str, entry: CacheEntry) -> Result<()> {
        self.put_all(namespace, vec![entry]).await
    }

    async fn put_all(&self, namespace: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let namespace = namespace.to_string();
        let quota = self.quota;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;

            ensure_namespace(&tx, &namespace)?;
            for entry in &entries {
                insert_entry(&tx, &namespace, entry)?;
            }

            if let Some(quota) = quota {
                let needed = total_usage(&tx)?;
                if needed > quota {
                    // Dropping the transaction rolls every insert back.
                    return Err(quota_exceeded(quota, needed));
                }
            }

            tx.commit().map_err(storage_err)?;
            debug!(namespace = %namespace, count = entries.len(), "Cache entries committed");
            Ok(())
        })
        .await
    }

    async fn delete_entry(&self, namespace: &str, key: &CacheKey) -> Result<bool> {
        let namespace = namespace.to_string();
        let key = key.clone();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM entries WHERE namespace = ? AND method = ? AND url = ?",
                    params![namespace, key.method, key.url],
                )
                .map_err(storage_err)?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<CacheKey>> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT method, url FROM entries WHERE namespace = ?
                     ORDER BY method, url",
                )
                .map_err(storage_err)?;
            let keys = stmt
                .query_map([&namespace], |row| {
                    Ok(CacheKey {
                        method: row.get(0)?,
                        url: row.get(1)?,
                    })
                })
                .map_err(storage_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(keys)
        })
        .await
    }

    async fn usage(&self) -> Result<u64> {
        self.with_conn(|conn| total_usage(conn)).await
    }

    fn quota(&self) -> Option<u64> {
        self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(url: &str, body: &[u8]) -> CacheEntry {
        CacheEntry {
            url: url.to_string(),
            method: "GET".to_string(),
            status: 200,
            headers: vec![
                ("content-type".to_string(), b"text/html".to_vec()),
                ("vary".to_string(), b"accept".to_vec()),
                ("vary".to_string(), b"origin".to_vec()),
            ],
            body: body.to_vec(),
            cached_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_sqlite_initialization() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("nested/caches.db")).unwrap();
        assert!(backend.namespaces().await.unwrap().is_empty());
        assert_eq!(backend.usage().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("caches.db");
        let e = entry("https://app.test/offline.html", b"<h1>offline</h1>");

        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.put("vibecode-v1", e.clone()).await.unwrap();
        }

        let reopened = SqliteBackend::open(&path).unwrap();
        assert_eq!(reopened.get("vibecode-v1", &e.key()).await.unwrap(), Some(e));
        assert!(reopened.has("vibecode-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_namespace_cascades() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("caches.db")).unwrap();
        let e = entry("https://app.test/a.js", b"a");

        backend.put("vibecode-runtime-v0", e.clone()).await.unwrap();
        assert!(backend.delete_namespace("vibecode-runtime-v0").await.unwrap());
        assert!(backend.get("vibecode-runtime-v0", &e.key()).await.unwrap().is_none());
        assert_eq!(backend.usage().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_overwrites_and_keys_sorted() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("caches.db")).unwrap();

        backend.put("rt", entry("https://app.test/b.js", b"1")).await.unwrap();
        backend.put("rt", entry("https://app.test/a.js", b"1")).await.unwrap();
        backend.put("rt", entry("https://app.test/b.js", b"22")).await.unwrap();

        let keys = backend.keys("rt").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].url, "https://app.test/a.js");

        let b = backend
            .get("rt", &CacheKey::get(&url::Url::parse("https://app.test/b.js").unwrap()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.body, b"22");
    }

    #[tokio::test]
    async fn test_quota_rolls_back_batch() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("caches.db"))
            .unwrap()
            .with_quota(100);

        let batch = vec![
            entry("https://app.test/small", b"ok"),
            entry("https://app.test/big", &[0u8; 256]),
        ];
        let err = backend.put_all("precache", batch).await.unwrap_err();

        assert!(matches!(err, SwKitError::Storage { .. }));
        assert!(backend.keys("precache").await.unwrap().is_empty());
        assert_eq!(backend.usage().await.unwrap(), 0);
    }
}
