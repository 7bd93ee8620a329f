//! In-memory storage backend.
//!
//! Stores all data in a `BTreeMap` behind a `RwLock`. Not persistent — all
//! data is lost when the process exits. Use for unit tests and ephemeral
//! development servers.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{StorageBackend, StorageError, paginate_keys};

/// An in-memory storage backend backed by a `BTreeMap`.
///
/// Thread-safe and async-compatible. Data is sorted by key, which makes
/// prefix listing and seek-based pagination cheap via `BTreeMap::range`.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        let keys = data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }

    async fn list_page(
        &self,
        prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        // Seek straight to prefix+after instead of scanning the whole prefix.
        let start = format!("{prefix}{after}");
        let page = paginate_keys(
            data.range((Bound::Excluded(start), Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.as_str()),
            prefix,
            after,
            limit,
        );
        Ok(page)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let data = self.data.read().await;
        Ok(data.contains_key(key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let backend = MemoryBackend::new();
        let result = backend.get("does/not/exist").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let backend = MemoryBackend::new();
        backend.put("core/config", b"hello").await.unwrap();
        let val = backend.get("core/config").await.unwrap();
        assert_eq!(val, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn put_overwrites_existing() {
        let backend = MemoryBackend::new();
        backend.put("key", b"v1").await.unwrap();
        backend.put("key", b"v2").await.unwrap();
        let val = backend.get("key").await.unwrap();
        assert_eq!(val, Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.put("key", b"val").await.unwrap();
        backend.delete("key").await.unwrap();
        backend.delete("key").await.unwrap();
        assert_eq!(backend.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_with_prefix_is_ordered() {
        let backend = MemoryBackend::new();
        backend.put("kv/data/b", b"2").await.unwrap();
        backend.put("kv/data/a", b"1").await.unwrap();
        backend.put("sys/config", b"3").await.unwrap();

        let keys = backend.list("kv/data/").await.unwrap();
        assert_eq!(keys, vec!["kv/data/a", "kv/data/b"]);
    }

    #[tokio::test]
    async fn list_page_collapses_and_paginates() {
        let backend = MemoryBackend::new();
        for i in 1..=10u32 {
            backend
                .put(&format!("a/{i}"), i.to_string().as_bytes())
                .await
                .unwrap();
        }

        let page = backend.list_page("a/", "", 3).await.unwrap();
        assert_eq!(page, vec!["1", "10", "2"]);

        let page = backend.list_page("a/", "2", 3).await.unwrap();
        assert_eq!(page, vec!["3", "4", "5"]);
    }

    #[tokio::test]
    async fn list_page_negative_limit_returns_all() {
        let backend = MemoryBackend::new();
        backend.put("a/x", b"1").await.unwrap();
        backend.put("a/y/nested", b"2").await.unwrap();

        let page = backend.list_page("a/", "", -1).await.unwrap();
        assert_eq!(page, vec!["x", "y/"]);
    }

    #[tokio::test]
    async fn exists_works() {
        let backend = MemoryBackend::new();
        assert!(!backend.exists("key").await.unwrap());
        backend.put("key", b"val").await.unwrap();
        assert!(backend.exists("key").await.unwrap());
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.put("key", b"val").await.unwrap();
        assert_eq!(clone.get("key").await.unwrap(), Some(b"val".to_vec()));
    }
}
