//! Physical storage abstraction for Strongbox.
//!
//! This crate defines the [`StorageBackend`] trait — an ordered key-value
//! storage interface that knows nothing about secrets, encryption, or
//! engines. The encryption barrier in `strongbox-core` wraps a storage
//! backend so that every value reaching this layer is already ciphertext.
//!
//! Two implementations live here:
//!
//! - [`MemoryBackend`] — in-memory `BTreeMap`, for tests and ephemeral dev
//! - [`RocksDbBackend`] — standalone persistent backend (feature `rocksdb-backend`)
//!
//! The replicated store in `strongbox-raft` also implements
//! [`StorageBackend`], which is the production configuration.

mod error;
mod memory;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// A single physical record.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `core/keyring`,
/// `logical/3fc6.../data/myapp`). Values are opaque bytes. Entries flagged
/// `seal_wrap` receive an extra layer of seal encryption above the barrier
/// keyring before they are handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Full storage key.
    pub key: String,
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// Whether this entry must be wrapped by the seal in addition to the
    /// barrier keyring.
    pub seal_wrap: bool,
}

impl Entry {
    /// Create a plain (non-seal-wrapped) entry.
    #[must_use]
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            seal_wrap: false,
        }
    }
}

/// A pluggable ordered key-value storage backend.
///
/// Keys are unique; `list` returns keys in lexicographic order. Values are
/// opaque byte arrays — always encrypted by the barrier before reaching
/// storage. Implementations must be safe to share across async tasks.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. Idempotent — deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all full keys that start with the given prefix, in lexicographic
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Paginated, folder-collapsed listing.
    ///
    /// Returns names relative to `prefix`, strictly greater than `after`,
    /// truncated to `limit`. Keys containing `/` past the prefix collapse to
    /// their first segment with a trailing `/`, with consecutive duplicates
    /// suppressed. A negative `limit` returns everything; `0` returns an
    /// empty page.
    ///
    /// The default implementation scans `list(prefix)`; backends with seek
    /// support should override it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list_page(
        &self,
        prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, StorageError> {
        let keys = self.list(prefix).await?;
        Ok(paginate_keys(keys.iter().map(String::as_str), prefix, after, limit))
    }

    /// Check whether a key exists in storage.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Collapse, filter, and truncate an ordered stream of full keys into a
/// directory-style page.
///
/// `keys` must be lexicographically ordered full keys sharing `prefix`.
/// Names deeper than one segment collapse to `<segment>/`; entries not
/// strictly greater than `after` are skipped; the page stops at `limit`
/// (`< 0` means unbounded, `0` means empty).
#[must_use]
pub fn paginate_keys<'a>(
    keys: impl Iterator<Item = &'a str>,
    prefix: &str,
    after: &str,
    limit: i64,
) -> Vec<String> {
    if limit == 0 {
        return Vec::new();
    }

    let mut page: Vec<String> = Vec::new();
    for key in keys {
        let Some(rel) = key.strip_prefix(prefix) else {
            continue;
        };
        if rel.is_empty() {
            continue;
        }
        // Collapse nested keys to their first-segment folder name.
        let name = match rel.find('/') {
            Some(idx) => &rel[..=idx],
            None => rel,
        };
        if name <= after {
            continue;
        }
        if page.last().is_some_and(|last| last == name) {
            continue;
        }
        page.push(name.to_owned());
        if limit > 0 && page.len() as i64 >= limit {
            break;
        }
    }
    page
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn keys() -> Vec<String> {
        vec![
            "app/a".to_owned(),
            "app/b/1".to_owned(),
            "app/b/2".to_owned(),
            "app/c".to_owned(),
            "app/d/x/y".to_owned(),
        ]
    }

    #[test]
    fn paginate_collapses_folders() {
        let keys = keys();
        let page = paginate_keys(keys.iter().map(String::as_str), "app/", "", -1);
        assert_eq!(page, vec!["a", "b/", "c", "d/"]);
    }

    #[test]
    fn paginate_respects_after() {
        let keys = keys();
        let page = paginate_keys(keys.iter().map(String::as_str), "app/", "b/", -1);
        assert_eq!(page, vec!["c", "d/"]);
    }

    #[test]
    fn paginate_zero_limit_is_empty() {
        let keys = keys();
        let page = paginate_keys(keys.iter().map(String::as_str), "app/", "", 0);
        assert!(page.is_empty());
    }

    #[test]
    fn paginate_truncates_to_limit() {
        let keys = keys();
        let page = paginate_keys(keys.iter().map(String::as_str), "app/", "", 2);
        assert_eq!(page, vec!["a", "b/"]);
    }

    #[test]
    fn paginate_pages_compose_without_gaps() {
        let keys = keys();
        let mut all = Vec::new();
        let mut after = String::new();
        loop {
            let page = paginate_keys(keys.iter().map(String::as_str), "app/", &after, 2);
            if page.is_empty() {
                break;
            }
            after.clone_from(page.last().unwrap());
            all.extend(page);
        }
        assert_eq!(all, vec!["a", "b/", "c", "d/"]);
    }
}
