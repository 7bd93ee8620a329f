//! The mount router and logical request types.
//!
//! The router is a trie keyed by mount path segments. Lookup is
//! longest-prefix with trailing-`/` normalization: resolving
//! `secret/data/app` against a mount at `secret/` strips the prefix and
//! hands `data/app` to the mounted engine along with the mount entry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::barrier::Barrier;
use crate::engine::Engine;
use crate::error::{BarrierError, EngineError};
use crate::mount::MountEntry;
use crate::token::TokenEntry;

/// Logical operations, as mapped from HTTP verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// `GET`
    Read,
    /// `POST`/`PUT` on a new item.
    Create,
    /// `POST`/`PUT` on an existing item.
    Update,
    /// `DELETE`
    Delete,
    /// `LIST` / `GET ?list=true`
    List,
    /// `SCAN` / `GET ?scan=true` — recursive list.
    Scan,
    /// `PATCH` — partial update.
    Patch,
    /// Internal: lease renewal against the issuing engine.
    Renew,
    /// Internal: lease revocation against the issuing engine.
    Revoke,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Scan => "scan",
            Self::Patch => "patch",
            Self::Renew => "renew",
            Self::Revoke => "revoke",
        };
        f.write_str(name)
    }
}

/// A logical request traveling through the pipeline.
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique request ID (echoed in the response envelope).
    pub id: String,
    /// Logical operation.
    pub operation: Operation,
    /// Full logical path (namespace-relative), e.g. `secret/data/app`.
    pub path: String,
    /// Request body.
    pub data: Option<serde_json::Value>,
    /// The raw client token, if any.
    pub client_token: Option<String>,
    /// The resolved token entry (set by the core after validation).
    pub token_entry: Option<TokenEntry>,
    /// Logical namespace.
    pub namespace: String,
    /// Client address for audit.
    pub remote_addr: Option<String>,
    /// Requested response-wrapping TTL in seconds.
    pub wrap_ttl: Option<i64>,
    /// Pagination: return names strictly after this one.
    pub after: Option<String>,
    /// Pagination: page size (`-1` = all).
    pub limit: Option<i64>,
}

impl Request {
    /// Build a request with defaults for optional fields.
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            path: path.into(),
            data: None,
            client_token: None,
            token_entry: None,
            namespace: "root".to_owned(),
            remote_addr: None,
            wrap_ttl: None,
            after: None,
            limit: None,
        }
    }

    /// Attach a body.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the client token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.client_token = Some(token.into());
        self
    }

    /// The request body as an object map, if it is one.
    #[must_use]
    pub fn data_object(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.data.as_ref().and_then(serde_json::Value::as_object)
    }
}

/// Authentication data attached to login responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    /// The issued token.
    pub client_token: String,
    /// The token's accessor.
    pub accessor: String,
    /// Policies on the token.
    pub policies: Vec<String>,
    /// Lease duration in seconds (0 = non-expiring).
    pub lease_duration: i64,
    /// Whether the token can be renewed.
    pub renewable: bool,
    /// Bound entity, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// `service` or `batch`.
    pub token_type: String,
}

/// Response-wrapping metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapInfo {
    /// Single-use token that unwraps the response.
    pub token: String,
    /// Wrapping TTL in seconds.
    pub ttl: i64,
    /// When the wrapping was created.
    pub creation_time: DateTime<Utc>,
}

/// The uniform response envelope.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Response {
    /// Echo of the request ID.
    pub request_id: String,
    /// Lease ID when the response carries a leased secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    /// Lease duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_duration: Option<i64>,
    /// Whether the lease is renewable.
    pub renewable: bool,
    /// Engine-defined payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Non-fatal advisories.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Present when the response was wrapped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrap_info: Option<WrapInfo>,
    /// Present on login responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
}

impl Response {
    /// A data-bearing response.
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// An empty (204-style) response.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a warning to the advisory channel.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// An engine's private, prefix-scoped view of the barrier.
///
/// Every key an engine touches lives under `logical/<mount-uuid>/`; the
/// view makes escaping that namespace impossible.
#[derive(Clone)]
pub struct BarrierView {
    barrier: Arc<Barrier>,
    prefix: String,
}

impl BarrierView {
    /// Create a view rooted at `prefix` (must end with `/`).
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, prefix: impl Into<String>) -> Self {
        Self {
            barrier,
            prefix: prefix.into(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] from the underlying barrier.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        self.barrier.get(&self.full_key(key)).await
    }

    /// Write a value.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] from the underlying barrier.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        self.barrier.put(&self.full_key(key), value).await
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] from the underlying barrier.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.barrier.delete(&self.full_key(key)).await
    }

    /// List view-relative keys under a prefix.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] from the underlying barrier.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        let full = self.full_key(prefix);
        let keys = self.barrier.list(&full).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&full).map(String::from))
            .collect())
    }

    /// Paginated folder-collapsed listing relative to the view.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] from the underlying barrier.
    pub async fn list_page(
        &self,
        prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, BarrierError> {
        self.barrier
            .list_page(&self.full_key(prefix), after, limit)
            .await
    }

    /// Delete every key under a view-relative prefix.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] from the underlying barrier.
    pub async fn clear_prefix(&self, prefix: &str) -> Result<(), BarrierError> {
        let full = self.full_key(prefix);
        for key in self.barrier.list(&full).await? {
            self.barrier.delete(&key).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BarrierView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierView")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// A mounted engine instance in the routing trie.
#[derive(Clone)]
pub struct RouteEntry {
    /// The mount's table entry.
    pub mount: MountEntry,
    /// The running engine.
    pub engine: Arc<dyn Engine>,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    entry: Option<RouteEntry>,
}

/// Longest-prefix mount router.
pub struct Router {
    root: RwLock<TrieNode>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: RwLock::new(TrieNode::default()),
        }
    }

    /// Insert a mounted engine at its path.
    pub async fn mount(&self, entry: RouteEntry) {
        let segments = segments_of(&entry.mount.path);
        let mut root = self.root.write().await;
        let mut node = &mut *root;
        for segment in segments {
            node = node.children.entry(segment).or_default();
        }
        debug!(path = %entry.mount.path, "route mounted");
        node.entry = Some(entry);
    }

    /// Remove the mount at `path`. Returns whether anything was removed.
    pub async fn unmount(&self, path: &str) -> bool {
        let segments = segments_of(path);
        let mut root = self.root.write().await;
        let mut node = &mut *root;
        for segment in segments {
            match node.children.get_mut(&segment) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.entry.take().is_some()
    }

    /// Resolve the longest mount prefix for a request path.
    ///
    /// Returns the route entry and the path remainder after the mount
    /// prefix.
    pub async fn resolve(&self, path: &str) -> Option<(RouteEntry, String)> {
        let root = self.root.read().await;
        let mut node = &*root;
        let mut best: Option<(RouteEntry, usize)> = None;
        let mut consumed = 0;

        if let Some(entry) = &node.entry {
            best = Some((entry.clone(), 0));
        }
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match node.children.get(segment) {
                Some(child) => {
                    consumed += segment.len() + 1;
                    node = child;
                    if let Some(entry) = &node.entry {
                        best = Some((entry.clone(), consumed.min(path.len())));
                    }
                }
                None => break,
            }
        }

        best.map(|(entry, prefix_len)| {
            let remainder = path.get(prefix_len..).unwrap_or("").to_owned();
            (entry, remainder)
        })
    }

    /// Drop every route (pre-seal teardown).
    pub async fn clear(&self) {
        *self.root.write().await = TrieNode::default();
    }

    /// Route a request to its engine.
    ///
    /// The request's path is rewritten to the mount-relative remainder
    /// before dispatch.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] if no mount covers the path.
    /// - Whatever the engine returns.
    pub async fn route(&self, mut request: Request) -> Result<Response, EngineError> {
        let Some((route, remainder)) = self.resolve(&request.path).await else {
            return Err(EngineError::NotFound {
                path: request.path.clone(),
            });
        };
        request.path = remainder;
        route.engine.handle(&route.mount, &request).await
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

fn segments_of(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::AeadAlgorithm;
    use crate::engine::KvEngine;
    use crate::mount::MountEntry;
    use strongbox_storage::MemoryBackend;

    async fn test_barrier() -> Arc<Barrier> {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        barrier.initialize(AeadAlgorithm::Aes256Gcm).await.unwrap();
        barrier
    }

    fn mount_at(path: &str) -> MountEntry {
        MountEntry::new(path, "kv")
    }

    async fn route_entry(barrier: &Arc<Barrier>, path: &str) -> RouteEntry {
        let mount = mount_at(path);
        let view = BarrierView::new(
            Arc::clone(barrier),
            format!("logical/{}/", mount.uuid),
        );
        RouteEntry {
            mount,
            engine: Arc::new(KvEngine::new(view)),
        }
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let barrier = test_barrier().await;
        let router = Router::new();
        router.mount(route_entry(&barrier, "secret/").await).await;
        router
            .mount(route_entry(&barrier, "secret/special/").await)
            .await;

        let (route, rest) = router.resolve("secret/data/app").await.unwrap();
        assert_eq!(route.mount.path, "secret/");
        assert_eq!(rest, "data/app");

        let (route, rest) = router.resolve("secret/special/thing").await.unwrap();
        assert_eq!(route.mount.path, "secret/special/");
        assert_eq!(rest, "thing");
    }

    #[tokio::test]
    async fn unresolved_path_is_none() {
        let barrier = test_barrier().await;
        let router = Router::new();
        router.mount(route_entry(&barrier, "secret/").await).await;
        assert!(router.resolve("other/data").await.is_none());
    }

    #[tokio::test]
    async fn unmount_removes_route() {
        let barrier = test_barrier().await;
        let router = Router::new();
        router.mount(route_entry(&barrier, "secret/").await).await;

        assert!(router.unmount("secret/").await);
        assert!(!router.unmount("secret/").await);
        assert!(router.resolve("secret/data/app").await.is_none());
    }

    #[tokio::test]
    async fn route_dispatches_to_engine() {
        let barrier = test_barrier().await;
        let router = Router::new();
        router.mount(route_entry(&barrier, "secret/").await).await;

        let write = Request::new(Operation::Create, "secret/data/app")
            .with_data(serde_json::json!({"data": {"v": "world"}}));
        router.route(write).await.unwrap();

        let read = Request::new(Operation::Read, "secret/data/app");
        let response = router.route(read).await.unwrap();
        let data = response.data.unwrap();
        assert_eq!(data["data"]["v"], "world");
    }

    #[tokio::test]
    async fn barrier_view_is_prefix_scoped() {
        let barrier = test_barrier().await;
        let view_a = BarrierView::new(Arc::clone(&barrier), "logical/a/".to_owned());
        let view_b = BarrierView::new(Arc::clone(&barrier), "logical/b/".to_owned());

        view_a.put("k", b"from-a").await.unwrap();
        assert_eq!(view_b.get("k").await.unwrap(), None);
        assert_eq!(view_a.get("k").await.unwrap(), Some(b"from-a".to_vec()));
        assert_eq!(view_a.list("").await.unwrap(), vec!["k"]);
    }
}
