//! The engine contract and the built-in engines.
//!
//! Every secret/auth engine implements [`Engine`]: a uniform request
//! handler plus lifecycle hooks. Engines are instantiated through the
//! [`EngineRegistry`] keyed by engine type, each receiving a
//! [`BarrierView`] scoped to its private `logical/<mount-uuid>/`
//! namespace.
//!
//! Built-ins:
//!
//! - [`KvEngine`] — versioned key-value storage with soft delete and
//!   version metadata.
//! - [`CubbyholeEngine`] — per-token private storage, wiped when the token
//!   is revoked; backs response wrapping.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::EngineError;
use crate::mount::MountEntry;
use crate::router::{BarrierView, Operation, Request, Response};

/// The uniform engine contract.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    /// The engine type string this instance was mounted as.
    fn engine_type(&self) -> &'static str;

    /// Handle a mount-relative logical request.
    ///
    /// # Errors
    ///
    /// Returns a logical [`EngineError`] kind; the transport maps it to a
    /// status code.
    async fn handle(&self, mount: &MountEntry, request: &Request)
    -> Result<Response, EngineError>;

    /// Called once after the engine is mounted or reloaded.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the engine cannot start.
    async fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called when a storage key under the engine's view changed outside
    /// the local node (replication catch-up).
    async fn invalidate(&self, _key: &str) {}

    /// Called before unmount or seal; the engine drops caches and stops
    /// background work.
    async fn cleanup(&self) {}
}

/// Builds an engine instance for a mount.
pub type EngineFactory = Arc<dyn Fn(BarrierView) -> Arc<dyn Engine> + Send + Sync>;

/// Registry of engine factories keyed by engine type.
pub struct EngineRegistry {
    factories: RwLock<HashMap<String, EngineFactory>>,
}

impl EngineRegistry {
    /// Create an empty registry; call [`Self::register_builtins`] to add
    /// the built-in engines.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register the built-in engine types.
    pub async fn register_builtins(&self) {
        self.register("kv", Arc::new(|view| {
            Arc::new(KvEngine::new(view)) as Arc<dyn Engine>
        }))
        .await;
        self.register("cubbyhole", Arc::new(|view| {
            Arc::new(CubbyholeEngine::new(view)) as Arc<dyn Engine>
        }))
        .await;
    }

    /// Register (or replace) a factory for an engine type.
    pub async fn register(&self, engine_type: impl Into<String>, factory: EngineFactory) {
        self.factories
            .write()
            .await
            .insert(engine_type.into(), factory);
    }

    /// Instantiate an engine for a mount.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRequest`] for unknown engine types.
    pub async fn instantiate(
        &self,
        engine_type: &str,
        view: BarrierView,
    ) -> Result<Arc<dyn Engine>, EngineError> {
        let factories = self.factories.read().await;
        let factory = factories
            .get(engine_type)
            .ok_or_else(|| EngineError::InvalidRequest {
                reason: format!("unknown engine type: {engine_type}"),
            })?;
        Ok(factory(view))
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry").finish_non_exhaustive()
    }
}

// ── KV engine ────────────────────────────────────────────────────────

/// Stored secret with version history.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvSecret {
    versions: HashMap<u32, KvVersion>,
    current_version: u32,
    max_versions: u32,
}

/// A single version of a secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvVersion {
    data: serde_json::Map<String, serde_json::Value>,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

/// Versioned key-value engine.
///
/// Layout under the engine view: `data/<path>` holds the versioned secret,
/// reads default to the latest non-deleted version, deletes are soft.
pub struct KvEngine {
    view: BarrierView,
}

impl KvEngine {
    /// Default number of versions retained per secret.
    const DEFAULT_MAX_VERSIONS: u32 = 10;

    /// Create a KV engine over its private view.
    #[must_use]
    pub fn new(view: BarrierView) -> Self {
        Self { view }
    }

    async fn load(&self, path: &str) -> Result<Option<KvSecret>, EngineError> {
        let Some(bytes) = self.view.get(&format!("data/{path}")).await? else {
            return Ok(None);
        };
        let secret = serde_json::from_slice(&bytes).map_err(|e| EngineError::Internal {
            reason: format!("secret deserialization failed: {e}"),
        })?;
        Ok(Some(secret))
    }

    async fn store(&self, path: &str, secret: &KvSecret) -> Result<(), EngineError> {
        let bytes = serde_json::to_vec(secret).map_err(|e| EngineError::Internal {
            reason: format!("secret serialization failed: {e}"),
        })?;
        self.view.put(&format!("data/{path}"), &bytes).await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Response, EngineError> {
        let secret = self.load(path).await?.ok_or_else(|| EngineError::NotFound {
            path: path.to_owned(),
        })?;
        let version = secret
            .versions
            .get(&secret.current_version)
            .ok_or_else(|| EngineError::Internal {
                reason: format!("version {} missing", secret.current_version),
            })?;
        if version.deleted_at.is_some() {
            return Err(EngineError::NotFound {
                path: path.to_owned(),
            });
        }

        Ok(Response::ok(serde_json::json!({
            "data": version.data,
            "metadata": {
                "version": secret.current_version,
                "created_time": version.created_at.to_rfc3339(),
            }
        })))
    }

    async fn write(
        &self,
        path: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Response, EngineError> {
        let mut secret = self.load(path).await?.unwrap_or(KvSecret {
            versions: HashMap::new(),
            current_version: 0,
            max_versions: Self::DEFAULT_MAX_VERSIONS,
        });

        secret.current_version = secret.current_version.saturating_add(1);
        let now = Utc::now();
        secret.versions.insert(
            secret.current_version,
            KvVersion {
                data,
                created_at: now,
                deleted_at: None,
            },
        );

        while secret.max_versions > 0 && secret.versions.len() > secret.max_versions as usize {
            if let Some(min) = secret.versions.keys().copied().min() {
                secret.versions.remove(&min);
            }
        }

        self.store(path, &secret).await?;
        Ok(Response::ok(serde_json::json!({
            "version": secret.current_version,
            "created_time": now.to_rfc3339(),
        })))
    }

    async fn patch(
        &self,
        path: &str,
        updates: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Response, EngineError> {
        let secret = self.load(path).await?.ok_or_else(|| EngineError::NotFound {
            path: path.to_owned(),
        })?;
        let current = secret
            .versions
            .get(&secret.current_version)
            .filter(|v| v.deleted_at.is_none())
            .ok_or_else(|| EngineError::NotFound {
                path: path.to_owned(),
            })?;

        // Merge: null removes a key, anything else overwrites.
        let mut merged = current.data.clone();
        for (key, value) in updates {
            if value.is_null() {
                merged.remove(&key);
            } else {
                merged.insert(key, value);
            }
        }
        self.write(path, merged).await
    }

    async fn soft_delete(&self, path: &str) -> Result<Response, EngineError> {
        let mut secret = self.load(path).await?.ok_or_else(|| EngineError::NotFound {
            path: path.to_owned(),
        })?;
        if let Some(version) = secret.versions.get_mut(&secret.current_version) {
            version.deleted_at = Some(Utc::now());
        }
        self.store(path, &secret).await?;
        Ok(Response::empty())
    }

    async fn list(&self, path: &str, after: &str, limit: i64) -> Result<Response, EngineError> {
        let prefix = if path.is_empty() {
            "data/".to_owned()
        } else {
            format!("data/{}/", path.trim_end_matches('/'))
        };
        let keys = self.view.list_page(&prefix, after, limit).await?;
        Ok(Response::ok(serde_json::json!({ "keys": keys })))
    }

    async fn scan(&self, path: &str) -> Result<Response, EngineError> {
        let prefix = if path.is_empty() {
            "data/".to_owned()
        } else {
            format!("data/{}/", path.trim_end_matches('/'))
        };
        let keys = self.view.list(&prefix).await?;
        Ok(Response::ok(serde_json::json!({ "keys": keys })))
    }

    async fn metadata(&self, path: &str) -> Result<Response, EngineError> {
        let secret = self.load(path).await?.ok_or_else(|| EngineError::NotFound {
            path: path.to_owned(),
        })?;
        let created = secret.versions.values().map(|v| v.created_at).min();
        let updated = secret.versions.values().map(|v| v.created_at).max();
        Ok(Response::ok(serde_json::json!({
            "current_version": secret.current_version,
            "version_count": secret.versions.len(),
            "max_versions": secret.max_versions,
            "created_time": created.map(|t| t.to_rfc3339()),
            "updated_time": updated.map(|t| t.to_rfc3339()),
        })))
    }
}

fn body_object(
    request: &Request,
) -> Result<serde_json::Map<String, serde_json::Value>, EngineError> {
    let Some(body) = request.data_object() else {
        return Err(EngineError::InvalidRequest {
            reason: "request body must be a JSON object".to_owned(),
        });
    };
    // KV API convention: the secret lives under a `data` key; a flat
    // object is accepted as-is.
    match body.get("data") {
        Some(serde_json::Value::Object(inner)) => Ok(inner.clone()),
        Some(_) => Err(EngineError::InvalidRequest {
            reason: "'data' must be a JSON object".to_owned(),
        }),
        None => Ok(body.clone()),
    }
}

#[async_trait::async_trait]
impl Engine for KvEngine {
    fn engine_type(&self) -> &'static str {
        "kv"
    }

    async fn handle(
        &self,
        _mount: &MountEntry,
        request: &Request,
    ) -> Result<Response, EngineError> {
        let path = request.path.as_str();

        if let Some(meta_path) = path.strip_prefix("metadata/") {
            return match request.operation {
                Operation::Read => self.metadata(meta_path).await,
                other => Err(EngineError::UnsupportedOperation {
                    operation: other.to_string(),
                }),
            };
        }

        let data_path = path.strip_prefix("data/").unwrap_or(path);
        match request.operation {
            Operation::Read => self.read(data_path).await,
            Operation::Create | Operation::Update => {
                self.write(data_path, body_object(request)?).await
            }
            Operation::Patch => self.patch(data_path, body_object(request)?).await,
            Operation::Delete => self.soft_delete(data_path).await,
            Operation::List => {
                self.list(
                    data_path,
                    request.after.as_deref().unwrap_or(""),
                    request.limit.unwrap_or(-1),
                )
                .await
            }
            Operation::Scan => self.scan(data_path).await,
            // Static secrets have nothing to revoke server-side.
            Operation::Revoke => Ok(Response::empty()),
            Operation::Renew => Err(EngineError::UnsupportedOperation {
                operation: request.operation.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for KvEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvEngine").finish_non_exhaustive()
    }
}

// ── Cubbyhole engine ─────────────────────────────────────────────────

/// Per-token private storage.
///
/// Every key is scoped to the requesting token's hash; no token can see
/// another's cubbyhole. Revoking a token wipes its compartment.
pub struct CubbyholeEngine {
    view: BarrierView,
}

impl CubbyholeEngine {
    /// Create a cubbyhole engine over its private view.
    #[must_use]
    pub fn new(view: BarrierView) -> Self {
        Self { view }
    }

    /// Remove every entry belonging to a token (called on revocation).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Barrier`] on storage failure.
    pub async fn wipe(&self, token_hash: &str) -> Result<(), EngineError> {
        self.view.clear_prefix(&format!("{token_hash}/")).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Engine for CubbyholeEngine {
    fn engine_type(&self) -> &'static str {
        "cubbyhole"
    }

    async fn handle(
        &self,
        _mount: &MountEntry,
        request: &Request,
    ) -> Result<Response, EngineError> {
        let Some(token) = request.token_entry.as_ref() else {
            return Err(EngineError::PermissionDenied);
        };
        let scoped = format!("{}/{}", token.token_hash, request.path);

        match request.operation {
            Operation::Read => {
                let Some(bytes) = self.view.get(&scoped).await? else {
                    return Err(EngineError::NotFound {
                        path: request.path.clone(),
                    });
                };
                let data: serde_json::Value =
                    serde_json::from_slice(&bytes).map_err(|e| EngineError::Internal {
                        reason: format!("cubbyhole deserialization failed: {e}"),
                    })?;
                Ok(Response::ok(data))
            }
            Operation::Create | Operation::Update => {
                let body = request.data.clone().ok_or_else(|| {
                    EngineError::InvalidRequest {
                        reason: "request body required".to_owned(),
                    }
                })?;
                let bytes = serde_json::to_vec(&body).map_err(|e| EngineError::Internal {
                    reason: format!("cubbyhole serialization failed: {e}"),
                })?;
                self.view.put(&scoped, &bytes).await?;
                Ok(Response::empty())
            }
            Operation::Delete => {
                self.view.delete(&scoped).await?;
                Ok(Response::empty())
            }
            Operation::List => {
                let prefix = format!("{}/", scoped.trim_end_matches('/'));
                let keys = self
                    .view
                    .list_page(
                        &prefix,
                        request.after.as_deref().unwrap_or(""),
                        request.limit.unwrap_or(-1),
                    )
                    .await?;
                Ok(Response::ok(serde_json::json!({ "keys": keys })))
            }
            Operation::Revoke => Ok(Response::empty()),
            other => Err(EngineError::UnsupportedOperation {
                operation: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for CubbyholeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubbyholeEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::barrier::Barrier;
    use crate::crypto::AeadAlgorithm;
    use crate::token::TokenEntry;
    use strongbox_storage::MemoryBackend;

    async fn kv() -> (KvEngine, MountEntry) {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        barrier.initialize(AeadAlgorithm::Aes256Gcm).await.unwrap();
        let mount = MountEntry::new("secret/", "kv");
        let view = BarrierView::new(barrier, mount.storage_prefix());
        (KvEngine::new(view), mount)
    }

    fn write_request(path: &str, data: serde_json::Value) -> Request {
        Request::new(Operation::Create, path).with_data(data)
    }

    #[tokio::test]
    async fn write_read_roundtrip() {
        let (engine, mount) = kv().await;
        engine
            .handle(
                &mount,
                &write_request("data/app", serde_json::json!({"data": {"v": "world"}})),
            )
            .await
            .unwrap();

        let response = engine
            .handle(&mount, &Request::new(Operation::Read, "data/app"))
            .await
            .unwrap();
        assert_eq!(response.data.unwrap()["data"]["v"], "world");
    }

    #[tokio::test]
    async fn writes_create_versions() {
        let (engine, mount) = kv().await;
        for i in 1..=3 {
            let response = engine
                .handle(
                    &mount,
                    &write_request("data/app", serde_json::json!({"data": {"n": i}})),
                )
                .await
                .unwrap();
            assert_eq!(response.data.unwrap()["version"], i);
        }

        let meta = engine
            .handle(&mount, &Request::new(Operation::Read, "metadata/app"))
            .await
            .unwrap();
        let meta = meta.data.unwrap();
        assert_eq!(meta["current_version"], 3);
        assert_eq!(meta["version_count"], 3);
    }

    #[tokio::test]
    async fn patch_merges_and_removes_nulls() {
        let (engine, mount) = kv().await;
        engine
            .handle(
                &mount,
                &write_request(
                    "data/app",
                    serde_json::json!({"data": {"keep": 1, "drop": 2}}),
                ),
            )
            .await
            .unwrap();

        let patch = Request::new(Operation::Patch, "data/app")
            .with_data(serde_json::json!({"data": {"drop": null, "new": 3}}));
        engine.handle(&mount, &patch).await.unwrap();

        let response = engine
            .handle(&mount, &Request::new(Operation::Read, "data/app"))
            .await
            .unwrap();
        let data = response.data.unwrap();
        assert_eq!(data["data"]["keep"], 1);
        assert_eq!(data["data"]["new"], 3);
        assert!(data["data"].get("drop").is_none());
    }

    #[tokio::test]
    async fn delete_is_soft() {
        let (engine, mount) = kv().await;
        engine
            .handle(
                &mount,
                &write_request("data/app", serde_json::json!({"data": {"v": 1}})),
            )
            .await
            .unwrap();
        engine
            .handle(&mount, &Request::new(Operation::Delete, "data/app"))
            .await
            .unwrap();

        let err = engine
            .handle(&mount, &Request::new(Operation::Read, "data/app"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        // Metadata survives the soft delete.
        engine
            .handle(&mount, &Request::new(Operation::Read, "metadata/app"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn list_paginates() {
        let (engine, mount) = kv().await;
        for i in 1..=10u32 {
            engine
                .handle(
                    &mount,
                    &write_request(
                        &format!("data/a/{i:02}"),
                        serde_json::json!({"data": {"n": i}}),
                    ),
                )
                .await
                .unwrap();
        }

        let mut request = Request::new(Operation::List, "data/a");
        request.limit = Some(3);
        let response = engine.handle(&mount, &request).await.unwrap();
        assert_eq!(
            response.data.unwrap()["keys"],
            serde_json::json!(["01", "02", "03"])
        );

        request.after = Some("03".to_owned());
        let response = engine.handle(&mount, &request).await.unwrap();
        assert_eq!(
            response.data.unwrap()["keys"],
            serde_json::json!(["04", "05", "06"])
        );
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let (engine, mount) = kv().await;
        let err = engine
            .handle(&mount, &Request::new(Operation::Read, "data/ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cubbyhole_is_token_scoped() {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        barrier.initialize(AeadAlgorithm::Aes256Gcm).await.unwrap();
        let mount = MountEntry::new("cubbyhole/", "cubbyhole");
        let engine = CubbyholeEngine::new(BarrierView::new(barrier, mount.storage_prefix()));

        let token_a = TokenEntry::synthetic_for_tests("hash-a");
        let token_b = TokenEntry::synthetic_for_tests("hash-b");

        let mut write = Request::new(Operation::Create, "private")
            .with_data(serde_json::json!({"note": "mine"}));
        write.token_entry = Some(token_a.clone());
        engine.handle(&mount, &write).await.unwrap();

        let mut read_a = Request::new(Operation::Read, "private");
        read_a.token_entry = Some(token_a);
        let response = engine.handle(&mount, &read_a).await.unwrap();
        assert_eq!(response.data.unwrap()["note"], "mine");

        let mut read_b = Request::new(Operation::Read, "private");
        read_b.token_entry = Some(token_b);
        let err = engine.handle(&mount, &read_b).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cubbyhole_wipe_clears_compartment() {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        barrier.initialize(AeadAlgorithm::Aes256Gcm).await.unwrap();
        let mount = MountEntry::new("cubbyhole/", "cubbyhole");
        let engine = CubbyholeEngine::new(BarrierView::new(barrier, mount.storage_prefix()));

        let token = TokenEntry::synthetic_for_tests("hash-x");
        let mut write =
            Request::new(Operation::Create, "a").with_data(serde_json::json!({"v": 1}));
        write.token_entry = Some(token.clone());
        engine.handle(&mount, &write).await.unwrap();

        engine.wipe("hash-x").await.unwrap();

        let mut read = Request::new(Operation::Read, "a");
        read.token_entry = Some(token);
        let err = engine.handle(&mount, &read).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn registry_instantiates_builtins() {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        barrier.initialize(AeadAlgorithm::Aes256Gcm).await.unwrap();
        let registry = EngineRegistry::new();
        registry.register_builtins().await;

        let view = BarrierView::new(barrier, "logical/x/".to_owned());
        let engine = registry.instantiate("kv", view.clone()).await.unwrap();
        assert_eq!(engine.engine_type(), "kv");

        let err = match registry.instantiate("nope", view).await {
            Err(e) => e,
            Ok(_) => panic!("expected instantiate(\"nope\") to fail"),
        };
        assert!(matches!(err, EngineError::InvalidRequest { .. }));
    }
}
