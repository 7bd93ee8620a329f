//! The mount table.
//!
//! Mount entries map path prefixes to engine instances. Two tables exist
//! per namespace (secret and auth), each persisted **split** — one record
//! per mount under `core/mounts/<uuid>` / `core/auth/<uuid>` — so no
//! single record grows past the entry-size limit. A small index record
//! lists the mount UUIDs for fast enumeration.
//!
//! Write ordering keeps a concurrently-reloading standby consistent: the
//! index is written *after* the entry on mount and cleared *before* the
//! entry on unmount, so a reader following the index never sees a
//! half-written mount.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::barrier::Barrier;
use crate::error::MountError;

/// Storage prefix for secret-engine mount records.
const MOUNTS_PREFIX: &str = "core/mounts/";
/// Storage prefix for auth-method mount records.
const AUTH_PREFIX: &str = "core/auth/";
/// Index of secret-engine mount UUIDs.
const MOUNTS_INDEX: &str = "core/mounts-index";
/// Index of auth-method mount UUIDs.
const AUTH_INDEX: &str = "core/auth-index";

/// Paths that can never be shadowed by a user mount.
const PROTECTED_PREFIXES: &[&str] = &["sys/", "audit/", "identity/"];
/// Paths only the core itself may mount.
const INTERNAL_ONLY: &[&str] = &["cubbyhole/", "token/"];

/// Which mount table an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Secret engines (`/v1/<path>`).
    Secret,
    /// Auth methods (`/v1/auth/<path>`).
    Auth,
}

impl MountKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Secret => MOUNTS_PREFIX,
            Self::Auth => AUTH_PREFIX,
        }
    }

    fn index(self) -> &'static str {
        match self {
            Self::Secret => MOUNTS_INDEX,
            Self::Auth => AUTH_INDEX,
        }
    }
}

/// A single mount entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountEntry {
    /// Stable mount identifier (storage key component).
    pub uuid: String,
    /// Mount path, always ending in `/`.
    pub path: String,
    /// Engine type (e.g. `kv`, `cubbyhole`, `token`).
    #[serde(rename = "type")]
    pub engine_type: String,
    /// Opaque accessor used in audit logs and policy templates.
    pub accessor: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Engine-specific options.
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// Local mounts are not replicated to performance secondaries.
    #[serde(default)]
    pub local: bool,
    /// Whether the mount's storage is seal-wrapped.
    #[serde(default)]
    pub seal_wrap: bool,
    /// Whether the engine may draw from external entropy.
    #[serde(default)]
    pub external_entropy_access: bool,
    /// Owning namespace.
    #[serde(default = "default_namespace")]
    pub namespace_id: String,
    /// Check-and-set version, bumped on every tune.
    #[serde(default)]
    pub running_version: u64,
}

fn default_namespace() -> String {
    "root".to_owned()
}

impl MountEntry {
    /// Create an entry with a generated UUID and accessor. The path is
    /// normalized to end with `/`.
    #[must_use]
    pub fn new(path: impl Into<String>, engine_type: impl Into<String>) -> Self {
        let engine_type = engine_type.into();
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            path: normalize_path(&path.into()),
            accessor: generate_accessor(&engine_type),
            engine_type,
            description: String::new(),
            options: HashMap::new(),
            local: false,
            seal_wrap: false,
            external_entropy_access: false,
            namespace_id: default_namespace(),
            running_version: 0,
        }
    }

    /// The engine's private storage prefix under the barrier.
    #[must_use]
    pub fn storage_prefix(&self) -> String {
        format!("logical/{}/", self.uuid)
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.ends_with('/') {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/")
    }
}

fn generate_accessor(engine_type: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", engine_type, &id[..8])
}

/// The persisted mount tables, split one record per mount.
pub struct MountTable {
    barrier: Arc<Barrier>,
    /// Serializes mutations so index and entries stay consistent.
    write_lock: Mutex<()>,
}

impl MountTable {
    /// Create a mount table over the barrier.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier,
            write_lock: Mutex::new(()),
        }
    }

    /// Load all entries of one table.
    ///
    /// A UUID listed in the index whose record is missing (a torn write in
    /// progress) is skipped; the next reload picks it up.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Barrier`] on storage failure.
    pub async fn load(&self, kind: MountKind) -> Result<Vec<MountEntry>, MountError> {
        let uuids = self.load_index(kind).await?;
        let mut entries = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            if let Some(entry) = self.load_entry(kind, &uuid).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Persist a new mount.
    ///
    /// Rejects paths that collide with an existing mount (in either
    /// direction), protected system prefixes, and internal-only paths
    /// unless `internal` is set.
    ///
    /// # Errors
    ///
    /// - [`MountError::InvalidPath`] / [`MountError::ProtectedPath`] /
    ///   [`MountError::PathConflict`] on validation failure.
    pub async fn mount(
        &self,
        kind: MountKind,
        entry: &MountEntry,
        internal: bool,
    ) -> Result<(), MountError> {
        if entry.path == "/" || entry.path.is_empty() {
            return Err(MountError::InvalidPath {
                reason: "mount path cannot be empty".to_owned(),
            });
        }
        if kind == MountKind::Secret {
            for protected in PROTECTED_PREFIXES {
                if entry.path.starts_with(protected) || protected.starts_with(&entry.path) {
                    return Err(MountError::ProtectedPath {
                        path: entry.path.clone(),
                    });
                }
            }
            if !internal {
                for reserved in INTERNAL_ONLY {
                    if entry.path.starts_with(reserved) {
                        return Err(MountError::ProtectedPath {
                            path: entry.path.clone(),
                        });
                    }
                }
            }
        }

        let _guard = self.write_lock.lock().await;

        let existing = self.load(kind).await?;
        for other in &existing {
            if entry.path.starts_with(&other.path) || other.path.starts_with(&entry.path) {
                return Err(MountError::PathConflict {
                    path: entry.path.clone(),
                });
            }
        }

        // Entry first, index last: a reader following the index never sees
        // a UUID without its record.
        self.store_entry(kind, entry).await?;
        let mut uuids = self.load_index(kind).await?;
        uuids.push(entry.uuid.clone());
        self.store_index(kind, &uuids).await?;

        info!(path = %entry.path, engine = %entry.engine_type, "mounted");
        Ok(())
    }

    /// Remove the mount at `path` and return its entry.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NotFound`] if no mount exists there.
    pub async fn unmount(&self, kind: MountKind, path: &str) -> Result<MountEntry, MountError> {
        let normalized = normalize_path(path);
        let _guard = self.write_lock.lock().await;

        let entries = self.load(kind).await?;
        let entry = entries
            .into_iter()
            .find(|e| e.path == normalized)
            .ok_or_else(|| MountError::NotFound {
                path: normalized.clone(),
            })?;

        // Index first, entry second: a reader never routes to a mount whose
        // record is about to disappear.
        let uuids: Vec<String> = self
            .load_index(kind)
            .await?
            .into_iter()
            .filter(|u| u != &entry.uuid)
            .collect();
        self.store_index(kind, &uuids).await?;
        self.barrier
            .delete(&format!("{}{}", kind.prefix(), entry.uuid))
            .await?;

        info!(path = %normalized, "unmounted");
        Ok(entry)
    }

    /// Atomically rename a mount. The engine's storage prefix (keyed by
    /// UUID) is unchanged; only the routing path moves.
    ///
    /// # Errors
    ///
    /// - [`MountError::NotFound`] if `from` is not mounted.
    /// - [`MountError::PathConflict`] if `to` collides.
    pub async fn remount(
        &self,
        kind: MountKind,
        from: &str,
        to: &str,
    ) -> Result<MountEntry, MountError> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        let _guard = self.write_lock.lock().await;

        let entries = self.load(kind).await?;
        for other in &entries {
            if other.path != from && (to.starts_with(&other.path) || other.path.starts_with(&to)) {
                return Err(MountError::PathConflict { path: to.clone() });
            }
        }
        let mut entry = entries
            .into_iter()
            .find(|e| e.path == from)
            .ok_or_else(|| MountError::NotFound { path: from.clone() })?;

        entry.path.clone_from(&to);
        entry.running_version = entry.running_version.saturating_add(1);
        self.store_entry(kind, &entry).await?;

        info!(%from, %to, "remounted");
        Ok(entry)
    }

    /// Tune a mount's description and options via check-and-set on
    /// `running_version`.
    ///
    /// # Errors
    ///
    /// - [`MountError::NotFound`] if the path is not mounted.
    /// - [`MountError::CasMismatch`] on a version conflict.
    pub async fn tune(
        &self,
        kind: MountKind,
        path: &str,
        description: Option<String>,
        options: Option<HashMap<String, String>>,
        expected_version: u64,
    ) -> Result<MountEntry, MountError> {
        let normalized = normalize_path(path);
        let _guard = self.write_lock.lock().await;

        let entries = self.load(kind).await?;
        let mut entry = entries
            .into_iter()
            .find(|e| e.path == normalized)
            .ok_or_else(|| MountError::NotFound {
                path: normalized.clone(),
            })?;

        if entry.running_version != expected_version {
            return Err(MountError::CasMismatch {
                path: normalized,
                expected: expected_version,
                found: entry.running_version,
            });
        }

        if let Some(description) = description {
            entry.description = description;
        }
        if let Some(options) = options {
            entry.options.extend(options);
        }
        entry.running_version = entry.running_version.saturating_add(1);
        self.store_entry(kind, &entry).await?;

        info!(path = %entry.path, version = entry.running_version, "mount tuned");
        Ok(entry)
    }

    async fn load_entry(
        &self,
        kind: MountKind,
        uuid: &str,
    ) -> Result<Option<MountEntry>, MountError> {
        let key = format!("{}{}", kind.prefix(), uuid);
        let Some(bytes) = self.barrier.get(&key).await? else {
            return Ok(None);
        };
        let entry = serde_json::from_slice(&bytes).map_err(|e| MountError::Corrupt {
            key,
            reason: e.to_string(),
        })?;
        Ok(Some(entry))
    }

    async fn store_entry(&self, kind: MountKind, entry: &MountEntry) -> Result<(), MountError> {
        let key = format!("{}{}", kind.prefix(), entry.uuid);
        let bytes = serde_json::to_vec(entry).map_err(|e| MountError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.barrier.put(&key, &bytes).await?;
        Ok(())
    }

    async fn load_index(&self, kind: MountKind) -> Result<Vec<String>, MountError> {
        let Some(bytes) = self.barrier.get(kind.index()).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_slice(&bytes).map_err(|e| MountError::Corrupt {
            key: kind.index().to_owned(),
            reason: e.to_string(),
        })
    }

    async fn store_index(&self, kind: MountKind, uuids: &[String]) -> Result<(), MountError> {
        let bytes = serde_json::to_vec(uuids).map_err(|e| MountError::Corrupt {
            key: kind.index().to_owned(),
            reason: e.to_string(),
        })?;
        self.barrier.put(kind.index(), &bytes).await?;
        Ok(())
    }
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTable").finish_non_exhaustive()
    }
}
