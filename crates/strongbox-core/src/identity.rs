//! Minimal identity store: entities and their auth aliases.
//!
//! Entities are persistent identities that tokens bind to via `entity_id`;
//! policy templates expand entity attributes at evaluation time. Aliases
//! link an entity to a login on a specific auth mount, referenced by the
//! mount's accessor (identifiers, never back-pointers).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::barrier::Barrier;
use crate::error::BarrierError;

/// Storage prefix for entity records.
const ENTITY_PREFIX: &str = "sys/identity/entity/";

/// An auth alias attached to an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alias {
    /// Accessor of the auth mount the alias belongs to.
    pub mount_accessor: String,
    /// Login name on that mount.
    pub name: String,
}

/// A persistent identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Stable entity ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Policies granted through the entity (in addition to token policies).
    #[serde(default)]
    pub policies: Vec<String>,
    /// Auth aliases.
    #[serde(default)]
    pub aliases: Vec<Alias>,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Disabled entities fail every request.
    #[serde(default)]
    pub disabled: bool,
}

impl Entity {
    /// Create an entity with a generated ID.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            policies: Vec::new(),
            aliases: Vec::new(),
            metadata: HashMap::new(),
            disabled: false,
        }
    }

    /// The alias on a given mount accessor, if any.
    #[must_use]
    pub fn alias_for(&self, mount_accessor: &str) -> Option<&Alias> {
        self.aliases
            .iter()
            .find(|alias| alias.mount_accessor == mount_accessor)
    }
}

/// Entity CRUD over the barrier.
pub struct IdentityStore {
    barrier: Arc<Barrier>,
}

impl IdentityStore {
    /// Create an identity store.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Persist an entity (create or update).
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] on storage failure.
    pub async fn put(&self, entity: &Entity) -> Result<(), BarrierError> {
        let bytes = serde_json::to_vec(entity).map_err(|e| BarrierError::Corrupt {
            key: format!("{ENTITY_PREFIX}{}", entity.id),
            reason: e.to_string(),
        })?;
        self.barrier
            .put(&format!("{ENTITY_PREFIX}{}", entity.id), &bytes)
            .await?;
        info!(entity_id = %entity.id, name = %entity.name, "entity written");
        Ok(())
    }

    /// Load an entity by ID.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] on storage failure or a corrupt record.
    pub async fn get(&self, id: &str) -> Result<Option<Entity>, BarrierError> {
        let key = format!("{ENTITY_PREFIX}{id}");
        let Some(bytes) = self.barrier.get(&key).await? else {
            return Ok(None);
        };
        let entity = serde_json::from_slice(&bytes).map_err(|e| BarrierError::Corrupt {
            key,
            reason: e.to_string(),
        })?;
        Ok(Some(entity))
    }

    /// Delete an entity by ID.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] on storage failure.
    pub async fn delete(&self, id: &str) -> Result<(), BarrierError> {
        self.barrier.delete(&format!("{ENTITY_PREFIX}{id}")).await
    }

    /// List entity IDs.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] on storage failure.
    pub async fn list(&self) -> Result<Vec<String>, BarrierError> {
        let keys = self.barrier.list(ENTITY_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(ENTITY_PREFIX).map(String::from))
            .collect())
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::AeadAlgorithm;
    use strongbox_storage::MemoryBackend;

    async fn store() -> IdentityStore {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        barrier.initialize(AeadAlgorithm::Aes256Gcm).await.unwrap();
        IdentityStore::new(barrier)
    }

    #[tokio::test]
    async fn entity_roundtrip() {
        let store = store().await;
        let mut entity = Entity::new("service-a");
        entity.aliases.push(Alias {
            mount_accessor: "auth_token_1234".to_owned(),
            name: "service-a-login".to_owned(),
        });
        store.put(&entity).await.unwrap();

        let loaded = store.get(&entity.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "service-a");
        assert_eq!(
            loaded.alias_for("auth_token_1234").unwrap().name,
            "service-a-login"
        );
    }

    #[tokio::test]
    async fn missing_entity_is_none() {
        let store = store().await;
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_and_delete() {
        let store = store().await;
        let entity = Entity::new("e1");
        store.put(&entity).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![entity.id.clone()]);
        store.delete(&entity.id).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
