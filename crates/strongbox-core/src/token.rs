//! The token store.
//!
//! Tokens are the core authentication credential. Service tokens are
//! persisted hashed (`sys/token/id/<sha256(id)>`) with an accessor index,
//! form a revocation hierarchy (parent revocation cascades to non-orphan
//! children), and support renewal against TTL ceilings. Batch tokens are
//! self-describing blobs — `b.<base64(payload)>` encrypted under the
//! barrier's active key — never persisted, never renewable.
//!
//! The plaintext token is returned once at creation and never stored.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::barrier::Barrier;
use crate::error::TokenError;

/// Storage prefix for token records, keyed by `sha256(id)`.
const TOKEN_ID_PREFIX: &str = "sys/token/id/";
/// Storage prefix for the accessor index, keyed by `sha256(accessor)`.
const TOKEN_ACCESSOR_PREFIX: &str = "sys/token/accessor/";
/// Storage prefix for the parent → children index.
const TOKEN_PARENT_PREFIX: &str = "sys/token/parent/";

/// Prefix of service token identifiers.
const SERVICE_TOKEN_PREFIX: &str = "s.";
/// Prefix of batch token identifiers.
const BATCH_TOKEN_PREFIX: &str = "b.";

/// AAD binding batch-token payloads to their purpose.
const BATCH_TOKEN_AAD: &[u8] = b"token/batch";

/// Token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Persisted, renewable, revocable.
    Service,
    /// Self-contained, non-persistent, expires on its embedded TTL.
    Batch,
}

/// A token record. Service tokens are persisted through the barrier; batch
/// entries are synthesized from their payload at lookup time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    /// `sha256(id)`, hex — the storage key component. The plaintext ID is
    /// never stored.
    pub token_hash: String,
    /// Opaque accessor for audit and revoke-by-accessor.
    pub accessor: String,
    /// Parent token hash (None for root and orphan tokens).
    pub parent_hash: Option<String>,
    /// Attached policies.
    pub policies: Vec<String>,
    /// Arbitrary metadata.
    #[serde(default)]
    pub meta: HashMap<String, String>,
    /// TTL in seconds from creation/last renewal (0 = never expires).
    pub ttl_secs: i64,
    /// Hard ceiling from creation that renewals cannot cross (0 = none).
    #[serde(default)]
    pub explicit_max_ttl_secs: i64,
    /// When the token was created.
    pub creation_time: DateTime<Utc>,
    /// Last successful renewal.
    #[serde(default)]
    pub last_renewal: Option<DateTime<Utc>>,
    /// Bound identity entity.
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Service or batch.
    pub token_type: TokenType,
    /// Orphans survive parent revocation.
    #[serde(default)]
    pub orphan: bool,
    /// Periodic tokens renew to this period regardless of TTL arithmetic.
    #[serde(default)]
    pub period_secs: Option<i64>,
    /// CIDR blocks the token may be used from (empty = unrestricted).
    #[serde(default)]
    pub bound_cidrs: Vec<String>,
    /// Whether the token may be renewed.
    #[serde(default = "default_true")]
    pub renewable: bool,
    /// Display name for audit logs.
    #[serde(default)]
    pub display_name: String,
}

fn default_true() -> bool {
    true
}

impl TokenEntry {
    /// When this token expires, if it does.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.ttl_secs == 0 {
            return None;
        }
        let anchor = self.last_renewal.unwrap_or(self.creation_time);
        Some(anchor + Duration::seconds(self.ttl_secs))
    }

    /// Whether the token carries the `root` policy.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.policies.iter().any(|p| p == "root")
    }

    /// A minimal entry for engine tests.
    #[cfg(test)]
    #[must_use]
    pub fn synthetic_for_tests(token_hash: &str) -> Self {
        Self {
            token_hash: token_hash.to_owned(),
            accessor: format!("accessor-{token_hash}"),
            parent_hash: None,
            policies: vec!["default".to_owned()],
            meta: HashMap::new(),
            ttl_secs: 0,
            explicit_max_ttl_secs: 0,
            creation_time: Utc::now(),
            last_renewal: None,
            entity_id: None,
            token_type: TokenType::Service,
            orphan: false,
            period_secs: None,
            bound_cidrs: Vec::new(),
            renewable: true,
            display_name: "test".to_owned(),
        }
    }
}

/// Parameters for creating a service token.
#[derive(Debug, Clone, Default)]
pub struct CreateTokenParams {
    /// Policies to attach.
    pub policies: Vec<String>,
    /// TTL in seconds (0 = never expires).
    pub ttl_secs: i64,
    /// Explicit hard TTL ceiling (0 = none).
    pub explicit_max_ttl_secs: i64,
    /// Parent token hash for hierarchical revocation.
    pub parent_hash: Option<String>,
    /// Create as an orphan.
    pub orphan: bool,
    /// Periodic-token period.
    pub period_secs: Option<i64>,
    /// Bound identity entity.
    pub entity_id: Option<String>,
    /// Metadata.
    pub meta: HashMap<String, String>,
    /// CIDR restrictions.
    pub bound_cidrs: Vec<String>,
    /// Whether renewable.
    pub renewable: bool,
    /// Display name.
    pub display_name: String,
}

/// Batch-token payload, bincode-encoded and barrier-encrypted.
#[derive(Debug, Serialize, Deserialize)]
struct BatchTokenPayload {
    policies: Vec<String>,
    entity_id: Option<String>,
    creation_unix: i64,
    ttl_secs: i64,
    meta: HashMap<String, String>,
}

/// Accessor index record.
#[derive(Serialize, Deserialize)]
struct AccessorIndex {
    token_hash: String,
}

/// Token creation, lookup, renewal, and hierarchical revocation.
pub struct TokenStore {
    barrier: Arc<Barrier>,
}

impl TokenStore {
    /// Create a token store over the barrier.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Create a service token. Returns the plaintext token (shown once)
    /// and its entry.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] on storage failure.
    pub async fn create(
        &self,
        params: CreateTokenParams,
    ) -> Result<(String, TokenEntry), TokenError> {
        let id = generate_token_id(SERVICE_TOKEN_PREFIX);
        let token_hash = hash_token(&id);
        let accessor = generate_token_id("acc.");

        let entry = TokenEntry {
            token_hash: token_hash.clone(),
            accessor: accessor.clone(),
            parent_hash: if params.orphan {
                None
            } else {
                params.parent_hash.clone()
            },
            policies: params.policies,
            meta: params.meta,
            ttl_secs: params.ttl_secs,
            explicit_max_ttl_secs: params.explicit_max_ttl_secs,
            creation_time: Utc::now(),
            last_renewal: None,
            entity_id: params.entity_id,
            token_type: TokenType::Service,
            orphan: params.orphan,
            period_secs: params.period_secs,
            bound_cidrs: params.bound_cidrs,
            renewable: params.renewable,
            display_name: params.display_name,
        };

        self.store_entry(&entry).await?;

        // Accessor index.
        let index = AccessorIndex {
            token_hash: token_hash.clone(),
        };
        let index_bytes = serde_json::to_vec(&index).map_err(|e| TokenError::Corrupt {
            reason: e.to_string(),
        })?;
        self.barrier
            .put(
                &format!("{TOKEN_ACCESSOR_PREFIX}{}", hash_token(&accessor)),
                &index_bytes,
            )
            .await?;

        // Parent → child index for cascade revocation.
        if let Some(parent) = &entry.parent_hash {
            self.barrier
                .put(
                    &format!("{TOKEN_PARENT_PREFIX}{parent}/{token_hash}"),
                    b"1",
                )
                .await?;
        }

        info!(display_name = %entry.display_name, "service token created");
        Ok((id, entry))
    }

    /// Create the root token (policy `root`, no expiry, orphan).
    ///
    /// Only initialization and the generate-root ceremony call this.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] on storage failure.
    pub async fn create_root(&self) -> Result<String, TokenError> {
        let (token, _entry) = self
            .create(CreateTokenParams {
                policies: vec!["root".to_owned()],
                renewable: false,
                orphan: true,
                display_name: "root".to_owned(),
                ..CreateTokenParams::default()
            })
            .await?;
        info!("root token generated");
        Ok(token)
    }

    /// Create a batch token: encrypted, self-describing, never persisted.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] if the barrier is sealed.
    pub async fn create_batch(
        &self,
        policies: Vec<String>,
        entity_id: Option<String>,
        ttl_secs: i64,
        meta: HashMap<String, String>,
    ) -> Result<String, TokenError> {
        let payload = BatchTokenPayload {
            policies,
            entity_id,
            creation_unix: Utc::now().timestamp(),
            ttl_secs,
            meta,
        };
        let plaintext = bincode::serialize(&payload).map_err(|e| TokenError::Corrupt {
            reason: e.to_string(),
        })?;
        let blob = self
            .barrier
            .encrypt_value(BATCH_TOKEN_AAD, &plaintext)
            .await?;
        Ok(format!("{BATCH_TOKEN_PREFIX}{}", BASE64URL.encode(blob)))
    }

    /// Look up a token, validating expiry.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] for unknown or malformed tokens.
    /// - [`TokenError::Expired`] past the TTL.
    pub async fn lookup(&self, token: &str) -> Result<TokenEntry, TokenError> {
        if let Some(encoded) = token.strip_prefix(BATCH_TOKEN_PREFIX) {
            return self.lookup_batch(token, encoded).await;
        }

        let entry = self
            .load_entry(&hash_token(token))
            .await?
            .ok_or(TokenError::NotFound)?;

        if let Some(expires_at) = entry.expires_at() {
            if Utc::now() > expires_at {
                return Err(TokenError::Expired {
                    expired_at: expires_at.to_rfc3339(),
                });
            }
        }
        Ok(entry)
    }

    /// Look up a token entry by its accessor.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::NotFound`] for unknown accessors.
    pub async fn lookup_by_accessor(&self, accessor: &str) -> Result<TokenEntry, TokenError> {
        let key = format!("{TOKEN_ACCESSOR_PREFIX}{}", hash_token(accessor));
        let bytes = self.barrier.get(&key).await?.ok_or(TokenError::NotFound)?;
        let index: AccessorIndex =
            serde_json::from_slice(&bytes).map_err(|e| TokenError::Corrupt {
                reason: e.to_string(),
            })?;
        self.load_entry(&index.token_hash)
            .await?
            .ok_or(TokenError::NotFound)
    }

    /// Renew a service token.
    ///
    /// The new expiry is `now + increment`, clamped to the explicit max
    /// TTL (measured from creation). Periodic tokens always renew to their
    /// period.
    ///
    /// # Errors
    ///
    /// - [`TokenError::BatchTokenUnsupported`] for batch tokens.
    /// - [`TokenError::NotRenewable`] / [`TokenError::MaxTtlExceeded`].
    pub async fn renew(
        &self,
        token: &str,
        increment_secs: i64,
    ) -> Result<TokenEntry, TokenError> {
        let mut entry = self.lookup(token).await?;
        if entry.token_type == TokenType::Batch {
            return Err(TokenError::BatchTokenUnsupported);
        }
        if !entry.renewable {
            return Err(TokenError::NotRenewable);
        }

        let now = Utc::now();
        let requested = entry.period_secs.unwrap_or(increment_secs).max(1);
        let mut new_expiry = now + Duration::seconds(requested);

        if entry.explicit_max_ttl_secs > 0 {
            let ceiling =
                entry.creation_time + Duration::seconds(entry.explicit_max_ttl_secs);
            if now >= ceiling {
                return Err(TokenError::MaxTtlExceeded {
                    max_ttl_secs: entry.explicit_max_ttl_secs,
                });
            }
            if new_expiry > ceiling {
                new_expiry = ceiling;
            }
        }

        entry.last_renewal = Some(now);
        entry.ttl_secs = (new_expiry - now).num_seconds().max(1);
        self.store_entry(&entry).await?;

        info!(accessor = %entry.accessor, ttl = entry.ttl_secs, "token renewed");
        Ok(entry)
    }

    /// Revoke a token and cascade to its non-orphan children.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] on storage failure.
    pub async fn revoke(&self, token: &str) -> Result<(), TokenError> {
        if token.starts_with(BATCH_TOKEN_PREFIX) {
            // Nothing persisted to revoke; batch tokens die by TTL.
            return Ok(());
        }
        self.revoke_by_hash(&hash_token(token)).await
    }

    /// Direct children of a token, by hash.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] on storage failure.
    pub async fn children_of(&self, token_hash: &str) -> Result<Vec<String>, TokenError> {
        let prefix = format!("{TOKEN_PARENT_PREFIX}{token_hash}/");
        let keys = self.barrier.list(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(String::from))
            .collect())
    }

    /// Revoke a token subtree by the parent's hash.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] on storage failure.
    pub async fn revoke_by_hash(&self, token_hash: &str) -> Result<(), TokenError> {
        // Children first, parent-serialized.
        let children_prefix = format!("{TOKEN_PARENT_PREFIX}{token_hash}/");
        for child_key in self.barrier.list(&children_prefix).await? {
            if let Some(child_hash) = child_key.strip_prefix(&children_prefix) {
                Box::pin(self.revoke_by_hash(child_hash)).await?;
            }
            self.barrier.delete(&child_key).await?;
        }

        if let Some(entry) = self.load_entry(token_hash).await? {
            self.barrier
                .delete(&format!(
                    "{TOKEN_ACCESSOR_PREFIX}{}",
                    hash_token(&entry.accessor)
                ))
                .await?;
            if let Some(parent) = &entry.parent_hash {
                self.barrier
                    .delete(&format!("{TOKEN_PARENT_PREFIX}{parent}/{token_hash}"))
                    .await?;
            }
        }
        self.barrier
            .delete(&format!("{TOKEN_ID_PREFIX}{token_hash}"))
            .await?;

        info!(
            token_hash_prefix = &token_hash[..8.min(token_hash.len())],
            "token revoked"
        );
        Ok(())
    }

    /// Revoke a token but orphan its children instead of cascading.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] on storage failure.
    pub async fn revoke_orphan(&self, token: &str) -> Result<(), TokenError> {
        let token_hash = hash_token(token);
        let children_prefix = format!("{TOKEN_PARENT_PREFIX}{token_hash}/");
        for child_key in self.barrier.list(&children_prefix).await? {
            if let Some(child_hash) = child_key.strip_prefix(&children_prefix) {
                if let Some(mut child) = self.load_entry(child_hash).await? {
                    child.orphan = true;
                    child.parent_hash = None;
                    self.store_entry(&child).await?;
                }
            }
            self.barrier.delete(&child_key).await?;
        }
        self.revoke_by_hash(&token_hash).await
    }

    async fn lookup_batch(&self, token: &str, encoded: &str) -> Result<TokenEntry, TokenError> {
        let blob = BASE64URL
            .decode(encoded)
            .map_err(|e| TokenError::MalformedBatchToken {
                reason: format!("base64 decode failed: {e}"),
            })?;
        let plaintext = self
            .barrier
            .decrypt_value(BATCH_TOKEN_AAD, &blob)
            .await
            .map_err(|_| TokenError::NotFound)?;
        let payload: BatchTokenPayload =
            bincode::deserialize(&plaintext).map_err(|e| TokenError::MalformedBatchToken {
                reason: e.to_string(),
            })?;

        let creation_time = DateTime::from_timestamp(payload.creation_unix, 0)
            .ok_or_else(|| TokenError::MalformedBatchToken {
                reason: "invalid creation timestamp".to_owned(),
            })?;
        let entry = TokenEntry {
            token_hash: hash_token(token),
            accessor: String::new(),
            parent_hash: None,
            policies: payload.policies,
            meta: payload.meta,
            ttl_secs: payload.ttl_secs,
            explicit_max_ttl_secs: 0,
            creation_time,
            last_renewal: None,
            entity_id: payload.entity_id,
            token_type: TokenType::Batch,
            orphan: true,
            period_secs: None,
            bound_cidrs: Vec::new(),
            renewable: false,
            display_name: "batch".to_owned(),
        };

        if let Some(expires_at) = entry.expires_at() {
            if Utc::now() > expires_at {
                return Err(TokenError::Expired {
                    expired_at: expires_at.to_rfc3339(),
                });
            }
        }
        Ok(entry)
    }

    async fn load_entry(&self, token_hash: &str) -> Result<Option<TokenEntry>, TokenError> {
        let Some(bytes) = self
            .barrier
            .get(&format!("{TOKEN_ID_PREFIX}{token_hash}"))
            .await?
        else {
            return Ok(None);
        };
        let entry = serde_json::from_slice(&bytes).map_err(|e| TokenError::Corrupt {
            reason: e.to_string(),
        })?;
        Ok(Some(entry))
    }

    async fn store_entry(&self, entry: &TokenEntry) -> Result<(), TokenError> {
        let bytes = serde_json::to_vec(entry).map_err(|e| TokenError::Corrupt {
            reason: e.to_string(),
        })?;
        self.barrier
            .put(&format!("{TOKEN_ID_PREFIX}{}", entry.token_hash), &bytes)
            .await?;
        Ok(())
    }
}

/// Hash a plaintext token or accessor with SHA-256 (hex).
#[must_use]
pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

fn generate_token_id(prefix: &str) -> String {
    let mut bytes = [0u8; 18];
    OsRng.fill_bytes(&mut bytes);
    format!("{prefix}{}", hex::encode(bytes))
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}
