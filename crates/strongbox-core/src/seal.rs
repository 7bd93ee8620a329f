//! Seal providers and the seal/unseal lifecycle.
//!
//! The root key never touches storage in the clear: it is wrapped by seal
//! key material and stored at a reserved physical path. Three providers
//! implement the wrap/unwrap contract:
//!
//! - **Shamir**: the wrapping key is split into `n` shares with threshold
//!   `t` (GF(2^8) polynomial interpolation). Unsealing collects shares via
//!   a state machine: `sealed → collecting(shares) → unsealed`. No share is
//!   ever stored server-side.
//! - **Auto** (KMS/HSM): an external [`KeyWrapper`] round-trips the root
//!   key; unseal happens automatically at startup from the stored wrapped
//!   key. A separate recovery key (split like Shamir shares) gates
//!   privileged operations.
//! - **Static**: key material supplied at startup (env, file, config).
//!   Intended only for declarative bootstrap.
//!
//! Seal configuration is persisted in cleartext — it must be readable
//! before the barrier can be unsealed.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sharks::{Share, Sharks};
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::barrier::Barrier;
use crate::crypto::{self, AeadAlgorithm, EncryptionKey};
use crate::error::SealError;

/// Cleartext physical path of the barrier seal configuration.
pub const SEAL_CONFIG_PATH: &str = "core/seal-config";
/// Cleartext physical path of the recovery-key configuration.
pub const RECOVERY_CONFIG_PATH: &str = "core/recovery-config";
/// Cleartext physical path of the wrapped root key record.
pub const ROOT_KEY_PATH: &str = "core/master";
/// Cleartext physical path of the seal-wrapped barrier key for auto-unseal.
pub const STORED_BARRIER_KEYS_PATH: &str = "core/hsm/barrier-unseal-keys";
/// Cleartext physical path of the seal-wrapped recovery key.
pub const RECOVERY_KEY_PATH: &str = "core/recovery-key";

/// Seal provider kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SealType {
    /// Shamir-split unseal key, collected from operators.
    Shamir,
    /// External key wrapper (KMS / HSM / PKCS#11).
    Kms,
    /// Static key material supplied at startup.
    Static,
}

impl std::fmt::Display for SealType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Shamir => "shamir",
            Self::Kms => "kms",
            Self::Static => "static",
        };
        f.write_str(name)
    }
}

/// Persisted seal configuration (cleartext).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealConfig {
    /// Seal provider kind.
    #[serde(rename = "type")]
    pub seal_type: SealType,
    /// Total number of key shares.
    pub secret_shares: u8,
    /// Shares required to reconstruct the key.
    pub secret_threshold: u8,
    /// Optional PGP public keys the shares were encrypted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_keys: Option<Vec<String>>,
    /// Number of shares stored server-side (1 for auto-unseal).
    #[serde(default)]
    pub stored_shares: u8,
    /// Server-generated nonce identifying the config generation.
    pub nonce: String,
}

impl SealConfig {
    /// Validate Shamir parameters: `1 ≤ threshold ≤ shares`.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidConfig`] describing the violation.
    pub fn validate(&self) -> Result<(), SealError> {
        if self.secret_shares == 0 {
            return Err(SealError::InvalidConfig {
                reason: "share count must be at least 1".to_owned(),
            });
        }
        if self.secret_threshold == 0 {
            return Err(SealError::InvalidConfig {
                reason: "threshold must be at least 1".to_owned(),
            });
        }
        if self.secret_threshold > self.secret_shares {
            return Err(SealError::InvalidConfig {
                reason: format!(
                    "threshold ({}) cannot exceed share count ({})",
                    self.secret_threshold, self.secret_shares
                ),
            });
        }
        Ok(())
    }
}

/// The wrapped root key record (cleartext at [`ROOT_KEY_PATH`]): the root
/// key ciphertext plus wrapping metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKeyRecord {
    /// Which provider produced the ciphertext.
    #[serde(rename = "type")]
    pub seal_type: SealType,
    /// Key-wrapping identifier for external wrappers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// The wrapped key bytes.
    pub ciphertext: Vec<u8>,
}

/// An external AEAD that wraps key material (KMS, HSM, PKCS#11).
#[async_trait::async_trait]
pub trait KeyWrapper: Send + Sync {
    /// Identifier of the wrapping key (recorded in the wrapped-key record).
    fn key_id(&self) -> String;

    /// Wrap plaintext key material.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Wrapper`] if the external service fails.
    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError>;

    /// Unwrap a blob produced by [`Self::wrap`].
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Wrapper`] if the external service fails.
    async fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>, SealError>;
}

/// A file-backed [`KeyWrapper`]: a 32-byte key loaded at startup, standing
/// in for a network KMS. The file content is hex or base64.
pub struct FileKeyWrapper {
    key: EncryptionKey,
    key_id: String,
}

impl FileKeyWrapper {
    /// Load the wrapping key from a file.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidConfig`] if the file is unreadable or
    /// does not contain a 32-byte key.
    pub fn from_file(path: &str) -> Result<Self, SealError> {
        let content = std::fs::read_to_string(path).map_err(|e| SealError::InvalidConfig {
            reason: format!("cannot read wrapper key file '{path}': {e}"),
        })?;
        let key = decode_key_material(content.trim())?;
        Ok(Self {
            key,
            key_id: format!("file:{path}"),
        })
    }

    /// Build from raw key material (for tests and embedded config).
    #[must_use]
    pub fn from_key(key: EncryptionKey, key_id: impl Into<String>) -> Self {
        Self {
            key,
            key_id: key_id.into(),
        }
    }
}

#[async_trait::async_trait]
impl KeyWrapper for FileKeyWrapper {
    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        crypto::encrypt(
            &self.key,
            AeadAlgorithm::Aes256Gcm,
            0,
            self.key_id.as_bytes(),
            plaintext,
        )
        .map_err(|e| SealError::Wrapper {
            key_id: self.key_id.clone(),
            reason: e.to_string(),
        })
    }

    async fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        crypto::decrypt(&self.key, self.key_id.as_bytes(), blob).map_err(|e| SealError::Wrapper {
            key_id: self.key_id.clone(),
            reason: e.to_string(),
        })
    }
}

/// The uniform seal provider contract.
#[async_trait::async_trait]
pub trait Seal: Send + Sync {
    /// Provider kind.
    fn seal_type(&self) -> SealType;

    /// Whether the wrapping key material lives with operators (Shamir)
    /// rather than an external service.
    fn is_local(&self) -> bool;

    /// Key-wrapping identifier, for providers that have one.
    fn key_id(&self) -> Option<String> {
        None
    }

    /// Wrap key material.
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] if wrapping key material is unavailable or the
    /// provider fails.
    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError>;

    /// Unwrap a blob produced by [`Seal::wrap`].
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] if the provider fails or the blob does not
    /// authenticate.
    async fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>, SealError>;
}

/// Shamir seal: wraps with the reconstructed (or freshly generated) unseal
/// key. The key is present only after init, a successful unseal, or a
/// rekey.
pub struct ShamirSeal {
    key: RwLock<Option<EncryptionKey>>,
}

impl ShamirSeal {
    /// Create a Shamir seal with no key material yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: RwLock::new(None),
        }
    }

    /// Install the unseal key (after init, unseal, or rekey).
    pub async fn set_key(&self, key: EncryptionKey) {
        *self.key.write().await = Some(key);
    }

    /// Drop the unseal key from memory.
    pub async fn clear_key(&self) {
        *self.key.write().await = None;
    }
}

impl Default for ShamirSeal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Seal for ShamirSeal {
    fn seal_type(&self) -> SealType {
        SealType::Shamir
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let guard = self.key.read().await;
        let key = guard.as_ref().ok_or(SealError::MissingShamirKey)?;
        Ok(crypto::encrypt(
            key,
            AeadAlgorithm::Aes256Gcm,
            0,
            b"shamir-seal",
            plaintext,
        )?)
    }

    async fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        let guard = self.key.read().await;
        let key = guard.as_ref().ok_or(SealError::MissingShamirKey)?;
        Ok(crypto::decrypt(key, b"shamir-seal", blob)?)
    }
}

/// Auto seal: delegates to an external [`KeyWrapper`].
pub struct AutoSeal {
    wrapper: Arc<dyn KeyWrapper>,
}

impl AutoSeal {
    /// Create an auto seal over the given wrapper.
    #[must_use]
    pub fn new(wrapper: Arc<dyn KeyWrapper>) -> Self {
        Self { wrapper }
    }

    /// The underlying wrapper (for seal-wrapped barrier paths).
    #[must_use]
    pub fn wrapper(&self) -> Arc<dyn KeyWrapper> {
        Arc::clone(&self.wrapper)
    }
}

#[async_trait::async_trait]
impl Seal for AutoSeal {
    fn seal_type(&self) -> SealType {
        SealType::Kms
    }

    fn is_local(&self) -> bool {
        false
    }

    fn key_id(&self) -> Option<String> {
        Some(self.wrapper.key_id())
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        self.wrapper.wrap(plaintext).await
    }

    async fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        self.wrapper.unwrap(blob).await
    }
}

/// Static seal: key material supplied at startup.
pub struct StaticSeal {
    key: EncryptionKey,
}

impl StaticSeal {
    /// Create a static seal from raw key material.
    #[must_use]
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    /// Load key material from an environment variable (hex or base64).
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidConfig`] if the variable is missing or
    /// malformed.
    pub fn from_env(var: &str) -> Result<Self, SealError> {
        let value = std::env::var(var).map_err(|_| SealError::InvalidConfig {
            reason: format!("environment variable '{var}' is not set"),
        })?;
        Ok(Self::new(decode_key_material(value.trim())?))
    }
}

#[async_trait::async_trait]
impl Seal for StaticSeal {
    fn seal_type(&self) -> SealType {
        SealType::Static
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        Ok(crypto::encrypt(
            &self.key,
            AeadAlgorithm::Aes256Gcm,
            0,
            b"static-seal",
            plaintext,
        )?)
    }

    async fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        Ok(crypto::decrypt(&self.key, b"static-seal", blob)?)
    }
}

/// Load 32-byte key material (hex or base64) from an environment variable.
///
/// # Errors
///
/// Returns [`SealError::InvalidConfig`] if the variable is missing or the
/// material is malformed.
pub fn key_material_from_env(var: &str) -> Result<EncryptionKey, SealError> {
    let value = std::env::var(var).map_err(|_| SealError::InvalidConfig {
        reason: format!("environment variable '{var}' is not set"),
    })?;
    decode_key_material(value.trim())
}

fn decode_key_material(encoded: &str) -> Result<EncryptionKey, SealError> {
    let bytes = if let Ok(bytes) = hex::decode(encoded) {
        bytes
    } else {
        BASE64.decode(encoded).map_err(|e| SealError::InvalidConfig {
            reason: format!("key material is neither hex nor base64: {e}"),
        })?
    };
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SealError::InvalidConfig {
            reason: format!("key material must be 32 bytes, got {}", bytes.len()),
        })?;
    Ok(EncryptionKey::from_bytes(array))
}

/// Split a key into `n` base64 shares with threshold `t`.
///
/// With `n == 1` the share is the key itself.
pub(crate) fn split_key(key: &EncryptionKey, shares: u8, threshold: u8) -> Vec<String> {
    if shares == 1 {
        return vec![BASE64.encode(key.as_bytes())];
    }
    let sharks = Sharks(threshold);
    let dealer = sharks.dealer(key.as_bytes());
    dealer
        .take(usize::from(shares))
        .map(|share| BASE64.encode(Vec::from(&share)))
        .collect()
}

/// Recombine raw share bytes into the original 32-byte key.
pub(crate) fn combine_shares(
    shares: &[Vec<u8>],
    threshold: u8,
) -> Result<EncryptionKey, SealError> {
    let key_bytes = if threshold == 1 && shares.len() == 1 && shares[0].len() == 32 {
        shares[0].clone()
    } else {
        let parsed: Result<Vec<Share>, SealError> = shares
            .iter()
            .map(|bytes| {
                Share::try_from(bytes.as_slice()).map_err(|e| SealError::InvalidShare {
                    reason: format!("share deserialization failed: {e}"),
                })
            })
            .collect();
        let sharks = Sharks(threshold);
        sharks
            .recover(&parsed?)
            .map_err(|_| SealError::InvalidShares)?
    };

    let array: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| SealError::InvalidShares)?;
    Ok(EncryptionKey::from_bytes(array))
}

/// Result of initialization: the key shares handed to operators (shown
/// once, never stored).
#[derive(Debug)]
pub struct InitKeys {
    /// Base64 barrier unseal shares (Shamir seal) — empty for auto seals.
    pub unseal_shares: Vec<String>,
    /// Base64 recovery key shares — empty for the Shamir seal.
    pub recovery_shares: Vec<String>,
}

/// Progress of an in-flight unseal.
#[derive(Debug, Clone, Serialize)]
pub struct UnsealProgress {
    /// Shares required.
    pub threshold: u8,
    /// Distinct shares submitted so far.
    pub progress: u8,
}

/// Current seal status.
#[derive(Debug, Clone, Serialize)]
pub struct SealStatus {
    /// Whether a wrapped root key exists.
    pub initialized: bool,
    /// Whether the barrier is sealed.
    pub sealed: bool,
    /// Seal provider kind.
    pub seal_type: SealType,
    /// Configured share count (0 when uninitialized).
    pub shares: u8,
    /// Configured threshold (0 when uninitialized).
    pub threshold: u8,
    /// Shares submitted in the current unseal attempt.
    pub progress: u8,
    /// Nonce of the current seal configuration.
    pub nonce: String,
}

/// Orchestrates init, the unseal state machine, stored-key unseal, and
/// seal migration.
pub struct SealManager {
    barrier: Arc<Barrier>,
    seal: RwLock<Arc<dyn Seal>>,
    shamir: RwLock<Option<Arc<ShamirSeal>>>,
    algorithm: AeadAlgorithm,
    /// Raw share bytes collected during unseal. Cleared on success, reset,
    /// or seal.
    pending: Mutex<Vec<Vec<u8>>>,
}

impl SealManager {
    /// Create a manager for a Shamir seal.
    #[must_use]
    pub fn new_shamir(barrier: Arc<Barrier>, algorithm: AeadAlgorithm) -> Self {
        let shamir = Arc::new(ShamirSeal::new());
        Self {
            barrier,
            seal: RwLock::new(Arc::clone(&shamir) as Arc<dyn Seal>),
            shamir: RwLock::new(Some(shamir)),
            algorithm,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Create a manager for an auto (external wrapper) seal.
    #[must_use]
    pub fn new_auto(
        barrier: Arc<Barrier>,
        wrapper: Arc<dyn KeyWrapper>,
        algorithm: AeadAlgorithm,
    ) -> Self {
        Self {
            barrier,
            seal: RwLock::new(Arc::new(AutoSeal::new(wrapper)) as Arc<dyn Seal>),
            shamir: RwLock::new(None),
            algorithm,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Create a manager for a static seal.
    #[must_use]
    pub fn new_static(barrier: Arc<Barrier>, key: EncryptionKey, algorithm: AeadAlgorithm) -> Self {
        Self {
            barrier,
            seal: RwLock::new(Arc::new(StaticSeal::new(key)) as Arc<dyn Seal>),
            shamir: RwLock::new(None),
            algorithm,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// The active seal provider.
    pub async fn seal_handle(&self) -> Arc<dyn Seal> {
        Arc::clone(&*self.seal.read().await)
    }

    /// The barrier this manager drives.
    #[must_use]
    pub fn barrier(&self) -> &Arc<Barrier> {
        &self.barrier
    }

    /// Whether a wrapped root key exists in storage.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Storage`] on backend failure.
    pub async fn is_initialized(&self) -> Result<bool, SealError> {
        Ok(self.barrier.get_raw(ROOT_KEY_PATH).await?.is_some())
    }

    /// Initialize the barrier and wrap the new root key under this seal.
    ///
    /// For the Shamir seal a fresh unseal key is generated, split into
    /// `secret_shares` shares, and returned; the core is left unsealed. For
    /// auto and static seals the root key is wrapped directly, a recovery
    /// key is generated and split, and the wrapped barrier key is also
    /// stored for automatic unseal at startup.
    ///
    /// # Errors
    ///
    /// - [`SealError::AlreadyInitialized`] if a wrapped root key exists.
    /// - [`SealError::InvalidConfig`] on bad Shamir parameters.
    pub async fn initialize(&self, shares: u8, threshold: u8) -> Result<InitKeys, SealError> {
        if self.is_initialized().await? {
            return Err(SealError::AlreadyInitialized);
        }

        let seal = self.seal_handle().await;
        let seal_type = seal.seal_type();
        let config = SealConfig {
            seal_type,
            secret_shares: shares,
            secret_threshold: threshold,
            pgp_keys: None,
            stored_shares: if seal.is_local() { 0 } else { 1 },
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        config.validate()?;

        let root_key = self.barrier.initialize(self.algorithm).await?;

        let keys = if seal.is_local() {
            // Shamir: generate and split the unseal key; wrap the root key
            // under it.
            let unseal_key = EncryptionKey::generate();
            let unseal_shares = split_key(&unseal_key, shares, threshold);
            if let Some(shamir) = self.shamir.read().await.as_ref() {
                shamir.set_key(unseal_key).await;
            }
            let wrapped = seal.wrap(root_key.as_bytes()).await?;
            self.store_root_record(seal_type, None, wrapped).await?;
            InitKeys {
                unseal_shares,
                recovery_shares: Vec::new(),
            }
        } else {
            // Auto / static: wrap the root key directly and store it for
            // startup unseal; split a separate recovery key.
            let wrapped = seal.wrap(root_key.as_bytes()).await?;
            let key_id = seal.key_id();
            self.store_root_record(seal_type, key_id.clone(), wrapped.clone())
                .await?;
            let record = WrappedKeyRecord {
                seal_type,
                key_id: key_id.clone(),
                ciphertext: wrapped,
            };
            self.barrier
                .put_raw(STORED_BARRIER_KEYS_PATH, &encode_record(&record)?)
                .await?;

            let recovery_key = EncryptionKey::generate();
            let recovery_shares = split_key(&recovery_key, shares, threshold);
            let wrapped_recovery = seal.wrap(recovery_key.as_bytes()).await?;
            let recovery_record = WrappedKeyRecord {
                seal_type,
                key_id,
                ciphertext: wrapped_recovery,
            };
            self.barrier
                .put_raw(RECOVERY_KEY_PATH, &encode_record(&recovery_record)?)
                .await?;
            let recovery_config = SealConfig {
                nonce: uuid::Uuid::new_v4().to_string(),
                ..config.clone()
            };
            self.store_config(RECOVERY_CONFIG_PATH, &recovery_config)
                .await?;

            InitKeys {
                unseal_shares: Vec::new(),
                recovery_shares,
            }
        };

        self.store_config(SEAL_CONFIG_PATH, &config).await?;

        info!(seal = %seal_type, shares, threshold, "core initialized");
        Ok(keys)
    }

    /// Submit one unseal share (Shamir state machine).
    ///
    /// Duplicate submissions are idempotent. Returns `Some(progress)` while
    /// below the threshold and `None` once the barrier is unsealed. If the
    /// collected shares fail to reconstruct a key that decrypts the wrapped
    /// root key, progress resets and [`SealError::InvalidShares`] is
    /// returned.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInitialized`] before init.
    /// - [`SealError::AlreadyUnsealed`] when not sealed.
    /// - [`SealError::Unsupported`] for non-Shamir seals.
    pub async fn submit_unseal_share(
        &self,
        share_b64: &str,
    ) -> Result<Option<UnsealProgress>, SealError> {
        let seal = self.seal_handle().await;
        if !seal.is_local() {
            return Err(SealError::Unsupported {
                seal_type: seal.seal_type().to_string(),
            });
        }
        if !self.is_initialized().await? {
            return Err(SealError::NotInitialized);
        }
        if self.barrier.is_unsealed().await {
            return Err(SealError::AlreadyUnsealed);
        }

        let share = BASE64
            .decode(share_b64)
            .map_err(|e| SealError::InvalidShare {
                reason: format!("base64 decode failed: {e}"),
            })?;

        let config = self.config().await?;

        let mut pending = self.pending.lock().await;
        let duplicate = pending
            .iter()
            .any(|existing| bool::from(existing.as_slice().ct_eq(share.as_slice())));
        if !duplicate {
            pending.push(share);
        }

        let submitted = u8::try_from(pending.len()).unwrap_or(u8::MAX);
        if submitted < config.secret_threshold {
            return Ok(Some(UnsealProgress {
                threshold: config.secret_threshold,
                progress: submitted,
            }));
        }

        // Quorum reached: reconstruct and attempt the unseal.
        let shares: Vec<Vec<u8>> = pending.drain(..).collect();
        drop(pending);

        let unseal_key = combine_shares(&shares, config.secret_threshold)?;
        if let Some(shamir) = self.shamir.read().await.as_ref() {
            shamir.set_key(unseal_key).await;
        }

        let record = self.load_root_record().await?;
        let root_bytes = match seal.unwrap(&record.ciphertext).await {
            Ok(bytes) => bytes,
            Err(_) => {
                if let Some(shamir) = self.shamir.read().await.as_ref() {
                    shamir.clear_key().await;
                }
                return Err(SealError::InvalidShares);
            }
        };
        let root_key = root_key_from_bytes(&root_bytes)?;
        self.barrier.unseal(&root_key).await?;

        info!("core unsealed");
        Ok(None)
    }

    /// Reset unseal progress, discarding collected shares.
    pub async fn reset_unseal(&self) {
        self.pending.lock().await.clear();
    }

    /// Unseal from the stored wrapped key (auto and static seals).
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInitialized`] before init.
    /// - [`SealError::Unsupported`] for the Shamir seal.
    pub async fn unseal_with_stored_keys(&self) -> Result<(), SealError> {
        let seal = self.seal_handle().await;
        if seal.is_local() {
            return Err(SealError::Unsupported {
                seal_type: seal.seal_type().to_string(),
            });
        }
        if self.barrier.is_unsealed().await {
            return Ok(());
        }

        let blob = self
            .barrier
            .get_raw(STORED_BARRIER_KEYS_PATH)
            .await?
            .ok_or(SealError::NotInitialized)?;
        let record = decode_record(STORED_BARRIER_KEYS_PATH, &blob)?;
        let root_bytes = seal.unwrap(&record.ciphertext).await?;
        let root_key = root_key_from_bytes(&root_bytes)?;
        self.barrier.unseal(&root_key).await?;

        info!("core auto-unsealed from stored keys");
        Ok(())
    }

    /// Seal the barrier, zeroizing key material and clearing unseal
    /// progress. Sealing an already-sealed core is a no-op.
    pub async fn seal(&self) {
        self.pending.lock().await.clear();
        if let Some(shamir) = self.shamir.read().await.as_ref() {
            shamir.clear_key().await;
        }
        self.barrier.seal().await;
    }

    /// Current seal status.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Storage`] on backend failure.
    pub async fn status(&self) -> Result<SealStatus, SealError> {
        let initialized = self.is_initialized().await?;
        let sealed = !self.barrier.is_unsealed().await;
        let seal_type = self.seal_handle().await.seal_type();

        let (shares, threshold, nonce) = if initialized {
            let config = self.config().await?;
            (
                config.secret_shares,
                config.secret_threshold,
                config.nonce,
            )
        } else {
            (0, 0, String::new())
        };
        let progress = u8::try_from(self.pending.lock().await.len()).unwrap_or(u8::MAX);

        Ok(SealStatus {
            initialized,
            sealed,
            seal_type,
            shares,
            threshold,
            progress,
            nonce,
        })
    }

    /// Load the barrier seal configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::NotInitialized`] if absent.
    pub async fn config(&self) -> Result<SealConfig, SealError> {
        self.load_config(SEAL_CONFIG_PATH)
            .await?
            .ok_or(SealError::NotInitialized)
    }

    /// Load the recovery-key configuration, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Storage`] / [`SealError::Corrupt`] on failure.
    pub async fn recovery_config(&self) -> Result<Option<SealConfig>, SealError> {
        self.load_config(RECOVERY_CONFIG_PATH).await
    }

    /// Verify that a set of shares reconstructs the privileged-operation
    /// key: the recovery key for auto/static seals, the unseal key for the
    /// Shamir seal.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::RecoveryKeyVerification`] if the quorum does
    /// not check out.
    pub async fn verify_privileged_quorum(&self, shares: &[Vec<u8>]) -> Result<(), SealError> {
        let seal = self.seal_handle().await;
        if seal.is_local() {
            // Shamir: the reconstructed key must decrypt the wrapped root.
            let config = self.config().await?;
            let candidate = combine_shares(shares, config.secret_threshold)
                .map_err(|_| SealError::RecoveryKeyVerification)?;
            let record = self.load_root_record().await?;
            crypto::decrypt(&candidate, b"shamir-seal", &record.ciphertext)
                .map(|_| ())
                .map_err(|_| SealError::RecoveryKeyVerification)
        } else {
            let config = self
                .recovery_config()
                .await?
                .ok_or(SealError::RecoveryKeyVerification)?;
            let candidate = combine_shares(shares, config.secret_threshold)
                .map_err(|_| SealError::RecoveryKeyVerification)?;
            let blob = self
                .barrier
                .get_raw(RECOVERY_KEY_PATH)
                .await?
                .ok_or(SealError::RecoveryKeyVerification)?;
            let record = decode_record(RECOVERY_KEY_PATH, &blob)?;
            let stored = seal.unwrap(&record.ciphertext).await?;
            if bool::from(stored.as_slice().ct_eq(candidate.as_bytes())) {
                Ok(())
            } else {
                Err(SealError::RecoveryKeyVerification)
            }
        }
    }

    /// Migrate to a Shamir seal: re-wrap the root key under a fresh unseal
    /// key and return its shares. The caller must have authorized via a
    /// privileged quorum; the barrier must be unsealed.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if sealed, or persistence errors.
    pub async fn migrate_to_shamir(&self, shares: u8, threshold: u8) -> Result<InitKeys, SealError> {
        let config = SealConfig {
            seal_type: SealType::Shamir,
            secret_shares: shares,
            secret_threshold: threshold,
            pgp_keys: None,
            stored_shares: 0,
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        config.validate()?;

        let root_key = self.barrier.root_key().await?;
        let unseal_key = EncryptionKey::generate();
        let unseal_shares = split_key(&unseal_key, shares, threshold);

        let shamir = Arc::new(ShamirSeal::new());
        shamir.set_key(unseal_key).await;
        let wrapped = shamir.wrap(root_key.as_bytes()).await?;

        self.store_root_record(SealType::Shamir, None, wrapped)
            .await?;
        self.store_config(SEAL_CONFIG_PATH, &config).await?;
        self.barrier.delete_raw(STORED_BARRIER_KEYS_PATH).await?;
        self.barrier.delete_raw(RECOVERY_KEY_PATH).await?;
        self.barrier.delete_raw(RECOVERY_CONFIG_PATH).await?;

        *self.seal.write().await = Arc::clone(&shamir) as Arc<dyn Seal>;
        *self.shamir.write().await = Some(shamir);

        info!("seal migrated to shamir");
        Ok(InitKeys {
            unseal_shares,
            recovery_shares: Vec::new(),
        })
    }

    /// Migrate to an auto seal: re-wrap the root key under the external
    /// wrapper and generate fresh recovery keys. The caller must have
    /// authorized via a privileged quorum; the barrier must be unsealed.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if sealed, or wrapper/persistence
    /// errors.
    pub async fn migrate_to_auto(
        &self,
        wrapper: Arc<dyn KeyWrapper>,
        recovery_shares: u8,
        recovery_threshold: u8,
    ) -> Result<InitKeys, SealError> {
        let config = SealConfig {
            seal_type: SealType::Kms,
            secret_shares: recovery_shares,
            secret_threshold: recovery_threshold,
            pgp_keys: None,
            stored_shares: 1,
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        config.validate()?;

        let root_key = self.barrier.root_key().await?;
        let seal = Arc::new(AutoSeal::new(wrapper));
        let key_id = Some(seal.wrapper().key_id());

        let wrapped = seal.wrap(root_key.as_bytes()).await?;
        self.store_root_record(SealType::Kms, key_id.clone(), wrapped.clone())
            .await?;
        let record = WrappedKeyRecord {
            seal_type: SealType::Kms,
            key_id: key_id.clone(),
            ciphertext: wrapped,
        };
        self.barrier
            .put_raw(STORED_BARRIER_KEYS_PATH, &encode_record(&record)?)
            .await?;

        let recovery_key = EncryptionKey::generate();
        let shares = split_key(&recovery_key, recovery_shares, recovery_threshold);
        let wrapped_recovery = seal.wrap(recovery_key.as_bytes()).await?;
        let recovery_record = WrappedKeyRecord {
            seal_type: SealType::Kms,
            key_id,
            ciphertext: wrapped_recovery,
        };
        self.barrier
            .put_raw(RECOVERY_KEY_PATH, &encode_record(&recovery_record)?)
            .await?;
        let recovery_config = SealConfig {
            nonce: uuid::Uuid::new_v4().to_string(),
            ..config.clone()
        };
        self.store_config(RECOVERY_CONFIG_PATH, &recovery_config)
            .await?;
        self.store_config(SEAL_CONFIG_PATH, &config).await?;

        *self.seal.write().await = seal as Arc<dyn Seal>;
        *self.shamir.write().await = None;

        info!("seal migrated to auto");
        Ok(InitKeys {
            unseal_shares: Vec::new(),
            recovery_shares: shares,
        })
    }

    // ── rekey support ───────────────────────────────────────────────

    pub(crate) async fn load_root_record(&self) -> Result<WrappedKeyRecord, SealError> {
        let blob = self
            .barrier
            .get_raw(ROOT_KEY_PATH)
            .await?
            .ok_or(SealError::NotInitialized)?;
        decode_record(ROOT_KEY_PATH, &blob)
    }

    pub(crate) async fn store_root_record(
        &self,
        seal_type: SealType,
        key_id: Option<String>,
        ciphertext: Vec<u8>,
    ) -> Result<(), SealError> {
        let record = WrappedKeyRecord {
            seal_type,
            key_id,
            ciphertext,
        };
        self.barrier
            .put_raw(ROOT_KEY_PATH, &encode_record(&record)?)
            .await?;
        Ok(())
    }

    pub(crate) async fn store_config(
        &self,
        path: &str,
        config: &SealConfig,
    ) -> Result<(), SealError> {
        let bytes = serde_json::to_vec(config).map_err(|e| SealError::Corrupt {
            key: path.to_owned(),
            reason: e.to_string(),
        })?;
        self.barrier.put_raw(path, &bytes).await?;
        Ok(())
    }

    async fn load_config(&self, path: &str) -> Result<Option<SealConfig>, SealError> {
        let Some(bytes) = self.barrier.get_raw(path).await? else {
            return Ok(None);
        };
        let config = serde_json::from_slice(&bytes).map_err(|e| SealError::Corrupt {
            key: path.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Some(config))
    }

    pub(crate) async fn set_shamir_key(&self, key: EncryptionKey) {
        if let Some(shamir) = self.shamir.read().await.as_ref() {
            shamir.set_key(key).await;
        }
    }
}

pub(crate) fn encode_record(record: &WrappedKeyRecord) -> Result<Vec<u8>, SealError> {
    serde_json::to_vec(record).map_err(|e| SealError::Corrupt {
        key: ROOT_KEY_PATH.to_owned(),
        reason: e.to_string(),
    })
}

pub(crate) fn decode_record(key: &str, bytes: &[u8]) -> Result<WrappedKeyRecord, SealError> {
    serde_json::from_slice(bytes).map_err(|e| SealError::Corrupt {
        key: key.to_owned(),
        reason: e.to_string(),
    })
}

pub(crate) fn root_key_from_bytes(bytes: &[u8]) -> Result<EncryptionKey, SealError> {
    let array: [u8; 32] = bytes.try_into().map_err(|_| SealError::Corrupt {
        key: ROOT_KEY_PATH.to_owned(),
        reason: "unwrapped root key is not 32 bytes".to_owned(),
    })?;
    Ok(EncryptionKey::from_bytes(array))
}

impl std::fmt::Debug for SealManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use strongbox_storage::MemoryBackend;

    fn shamir_manager() -> SealManager {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        SealManager::new_shamir(barrier, AeadAlgorithm::Aes256Gcm)
    }

    fn auto_manager() -> SealManager {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        let wrapper = Arc::new(FileKeyWrapper::from_key(
            EncryptionKey::generate(),
            "test-kms",
        ));
        SealManager::new_auto(barrier, wrapper, AeadAlgorithm::Aes256Gcm)
    }

    // ── shamir split / combine ──────────────────────────────────────

    #[test]
    fn split_and_combine_any_threshold_subset() {
        let key = EncryptionKey::generate();
        let shares = split_key(&key, 5, 3);
        assert_eq!(shares.len(), 5);

        // Any 3 of 5 shares reconstruct the key.
        for combo in [[0, 1, 2], [0, 2, 4], [1, 3, 4]] {
            let raw: Vec<Vec<u8>> = combo
                .iter()
                .map(|i| BASE64.decode(&shares[*i]).unwrap())
                .collect();
            let recovered = combine_shares(&raw, 3).unwrap();
            assert_eq!(recovered.as_bytes(), key.as_bytes());
        }
    }

    #[test]
    fn too_few_shares_do_not_reconstruct() {
        let key = EncryptionKey::generate();
        let shares = split_key(&key, 5, 3);
        let raw: Vec<Vec<u8>> = shares
            .iter()
            .take(2)
            .map(|s| BASE64.decode(s).unwrap())
            .collect();
        match combine_shares(&raw, 3) {
            // sharks returns an error below threshold...
            Err(_) => {}
            // ...or interpolates garbage; either way it must not be the key.
            Ok(recovered) => assert_ne!(recovered.as_bytes(), key.as_bytes()),
        }
    }

    #[test]
    fn single_share_config_roundtrips() {
        let key = EncryptionKey::generate();
        let shares = split_key(&key, 1, 1);
        let raw = vec![BASE64.decode(&shares[0]).unwrap()];
        let recovered = combine_shares(&raw, 1).unwrap();
        assert_eq!(recovered.as_bytes(), key.as_bytes());
    }

    // ── init ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn shamir_init_returns_shares_and_unseals() {
        let mgr = shamir_manager();
        let keys = mgr.initialize(5, 3).await.unwrap();
        assert_eq!(keys.unseal_shares.len(), 5);
        assert!(keys.recovery_shares.is_empty());
        assert!(mgr.barrier().is_unsealed().await);
    }

    #[tokio::test]
    async fn init_twice_fails() {
        let mgr = shamir_manager();
        mgr.initialize(3, 2).await.unwrap();
        let err = mgr.initialize(3, 2).await.unwrap_err();
        assert!(matches!(err, SealError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn init_rejects_bad_config() {
        let mgr = shamir_manager();
        assert!(matches!(
            mgr.initialize(0, 0).await.unwrap_err(),
            SealError::InvalidConfig { .. }
        ));
        assert!(matches!(
            mgr.initialize(3, 4).await.unwrap_err(),
            SealError::InvalidConfig { .. }
        ));
    }

    #[tokio::test]
    async fn auto_init_returns_recovery_shares() {
        let mgr = auto_manager();
        let keys = mgr.initialize(5, 3).await.unwrap();
        assert!(keys.unseal_shares.is_empty());
        assert_eq!(keys.recovery_shares.len(), 5);
        assert!(mgr.barrier().is_unsealed().await);
    }

    // ── unseal state machine ────────────────────────────────────────

    #[tokio::test]
    async fn unseal_collects_to_threshold() {
        let mgr = shamir_manager();
        let keys = mgr.initialize(5, 3).await.unwrap();
        mgr.seal().await;

        let p = mgr
            .submit_unseal_share(&keys.unseal_shares[1])
            .await
            .unwrap()
            .unwrap();
        assert_eq!((p.threshold, p.progress), (3, 1));

        let p = mgr
            .submit_unseal_share(&keys.unseal_shares[3])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.progress, 2);

        let done = mgr
            .submit_unseal_share(&keys.unseal_shares[0])
            .await
            .unwrap();
        assert!(done.is_none());
        assert!(mgr.barrier().is_unsealed().await);
    }

    #[tokio::test]
    async fn duplicate_share_is_idempotent() {
        let mgr = shamir_manager();
        let keys = mgr.initialize(5, 3).await.unwrap();
        mgr.seal().await;

        mgr.submit_unseal_share(&keys.unseal_shares[0])
            .await
            .unwrap();
        let p = mgr
            .submit_unseal_share(&keys.unseal_shares[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.progress, 1);
    }

    #[tokio::test]
    async fn wrong_shares_reset_progress() {
        let mgr = shamir_manager();
        let keys = mgr.initialize(3, 2).await.unwrap();
        mgr.seal().await;

        // Shares from a different initialization.
        let other = shamir_manager();
        let other_keys = other.initialize(3, 2).await.unwrap();

        mgr.submit_unseal_share(&other_keys.unseal_shares[0])
            .await
            .unwrap();
        let err = mgr
            .submit_unseal_share(&other_keys.unseal_shares[1])
            .await
            .unwrap_err();
        assert!(matches!(err, SealError::InvalidShares));

        let status = mgr.status().await.unwrap();
        assert_eq!(status.progress, 0);
        assert!(status.sealed);

        // Correct shares still work afterwards.
        mgr.submit_unseal_share(&keys.unseal_shares[0])
            .await
            .unwrap();
        mgr.submit_unseal_share(&keys.unseal_shares[2])
            .await
            .unwrap();
        assert!(mgr.barrier().is_unsealed().await);
    }

    #[tokio::test]
    async fn reset_clears_progress() {
        let mgr = shamir_manager();
        let keys = mgr.initialize(5, 3).await.unwrap();
        mgr.seal().await;

        mgr.submit_unseal_share(&keys.unseal_shares[0])
            .await
            .unwrap();
        mgr.reset_unseal().await;
        assert_eq!(mgr.status().await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn unseal_on_unsealed_core_fails() {
        let mgr = shamir_manager();
        let keys = mgr.initialize(3, 2).await.unwrap();
        let err = mgr
            .submit_unseal_share(&keys.unseal_shares[0])
            .await
            .unwrap_err();
        assert!(matches!(err, SealError::AlreadyUnsealed));
    }

    #[tokio::test]
    async fn unseal_before_init_fails() {
        let mgr = shamir_manager();
        let err = mgr.submit_unseal_share("dGVzdA==").await.unwrap_err();
        assert!(matches!(err, SealError::NotInitialized));
    }

    #[tokio::test]
    async fn data_survives_seal_unseal_cycle() {
        let mgr = shamir_manager();
        let keys = mgr.initialize(5, 3).await.unwrap();

        mgr.barrier().put("secret/hello", b"world").await.unwrap();
        mgr.seal().await;

        // Submit in arbitrary order, as an operator would.
        mgr.submit_unseal_share(&keys.unseal_shares[1]).await.unwrap();
        mgr.submit_unseal_share(&keys.unseal_shares[3]).await.unwrap();
        mgr.submit_unseal_share(&keys.unseal_shares[0]).await.unwrap();

        let value = mgr.barrier().get("secret/hello").await.unwrap();
        assert_eq!(value, Some(b"world".to_vec()));
    }

    // ── auto seal ───────────────────────────────────────────────────

    #[tokio::test]
    async fn auto_seal_unseals_from_stored_keys() {
        let mgr = auto_manager();
        mgr.initialize(5, 3).await.unwrap();
        mgr.barrier().put("k", b"v").await.unwrap();
        mgr.seal().await;

        mgr.unseal_with_stored_keys().await.unwrap();
        assert_eq!(mgr.barrier().get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn shamir_rejects_stored_key_unseal() {
        let mgr = shamir_manager();
        mgr.initialize(3, 2).await.unwrap();
        mgr.seal().await;
        let err = mgr.unseal_with_stored_keys().await.unwrap_err();
        assert!(matches!(err, SealError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn auto_seal_rejects_share_submission() {
        let mgr = auto_manager();
        mgr.initialize(3, 2).await.unwrap();
        mgr.seal().await;
        let err = mgr.submit_unseal_share("dGVzdA==").await.unwrap_err();
        assert!(matches!(err, SealError::Unsupported { .. }));
    }

    // ── privileged quorum ───────────────────────────────────────────

    #[tokio::test]
    async fn recovery_quorum_verifies_for_auto_seal() {
        let mgr = auto_manager();
        let keys = mgr.initialize(5, 3).await.unwrap();

        let shares: Vec<Vec<u8>> = keys.recovery_shares[..3]
            .iter()
            .map(|s| BASE64.decode(s).unwrap())
            .collect();
        mgr.verify_privileged_quorum(&shares).await.unwrap();

        let bogus = vec![vec![1u8; 33], vec![2u8; 33], vec![3u8; 33]];
        assert!(mgr.verify_privileged_quorum(&bogus).await.is_err());
    }

    #[tokio::test]
    async fn unseal_key_quorum_verifies_for_shamir_seal() {
        let mgr = shamir_manager();
        let keys = mgr.initialize(5, 3).await.unwrap();

        let shares: Vec<Vec<u8>> = keys.unseal_shares[..3]
            .iter()
            .map(|s| BASE64.decode(s).unwrap())
            .collect();
        mgr.verify_privileged_quorum(&shares).await.unwrap();
    }

    // ── seal migration ──────────────────────────────────────────────

    #[tokio::test]
    async fn migrate_shamir_to_auto_and_back() {
        let mgr = shamir_manager();
        mgr.initialize(3, 2).await.unwrap();
        mgr.barrier().put("k", b"v").await.unwrap();

        let wrapper = Arc::new(FileKeyWrapper::from_key(
            EncryptionKey::generate(),
            "migration-kms",
        ));
        let keys = mgr.migrate_to_auto(wrapper, 5, 3).await.unwrap();
        assert_eq!(keys.recovery_shares.len(), 5);
        assert_eq!(mgr.config().await.unwrap().seal_type, SealType::Kms);

        // The stored key now auto-unseals.
        mgr.seal().await;
        mgr.unseal_with_stored_keys().await.unwrap();
        assert_eq!(mgr.barrier().get("k").await.unwrap(), Some(b"v".to_vec()));

        // And back to shamir.
        let keys = mgr.migrate_to_shamir(5, 3).await.unwrap();
        assert_eq!(keys.unseal_shares.len(), 5);
        mgr.seal().await;
        mgr.submit_unseal_share(&keys.unseal_shares[0]).await.unwrap();
        mgr.submit_unseal_share(&keys.unseal_shares[2]).await.unwrap();
        mgr.submit_unseal_share(&keys.unseal_shares[4]).await.unwrap();
        assert_eq!(mgr.barrier().get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    // ── status ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn status_reflects_lifecycle() {
        let mgr = shamir_manager();
        let status = mgr.status().await.unwrap();
        assert!(!status.initialized);
        assert!(status.sealed);

        let keys = mgr.initialize(5, 3).await.unwrap();
        let status = mgr.status().await.unwrap();
        assert!(status.initialized);
        assert!(!status.sealed);
        assert_eq!((status.shares, status.threshold), (5, 3));

        mgr.seal().await;
        mgr.submit_unseal_share(&keys.unseal_shares[0]).await.unwrap();
        let status = mgr.status().await.unwrap();
        assert!(status.sealed);
        assert_eq!(status.progress, 1);
    }
}
