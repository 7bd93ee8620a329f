//! The encryption barrier.
//!
//! The barrier presents the same ordered key-value interface as the
//! physical store, but every value written is encrypted under the active
//! keyring data key and every value read is decrypted. The storage layer
//! only ever sees ciphertext. When sealed, the barrier rejects all
//! operations with [`BarrierError::Sealed`].
//!
//! # Security model
//!
//! - The keyring (root key + data keys) lives only in process memory while
//!   unsealed; sealing drops it and zeroizes the key material.
//! - Keys (storage paths) are stored in plaintext to support prefix
//!   listing; values carry the envelope from [`crate::crypto`].
//! - The storage key is bound as AEAD associated data.
//! - Paths flagged for seal wrapping get an extra layer of seal encryption
//!   before the keyring, so their plaintext is never protected by the
//!   keyring alone.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use strongbox_storage::StorageBackend;

use crate::crypto::{self, AeadAlgorithm, EncryptionKey};
use crate::error::BarrierError;
use crate::keyring::Keyring;
use crate::seal::KeyWrapper;

/// Storage key of the encrypted keyring.
pub const KEYRING_PATH: &str = "core/keyring";

/// Reserved term for ciphertexts encrypted directly by the root key (the
/// keyring blob itself and the wrapped root key record).
pub const ROOT_KEY_TERM: u32 = 0;

/// Default maximum entry size accepted by the barrier.
pub const MAX_ENTRY_SIZE: usize = 1024 * 1024;

/// The encryption barrier wrapping a storage backend.
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    keyring: RwLock<Option<Keyring>>,
    seal_wrapper: RwLock<Option<Arc<dyn KeyWrapper>>>,
    seal_wrap_prefixes: RwLock<Vec<String>>,
    max_entry_size: usize,
}

impl Barrier {
    /// Create a new sealed barrier over the given storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            keyring: RwLock::new(None),
            seal_wrapper: RwLock::new(None),
            seal_wrap_prefixes: RwLock::new(Vec::new()),
            max_entry_size: MAX_ENTRY_SIZE,
        }
    }

    /// Install an external key wrapper and the path prefixes whose entries
    /// must be seal-wrapped in addition to the keyring.
    pub async fn set_seal_wrapper(&self, wrapper: Arc<dyn KeyWrapper>, prefixes: Vec<String>) {
        *self.seal_wrapper.write().await = Some(wrapper);
        *self.seal_wrap_prefixes.write().await = prefixes;
    }

    /// Whether a keyring exists in storage.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the backend fails.
    pub async fn is_initialized(&self) -> Result<bool, BarrierError> {
        Ok(self.storage.exists(KEYRING_PATH).await?)
    }

    /// Generate a fresh root key and keyring (term 1), persist the keyring
    /// encrypted by the root key, and leave the barrier unsealed.
    ///
    /// Returns the root key so the seal can wrap and store it.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::AlreadyInitialized`] if a keyring already exists.
    /// - [`BarrierError::Crypto`] / [`BarrierError::Storage`] on failure.
    pub async fn initialize(
        &self,
        algorithm: AeadAlgorithm,
    ) -> Result<EncryptionKey, BarrierError> {
        if self.is_initialized().await? {
            return Err(BarrierError::AlreadyInitialized);
        }

        let root_key = EncryptionKey::generate();
        let keyring = Keyring::new(root_key.clone(), algorithm);
        self.persist_keyring(&keyring).await?;
        *self.keyring.write().await = Some(keyring);

        info!("barrier initialized");
        Ok(root_key)
    }

    /// Unseal the barrier: decrypt the persisted keyring with the root key.
    ///
    /// Unsealing an already-unsealed barrier is a no-op.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::NotInitialized`] if no keyring exists.
    /// - [`BarrierError::Crypto`] if the root key is wrong.
    pub async fn unseal(&self, root_key: &EncryptionKey) -> Result<(), BarrierError> {
        let mut guard = self.keyring.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let blob = self
            .storage
            .get(KEYRING_PATH)
            .await?
            .ok_or(BarrierError::NotInitialized)?;
        let plaintext = crypto::decrypt(root_key, KEYRING_PATH.as_bytes(), &blob)?;
        let keyring = Keyring::deserialize(&plaintext)?;
        *guard = Some(keyring);

        info!("barrier unsealed");
        Ok(())
    }

    /// Seal the barrier, dropping the keyring (key material is zeroized on
    /// drop). Sealing an already-sealed barrier is a no-op.
    pub async fn seal(&self) {
        let mut guard = self.keyring.write().await;
        if guard.take().is_some() {
            info!("barrier sealed");
        }
    }

    /// Whether the barrier is currently unsealed.
    pub async fn is_unsealed(&self) -> bool {
        self.keyring.read().await.is_some()
    }

    /// Append a new data key term and persist the keyring.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed, or persistence errors.
    pub async fn rotate(&self) -> Result<u32, BarrierError> {
        let mut guard = self.keyring.write().await;
        let keyring = guard.as_mut().ok_or(BarrierError::Sealed)?;
        let term = keyring.rotate();
        let serialized = keyring.serialize()?;
        let blob = crypto::encrypt(
            keyring.root_key(),
            keyring.algorithm(),
            ROOT_KEY_TERM,
            KEYRING_PATH.as_bytes(),
            &serialized,
        )?;
        self.storage.put(KEYRING_PATH, &blob).await?;

        info!(term, "barrier keyring rotated");
        Ok(term)
    }

    /// Replace the root key and re-persist the keyring under it.
    ///
    /// The data keys (and therefore all entry ciphertexts) are unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed, or persistence errors.
    pub async fn rekey_root(&self, new_root: EncryptionKey) -> Result<(), BarrierError> {
        let mut guard = self.keyring.write().await;
        let keyring = guard.as_mut().ok_or(BarrierError::Sealed)?;
        keyring.set_root_key(new_root);
        let serialized = keyring.serialize()?;
        let blob = crypto::encrypt(
            keyring.root_key(),
            keyring.algorithm(),
            ROOT_KEY_TERM,
            KEYRING_PATH.as_bytes(),
            &serialized,
        )?;
        self.storage.put(KEYRING_PATH, &blob).await?;

        info!("barrier root key replaced");
        Ok(())
    }

    /// Clone the current root key (for seal wrapping / migration).
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn root_key(&self) -> Result<EncryptionKey, BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;
        Ok(keyring.root_key().clone())
    }

    /// The active keyring term.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn active_term(&self) -> Result<u32, BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;
        Ok(keyring.active_term())
    }

    /// Write a value through the barrier.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] when sealed.
    /// - [`BarrierError::EntryTooLarge`] past the size limit.
    /// - [`BarrierError::Crypto`] / [`BarrierError::Storage`] on failure.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        if value.len() > self.max_entry_size {
            return Err(BarrierError::EntryTooLarge {
                size: value.len(),
                max: self.max_entry_size,
            });
        }

        let plaintext = if self.is_seal_wrapped(key).await {
            self.seal_wrap(value).await?
        } else {
            value.to_vec()
        };

        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;
        let blob = crypto::encrypt(
            keyring.active_key()?,
            keyring.algorithm(),
            keyring.active_term(),
            key.as_bytes(),
            &plaintext,
        )?;
        drop(guard);

        self.storage.put(key, &blob).await?;
        Ok(())
    }

    /// Read a value through the barrier.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] when sealed.
    /// - [`BarrierError::UnknownTerm`] if the ciphertext's term is not in
    ///   the keyring.
    /// - [`BarrierError::Crypto`] on AEAD failure (corrupt ciphertext).
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;

        let Some(blob) = self.storage.get(key).await? else {
            return Ok(None);
        };

        let term = crypto::parse_term(&blob)?;
        if term == ROOT_KEY_TERM {
            return Err(BarrierError::Corrupt {
                key: key.to_owned(),
                reason: "entry claims the reserved root-key term".to_owned(),
            });
        }
        let data_key = keyring
            .key_for_term(term)
            .ok_or(BarrierError::UnknownTerm { term })?;
        let plaintext = crypto::decrypt(data_key, key.as_bytes(), &blob)?;
        drop(guard);

        if self.is_seal_wrapped(key).await {
            return Ok(Some(self.seal_unwrap(&plaintext).await?));
        }
        Ok(Some(plaintext))
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.check_unsealed().await?;
        self.storage.delete(key).await?;
        Ok(())
    }

    /// List full keys under a prefix.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        self.check_unsealed().await?;
        Ok(self.storage.list(prefix).await?)
    }

    /// Paginated folder-collapsed listing (see the storage trait contract).
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn list_page(
        &self,
        prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, BarrierError> {
        self.check_unsealed().await?;
        Ok(self.storage.list_page(prefix, after, limit).await?)
    }

    /// Recursive listing: every key under `prefix`, relative to it.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn scan(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        self.check_unsealed().await?;
        let keys = self.storage.list(prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(prefix).map(String::from))
            .collect())
    }

    /// Check whether a key exists.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn exists(&self, key: &str) -> Result<bool, BarrierError> {
        self.check_unsealed().await?;
        Ok(self.storage.exists(key).await?)
    }

    /// Encrypt a standalone value under the active data key (used for
    /// batch tokens, which are never persisted).
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] when sealed.
    pub async fn encrypt_value(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;
        Ok(crypto::encrypt(
            keyring.active_key()?,
            keyring.algorithm(),
            keyring.active_term(),
            aad,
            plaintext,
        )?)
    }

    /// Decrypt a value produced by [`Self::encrypt_value`], resolving the
    /// data key from the envelope's term.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] / [`BarrierError::UnknownTerm`] /
    /// [`BarrierError::Crypto`].
    pub async fn decrypt_value(&self, aad: &[u8], blob: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let guard = self.keyring.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;
        let term = crypto::parse_term(blob)?;
        let key = keyring
            .key_for_term(term)
            .ok_or(BarrierError::UnknownTerm { term })?;
        Ok(crypto::decrypt(key, aad, blob)?)
    }

    /// Write raw bytes to the physical store WITHOUT encryption.
    ///
    /// Reserved for records that must be readable while sealed: the seal
    /// configuration and the wrapped root key (which are ciphertext or
    /// non-sensitive by construction).
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the backend fails.
    pub async fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        self.storage.put(key, value).await?;
        Ok(())
    }

    /// Read raw bytes from the physical store WITHOUT decryption.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the backend fails.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        Ok(self.storage.get(key).await?)
    }

    /// Delete a raw physical key.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the backend fails.
    pub async fn delete_raw(&self, key: &str) -> Result<(), BarrierError> {
        self.storage.delete(key).await?;
        Ok(())
    }

    async fn check_unsealed(&self) -> Result<(), BarrierError> {
        if self.keyring.read().await.is_some() {
            Ok(())
        } else {
            Err(BarrierError::Sealed)
        }
    }

    async fn persist_keyring(&self, keyring: &Keyring) -> Result<(), BarrierError> {
        let serialized = keyring.serialize()?;
        let blob = crypto::encrypt(
            keyring.root_key(),
            keyring.algorithm(),
            ROOT_KEY_TERM,
            KEYRING_PATH.as_bytes(),
            &serialized,
        )?;
        self.storage.put(KEYRING_PATH, &blob).await?;
        Ok(())
    }

    async fn is_seal_wrapped(&self, key: &str) -> bool {
        if self.seal_wrapper.read().await.is_none() {
            return false;
        }
        self.seal_wrap_prefixes
            .read()
            .await
            .iter()
            .any(|prefix| key.starts_with(prefix))
    }

    async fn seal_wrap(&self, value: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let guard = self.seal_wrapper.read().await;
        let wrapper = guard.as_ref().ok_or_else(|| BarrierError::SealWrap {
            reason: "no seal wrapper configured".to_owned(),
        })?;
        wrapper
            .wrap(value)
            .await
            .map_err(|e| BarrierError::SealWrap {
                reason: e.to_string(),
            })
    }

    async fn seal_unwrap(&self, value: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let guard = self.seal_wrapper.read().await;
        let wrapper = guard.as_ref().ok_or_else(|| BarrierError::SealWrap {
            reason: "no seal wrapper configured".to_owned(),
        })?;
        wrapper
            .unwrap(value)
            .await
            .map_err(|e| BarrierError::SealWrap {
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}
