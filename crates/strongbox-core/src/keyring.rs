//! The barrier keyring.
//!
//! An ordered collection of data keys indexed by a monotonically increasing
//! term (≥ 1). New writes use the active term; every historical term is
//! retained so old ciphertexts stay decryptable. The keyring also carries
//! the root key — the key that encrypts the keyring itself at rest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{AeadAlgorithm, EncryptionKey};
use crate::error::BarrierError;

/// In-memory keyring. Exists only while the barrier is unsealed.
pub struct Keyring {
    root_key: EncryptionKey,
    keys: BTreeMap<u32, EncryptionKey>,
    active_term: u32,
    algorithm: AeadAlgorithm,
}

/// Serialized keyring shape. Persisted encrypted by the root key; the raw
/// key bytes are zeroized as soon as the conversion is done.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct PersistedKeyring {
    root_key: Vec<u8>,
    keys: Vec<PersistedKey>,
    #[zeroize(skip)]
    active_term: u32,
    #[zeroize(skip)]
    algorithm: AeadAlgorithm,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct PersistedKey {
    #[zeroize(skip)]
    term: u32,
    key: Vec<u8>,
}

impl Keyring {
    /// Create a fresh keyring with a single data key at term 1.
    #[must_use]
    pub fn new(root_key: EncryptionKey, algorithm: AeadAlgorithm) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(1, EncryptionKey::generate());
        Self {
            root_key,
            keys,
            active_term: 1,
            algorithm,
        }
    }

    /// Append a new data key and make it the active term.
    ///
    /// Historical terms are retained.
    pub fn rotate(&mut self) -> u32 {
        let next = self.active_term.saturating_add(1);
        self.keys.insert(next, EncryptionKey::generate());
        self.active_term = next;
        next
    }

    /// The term used for new writes.
    #[must_use]
    pub fn active_term(&self) -> u32 {
        self.active_term
    }

    /// Number of retained data keys.
    #[must_use]
    pub fn term_count(&self) -> usize {
        self.keys.len()
    }

    /// The data key for a term, if retained.
    #[must_use]
    pub fn key_for_term(&self, term: u32) -> Option<&EncryptionKey> {
        self.keys.get(&term)
    }

    /// The active data key.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::UnknownTerm`] if the keyring is internally
    /// inconsistent (active term missing).
    pub fn active_key(&self) -> Result<&EncryptionKey, BarrierError> {
        self.keys.get(&self.active_term).ok_or(BarrierError::UnknownTerm {
            term: self.active_term,
        })
    }

    /// The key that encrypts the keyring at rest.
    #[must_use]
    pub fn root_key(&self) -> &EncryptionKey {
        &self.root_key
    }

    /// Replace the root key (rekey-root). The data keys are unchanged; the
    /// caller re-persists the keyring under the new root key.
    pub fn set_root_key(&mut self, root_key: EncryptionKey) {
        self.root_key = root_key;
    }

    /// The AEAD algorithm used for new writes.
    #[must_use]
    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    /// Serialize for persistence. The output is plaintext and must only be
    /// stored after encryption by the root key.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Corrupt`] on serialization failure.
    pub fn serialize(&self) -> Result<Vec<u8>, BarrierError> {
        let persisted = PersistedKeyring {
            root_key: self.root_key.as_bytes().to_vec(),
            keys: self
                .keys
                .iter()
                .map(|(term, key)| PersistedKey {
                    term: *term,
                    key: key.as_bytes().to_vec(),
                })
                .collect(),
            active_term: self.active_term,
            algorithm: self.algorithm,
        };
        serde_json::to_vec(&persisted).map_err(|e| BarrierError::Corrupt {
            key: "core/keyring".to_owned(),
            reason: e.to_string(),
        })
    }

    /// Reconstruct from serialized bytes (already decrypted by the caller).
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Corrupt`] on malformed input.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, BarrierError> {
        let persisted: PersistedKeyring =
            serde_json::from_slice(bytes).map_err(|e| BarrierError::Corrupt {
                key: "core/keyring".to_owned(),
                reason: e.to_string(),
            })?;

        let root_key = key_from_vec(&persisted.root_key)?;
        let mut keys = BTreeMap::new();
        for entry in &persisted.keys {
            keys.insert(entry.term, key_from_vec(&entry.key)?);
        }
        if !keys.contains_key(&persisted.active_term) {
            return Err(BarrierError::UnknownTerm {
                term: persisted.active_term,
            });
        }

        Ok(Self {
            root_key,
            keys,
            active_term: persisted.active_term,
            algorithm: persisted.algorithm,
        })
    }
}

fn key_from_vec(bytes: &[u8]) -> Result<EncryptionKey, BarrierError> {
    let array: [u8; 32] = bytes.try_into().map_err(|_| BarrierError::Corrupt {
        key: "core/keyring".to_owned(),
        reason: "key is not 32 bytes".to_owned(),
    })?;
    Ok(EncryptionKey::from_bytes(array))
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("active_term", &self.active_term)
            .field("terms", &self.keys.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_keyring_starts_at_term_one() {
        let keyring = Keyring::new(EncryptionKey::generate(), AeadAlgorithm::Aes256Gcm);
        assert_eq!(keyring.active_term(), 1);
        assert_eq!(keyring.term_count(), 1);
        assert!(keyring.key_for_term(1).is_some());
    }

    #[test]
    fn rotate_appends_and_retains_history() {
        let mut keyring = Keyring::new(EncryptionKey::generate(), AeadAlgorithm::Aes256Gcm);
        let term = keyring.rotate();
        assert_eq!(term, 2);
        assert_eq!(keyring.active_term(), 2);
        assert_eq!(keyring.term_count(), 2);
        assert!(keyring.key_for_term(1).is_some());
        assert!(keyring.key_for_term(2).is_some());
    }

    #[test]
    fn serialize_roundtrip_preserves_keys() {
        let mut keyring = Keyring::new(EncryptionKey::generate(), AeadAlgorithm::ChaCha20Poly1305);
        keyring.rotate();
        keyring.rotate();

        let bytes = keyring.serialize().unwrap();
        let restored = Keyring::deserialize(&bytes).unwrap();

        assert_eq!(restored.active_term(), 3);
        assert_eq!(restored.term_count(), 3);
        assert_eq!(restored.algorithm(), AeadAlgorithm::ChaCha20Poly1305);
        assert_eq!(
            restored.key_for_term(2).unwrap().as_bytes(),
            keyring.key_for_term(2).unwrap().as_bytes()
        );
        assert_eq!(
            restored.root_key().as_bytes(),
            keyring.root_key().as_bytes()
        );
    }

    #[test]
    fn deserialize_rejects_missing_active_term() {
        let keyring = Keyring::new(EncryptionKey::generate(), AeadAlgorithm::Aes256Gcm);
        let bytes = keyring.serialize().unwrap();
        let mut parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        parsed["active_term"] = serde_json::json!(9);
        let err = Keyring::deserialize(&serde_json::to_vec(&parsed).unwrap()).unwrap_err();
        assert!(matches!(err, BarrierError::UnknownTerm { term: 9 }));
    }

    #[test]
    fn unknown_term_lookup_returns_none() {
        let keyring = Keyring::new(EncryptionKey::generate(), AeadAlgorithm::Aes256Gcm);
        assert!(keyring.key_for_term(42).is_none());
    }
}
