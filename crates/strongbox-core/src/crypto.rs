//! Cryptographic primitives for Strongbox.
//!
//! Provides the barrier's AEAD envelope, HKDF-SHA256 key derivation, and a
//! zeroize-on-drop key newtype. All key material is automatically cleared
//! from memory when dropped.
//!
//! # Envelope format
//!
//! ```text
//! version (1 byte) || term (4 bytes, big-endian) || nonce (12 bytes) || ciphertext || tag (16 bytes)
//! ```
//!
//! The version byte selects the AEAD algorithm (1 = AES-256-GCM,
//! 2 = ChaCha20-Poly1305). The term selects which keyring data key was
//! used. The storage key is bound as associated data, so a ciphertext
//! cannot be cut-and-pasted under a different key.

use std::fmt;
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key as AesKey, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Nonce length (96 bits).
pub const NONCE_LEN: usize = 12;

/// AEAD tag length.
pub const TAG_LEN: usize = 16;

/// Envelope header: version byte + 4-byte term + nonce.
pub const HEADER_LEN: usize = 1 + 4 + NONCE_LEN;

/// Minimum envelope length: header + tag.
pub const MIN_CIPHERTEXT_LEN: usize = HEADER_LEN + TAG_LEN;

/// The AEAD algorithm selected by an envelope's version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AeadAlgorithm {
    /// AES-256-GCM (envelope version 1).
    Aes256Gcm,
    /// ChaCha20-Poly1305 (envelope version 2).
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    /// The envelope version byte for this algorithm.
    #[must_use]
    pub fn version(self) -> u8 {
        match self {
            Self::Aes256Gcm => 1,
            Self::ChaCha20Poly1305 => 2,
        }
    }

    /// Resolve an envelope version byte.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownVersion`] for unrecognized bytes.
    pub fn from_version(version: u8) -> Result<Self, CryptoError> {
        match version {
            1 => Ok(Self::Aes256Gcm),
            2 => Ok(Self::ChaCha20Poly1305),
            _ => Err(CryptoError::UnknownVersion { version }),
        }
    }
}

/// A 256-bit key that is zeroized on drop.
///
/// Used for the root key, keyring data keys, unseal keys, and recovery
/// keys. The inner bytes are never exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// The caller must not log or persist these bytes in cleartext.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Last nonce handed out by the RNG. A CSPRNG repeating a 96-bit nonce in
/// consecutive calls means it is broken, and GCM nonce reuse is
/// catastrophic, so the envelope layer refuses to continue.
static LAST_NONCE: Mutex<Option<[u8; NONCE_LEN]>> = Mutex::new(None);

fn fresh_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut last = LAST_NONCE.lock().map_err(|_| CryptoError::Encryption {
        reason: "nonce guard poisoned".to_owned(),
    })?;
    if last.as_ref() == Some(&nonce) {
        return Err(CryptoError::NonceReuse);
    }
    *last = Some(nonce);
    Ok(nonce)
}

/// Encrypt `plaintext` into a versioned envelope.
///
/// `aad` is bound as associated data — for barrier entries it is the
/// storage key.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails, or
/// [`CryptoError::NonceReuse`] if the nonce RNG repeats itself.
pub fn encrypt(
    key: &EncryptionKey,
    algorithm: AeadAlgorithm,
    term: u32,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = fresh_nonce()?;
    let payload = Payload {
        msg: plaintext,
        aad,
    };

    let ciphertext = match algorithm {
        AeadAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key.as_bytes()));
            cipher.encrypt(Nonce::from_slice(&nonce), payload)
        }
        AeadAlgorithm::ChaCha20Poly1305 => {
            let cipher =
                ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key.as_bytes()));
            cipher.encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
        }
    }
    .map_err(|e| CryptoError::Encryption {
        reason: e.to_string(),
    })?;

    let mut envelope = Vec::with_capacity(HEADER_LEN.saturating_add(ciphertext.len()));
    envelope.push(algorithm.version());
    envelope.extend_from_slice(&term.to_be_bytes());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Read the keyring term from an envelope without decrypting it.
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] or
/// [`CryptoError::UnknownVersion`] on malformed envelopes.
pub fn parse_term(envelope: &[u8]) -> Result<u32, CryptoError> {
    if envelope.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: envelope.len(),
        });
    }
    AeadAlgorithm::from_version(envelope[0])?;
    let mut term = [0u8; 4];
    term.copy_from_slice(&envelope[1..5]);
    Ok(u32::from_be_bytes(term))
}

/// Decrypt an envelope produced by [`encrypt`].
///
/// The caller resolves the data key for the envelope's term (see
/// [`parse_term`]) and supplies the same `aad` used at encryption time.
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] or
/// [`CryptoError::UnknownVersion`] on malformed envelopes, and
/// [`CryptoError::Decryption`] if authentication fails.
pub fn decrypt(key: &EncryptionKey, aad: &[u8], envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: envelope.len(),
        });
    }

    let algorithm = AeadAlgorithm::from_version(envelope[0])?;
    let nonce = &envelope[5..HEADER_LEN];
    let ciphertext = &envelope[HEADER_LEN..];
    let payload = Payload {
        msg: ciphertext,
        aad,
    };

    match algorithm {
        AeadAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key.as_bytes()));
            cipher.decrypt(Nonce::from_slice(nonce), payload)
        }
        AeadAlgorithm::ChaCha20Poly1305 => {
            let cipher =
                ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key.as_bytes()));
            cipher.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
        }
    }
    .map_err(|e| CryptoError::Decryption {
        reason: e.to_string(),
    })
}

/// Derive a purpose-specific key from a parent key using HKDF-SHA256.
///
/// The `info` string must be unique per purpose (e.g. `b"audit-hmac-v1"`).
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_key(
    parent: &EncryptionKey,
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, parent.as_bytes());
    let mut derived = [0u8; 32];
    hk.expand(info, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(derived))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_aes() {
        let key = EncryptionKey::generate();
        let envelope = encrypt(&key, AeadAlgorithm::Aes256Gcm, 1, b"core/test", b"secret").unwrap();
        let plaintext = decrypt(&key, b"core/test", &envelope).unwrap();
        assert_eq!(plaintext, b"secret");
    }

    #[test]
    fn roundtrip_chacha() {
        let key = EncryptionKey::generate();
        let envelope =
            encrypt(&key, AeadAlgorithm::ChaCha20Poly1305, 3, b"core/test", b"secret").unwrap();
        assert_eq!(envelope[0], 2);
        let plaintext = decrypt(&key, b"core/test", &envelope).unwrap();
        assert_eq!(plaintext, b"secret");
    }

    #[test]
    fn term_is_recoverable_without_decryption() {
        let key = EncryptionKey::generate();
        let envelope = encrypt(&key, AeadAlgorithm::Aes256Gcm, 7, b"k", b"v").unwrap();
        assert_eq!(parse_term(&envelope).unwrap(), 7);
    }

    #[test]
    fn wrong_key_fails() {
        let envelope = encrypt(
            &EncryptionKey::generate(),
            AeadAlgorithm::Aes256Gcm,
            1,
            b"k",
            b"v",
        )
        .unwrap();
        let result = decrypt(&EncryptionKey::generate(), b"k", &envelope);
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn wrong_aad_fails() {
        let key = EncryptionKey::generate();
        let envelope = encrypt(&key, AeadAlgorithm::Aes256Gcm, 1, b"path/a", b"v").unwrap();
        // Same ciphertext pasted under another key path must not decrypt.
        let result = decrypt(&key, b"path/b", &envelope);
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let mut envelope = encrypt(&key, AeadAlgorithm::Aes256Gcm, 1, b"k", b"v").unwrap();
        if let Some(byte) = envelope.get_mut(HEADER_LEN) {
            *byte ^= 0xFF;
        }
        assert!(matches!(
            decrypt(&key, b"k", &envelope),
            Err(CryptoError::Decryption { .. })
        ));
    }

    #[test]
    fn too_short_fails() {
        let key = EncryptionKey::generate();
        let result = decrypt(&key, b"k", &[0u8; 10]);
        assert!(matches!(result, Err(CryptoError::CiphertextTooShort { .. })));
    }

    #[test]
    fn unknown_version_fails() {
        let key = EncryptionKey::generate();
        let mut envelope = encrypt(&key, AeadAlgorithm::Aes256Gcm, 1, b"k", b"v").unwrap();
        envelope[0] = 99;
        assert!(matches!(
            decrypt(&key, b"k", &envelope),
            Err(CryptoError::UnknownVersion { version: 99 })
        ));
        assert!(parse_term(&envelope).is_err());
    }

    #[test]
    fn two_encryptions_differ() {
        let key = EncryptionKey::generate();
        let e1 = encrypt(&key, AeadAlgorithm::Aes256Gcm, 1, b"k", b"same").unwrap();
        let e2 = encrypt(&key, AeadAlgorithm::Aes256Gcm, 1, b"k", b"same").unwrap();
        assert_ne!(e1, e2);
    }

    #[test]
    fn derive_key_is_deterministic_and_purpose_bound() {
        let root = EncryptionKey::generate();
        let k1 = derive_key(&root, Some(b"salt"), b"audit-hmac-v1").unwrap();
        let k2 = derive_key(&root, Some(b"salt"), b"audit-hmac-v1").unwrap();
        let k3 = derive_key(&root, Some(b"salt"), b"batch-token-v1").unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        assert_ne!(k1.as_bytes(), k3.as_bytes());
    }

    #[test]
    fn debug_redacts_key_bytes() {
        let key = EncryptionKey::generate();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
    }
}
