//! Rekey and generate-root ceremonies.
//!
//! Both are quorum operations: an operator starts one, receives a
//! server-generated nonce, and key holders submit shares against that nonce
//! until the threshold is met. Only one operation of each kind may be in
//! flight; cancelling resets progress even if the nonce has been exposed.
//!
//! Rekey comes in two modes:
//!
//! - **split-only**: a new unseal (or recovery) key is generated and split
//!   into a new share set; the root key is unchanged, just re-wrapped.
//! - **rekey-root**: a new root key is generated and the keyring header is
//!   re-encrypted under it before the new share set is produced.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::info;

use crate::crypto::EncryptionKey;
use crate::error::SealError;
use crate::seal::{
    RECOVERY_CONFIG_PATH, RECOVERY_KEY_PATH, SEAL_CONFIG_PATH, SealConfig, SealManager, SealType,
    WrappedKeyRecord, encode_record, split_key,
};

/// What a rekey operation does to the root key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyMode {
    /// New shares only; the root key is re-wrapped but unchanged.
    SplitOnly,
    /// Rotate the root key and re-encrypt the keyring header.
    RotateRoot,
}

/// Which key set a rekey operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyTarget {
    /// The barrier unseal key shares.
    Barrier,
    /// The recovery key shares (auto seals).
    Recovery,
}

struct RekeyOperation {
    nonce: String,
    shares: u8,
    threshold: u8,
    mode: RekeyMode,
    target: RekeyTarget,
    progress: Vec<Vec<u8>>,
}

/// Progress of an in-flight rekey.
#[derive(Debug, Clone, Serialize)]
pub struct RekeyStatus {
    /// Whether an operation is in flight.
    pub started: bool,
    /// The operation's nonce (empty when idle).
    pub nonce: String,
    /// Target share count.
    pub shares: u8,
    /// Target threshold.
    pub threshold: u8,
    /// Shares submitted so far.
    pub progress: u8,
    /// Shares required (current config's threshold).
    pub required: u8,
}

/// Result of a completed rekey: the new share set, shown once.
#[derive(Debug)]
pub struct RekeyResult {
    /// Base64 shares of the new key.
    pub shares: Vec<String>,
    /// The operation's nonce.
    pub nonce: String,
}

/// Drives rekey operations against the seal manager.
pub struct RekeyManager {
    seal_mgr: Arc<SealManager>,
    operation: Mutex<Option<RekeyOperation>>,
}

impl RekeyManager {
    /// Create a rekey manager.
    #[must_use]
    pub fn new(seal_mgr: Arc<SealManager>) -> Self {
        Self {
            seal_mgr,
            operation: Mutex::new(None),
        }
    }

    /// Start a rekey operation and return its nonce.
    ///
    /// # Errors
    ///
    /// - [`SealError::InProgress`] if a rekey is already running.
    /// - [`SealError::InvalidConfig`] on bad target parameters.
    /// - [`SealError::Unsupported`] for a recovery rekey without recovery
    ///   keys configured.
    pub async fn init(
        &self,
        shares: u8,
        threshold: u8,
        mode: RekeyMode,
        target: RekeyTarget,
    ) -> Result<String, SealError> {
        let probe = SealConfig {
            seal_type: SealType::Shamir,
            secret_shares: shares,
            secret_threshold: threshold,
            pgp_keys: None,
            stored_shares: 0,
            nonce: String::new(),
        };
        probe.validate()?;

        if target == RekeyTarget::Recovery {
            if self.seal_mgr.recovery_config().await?.is_none() {
                return Err(SealError::Unsupported {
                    seal_type: "recovery rekey without recovery keys".to_owned(),
                });
            }
            if mode == RekeyMode::RotateRoot {
                return Err(SealError::InvalidConfig {
                    reason: "recovery rekey cannot rotate the root key".to_owned(),
                });
            }
        }

        let mut guard = self.operation.lock().await;
        if guard.is_some() {
            return Err(SealError::InProgress {
                operation: "rekey".to_owned(),
            });
        }

        let nonce = uuid::Uuid::new_v4().to_string();
        *guard = Some(RekeyOperation {
            nonce: nonce.clone(),
            shares,
            threshold,
            mode,
            target,
            progress: Vec::new(),
        });

        info!(%nonce, "rekey started");
        Ok(nonce)
    }

    /// Cancel the in-flight operation, clearing all progress.
    pub async fn cancel(&self) {
        if self.operation.lock().await.take().is_some() {
            info!("rekey cancelled");
        }
    }

    /// Current rekey status.
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] if the current config cannot be loaded.
    pub async fn status(&self) -> Result<RekeyStatus, SealError> {
        let guard = self.operation.lock().await;
        let required = match guard.as_ref().map(|op| op.target) {
            Some(RekeyTarget::Recovery) => self
                .seal_mgr
                .recovery_config()
                .await?
                .map_or(0, |c| c.secret_threshold),
            _ => match self.seal_mgr.config().await {
                Ok(config) => config.secret_threshold,
                Err(SealError::NotInitialized) => 0,
                Err(e) => return Err(e),
            },
        };

        Ok(match guard.as_ref() {
            None => RekeyStatus {
                started: false,
                nonce: String::new(),
                shares: 0,
                threshold: 0,
                progress: 0,
                required,
            },
            Some(op) => RekeyStatus {
                started: true,
                nonce: op.nonce.clone(),
                shares: op.shares,
                threshold: op.threshold,
                progress: u8::try_from(op.progress.len()).unwrap_or(u8::MAX),
                required,
            },
        })
    }

    /// Submit one share of the *current* key set against the operation
    /// nonce. Duplicate submissions are idempotent.
    ///
    /// Returns `None` while below the current threshold, or the completed
    /// [`RekeyResult`] with the new share set.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInProgress`] without an active operation.
    /// - [`SealError::NonceMismatch`] on the wrong nonce.
    /// - [`SealError::InvalidShares`] if the quorum fails to verify
    ///   (progress resets, the operation stays active).
    pub async fn submit_share(
        &self,
        nonce: &str,
        share_b64: &str,
    ) -> Result<Option<RekeyResult>, SealError> {
        let share = BASE64
            .decode(share_b64)
            .map_err(|e| SealError::InvalidShare {
                reason: format!("base64 decode failed: {e}"),
            })?;

        let mut guard = self.operation.lock().await;
        let op = guard.as_mut().ok_or(SealError::NotInProgress {
            operation: "rekey".to_owned(),
        })?;
        if op.nonce != nonce {
            return Err(SealError::NonceMismatch);
        }

        let duplicate = op
            .progress
            .iter()
            .any(|existing| bool::from(existing.as_slice().ct_eq(share.as_slice())));
        if !duplicate {
            op.progress.push(share);
        }

        let current_threshold = match op.target {
            RekeyTarget::Barrier => self.seal_mgr.config().await?.secret_threshold,
            RekeyTarget::Recovery => self
                .seal_mgr
                .recovery_config()
                .await?
                .ok_or(SealError::RecoveryKeyVerification)?
                .secret_threshold,
        };

        if op.progress.len() < usize::from(current_threshold) {
            return Ok(None);
        }

        // Quorum reached: verify the submitted shares, then cut over.
        let submitted: Vec<Vec<u8>> = op.progress.drain(..).collect();
        if let Err(e) = self.seal_mgr.verify_privileged_quorum(&submitted).await {
            // Bad quorum: progress is reset but the operation survives.
            return Err(match e {
                SealError::RecoveryKeyVerification => SealError::InvalidShares,
                other => other,
            });
        }

        let result = self.execute(op).await?;
        *guard = None;

        info!("rekey completed");
        Ok(Some(result))
    }

    async fn execute(&self, op: &RekeyOperation) -> Result<RekeyResult, SealError> {
        match op.target {
            RekeyTarget::Barrier => self.execute_barrier(op).await,
            RekeyTarget::Recovery => self.execute_recovery(op).await,
        }
    }

    async fn execute_barrier(&self, op: &RekeyOperation) -> Result<RekeyResult, SealError> {
        let barrier = self.seal_mgr.barrier();

        if op.mode == RekeyMode::RotateRoot {
            barrier.rekey_root(EncryptionKey::generate()).await?;
        }
        let root_key = barrier.root_key().await?;

        let seal = self.seal_mgr.seal_handle().await;
        let config = self.seal_mgr.config().await?;

        let new_shares = if seal.is_local() {
            // New unseal key, new shares; re-wrap the (possibly rotated)
            // root key under it.
            let unseal_key = EncryptionKey::generate();
            let shares = split_key(&unseal_key, op.shares, op.threshold);
            self.seal_mgr.set_shamir_key(unseal_key).await;
            let wrapped = seal.wrap(root_key.as_bytes()).await?;
            self.seal_mgr
                .store_root_record(seal.seal_type(), seal.key_id(), wrapped)
                .await?;
            shares
        } else {
            // Auto seal: the wrapper is the share set's stand-in; re-wrap
            // the root key (required after rekey-root) and keep stored keys
            // in sync.
            let wrapped = seal.wrap(root_key.as_bytes()).await?;
            self.seal_mgr
                .store_root_record(seal.seal_type(), seal.key_id(), wrapped.clone())
                .await?;
            let record = WrappedKeyRecord {
                seal_type: seal.seal_type(),
                key_id: seal.key_id(),
                ciphertext: wrapped,
            };
            barrier
                .put_raw(crate::seal::STORED_BARRIER_KEYS_PATH, &encode_record(&record)?)
                .await?;
            Vec::new()
        };

        let new_config = SealConfig {
            secret_shares: op.shares,
            secret_threshold: op.threshold,
            nonce: op.nonce.clone(),
            ..config
        };
        self.seal_mgr
            .store_config(SEAL_CONFIG_PATH, &new_config)
            .await?;

        Ok(RekeyResult {
            shares: new_shares,
            nonce: op.nonce.clone(),
        })
    }

    async fn execute_recovery(&self, op: &RekeyOperation) -> Result<RekeyResult, SealError> {
        let barrier = self.seal_mgr.barrier();
        let seal = self.seal_mgr.seal_handle().await;
        let config = self
            .seal_mgr
            .recovery_config()
            .await?
            .ok_or(SealError::RecoveryKeyVerification)?;

        let recovery_key = EncryptionKey::generate();
        let shares = split_key(&recovery_key, op.shares, op.threshold);
        let wrapped = seal.wrap(recovery_key.as_bytes()).await?;
        let record = WrappedKeyRecord {
            seal_type: seal.seal_type(),
            key_id: seal.key_id(),
            ciphertext: wrapped,
        };
        barrier
            .put_raw(RECOVERY_KEY_PATH, &encode_record(&record)?)
            .await?;

        let new_config = SealConfig {
            secret_shares: op.shares,
            secret_threshold: op.threshold,
            nonce: op.nonce.clone(),
            ..config
        };
        self.seal_mgr
            .store_config(RECOVERY_CONFIG_PATH, &new_config)
            .await?;

        Ok(RekeyResult {
            shares,
            nonce: op.nonce.clone(),
        })
    }
}

impl std::fmt::Debug for RekeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RekeyManager").finish_non_exhaustive()
    }
}

struct GenerateRootOperation {
    nonce: String,
    progress: Vec<Vec<u8>>,
}

/// Progress of an in-flight generate-root ceremony.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRootStatus {
    /// Whether a ceremony is in flight.
    pub started: bool,
    /// The ceremony's nonce (empty when idle).
    pub nonce: String,
    /// Shares submitted so far.
    pub progress: u8,
    /// Shares required.
    pub required: u8,
}

/// Drives the generate-root ceremony: a privileged-key quorum authorizes
/// minting a fresh root token. The manager only verifies the quorum; the
/// core mints the token.
pub struct GenerateRootManager {
    seal_mgr: Arc<SealManager>,
    operation: Mutex<Option<GenerateRootOperation>>,
}

impl GenerateRootManager {
    /// Create a generate-root manager.
    #[must_use]
    pub fn new(seal_mgr: Arc<SealManager>) -> Self {
        Self {
            seal_mgr,
            operation: Mutex::new(None),
        }
    }

    /// Start a ceremony and return its nonce.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InProgress`] if one is already running.
    pub async fn init(&self) -> Result<String, SealError> {
        let mut guard = self.operation.lock().await;
        if guard.is_some() {
            return Err(SealError::InProgress {
                operation: "generate-root".to_owned(),
            });
        }
        let nonce = uuid::Uuid::new_v4().to_string();
        *guard = Some(GenerateRootOperation {
            nonce: nonce.clone(),
            progress: Vec::new(),
        });
        info!(%nonce, "generate-root started");
        Ok(nonce)
    }

    /// Cancel the ceremony, clearing progress.
    pub async fn cancel(&self) {
        if self.operation.lock().await.take().is_some() {
            info!("generate-root cancelled");
        }
    }

    /// Current ceremony status.
    ///
    /// # Errors
    ///
    /// Returns [`SealError`] if the config cannot be loaded.
    pub async fn status(&self) -> Result<GenerateRootStatus, SealError> {
        let guard = self.operation.lock().await;
        let required = self.required_threshold().await?;
        Ok(match guard.as_ref() {
            None => GenerateRootStatus {
                started: false,
                nonce: String::new(),
                progress: 0,
                required,
            },
            Some(op) => GenerateRootStatus {
                started: true,
                nonce: op.nonce.clone(),
                progress: u8::try_from(op.progress.len()).unwrap_or(u8::MAX),
                required,
            },
        })
    }

    /// Submit one privileged-key share. Returns `true` once the quorum has
    /// been verified (the ceremony then completes and clears).
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInProgress`] without an active ceremony.
    /// - [`SealError::NonceMismatch`] on the wrong nonce.
    /// - [`SealError::InvalidShares`] if the quorum fails to verify.
    pub async fn submit_share(&self, nonce: &str, share_b64: &str) -> Result<bool, SealError> {
        let share = BASE64
            .decode(share_b64)
            .map_err(|e| SealError::InvalidShare {
                reason: format!("base64 decode failed: {e}"),
            })?;

        let mut guard = self.operation.lock().await;
        let op = guard.as_mut().ok_or(SealError::NotInProgress {
            operation: "generate-root".to_owned(),
        })?;
        if op.nonce != nonce {
            return Err(SealError::NonceMismatch);
        }

        let duplicate = op
            .progress
            .iter()
            .any(|existing| bool::from(existing.as_slice().ct_eq(share.as_slice())));
        if !duplicate {
            op.progress.push(share);
        }

        let required = self.required_threshold().await?;
        if op.progress.len() < usize::from(required) {
            return Ok(false);
        }

        let submitted: Vec<Vec<u8>> = op.progress.drain(..).collect();
        match self.seal_mgr.verify_privileged_quorum(&submitted).await {
            Ok(()) => {
                *guard = None;
                info!("generate-root quorum verified");
                Ok(true)
            }
            Err(SealError::RecoveryKeyVerification) => Err(SealError::InvalidShares),
            Err(e) => Err(e),
        }
    }

    async fn required_threshold(&self) -> Result<u8, SealError> {
        if let Some(recovery) = self.seal_mgr.recovery_config().await? {
            return Ok(recovery.secret_threshold);
        }
        match self.seal_mgr.config().await {
            Ok(config) => Ok(config.secret_threshold),
            Err(SealError::NotInitialized) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for GenerateRootManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateRootManager").finish_non_exhaustive()
    }
}
