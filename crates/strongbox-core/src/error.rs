//! Error types for `strongbox-core`.
//!
//! One enum per subsystem. Each variant carries enough context to diagnose
//! the problem without a debugger; crypto errors never include key material.

use strongbox_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AEAD decryption failed (wrong key, corrupted ciphertext, or tampered
    /// tag / associated data).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid envelope header + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// The envelope version byte does not map to a known AEAD algorithm.
    #[error("unknown ciphertext version: {version}")]
    UnknownVersion { version: u8 },

    /// The nonce RNG produced a duplicate. Continuing would catastrophically
    /// weaken GCM, so the caller must treat this as fatal.
    #[error("nonce reuse detected; RNG is unsound")]
    NonceReuse,
}

/// Errors from the encryption barrier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The barrier is sealed — no operations are possible until unseal.
    #[error("barrier is sealed")]
    Sealed,

    /// The barrier has already been initialized.
    #[error("barrier is already initialized")]
    AlreadyInitialized,

    /// The barrier has not been initialized yet.
    #[error("barrier is not initialized")]
    NotInitialized,

    /// The ciphertext references a keyring term this barrier does not have.
    #[error("ciphertext encrypted under unknown keyring term {term}")]
    UnknownTerm { term: u32 },

    /// The value exceeds the maximum entry size.
    #[error("entry too large: {size} bytes exceeds the {max} byte limit")]
    EntryTooLarge { size: usize, max: usize },

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A persisted barrier record could not be decoded.
    #[error("corrupt barrier record '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),

    /// The seal wrapper for a seal-wrapped path failed.
    #[error("seal wrap error: {reason}")]
    SealWrap { reason: String },
}

/// Errors from seal, unseal, rekey, and recovery-key operations.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// The core has already been initialized.
    #[error("already initialized")]
    AlreadyInitialized,

    /// The core has not been initialized yet.
    #[error("not initialized")]
    NotInitialized,

    /// The barrier is already unsealed.
    #[error("already unsealed")]
    AlreadyUnsealed,

    /// The barrier is already sealed.
    #[error("already sealed")]
    AlreadySealed,

    /// Invalid Shamir configuration parameters.
    #[error("invalid seal config: {reason}")]
    InvalidConfig { reason: String },

    /// A submitted key share was malformed.
    #[error("invalid key share: {reason}")]
    InvalidShare { reason: String },

    /// The collected shares did not reconstruct a key that decrypts the
    /// wrapped root key. Progress has been reset.
    #[error("submitted shares failed to reconstruct the unseal key")]
    InvalidShares,

    /// This seal variant cannot perform the requested operation.
    #[error("operation not supported by the {seal_type} seal")]
    Unsupported { seal_type: String },

    /// The Shamir seal has no reconstructed key in memory yet.
    #[error("shamir seal key is not available")]
    MissingShamirKey,

    /// A rekey or generate-root operation is already in progress.
    #[error("a {operation} operation is already in progress")]
    InProgress { operation: String },

    /// No such operation is in progress.
    #[error("no {operation} operation is in progress")]
    NotInProgress { operation: String },

    /// The caller's nonce does not match the in-progress operation.
    #[error("nonce mismatch for the in-progress operation")]
    NonceMismatch,

    /// The recovery key quorum did not authorize the operation.
    #[error("recovery key verification failed")]
    RecoveryKeyVerification,

    /// The external key wrapper failed.
    #[error("key wrapper '{key_id}' failed: {reason}")]
    Wrapper { key_id: String, reason: String },

    /// A cryptographic operation failed.
    #[error("seal crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The encryption barrier returned an error.
    #[error("seal barrier error: {0}")]
    Barrier(#[from] BarrierError),

    /// The physical storage returned an error.
    #[error("seal storage error: {0}")]
    Storage(#[from] StorageError),

    /// A persisted seal record could not be decoded.
    #[error("corrupt seal record '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// Errors from token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token was not found (or is malformed).
    #[error("token not found")]
    NotFound,

    /// The token has expired.
    #[error("token expired at {expired_at}")]
    Expired { expired_at: String },

    /// The token is not renewable.
    #[error("token is not renewable")]
    NotRenewable,

    /// Renewal would exceed the token's explicit maximum TTL.
    #[error("token has exceeded its explicit max TTL of {max_ttl_secs}s")]
    MaxTtlExceeded { max_ttl_secs: i64 },

    /// A batch token cannot be used here (e.g. child creation, renewal).
    #[error("operation not supported for batch tokens")]
    BatchTokenUnsupported,

    /// The batch token payload could not be decoded.
    #[error("malformed batch token: {reason}")]
    MalformedBatchToken { reason: String },

    /// The barrier returned an error.
    #[error("token barrier error: {0}")]
    Barrier(#[from] BarrierError),

    /// A persisted token record could not be decoded.
    #[error("corrupt token record: {reason}")]
    Corrupt { reason: String },
}

/// Errors from policy storage and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The requested policy was not found.
    #[error("policy not found: {name}")]
    NotFound { name: String },

    /// The policy document is invalid.
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// Cannot modify a built-in policy.
    #[error("cannot modify built-in policy: {name}")]
    BuiltIn { name: String },

    /// Check-and-set version mismatch on write.
    #[error("policy version conflict on '{name}': expected {expected}, found {found}")]
    CasMismatch {
        name: String,
        expected: u64,
        found: u64,
    },

    /// Access denied by policy evaluation.
    #[error("permission denied on path '{path}' for {capability}")]
    Denied { path: String, capability: String },

    /// A parameter constraint was violated.
    #[error("parameter constraint violated on path '{path}': {reason}")]
    ParameterViolation { path: String, reason: String },

    /// The barrier returned an error.
    #[error("policy barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from mount table operations.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// The mount path is already in use (or shadows an existing mount).
    #[error("mount path conflicts with existing mount: {path}")]
    PathConflict { path: String },

    /// The mount path was not found.
    #[error("mount not found: {path}")]
    NotFound { path: String },

    /// Invalid mount path.
    #[error("invalid mount path: {reason}")]
    InvalidPath { reason: String },

    /// The path collides with a protected system prefix.
    #[error("cannot mount on protected path: {path}")]
    ProtectedPath { path: String },

    /// Unknown engine type.
    #[error("unknown engine type: {engine_type}")]
    UnknownEngineType { engine_type: String },

    /// Check-and-set version mismatch on tune.
    #[error("mount version conflict on '{path}': expected {expected}, found {found}")]
    CasMismatch {
        path: String,
        expected: u64,
        found: u64,
    },

    /// A persisted mount record could not be decoded.
    #[error("corrupt mount record '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// The barrier returned an error.
    #[error("mount barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Logical error kinds engines surface to the router.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The requested item was not found.
    #[error("not found at path '{path}'")]
    NotFound { path: String },

    /// The caller is not permitted to perform this operation.
    #[error("permission denied")]
    PermissionDenied,

    /// The request is malformed for this engine.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The engine does not support this operation on this path.
    #[error("unsupported operation: {operation}")]
    UnsupportedOperation { operation: String },

    /// The engine is read-only on this node (e.g. a standby).
    #[error("engine is read-only")]
    ReadOnly,

    /// The barrier returned an error.
    #[error("engine barrier error: {0}")]
    Barrier(#[from] BarrierError),

    /// Internal engine error. Marked transient so clients may retry.
    #[error("engine internal error: {reason}")]
    Internal { reason: String },
}

/// Errors from lease tracking and revocation.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The lease was not found.
    #[error("lease not found: {lease_id}")]
    NotFound { lease_id: String },

    /// The lease is not renewable.
    #[error("lease is not renewable: {lease_id}")]
    NotRenewable { lease_id: String },

    /// The lease could not be revoked and has been marked irrevocable.
    #[error("lease is irrevocable: {lease_id}: {reason}")]
    Irrevocable { lease_id: String, reason: String },

    /// The issuing engine rejected the revocation.
    #[error("engine revocation failed for lease '{lease_id}': {reason}")]
    RevocationFailed { lease_id: String, reason: String },

    /// The barrier returned an error.
    #[error("lease barrier error: {0}")]
    Barrier(#[from] BarrierError),

    /// A persisted lease record could not be decoded.
    #[error("corrupt lease record: {reason}")]
    Corrupt { reason: String },
}

/// Errors from audit logging.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// All audit sinks failed to write — the request must be denied.
    #[error("all audit sinks failed (fail-closed)")]
    AllSinksFailed,

    /// A specific audit sink failed.
    #[error("audit sink '{name}' failed: {reason}")]
    SinkFailure { name: String, reason: String },

    /// Serialization of the audit entry failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors from the core request pipeline and lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The barrier is sealed.
    #[error("core is sealed")]
    Sealed,

    /// The core has not been initialized.
    #[error("core is not initialized")]
    Uninitialized,

    /// This node is a standby; the request must be forwarded or redirected
    /// to the active node.
    #[error("node is in standby mode")]
    Standby {
        /// The active node's API address, if known.
        leader: Option<String>,
    },

    /// No mount handles the requested path.
    #[error("no handler for path '{path}'")]
    NoHandler { path: String },

    /// Authentication failed.
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// The path requires `sudo` capability.
    #[error("sudo capability required for path '{path}'")]
    SudoRequired { path: String },

    /// The request is malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Token subsystem error.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Policy subsystem error.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Mount subsystem error.
    #[error(transparent)]
    Mount(#[from] MountError),

    /// Engine error.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Barrier error.
    #[error(transparent)]
    Barrier(#[from] BarrierError),

    /// Seal subsystem error.
    #[error(transparent)]
    Seal(#[from] SealError),

    /// Lease subsystem error.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Audit failure (fail-closed).
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Internal error.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}
