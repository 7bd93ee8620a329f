//! Error types for `strongbox-storage`.

/// Errors from a physical storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Opening the backend failed (bad path, corrupted files, locked database).
    #[error("failed to open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// A read operation failed.
    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    /// A write operation failed.
    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    /// A delete operation failed.
    #[error("failed to delete key '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// A prefix listing failed.
    #[error("failed to list prefix '{prefix}': {reason}")]
    List { prefix: String, reason: String },

    /// A backend transaction could not be started or committed.
    #[error("storage transaction failed: {reason}")]
    Transaction { reason: String },

    /// A stored key was not valid UTF-8.
    #[error("invalid storage key: {reason}")]
    InvalidKey { reason: String },

    /// The value exceeds the backend's maximum entry size.
    #[error("entry too large: {size} bytes exceeds the {max} byte limit")]
    EntryTooLarge { size: usize, max: usize },
}
