//! Error types for `strongbox-raft`.

/// Errors from encoding, decoding, or validating log entries.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Serializing a log entry failed.
    #[error("failed to encode log entry: {reason}")]
    Encode { reason: String },

    /// Deserializing a log entry failed.
    #[error("failed to decode log entry: {reason}")]
    Decode { reason: String },

    /// The entry's operation sequence violates the transaction shape rules.
    #[error("invalid transaction shape: {reason}")]
    InvalidTransaction { reason: String },
}

/// Errors from the finite-state machine.
#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    /// The backing database could not be opened.
    #[error("failed to open FSM store at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// The backing database returned an error outside the apply path.
    /// Errors *inside* apply are fatal, not returned.
    #[error("FSM store error: {reason}")]
    Storage { reason: String },

    /// The database handle is closed (mid snapshot install).
    #[error("FSM store is closed")]
    Closed,

    /// Snapshot capture or install failed.
    #[error("snapshot error: {reason}")]
    Snapshot { reason: String },

    /// A persisted FSM-internal record could not be decoded.
    #[error("corrupt FSM record '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// Errors from the replicated store front-end.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// The log entry was malformed.
    #[error(transparent)]
    Log(#[from] LogError),

    /// The FSM failed outside the apply path.
    #[error(transparent)]
    Fsm(#[from] FsmError),

    /// A transaction's verify operations failed against pre-transaction
    /// state; none of its writes were applied. Callers may retry.
    #[error("transaction commit failure: {reason}")]
    TransactionRejected { reason: String },

    /// The apply pipeline has shut down.
    #[error("replicated store is shut down")]
    Shutdown,
}
