//! Log entry types and codec.
//!
//! Every mutation of the replicated store travels through the log as a
//! [`LogData`] — a list of operations applied atomically by the FSM.
//! Entries whose first operation is [`OpType::BeginTx`] carry optimistic
//! transactions: their verify operations are evaluated against
//! pre-transaction state and the whole entry is discarded on mismatch.
//!
//! Entries are encoded with bincode. The encoding must stay stable across
//! versions: replicas decode each other's entries and snapshots.

use serde::{Deserialize, Serialize};

use crate::error::LogError;

/// Operation discriminant within a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    /// Write `value` at `key`.
    Put,
    /// Remove `key`.
    Delete,
    /// Open a transaction. Must be the first operation.
    BeginTx,
    /// Close a transaction. Must be the last operation.
    CommitTx,
    /// Assert that `key` holds exactly `verify_data` (or is absent when
    /// `verify_data` is `None`) in pre-transaction state.
    VerifyRead,
    /// Assert that the full keys under prefix `key` in pre-transaction
    /// state equal the decoded `verify_data` list.
    VerifyList,
    /// Marker entry emitted after snapshot restore so the node can rebuild
    /// in-memory state from the store.
    RestoreCallback,
}

/// One operation inside a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOperation {
    /// Operation type.
    pub op: OpType,
    /// Target key (or prefix for `VerifyList`). Unused for transaction
    /// delimiters.
    #[serde(default)]
    pub key: String,
    /// Value for `Put`.
    #[serde(default)]
    pub value: Option<Vec<u8>>,
    /// Expected state for verify operations.
    #[serde(default)]
    pub verify_data: Option<Vec<u8>>,
}

impl LogOperation {
    /// A `Put` operation.
    #[must_use]
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            op: OpType::Put,
            key: key.into(),
            value: Some(value),
            verify_data: None,
        }
    }

    /// A `Delete` operation.
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: OpType::Delete,
            key: key.into(),
            value: None,
            verify_data: None,
        }
    }

    /// A `VerifyRead` operation. `expected = None` asserts absence.
    #[must_use]
    pub fn verify_read(key: impl Into<String>, expected: Option<Vec<u8>>) -> Self {
        Self {
            op: OpType::VerifyRead,
            key: key.into(),
            value: None,
            verify_data: expected,
        }
    }

    /// A `VerifyList` operation asserting the exact set of full keys under
    /// `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Encode`] if the expected key list cannot be
    /// serialized.
    pub fn verify_list(prefix: impl Into<String>, expected: &[String]) -> Result<Self, LogError> {
        let verify_data = bincode::serialize(expected).map_err(|e| LogError::Encode {
            reason: e.to_string(),
        })?;
        Ok(Self {
            op: OpType::VerifyList,
            key: prefix.into(),
            value: None,
            verify_data: Some(verify_data),
        })
    }

    fn delimiter(op: OpType) -> Self {
        Self {
            op,
            key: String::new(),
            value: None,
            verify_data: None,
        }
    }
}

/// A decoded log entry: the unit of replication and of atomic application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogData {
    /// Operations applied in order.
    pub operations: Vec<LogOperation>,
}

impl LogData {
    /// A single-put entry.
    #[must_use]
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            operations: vec![LogOperation::put(key, value)],
        }
    }

    /// A single-delete entry.
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            operations: vec![LogOperation::delete(key)],
        }
    }

    /// Wrap `ops` in `BeginTx` / `CommitTx` delimiters.
    #[must_use]
    pub fn transaction(ops: Vec<LogOperation>) -> Self {
        let mut operations = Vec::with_capacity(ops.len().saturating_add(2));
        operations.push(LogOperation::delimiter(OpType::BeginTx));
        operations.extend(ops);
        operations.push(LogOperation::delimiter(OpType::CommitTx));
        Self { operations }
    }

    /// Whether this entry is an optimistic transaction.
    #[must_use]
    pub fn is_transactional(&self) -> bool {
        self.operations
            .first()
            .is_some_and(|op| op.op == OpType::BeginTx)
    }

    /// Encode with bincode.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Encode`] on serialization failure.
    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        bincode::serialize(self).map_err(|e| LogError::Encode {
            reason: e.to_string(),
        })
    }

    /// Decode from bincode.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Decode`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        bincode::deserialize(bytes).map_err(|e| LogError::Decode {
            reason: e.to_string(),
        })
    }

    /// Check the transaction shape rules.
    ///
    /// If the entry contains any transaction delimiter or verify operation:
    /// the first operation must be `BeginTx`, the last must be `CommitTx`,
    /// no delimiter may appear in between (no nesting), and verify
    /// operations may only appear inside the transaction body.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidTransaction`] describing the violation.
    pub fn validate(&self) -> Result<(), LogError> {
        if self.operations.is_empty() {
            return Err(LogError::InvalidTransaction {
                reason: "entry has no operations".to_owned(),
            });
        }

        let has_tx_ops = self.operations.iter().any(|op| {
            matches!(
                op.op,
                OpType::BeginTx | OpType::CommitTx | OpType::VerifyRead | OpType::VerifyList
            )
        });
        if !has_tx_ops {
            return Ok(());
        }

        let Some((first, rest)) = self.operations.split_first() else {
            return Err(LogError::InvalidTransaction {
                reason: "entry has no operations".to_owned(),
            });
        };
        if first.op != OpType::BeginTx {
            return Err(LogError::InvalidTransaction {
                reason: "transactional operations outside a begin_tx entry".to_owned(),
            });
        }
        let Some((last, body)) = rest.split_last() else {
            return Err(LogError::InvalidTransaction {
                reason: "begin_tx without commit_tx".to_owned(),
            });
        };
        if last.op != OpType::CommitTx {
            return Err(LogError::InvalidTransaction {
                reason: "last operation must be commit_tx".to_owned(),
            });
        }
        for op in body {
            if matches!(op.op, OpType::BeginTx | OpType::CommitTx) {
                return Err(LogError::InvalidTransaction {
                    reason: "nested transactions are not permitted".to_owned(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let entry = LogData::transaction(vec![
            LogOperation::verify_read("a", Some(b"1".to_vec())),
            LogOperation::put("a", b"2".to_vec()),
        ]);
        let bytes = entry.encode().unwrap();
        let decoded = LogData::decode(&bytes).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn plain_entry_is_valid() {
        LogData::put("k", b"v".to_vec()).validate().unwrap();
        LogData::delete("k").validate().unwrap();
    }

    #[test]
    fn transaction_constructor_is_valid() {
        let entry = LogData::transaction(vec![LogOperation::put("k", b"v".to_vec())]);
        assert!(entry.is_transactional());
        entry.validate().unwrap();
    }

    #[test]
    fn verify_outside_transaction_is_invalid() {
        let entry = LogData {
            operations: vec![LogOperation::verify_read("k", None)],
        };
        let err = entry.validate().unwrap_err();
        assert!(matches!(err, LogError::InvalidTransaction { .. }));
    }

    #[test]
    fn nested_transaction_is_invalid() {
        let mut entry = LogData::transaction(vec![LogOperation::put("k", b"v".to_vec())]);
        entry.operations.insert(
            1,
            LogOperation {
                op: OpType::BeginTx,
                key: String::new(),
                value: None,
                verify_data: None,
            },
        );
        let err = entry.validate().unwrap_err();
        assert!(matches!(err, LogError::InvalidTransaction { .. }));
    }

    #[test]
    fn missing_commit_is_invalid() {
        let entry = LogData {
            operations: vec![
                LogOperation {
                    op: OpType::BeginTx,
                    key: String::new(),
                    value: None,
                    verify_data: None,
                },
                LogOperation::put("k", b"v".to_vec()),
            ],
        };
        let err = entry.validate().unwrap_err();
        assert!(matches!(err, LogError::InvalidTransaction { .. }));
    }

    #[test]
    fn empty_entry_is_invalid() {
        let entry = LogData { operations: vec![] };
        assert!(entry.validate().is_err());
    }
}
