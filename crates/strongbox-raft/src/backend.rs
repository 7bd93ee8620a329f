//! The replicated store front-end.
//!
//! [`RaftStore`] is what the rest of the system sees: a [`StorageBackend`]
//! whose writes travel through the log. Submissions are queued on a channel
//! and drained by a single apply pipeline worker, which assigns each entry
//! a monotonically increasing commit index (the commit order of two
//! concurrent submissions is whatever order the queue hands them over in),
//! groups queued entries into one batch per apply cycle, and runs the
//! blocking FSM apply on the Tokio blocking pool.
//!
//! Reads are served directly from the FSM and reflect every previously
//! acknowledged write on this node.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use strongbox_storage::{StorageBackend, StorageError};

use crate::error::{FsmError, RaftError};
use crate::fsm::{self, ApplyOutcome, Fsm, LocalNodeConfig};
use crate::log::{LogData, LogOperation};
use crate::snapshot::{self, SnapshotMeta};

/// Maximum entries folded into one apply batch.
const MAX_BATCH: usize = 64;

/// Maximum bytes per chunk when splitting oversized commands.
pub const CHUNK_SIZE: usize = 512 * 1024;

struct Submission {
    entry: LogData,
    respond: oneshot::Sender<Result<ApplyOutcome, RaftError>>,
}

/// The replicated storage backend.
pub struct RaftStore {
    fsm: Arc<Fsm>,
    submit_tx: mpsc::Sender<Submission>,
    term: Arc<AtomicU64>,
    chunk_op: AtomicU64,
    node_id: String,
}

impl std::fmt::Debug for RaftStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftStore")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl RaftStore {
    /// Open the store at `path` and start the apply pipeline.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Fsm`] if the backing store cannot be opened.
    pub fn open(path: impl AsRef<Path>, node_id: impl Into<String>) -> Result<Arc<Self>, RaftError> {
        let fsm = Arc::new(Fsm::open(path)?);
        let applied = fsm.applied_state()?;

        let (submit_tx, submit_rx) = mpsc::channel(1024);
        let term = Arc::new(AtomicU64::new(applied.term.max(1)));

        let store = Arc::new(Self {
            fsm: Arc::clone(&fsm),
            submit_tx,
            term: Arc::clone(&term),
            chunk_op: AtomicU64::new(applied.index.saturating_add(1)),
            node_id: node_id.into(),
        });

        tokio::spawn(apply_pipeline(fsm, submit_rx, term, applied.index));

        Ok(store)
    }

    /// Submit one log entry and wait for its apply outcome.
    ///
    /// # Errors
    ///
    /// - [`RaftError::Log`] if the entry is malformed.
    /// - [`RaftError::Shutdown`] if the apply pipeline has stopped.
    pub async fn submit(&self, entry: LogData) -> Result<ApplyOutcome, RaftError> {
        entry.validate()?;

        let (respond, receive) = oneshot::channel();
        self.submit_tx
            .send(Submission { entry, respond })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        receive.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Submit a verify-then-apply transaction.
    ///
    /// The operations are wrapped in `begin_tx` / `commit_tx`. Verify
    /// operations are evaluated against pre-transaction state; on conflict
    /// nothing is written.
    ///
    /// # Errors
    ///
    /// - [`RaftError::TransactionRejected`] on verify conflict (retryable).
    /// - [`RaftError::Log`] / [`RaftError::Shutdown`] as for [`Self::submit`].
    pub async fn submit_transaction(&self, ops: Vec<LogOperation>) -> Result<(), RaftError> {
        let outcome = self.submit(LogData::transaction(ops)).await?;
        match outcome {
            ApplyOutcome::TxRejected { reason, .. } => {
                Err(RaftError::TransactionRejected { reason })
            }
            ApplyOutcome::Applied { .. } | ApplyOutcome::Restored { .. } => Ok(()),
        }
    }

    /// Submit an oversized entry as a chunked command.
    ///
    /// The encoded entry is split into chunks written under the reserved
    /// `raftchunking/` prefix; the FSM assembles and applies the original
    /// entry once every chunk is present, then deletes the chunks.
    ///
    /// # Errors
    ///
    /// As for [`Self::submit`].
    pub async fn submit_chunked(&self, entry: &LogData) -> Result<(), RaftError> {
        let encoded = entry.encode()?;
        let op_num = self.chunk_op.fetch_add(1, Ordering::SeqCst);
        let chunks: Vec<&[u8]> = encoded.chunks(CHUNK_SIZE).collect();
        let num_chunks = u32::try_from(chunks.len()).map_err(|_| RaftError::Log(
            crate::error::LogError::Encode {
                reason: "entry requires more than u32::MAX chunks".to_owned(),
            },
        ))?;

        debug!(op_num, num_chunks, "submitting chunked command");

        for (seq, chunk) in chunks.into_iter().enumerate() {
            let seq = u32::try_from(seq).unwrap_or(u32::MAX);
            let record = fsm::encode_chunk(num_chunks, chunk.to_vec())?;
            self.submit(LogData::put(fsm::chunk_key(op_num, seq), record))
                .await?;
        }
        Ok(())
    }

    /// Capture snapshot metadata.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Fsm`] on config-record read failure.
    pub async fn snapshot(&self) -> Result<SnapshotMeta, RaftError> {
        let fsm = Arc::clone(&self.fsm);
        run_blocking(move || snapshot::capture(&fsm)).await
    }

    /// Install a snapshot from an installer file (see
    /// [`Fsm::install_snapshot`]).
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Fsm`] if the install fails.
    pub async fn install_snapshot(&self, installer: &Path) -> Result<(), RaftError> {
        let fsm = Arc::clone(&self.fsm);
        let installer = installer.to_path_buf();
        run_blocking(move || fsm.install_snapshot(&installer)).await
    }

    /// This node's suffrage intent.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Fsm`] on read failure.
    pub async fn local_node_config(&self) -> Result<Option<LocalNodeConfig>, RaftError> {
        let fsm = Arc::clone(&self.fsm);
        run_blocking(move || fsm.local_node_config()).await
    }

    /// Record this node's suffrage intent.
    ///
    /// # Errors
    ///
    /// Returns [`RaftError::Fsm`] on write failure.
    pub async fn set_local_node_config(&self, config: LocalNodeConfig) -> Result<(), RaftError> {
        let fsm = Arc::clone(&self.fsm);
        run_blocking(move || fsm.set_local_node_config(&config)).await
    }

    /// The stable node identifier.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Bump the leadership term (called when this node wins an election).
    pub fn set_term(&self, term: u64) {
        self.term.store(term, Ordering::SeqCst);
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, RaftError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FsmError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            RaftError::Fsm(FsmError::Storage {
                reason: format!("blocking task panicked: {e}"),
            })
        })?
        .map_err(RaftError::Fsm)
}

/// The apply pipeline: drains queued submissions, assigns commit indexes,
/// applies one batch per cycle, and reports per-entry outcomes.
async fn apply_pipeline(
    fsm: Arc<Fsm>,
    mut rx: mpsc::Receiver<Submission>,
    term: Arc<AtomicU64>,
    mut last_index: u64,
) {
    while let Some(first) = rx.recv().await {
        let mut pending = vec![first];
        while pending.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(submission) => pending.push(submission),
                Err(_) => break,
            }
        }

        let mut entries = Vec::with_capacity(pending.len());
        let mut responders = Vec::with_capacity(pending.len());
        for submission in pending {
            last_index = last_index.saturating_add(1);
            entries.push((last_index, submission.entry));
            responders.push(submission.respond);
        }

        let apply_fsm = Arc::clone(&fsm);
        let apply_term = term.load(Ordering::SeqCst);
        let result = tokio::task::spawn_blocking(move || {
            apply_fsm.apply_batch(apply_term, &entries)
        })
        .await;

        match result {
            Ok(Ok(outcomes)) => {
                for (outcome, respond) in outcomes.into_iter().zip(responders) {
                    let _ = respond.send(Ok(outcome));
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "apply batch failed");
                let reason = e.to_string();
                for respond in responders {
                    let _ = respond.send(Err(RaftError::Fsm(FsmError::Storage {
                        reason: reason.clone(),
                    })));
                }
            }
            Err(join_err) => {
                // The FSM panicked: deterministic apply failed. Nothing
                // more can be served from this store.
                error!(error = %join_err, "apply pipeline worker lost; shutting down");
                return;
            }
        }
    }
}

fn write_error(err: &RaftError, key: &str) -> StorageError {
    StorageError::Write {
        key: key.to_owned(),
        reason: err.to_string(),
    }
}

#[async_trait::async_trait]
impl StorageBackend for RaftStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let fsm = Arc::clone(&self.fsm);
        let key_owned = key.to_owned();
        run_blocking(move || fsm.get(&key_owned))
            .await
            .map_err(|e| StorageError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.submit(LogData::put(key, value.to_vec()))
            .await
            .map(|_| ())
            .map_err(|e| write_error(&e, key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.submit(LogData::delete(key))
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let fsm = Arc::clone(&self.fsm);
        let prefix_owned = prefix.to_owned();
        run_blocking(move || fsm.list(&prefix_owned))
            .await
            .map_err(|e| StorageError::List {
                prefix: prefix.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn list_page(
        &self,
        prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, StorageError> {
        let fsm = Arc::clone(&self.fsm);
        let prefix_owned = prefix.to_owned();
        let after = after.to_owned();
        run_blocking(move || fsm.list_page(&prefix_owned, &after, limit))
            .await
            .map_err(|e| StorageError::List {
                prefix: prefix.to_owned(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> Arc<RaftStore> {
        RaftStore::open(dir.path().join("raft.redb"), "node-1").unwrap()
    }

    #[tokio::test]
    async fn storage_roundtrip_through_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.put("core/config", b"hello").await.unwrap();
        assert_eq!(
            store.get("core/config").await.unwrap(),
            Some(b"hello".to_vec())
        );
        store.delete("core/config").await.unwrap();
        assert_eq!(store.get("core/config").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_reflect_acknowledged_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        for i in 0..50u32 {
            store
                .put(&format!("k/{i:03}"), i.to_string().as_bytes())
                .await
                .unwrap();
        }
        assert_eq!(store.list("k/").await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn transaction_conflict_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.put("a", b"1").await.unwrap();

        store
            .submit_transaction(vec![
                LogOperation::verify_read("a", Some(b"1".to_vec())),
                LogOperation::put("a", b"2".to_vec()),
            ])
            .await
            .unwrap();

        let err = store
            .submit_transaction(vec![
                LogOperation::verify_read("a", Some(b"1".to_vec())),
                LogOperation::put("a", b"3".to_vec()),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::TransactionRejected { .. }));
        assert_eq!(store.get("a").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn chunked_submit_applies_original_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let big = LogData::put("big", vec![7u8; CHUNK_SIZE + 100]);
        store.submit_chunked(&big).await.unwrap();

        assert_eq!(
            store.get("big").await.unwrap(),
            Some(vec![7u8; CHUNK_SIZE + 100])
        );
        assert!(store.list(fsm::CHUNK_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_entry_is_rejected_before_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let bad = LogData {
            operations: vec![LogOperation::verify_read("k", None)],
        };
        let err = store.submit(bad).await.unwrap_err();
        assert!(matches!(err, RaftError::Log(_)));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir);
            store.put("persist/me", b"still-here").await.unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(
            store.get("persist/me").await.unwrap(),
            Some(b"still-here".to_vec())
        );
    }
}
