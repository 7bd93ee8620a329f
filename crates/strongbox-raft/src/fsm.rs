//! The deterministic finite-state machine.
//!
//! The FSM turns ordered batches of log entries into writes against an
//! embedded redb database with two tables: `data` (user entries) and
//! `config` (FSM-internal metadata — latest applied index/term, cluster
//! configuration, this node's suffrage intent).
//!
//! Application is batched: one write transaction per batch, entries applied
//! in commit order. Transactional entries evaluate their verify operations
//! against the *pre-batch* snapshot (a read transaction opened before the
//! write transaction); a failed verify discards that entry's writes and the
//! batch continues. Non-transactional apply failures are fatal — Raft
//! requires deterministic application, so a replica that cannot apply a
//! committed entry must stop rather than diverge.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::warn;

use strongbox_storage::paginate_keys;

use crate::error::FsmError;
use crate::log::{LogData, LogOperation, OpType};

/// User entries.
const DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("data");
/// FSM-internal metadata.
const CONFIG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("config");

/// Config-table key for the latest applied `(index, term)`.
const APPLIED_KEY: &str = "latest_applied";
/// Config-table key for the latest cluster configuration.
const CONFIGURATION_KEY: &str = "latest_configuration";
/// Config-table key for this node's suffrage intent. Preserved across
/// snapshot installs so a restored non-voter does not silently become a
/// voter.
const LOCAL_NODE_CONFIG_KEY: &str = "local_node_config";

/// Reserved prefix for chunked command reassembly.
pub const CHUNK_PREFIX: &str = "raftchunking/";

/// A node's voting membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suffrage {
    /// Participates in elections and quorum.
    Voter,
    /// Replicates only.
    NonVoter,
}

/// This node's intended suffrage, stored in the `config` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNodeConfig {
    /// Whether this node intends to vote.
    pub suffrage: Suffrage,
}

/// One peer in the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftServer {
    /// Stable node identifier.
    pub id: String,
    /// Cluster address used for replication traffic.
    pub address: String,
    /// Voting membership.
    pub suffrage: Suffrage,
}

/// The latest known cluster membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfiguration {
    /// All known peers.
    pub servers: Vec<RaftServer>,
}

/// Latest applied position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    /// Highest applied log index.
    pub index: u64,
    /// Term of that entry.
    pub term: u64,
}

/// Per-entry application result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entry's operations were written.
    Applied {
        /// Log index of the entry.
        index: u64,
    },
    /// The entry was a transaction whose verify operations failed against
    /// pre-transaction state; none of its writes are visible.
    TxRejected {
        /// Log index of the entry.
        index: u64,
        /// Human-readable conflict description.
        reason: String,
    },
    /// The entry was a restore callback: the store contents changed out
    /// from under in-memory caches, which must be rebuilt.
    Restored {
        /// Log index of the entry.
        index: u64,
    },
}

impl ApplyOutcome {
    /// Whether this outcome is a transaction rejection.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::TxRejected { .. })
    }
}

#[derive(Serialize, Deserialize)]
struct ChunkRecord {
    num_chunks: u32,
    data: Vec<u8>,
}

struct FsmInner {
    db: Option<Database>,
    path: PathBuf,
}

impl FsmInner {
    fn db(&self) -> Result<&Database, FsmError> {
        self.db.as_ref().ok_or(FsmError::Closed)
    }
}

/// The replicated state machine over a redb database.
///
/// All methods are blocking; the async front-end in [`crate::RaftStore`]
/// offloads them to the Tokio blocking pool.
pub struct Fsm {
    inner: RwLock<FsmInner>,
}

impl std::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("path", &self.inner.read().path)
            .finish_non_exhaustive()
    }
}

/// Refuse to continue after a non-deterministic apply failure.
///
/// A replica that cannot apply a committed entry would diverge from its
/// peers if it kept serving, so the process must stop (runtime-fatal exit).
#[allow(clippy::panic)]
fn fatal(context: &str, err: &dyn std::fmt::Display) -> ! {
    tracing::error!(context, error = %err, "FSM apply failed; node state is no longer trustworthy");
    panic!("fsm apply failure in {context}: {err}");
}

impl Fsm {
    /// Open (or create) the FSM store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::Open`] if the database cannot be created or its
    /// tables cannot be initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FsmError> {
        let path = path.as_ref().to_path_buf();
        let db = open_database(&path)?;
        Ok(Self {
            inner: RwLock::new(FsmInner {
                db: Some(db),
                path,
            }),
        })
    }

    /// Apply a batch of committed entries in order.
    ///
    /// Opens one write transaction for the whole batch. Returns one
    /// [`ApplyOutcome`] per entry. Transaction rejections are reported, not
    /// errors; anything else that fails mid-apply is fatal.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::Closed`] if the store is mid snapshot install.
    pub fn apply_batch(
        &self,
        term: u64,
        entries: &[(u64, LogData)],
    ) -> Result<Vec<ApplyOutcome>, FsmError> {
        let inner = self.inner.read();
        let db = inner.db()?;

        // Pre-batch snapshot for verify operations.
        let pre_txn = db.begin_read().map_err(|e| FsmError::Storage {
            reason: e.to_string(),
        })?;
        let pre = pre_txn
            .open_table(DATA_TABLE)
            .map_err(|e| FsmError::Storage {
                reason: e.to_string(),
            })?;

        let write_txn = db.begin_write().map_err(|e| FsmError::Storage {
            reason: e.to_string(),
        })?;

        let mut outcomes = Vec::with_capacity(entries.len());
        {
            let mut table = match write_txn.open_table(DATA_TABLE) {
                Ok(t) => t,
                Err(e) => fatal("open data table", &e),
            };

            let mut chunk_ops: BTreeSet<String> = BTreeSet::new();

            for (index, entry) in entries {
                if let Err(e) = entry.validate() {
                    // The leader validates entries before committing them,
                    // so a malformed committed entry means the log itself is
                    // corrupt.
                    fatal("validate committed entry", &e);
                }

                if entry.is_transactional() {
                    outcomes.push(apply_transaction(&pre, &mut table, *index, entry));
                } else {
                    let mut restored = false;
                    for op in &entry.operations {
                        apply_direct(&mut table, op, &mut chunk_ops, &mut restored);
                    }
                    outcomes.push(if restored {
                        ApplyOutcome::Restored { index: *index }
                    } else {
                        ApplyOutcome::Applied { index: *index }
                    });
                }
            }

            // Any chunk prefixes touched this batch may now be complete.
            for op_prefix in chunk_ops {
                assemble_chunks(&pre, &mut table, &op_prefix);
            }

            if let Some((last_index, _)) = entries.last() {
                let applied = AppliedState {
                    index: *last_index,
                    term,
                };
                write_config(&write_txn, APPLIED_KEY, &applied);
            }
        }

        if let Err(e) = write_txn.commit() {
            fatal("commit apply batch", &e);
        }

        Ok(outcomes)
    }

    /// Read a single value.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::Storage`] on database failure.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FsmError> {
        let inner = self.inner.read();
        let table = read_data_table(inner.db()?)?;
        let value = table
            .get(key)
            .map_err(|e| FsmError::Storage {
                reason: e.to_string(),
            })?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// List full keys under a prefix, in order.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::Storage`] on database failure.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, FsmError> {
        let inner = self.inner.read();
        let table = read_data_table(inner.db()?)?;
        scan_keys(&table, prefix, prefix, false)
    }

    /// Paginated folder-collapsed listing (see the storage trait contract).
    /// Seeks directly to `prefix + after`.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::Storage`] on database failure.
    pub fn list_page(
        &self,
        prefix: &str,
        after: &str,
        limit: i64,
    ) -> Result<Vec<String>, FsmError> {
        let inner = self.inner.read();
        let table = read_data_table(inner.db()?)?;
        let seek = format!("{prefix}{after}");
        let keys = scan_keys(&table, prefix, &seek, true)?;
        Ok(paginate_keys(
            keys.iter().map(String::as_str),
            prefix,
            after,
            limit,
        ))
    }

    /// The latest applied `(index, term)`.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::Storage`] / [`FsmError::Corrupt`] on failure.
    pub fn applied_state(&self) -> Result<AppliedState, FsmError> {
        let inner = self.inner.read();
        Ok(read_config(inner.db()?, APPLIED_KEY)?.unwrap_or_default())
    }

    /// The latest known cluster configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::Storage`] / [`FsmError::Corrupt`] on failure.
    pub fn configuration(&self) -> Result<RaftConfiguration, FsmError> {
        let inner = self.inner.read();
        Ok(read_config(inner.db()?, CONFIGURATION_KEY)?.unwrap_or_default())
    }

    /// Record a new cluster configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::Storage`] on failure.
    pub fn set_configuration(&self, config: &RaftConfiguration) -> Result<(), FsmError> {
        let inner = self.inner.read();
        write_config_standalone(inner.db()?, CONFIGURATION_KEY, config)
    }

    /// This node's suffrage intent, if recorded.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::Storage`] / [`FsmError::Corrupt`] on failure.
    pub fn local_node_config(&self) -> Result<Option<LocalNodeConfig>, FsmError> {
        let inner = self.inner.read();
        read_config(inner.db()?, LOCAL_NODE_CONFIG_KEY)
    }

    /// Record this node's suffrage intent.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::Storage`] on failure.
    pub fn set_local_node_config(&self, config: &LocalNodeConfig) -> Result<(), FsmError> {
        let inner = self.inner.read();
        write_config_standalone(inner.db()?, LOCAL_NODE_CONFIG_KEY, config)
    }

    /// Replace the backing store with a snapshot-installer file.
    ///
    /// The store already contains all state, so installing a snapshot is a
    /// file swap: close the database, atomically rename the installer onto
    /// the database path, reopen, and restore this node's suffrage record
    /// (which must survive the install).
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::Snapshot`] if the swap fails. On failure the
    /// store is left closed; the node must restart.
    pub fn install_snapshot(&self, installer: &Path) -> Result<(), FsmError> {
        let mut inner = self.inner.write();

        let local_config = match inner.db() {
            Ok(db) => read_config::<LocalNodeConfig>(db, LOCAL_NODE_CONFIG_KEY)?,
            Err(_) => None,
        };

        // Close the current database before touching its file.
        inner.db.take();

        std::fs::rename(installer, &inner.path).map_err(|e| FsmError::Snapshot {
            reason: format!(
                "failed to move installer onto '{}': {e}",
                inner.path.display()
            ),
        })?;

        let db = open_database(&inner.path).map_err(|e| FsmError::Snapshot {
            reason: format!("failed to reopen store after install: {e}"),
        })?;

        if let Some(config) = local_config {
            write_config_standalone(&db, LOCAL_NODE_CONFIG_KEY, &config)?;
        }

        inner.db = Some(db);
        Ok(())
    }

    /// The filesystem path of the backing store.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.inner.read().path.clone()
    }
}

fn open_database(path: &Path) -> Result<Database, FsmError> {
    let db = Database::create(path).map_err(|e| FsmError::Open {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    // Opening the tables in a write transaction creates them if missing.
    let txn = db.begin_write().map_err(|e| FsmError::Open {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    {
        txn.open_table(DATA_TABLE).map_err(|e| FsmError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        txn.open_table(CONFIG_TABLE).map_err(|e| FsmError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    }
    txn.commit().map_err(|e| FsmError::Open {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    Ok(db)
}

type ReadDataTable = redb::ReadOnlyTable<&'static str, &'static [u8]>;
type WriteDataTable<'txn> = redb::Table<'txn, &'static str, &'static [u8]>;

fn read_data_table(db: &Database) -> Result<ReadDataTable, FsmError> {
    let txn = db.begin_read().map_err(|e| FsmError::Storage {
        reason: e.to_string(),
    })?;
    txn.open_table(DATA_TABLE).map_err(|e| FsmError::Storage {
        reason: e.to_string(),
    })
}

fn scan_keys(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
    seek: &str,
    exclusive: bool,
) -> Result<Vec<String>, FsmError> {
    let bounds = if exclusive {
        (Bound::Excluded(seek), Bound::Unbounded)
    } else {
        (Bound::Included(seek), Bound::Unbounded)
    };
    let range = table.range::<&str>(bounds).map_err(|e| FsmError::Storage {
        reason: e.to_string(),
    })?;

    let mut keys = Vec::new();
    for item in range {
        let (k, _) = item.map_err(|e| FsmError::Storage {
            reason: e.to_string(),
        })?;
        let key = k.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_owned());
    }
    Ok(keys)
}

fn read_config<T: serde::de::DeserializeOwned>(
    db: &Database,
    key: &str,
) -> Result<Option<T>, FsmError> {
    let txn = db.begin_read().map_err(|e| FsmError::Storage {
        reason: e.to_string(),
    })?;
    let table = txn.open_table(CONFIG_TABLE).map_err(|e| FsmError::Storage {
        reason: e.to_string(),
    })?;
    let Some(guard) = table.get(key).map_err(|e| FsmError::Storage {
        reason: e.to_string(),
    })?
    else {
        return Ok(None);
    };
    let value = bincode::deserialize(guard.value()).map_err(|e| FsmError::Corrupt {
        key: key.to_owned(),
        reason: e.to_string(),
    })?;
    Ok(Some(value))
}

/// Write a config record inside an existing write transaction. Failures are
/// fatal: this only runs on the apply path.
fn write_config<T: Serialize>(txn: &redb::WriteTransaction, key: &str, value: &T) {
    let bytes = match bincode::serialize(value) {
        Ok(b) => b,
        Err(e) => fatal("encode config record", &e),
    };
    let mut table = match txn.open_table(CONFIG_TABLE) {
        Ok(t) => t,
        Err(e) => fatal("open config table", &e),
    };
    if let Err(e) = table.insert(key, bytes.as_slice()) {
        fatal("write config record", &e);
    }
}

/// Write a config record in its own transaction (non-apply path).
fn write_config_standalone<T: Serialize>(
    db: &Database,
    key: &str,
    value: &T,
) -> Result<(), FsmError> {
    let bytes = bincode::serialize(value).map_err(|e| FsmError::Storage {
        reason: e.to_string(),
    })?;
    let txn = db.begin_write().map_err(|e| FsmError::Storage {
        reason: e.to_string(),
    })?;
    {
        let mut table = txn.open_table(CONFIG_TABLE).map_err(|e| FsmError::Storage {
            reason: e.to_string(),
        })?;
        table
            .insert(key, bytes.as_slice())
            .map_err(|e| FsmError::Storage {
                reason: e.to_string(),
            })?;
    }
    txn.commit().map_err(|e| FsmError::Storage {
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Apply a non-transactional operation directly. Failures are fatal.
fn apply_direct(
    table: &mut WriteDataTable<'_>,
    op: &LogOperation,
    chunk_ops: &mut BTreeSet<String>,
    restored: &mut bool,
) {
    match op.op {
        OpType::Put => {
            let value = op.value.as_deref().unwrap_or_default();
            if let Err(e) = table.insert(op.key.as_str(), value) {
                fatal("apply put", &e);
            }
            if let Some(op_prefix) = chunk_op_prefix(&op.key) {
                chunk_ops.insert(op_prefix);
            }
        }
        OpType::Delete => {
            if let Err(e) = table.remove(op.key.as_str()) {
                fatal("apply delete", &e);
            }
        }
        OpType::RestoreCallback => {
            *restored = true;
        }
        // validate() rejects these outside a transaction; reaching here
        // means the committed log is corrupt.
        OpType::BeginTx | OpType::CommitTx | OpType::VerifyRead | OpType::VerifyList => {
            fatal(
                "apply non-transactional entry",
                &"transaction operation outside a transaction",
            );
        }
    }
}

/// Apply a transactional entry: evaluate verifies against the pre-batch
/// snapshot, then either apply all buffered writes or none.
fn apply_transaction(
    pre: &ReadDataTable,
    table: &mut WriteDataTable<'_>,
    index: u64,
    entry: &LogData,
) -> ApplyOutcome {
    let mut writes: Vec<&LogOperation> = Vec::new();

    for op in &entry.operations {
        match op.op {
            OpType::BeginTx | OpType::CommitTx => {}
            OpType::Put | OpType::Delete => writes.push(op),
            OpType::VerifyRead => {
                if let Err(reason) = verify_read(pre, op) {
                    return ApplyOutcome::TxRejected { index, reason };
                }
            }
            OpType::VerifyList => {
                if let Err(reason) = verify_list(pre, op) {
                    return ApplyOutcome::TxRejected { index, reason };
                }
            }
            OpType::RestoreCallback => {
                return ApplyOutcome::TxRejected {
                    index,
                    reason: "restore_callback inside a transaction".to_owned(),
                };
            }
        }
    }

    for op in writes {
        match op.op {
            OpType::Put => {
                let value = op.value.as_deref().unwrap_or_default();
                if let Err(e) = table.insert(op.key.as_str(), value) {
                    fatal("apply transactional put", &e);
                }
            }
            OpType::Delete => {
                if let Err(e) = table.remove(op.key.as_str()) {
                    fatal("apply transactional delete", &e);
                }
            }
            _ => {}
        }
    }

    ApplyOutcome::Applied { index }
}

fn verify_read(pre: &ReadDataTable, op: &LogOperation) -> Result<(), String> {
    let actual = match pre.get(op.key.as_str()) {
        Ok(v) => v.map(|guard| guard.value().to_vec()),
        Err(e) => fatal("verify_read", &e),
    };
    if actual.as_deref() == op.verify_data.as_deref() {
        Ok(())
    } else {
        Err(format!("verify_read conflict on '{}'", op.key))
    }
}

fn verify_list(pre: &ReadDataTable, op: &LogOperation) -> Result<(), String> {
    let expected: Vec<String> = match op.verify_data.as_deref() {
        Some(bytes) => match bincode::deserialize(bytes) {
            Ok(list) => list,
            Err(_) => return Err(format!("verify_list payload on '{}' is malformed", op.key)),
        },
        None => Vec::new(),
    };
    let actual = match scan_keys(pre, &op.key, &op.key, false) {
        Ok(keys) => keys,
        Err(e) => fatal("verify_list", &e),
    };
    if actual == expected {
        Ok(())
    } else {
        Err(format!("verify_list conflict on prefix '{}'", op.key))
    }
}

/// If `key` is a chunk record, return its `raftchunking/<op_num>/` prefix.
fn chunk_op_prefix(key: &str) -> Option<String> {
    let rest = key.strip_prefix(CHUNK_PREFIX)?;
    let op_num = rest.split('/').next()?;
    Some(format!("{CHUNK_PREFIX}{op_num}/"))
}

/// Build the storage key for one chunk of a chunked command.
#[must_use]
pub fn chunk_key(op_num: u64, seq_num: u32) -> String {
    // Zero-padded so lexicographic order equals sequence order.
    format!("{CHUNK_PREFIX}{op_num}/{seq_num:08}")
}

/// Encode a chunk record.
///
/// # Errors
///
/// Returns [`FsmError::Storage`] if serialization fails.
pub fn encode_chunk(num_chunks: u32, data: Vec<u8>) -> Result<Vec<u8>, FsmError> {
    bincode::serialize(&ChunkRecord { num_chunks, data }).map_err(|e| FsmError::Storage {
        reason: e.to_string(),
    })
}

/// After a batch touched `op_prefix`, check whether every chunk is present;
/// if so, assemble the original entry, apply it, and delete the chunks.
fn assemble_chunks(pre: &ReadDataTable, table: &mut WriteDataTable<'_>, op_prefix: &str) {
    // Collect chunk records from the write table (includes this batch).
    let mut chunk_keys = Vec::new();
    let mut records = Vec::new();
    {
        let range = match table.range::<&str>(op_prefix..) {
            Ok(r) => r,
            Err(e) => fatal("scan chunks", &e),
        };
        for item in range {
            let (k, v) = match item {
                Ok(pair) => pair,
                Err(e) => fatal("scan chunks", &e),
            };
            let key = k.value();
            if !key.starts_with(op_prefix) {
                break;
            }
            let record: ChunkRecord = match bincode::deserialize(v.value()) {
                Ok(r) => r,
                Err(e) => fatal("decode chunk record", &e),
            };
            chunk_keys.push(key.to_owned());
            records.push(record);
        }
    }

    let Some(first) = records.first() else {
        return;
    };
    if records.len() < first.num_chunks as usize {
        // Not complete yet; later batches will finish it.
        return;
    }

    let mut assembled = Vec::new();
    for record in &records {
        assembled.extend_from_slice(&record.data);
    }

    let entry = match LogData::decode(&assembled) {
        Ok(e) => e,
        Err(e) => fatal("decode assembled chunked entry", &e),
    };
    if let Err(e) = entry.validate() {
        fatal("validate assembled chunked entry", &e);
    }

    if entry.is_transactional() {
        // Deterministic on every replica: verify against the same pre-batch
        // snapshot. A rejected chunked transaction is dropped.
        if apply_transaction(pre, table, 0, &entry).is_rejected() {
            warn!(prefix = %op_prefix, "chunked transaction rejected during assembly");
        }
    } else {
        let mut nested_chunks = BTreeSet::new();
        let mut restored = false;
        for op in &entry.operations {
            apply_direct(table, op, &mut nested_chunks, &mut restored);
        }
    }

    for key in chunk_keys {
        if let Err(e) = table.remove(key.as_str()) {
            fatal("delete applied chunk", &e);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::log::LogOperation;

    fn open_fsm() -> (tempfile::TempDir, Fsm) {
        let dir = tempfile::tempdir().unwrap();
        let fsm = Fsm::open(dir.path().join("fsm.redb")).unwrap();
        (dir, fsm)
    }

    #[test]
    fn apply_put_then_get() {
        let (_dir, fsm) = open_fsm();
        fsm.apply_batch(1, &[(1, LogData::put("a", b"1".to_vec()))])
            .unwrap();
        assert_eq!(fsm.get("a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn apply_delete_removes() {
        let (_dir, fsm) = open_fsm();
        fsm.apply_batch(
            1,
            &[
                (1, LogData::put("a", b"1".to_vec())),
                (2, LogData::delete("a")),
            ],
        )
        .unwrap();
        assert_eq!(fsm.get("a").unwrap(), None);
    }

    #[test]
    fn applied_state_tracks_last_index() {
        let (_dir, fsm) = open_fsm();
        fsm.apply_batch(
            3,
            &[
                (7, LogData::put("a", b"1".to_vec())),
                (8, LogData::put("b", b"2".to_vec())),
            ],
        )
        .unwrap();
        assert_eq!(fsm.applied_state().unwrap(), AppliedState { index: 8, term: 3 });
    }

    #[test]
    fn transaction_conflict_rejects_second_writer() {
        let (_dir, fsm) = open_fsm();
        fsm.apply_batch(1, &[(1, LogData::put("a", b"1".to_vec()))])
            .unwrap();

        let txn_a = LogData::transaction(vec![
            LogOperation::verify_read("a", Some(b"1".to_vec())),
            LogOperation::put("a", b"2".to_vec()),
        ]);
        let txn_b = LogData::transaction(vec![
            LogOperation::verify_read("a", Some(b"1".to_vec())),
            LogOperation::put("a", b"3".to_vec()),
        ]);

        // A and B in separate batches: A commits first, so B's verify must
        // see a="2" and fail.
        let outcomes = fsm.apply_batch(1, &[(2, txn_a)]).unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::Applied { index: 2 }]);

        let outcomes = fsm.apply_batch(1, &[(3, txn_b)]).unwrap();
        assert!(outcomes[0].is_rejected());

        assert_eq!(fsm.get("a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn rejected_transaction_leaves_no_writes() {
        let (_dir, fsm) = open_fsm();
        let txn = LogData::transaction(vec![
            LogOperation::verify_read("missing", Some(b"x".to_vec())),
            LogOperation::put("new-key", b"v".to_vec()),
        ]);
        let outcomes = fsm.apply_batch(1, &[(1, txn)]).unwrap();
        assert!(outcomes[0].is_rejected());
        assert_eq!(fsm.get("new-key").unwrap(), None);
    }

    #[test]
    fn rejected_transaction_does_not_stop_batch() {
        let (_dir, fsm) = open_fsm();
        let bad = LogData::transaction(vec![LogOperation::verify_read(
            "missing",
            Some(b"x".to_vec()),
        )]);
        let good = LogData::put("after", b"ok".to_vec());
        let outcomes = fsm.apply_batch(1, &[(1, bad), (2, good)]).unwrap();
        assert!(outcomes[0].is_rejected());
        assert_eq!(outcomes[1], ApplyOutcome::Applied { index: 2 });
        assert_eq!(fsm.get("after").unwrap(), Some(b"ok".to_vec()));
    }

    #[test]
    fn verify_sees_pre_batch_state_not_in_batch_writes() {
        let (_dir, fsm) = open_fsm();
        fsm.apply_batch(1, &[(1, LogData::put("a", b"1".to_vec()))])
            .unwrap();

        // Same batch: a plain write changes `a`, then a transaction
        // verifies the *pre-batch* value. The verify must still pass.
        let write = LogData::put("a", b"9".to_vec());
        let txn = LogData::transaction(vec![
            LogOperation::verify_read("a", Some(b"1".to_vec())),
            LogOperation::put("b", b"2".to_vec()),
        ]);
        let outcomes = fsm.apply_batch(1, &[(2, write), (3, txn)]).unwrap();
        assert_eq!(
            outcomes,
            vec![
                ApplyOutcome::Applied { index: 2 },
                ApplyOutcome::Applied { index: 3 }
            ]
        );
        assert_eq!(fsm.get("b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn verify_read_absence() {
        let (_dir, fsm) = open_fsm();
        let txn = LogData::transaction(vec![
            LogOperation::verify_read("ghost", None),
            LogOperation::put("ghost", b"now-exists".to_vec()),
        ]);
        let outcomes = fsm.apply_batch(1, &[(1, txn)]).unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::Applied { index: 1 }]);
    }

    #[test]
    fn verify_list_matches_prefix_contents() {
        let (_dir, fsm) = open_fsm();
        fsm.apply_batch(
            1,
            &[
                (1, LogData::put("p/a", b"1".to_vec())),
                (2, LogData::put("p/b", b"2".to_vec())),
            ],
        )
        .unwrap();

        let ok = LogData::transaction(vec![
            LogOperation::verify_list("p/", &["p/a".to_owned(), "p/b".to_owned()]).unwrap(),
            LogOperation::put("p/c", b"3".to_vec()),
        ]);
        let outcomes = fsm.apply_batch(1, &[(3, ok)]).unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::Applied { index: 3 }]);

        let stale = LogData::transaction(vec![
            LogOperation::verify_list("p/", &["p/a".to_owned(), "p/b".to_owned()]).unwrap(),
        ]);
        let outcomes = fsm.apply_batch(1, &[(4, stale)]).unwrap();
        assert!(outcomes[0].is_rejected());
    }

    #[test]
    fn deterministic_replicas_converge() {
        let (_dir1, fsm1) = open_fsm();
        let (_dir2, fsm2) = open_fsm();

        let batch = vec![
            (1, LogData::put("x", b"1".to_vec())),
            (
                2,
                LogData::transaction(vec![
                    LogOperation::verify_read("x", Some(b"1".to_vec())),
                    LogOperation::put("x", b"2".to_vec()),
                ]),
            ),
            (3, LogData::delete("missing")),
            (4, LogData::put("y", b"3".to_vec())),
        ];

        let out1 = fsm1.apply_batch(1, &batch).unwrap();
        let out2 = fsm2.apply_batch(1, &batch).unwrap();
        assert_eq!(out1, out2);
        assert_eq!(fsm1.get("x").unwrap(), fsm2.get("x").unwrap());
        assert_eq!(fsm1.list("").unwrap(), fsm2.list("").unwrap());
    }

    #[test]
    fn list_page_limits_and_resumes() {
        let (_dir, fsm) = open_fsm();
        let entries: Vec<(u64, LogData)> = (1..=10u64)
            .map(|i| (i, LogData::put(format!("a/{i:02}"), vec![])))
            .collect();
        fsm.apply_batch(1, &entries).unwrap();

        let page1 = fsm.list_page("a/", "", 3).unwrap();
        assert_eq!(page1, vec!["01", "02", "03"]);
        let page2 = fsm.list_page("a/", "03", 3).unwrap();
        assert_eq!(page2, vec!["04", "05", "06"]);
        let all = fsm.list_page("a/", "", -1).unwrap();
        assert_eq!(all.len(), 10);
        assert!(fsm.list_page("a/", "", 0).unwrap().is_empty());
    }

    #[test]
    fn local_node_config_roundtrip() {
        let (_dir, fsm) = open_fsm();
        assert!(fsm.local_node_config().unwrap().is_none());
        fsm.set_local_node_config(&LocalNodeConfig {
            suffrage: Suffrage::NonVoter,
        })
        .unwrap();
        assert_eq!(
            fsm.local_node_config().unwrap(),
            Some(LocalNodeConfig {
                suffrage: Suffrage::NonVoter
            })
        );
    }

    #[test]
    fn install_snapshot_swaps_contents_and_keeps_suffrage() {
        let dir = tempfile::tempdir().unwrap();

        // Build the "snapshot" database.
        let installer_path = dir.path().join("installer.redb");
        {
            let source = Fsm::open(&installer_path).unwrap();
            source
                .apply_batch(5, &[(100, LogData::put("snap/key", b"from-snapshot".to_vec()))])
                .unwrap();
        }

        // The target node is a non-voter with divergent data.
        let fsm = Fsm::open(dir.path().join("fsm.redb")).unwrap();
        fsm.apply_batch(1, &[(1, LogData::put("old/key", b"stale".to_vec()))])
            .unwrap();
        fsm.set_local_node_config(&LocalNodeConfig {
            suffrage: Suffrage::NonVoter,
        })
        .unwrap();

        fsm.install_snapshot(&installer_path).unwrap();

        assert_eq!(fsm.get("snap/key").unwrap(), Some(b"from-snapshot".to_vec()));
        assert_eq!(fsm.get("old/key").unwrap(), None);
        // Suffrage intent survives the install.
        assert_eq!(
            fsm.local_node_config().unwrap(),
            Some(LocalNodeConfig {
                suffrage: Suffrage::NonVoter
            })
        );
    }

    #[test]
    fn chunked_command_assembles_and_cleans_up() {
        let (_dir, fsm) = open_fsm();

        let original = LogData::put("big/key", vec![0xAB; 64]);
        let encoded = original.encode().unwrap();
        let halves: Vec<&[u8]> = vec![&encoded[..encoded.len() / 2], &encoded[encoded.len() / 2..]];

        let mut entries = Vec::new();
        for (seq, half) in halves.iter().enumerate() {
            let record = encode_chunk(2, half.to_vec()).unwrap();
            entries.push((
                seq as u64 + 1,
                LogData::put(chunk_key(42, u32::try_from(seq).unwrap()), record),
            ));
        }

        fsm.apply_batch(1, &entries).unwrap();

        // The assembled entry applied and the chunks are gone.
        assert_eq!(fsm.get("big/key").unwrap(), Some(vec![0xAB; 64]));
        assert!(fsm.list(CHUNK_PREFIX).unwrap().is_empty());
    }

    #[test]
    fn chunked_command_waits_for_all_chunks() {
        let (_dir, fsm) = open_fsm();

        let original = LogData::put("big/key", vec![1u8; 32]);
        let encoded = original.encode().unwrap();
        let record = encode_chunk(2, encoded[..encoded.len() / 2].to_vec()).unwrap();

        fsm.apply_batch(1, &[(1, LogData::put(chunk_key(7, 0), record))])
            .unwrap();

        // Only one of two chunks present: nothing assembled yet.
        assert_eq!(fsm.get("big/key").unwrap(), None);
        assert_eq!(fsm.list(CHUNK_PREFIX).unwrap().len(), 1);
    }
}
