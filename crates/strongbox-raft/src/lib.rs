//! Replicated finite-state machine for Strongbox.
//!
//! This crate provides the storage layer used in clustered deployments:
//! a deterministic FSM ([`Fsm`]) that applies ordered batches of log
//! entries ([`LogData`]) into an embedded transactional store, with
//! optimistic verify-then-apply transactions, metadata-only snapshots,
//! chunked oversized commands, and a commit pipeline front-end
//! ([`RaftStore`]) implementing the physical storage trait.
//!
//! Cluster transport and peer discovery live outside this crate; the log
//! entry format and the FSM's deterministic apply are the replication
//! contract replicas agree on.

mod backend;
mod error;
mod fsm;
mod log;
mod snapshot;

pub use backend::{CHUNK_SIZE, RaftStore};
pub use error::{FsmError, LogError, RaftError};
pub use fsm::{
    ApplyOutcome, AppliedState, CHUNK_PREFIX, Fsm, LocalNodeConfig, RaftConfiguration, RaftServer,
    Suffrage, chunk_key, encode_chunk,
};
pub use log::{LogData, LogOperation, OpType};
pub use snapshot::{SnapshotMeta, capture};
