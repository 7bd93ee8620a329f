//! Snapshot metadata.
//!
//! The FSM's persistent store already contains all replicated state, so a
//! snapshot is metadata-only: the latest applied index/term and the latest
//! cluster configuration. The snapshot *payload* exchanged between nodes is
//! the store file itself; installing one is handled by
//! [`crate::Fsm::install_snapshot`].

use serde::{Deserialize, Serialize};

use crate::error::FsmError;
use crate::fsm::{Fsm, RaftConfiguration};

/// Metadata describing a point-in-time snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Highest log index contained in the snapshot.
    pub index: u64,
    /// Term of that entry.
    pub term: u64,
    /// Cluster membership as of the snapshot.
    pub configuration: RaftConfiguration,
}

/// Capture snapshot metadata from the FSM's config records.
///
/// # Errors
///
/// Returns [`FsmError`] if the config records cannot be read.
pub fn capture(fsm: &Fsm) -> Result<SnapshotMeta, FsmError> {
    let applied = fsm.applied_state()?;
    let configuration = fsm.configuration()?;
    Ok(SnapshotMeta {
        index: applied.index,
        term: applied.term,
        configuration,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fsm::{RaftServer, Suffrage};
    use crate::log::LogData;

    #[test]
    fn capture_reflects_applied_state_and_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = Fsm::open(dir.path().join("fsm.redb")).unwrap();

        fsm.apply_batch(2, &[(9, LogData::put("k", b"v".to_vec()))])
            .unwrap();
        let config = RaftConfiguration {
            servers: vec![RaftServer {
                id: "node-1".to_owned(),
                address: "127.0.0.1:8201".to_owned(),
                suffrage: Suffrage::Voter,
            }],
        };
        fsm.set_configuration(&config).unwrap();

        let meta = capture(&fsm).unwrap();
        assert_eq!(meta.index, 9);
        assert_eq!(meta.term, 2);
        assert_eq!(meta.configuration, config);
    }

    #[test]
    fn capture_on_fresh_store_is_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = Fsm::open(dir.path().join("fsm.redb")).unwrap();

        let meta = capture(&fsm).unwrap();
        assert_eq!(meta.index, 0);
        assert_eq!(meta.term, 0);
        assert!(meta.configuration.servers.is_empty());
    }
}
