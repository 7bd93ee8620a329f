//! File audit sink.
//!
//! Appends one JSON entry per line. Writes go through
//! `tokio::task::spawn_blocking` since std file I/O is synchronous, and
//! the file is opened per write so log rotation (rename + recreate) just
//! works.

use std::io::Write as _;
use std::path::PathBuf;

use crate::audit::{AuditEntry, AuditSink};
use crate::error::AuditError;

/// An audit sink appending JSON lines to a file.
pub struct FileAuditSink {
    path: PathBuf,
    blocking: bool,
}

impl FileAuditSink {
    /// Create a sink writing to `path`. `blocking` marks the sink as
    /// request-critical: a failed write fails the request even when other
    /// sinks succeeded.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, blocking: bool) -> Self {
        Self {
            path: path.into(),
            blocking,
        }
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    fn name(&self) -> &str {
        "file"
    }

    fn blocking(&self) -> bool {
        self.blocking
    }

    async fn log(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let line = serde_json::to_string(entry).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| AuditError::SinkFailure {
                    name: "file".to_owned(),
                    reason: format!("open '{}': {e}", path.display()),
                })?;
            writeln!(file, "{line}").map_err(|e| AuditError::SinkFailure {
                name: "file".to_owned(),
                reason: format!("write '{}': {e}", path.display()),
            })
        })
        .await
        .map_err(|e| AuditError::SinkFailure {
            name: "file".to_owned(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }
}

impl std::fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
