//! Audit logging.
//!
//! Every request that touches secrets, auth, or system config produces an
//! audit entry before the response leaves the server. Sinks are a
//! broadcast set: the request proceeds when at least one non-blocking sink
//! writes; it fails when every sink fails. With no sinks registered,
//! auditing is disabled and requests pass.
//!
//! Sensitive fields (token values, secret payloads) are HMAC-SHA256'd with
//! a key derived from the root key, so entries can be correlated without
//! exposing secrets.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::AuditError;

type HmacSha256 = Hmac<Sha256>;

/// A single audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry ID.
    pub id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// `request` or `response`.
    pub entry_type: String,
    /// Logical operation name.
    pub operation: String,
    /// Request path.
    pub path: String,
    /// HMAC of the client token (never the token itself).
    pub token_hmac: String,
    /// Policies on the requesting token.
    pub policies: Vec<String>,
    /// Client address.
    pub remote_addr: Option<String>,
    /// Error string for failed requests.
    pub error: Option<String>,
}

/// An audit sink.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// The sink's name (for error reporting).
    fn name(&self) -> &str;

    /// Whether a stuck write must fail the request. Non-blocking sinks
    /// only need one success among them.
    fn blocking(&self) -> bool {
        false
    }

    /// Write an entry. Must not silently drop entries.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::SinkFailure`] if the entry was not persisted.
    async fn log(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// A persisted audit-device description: how to rebuild a sink after a
/// restart or unseal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditDeviceEntry {
    /// Device name (the `sys/audit/<name>` path component).
    pub name: String,
    /// Sink type (`file`).
    #[serde(rename = "type")]
    pub sink_type: String,
    /// Sink-specific options (e.g. `file_path`).
    #[serde(default)]
    pub options: std::collections::HashMap<String, String>,
    /// Whether a failed write on this device fails the request even when
    /// another device succeeded.
    #[serde(default)]
    pub blocking: bool,
}

/// A registered device, visible through `sys/audit`.
#[derive(Debug, Clone, Serialize)]
pub struct AuditDeviceInfo {
    /// Device name.
    pub name: String,
    /// Sink type.
    #[serde(rename = "type")]
    pub sink_type: String,
    /// Whether the device is blocking.
    pub blocking: bool,
}

struct AuditDevice {
    name: String,
    sink: Arc<dyn AuditSink>,
}

/// Broadcasts entries to every registered device with fail-closed
/// semantics.
pub struct AuditBroker {
    devices: RwLock<Vec<AuditDevice>>,
    /// HMAC key for sensitive fields. Installed post-unseal (derived from
    /// the root key); std lock because [`AuditBroker::hmac`] is sync.
    hmac_key: std::sync::RwLock<Vec<u8>>,
}

impl AuditBroker {
    /// Create a broker with the given HMAC key for sensitive fields.
    #[must_use]
    pub fn new(hmac_key: Vec<u8>) -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            hmac_key: std::sync::RwLock::new(hmac_key),
        }
    }

    /// Replace the HMAC key (post-unseal key derivation).
    pub fn set_hmac_key(&self, key: Vec<u8>) {
        if let Ok(mut guard) = self.hmac_key.write() {
            *guard = key;
        }
    }

    /// Register a device, replacing any existing device with the same
    /// name.
    pub async fn add_device(&self, name: impl Into<String>, sink: Arc<dyn AuditSink>) {
        let name = name.into();
        let mut devices = self.devices.write().await;
        devices.retain(|device| device.name != name);
        devices.push(AuditDevice { name, sink });
    }

    /// Remove a device by name. Returns whether one was registered.
    pub async fn remove_device(&self, name: &str) -> bool {
        let mut devices = self.devices.write().await;
        let before = devices.len();
        devices.retain(|device| device.name != name);
        devices.len() != before
    }

    /// The registered devices.
    pub async fn devices(&self) -> Vec<AuditDeviceInfo> {
        self.devices
            .read()
            .await
            .iter()
            .map(|device| AuditDeviceInfo {
                name: device.name.clone(),
                sink_type: device.sink.name().to_owned(),
                blocking: device.sink.blocking(),
            })
            .collect()
    }

    /// Number of registered devices.
    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// HMAC a sensitive value for inclusion in an entry.
    #[must_use]
    pub fn hmac(&self, value: &str) -> String {
        let Ok(key) = self.hmac_key.read() else {
            return "hmac-unavailable".to_owned();
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
            return "hmac-unavailable".to_owned();
        };
        mac.update(value.as_bytes());
        format!("hmac-sha256:{}", hex::encode(mac.finalize().into_bytes()))
    }

    /// Broadcast an entry to all devices.
    ///
    /// Succeeds when at least one non-blocking device wrote and no
    /// blocking device failed. With zero devices, auditing is off and this
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::AllSinksFailed`] (or the blocking device's
    /// failure) — the caller must fail the request.
    pub async fn log(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let devices = self.devices.read().await;
        if devices.is_empty() {
            return Ok(());
        }

        let mut any_success = false;
        for device in devices.iter() {
            match device.sink.log(entry).await {
                Ok(()) => any_success = true,
                Err(e) => {
                    warn!(device = %device.name, error = %e, "audit device write failed");
                    if device.sink.blocking() {
                        return Err(AuditError::SinkFailure {
                            name: device.name.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        if any_success {
            Ok(())
        } else {
            Err(AuditError::AllSinksFailed)
        }
    }
}

impl std::fmt::Debug for AuditBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditBroker").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingSink {
        name: String,
        fail: AtomicBool,
        blocking: bool,
        writes: AtomicUsize,
    }

    impl RecordingSink {
        fn new(name: &str, blocking: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_owned(),
                fail: AtomicBool::new(false),
                blocking,
                writes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl AuditSink for RecordingSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn blocking(&self) -> bool {
            self.blocking
        }

        async fn log(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AuditError::SinkFailure {
                    name: self.name.clone(),
                    reason: "injected".to_owned(),
                });
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn entry() -> AuditEntry {
        AuditEntry {
            id: "e1".to_owned(),
            timestamp: Utc::now(),
            entry_type: "request".to_owned(),
            operation: "read".to_owned(),
            path: "secret/data/app".to_owned(),
            token_hmac: "hmac-sha256:abc".to_owned(),
            policies: vec!["default".to_owned()],
            remote_addr: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn no_devices_is_a_noop() {
        let broker = AuditBroker::new(vec![0u8; 32]);
        broker.log(&entry()).await.unwrap();
    }

    #[tokio::test]
    async fn one_success_is_enough() {
        let broker = AuditBroker::new(vec![0u8; 32]);
        let healthy = RecordingSink::new("healthy", false);
        let broken = RecordingSink::new("broken", false);
        broken.fail.store(true, Ordering::SeqCst);

        broker.add_device("healthy", healthy.clone()).await;
        broker.add_device("broken", broken).await;

        broker.log(&entry()).await.unwrap();
        assert_eq!(healthy.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_failures_fail_closed() {
        let broker = AuditBroker::new(vec![0u8; 32]);
        let a = RecordingSink::new("a", false);
        let b = RecordingSink::new("b", false);
        a.fail.store(true, Ordering::SeqCst);
        b.fail.store(true, Ordering::SeqCst);
        broker.add_device("a", a).await;
        broker.add_device("b", b).await;

        let err = broker.log(&entry()).await.unwrap_err();
        assert!(matches!(err, AuditError::AllSinksFailed));
    }

    #[tokio::test]
    async fn blocking_device_failure_fails_even_with_other_successes() {
        let broker = AuditBroker::new(vec![0u8; 32]);
        let healthy = RecordingSink::new("healthy", false);
        let stuck = RecordingSink::new("stuck", true);
        stuck.fail.store(true, Ordering::SeqCst);
        broker.add_device("healthy", healthy).await;
        broker.add_device("stuck", stuck).await;

        let err = broker.log(&entry()).await.unwrap_err();
        assert!(matches!(err, AuditError::SinkFailure { .. }));
    }

    #[tokio::test]
    async fn devices_can_be_listed_replaced_and_removed() {
        let broker = AuditBroker::new(vec![0u8; 32]);
        broker
            .add_device("primary", RecordingSink::new("memory", false))
            .await;
        broker
            .add_device("primary", RecordingSink::new("memory", true))
            .await;

        let devices = broker.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "primary");
        assert!(devices[0].blocking);

        assert!(broker.remove_device("primary").await);
        assert!(!broker.remove_device("primary").await);
        assert_eq!(broker.device_count().await, 0);
    }

    #[tokio::test]
    async fn hmac_is_stable_and_key_bound() {
        let broker_a = AuditBroker::new(vec![1u8; 32]);
        let broker_b = AuditBroker::new(vec![2u8; 32]);
        assert_eq!(broker_a.hmac("s.token"), broker_a.hmac("s.token"));
        assert_ne!(broker_a.hmac("s.token"), broker_b.hmac("s.token"));
        assert!(broker_a.hmac("s.token").starts_with("hmac-sha256:"));
    }
}
