//! Server configuration.
//!
//! Loaded from a JSON file (path via the first CLI argument or
//! `STRONGBOX_CONFIG`) with stanzas for storage, listeners, the seal,
//! telemetry, and lease TTLs. A handful of `STRONGBOX_*` environment
//! variables override file values for development. SIGHUP re-reads the log
//! level (and TLS material, when configured) but never storage.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Storage stanza.
    pub storage: StorageStanza,
    /// One or more listeners.
    #[serde(default = "default_listeners")]
    pub listener: Vec<ListenerStanza>,
    /// Seal stanza (defaults to Shamir).
    #[serde(default)]
    pub seal: SealStanza,
    /// Telemetry stanza.
    #[serde(default)]
    pub telemetry: TelemetryStanza,
    /// Client-facing address advertised for redirects.
    #[serde(default)]
    pub api_addr: Option<String>,
    /// Cluster-internal address.
    #[serde(default)]
    pub cluster_addr: Option<String>,
    /// Entry cache size (reserved; 0 disables).
    #[serde(default)]
    pub cache_size: usize,
    /// Default lease TTL in seconds.
    #[serde(default = "default_lease_ttl")]
    pub default_lease_ttl: i64,
    /// Maximum lease TTL in seconds.
    #[serde(default = "default_lease_ttl")]
    pub max_lease_ttl: i64,
    /// Whether the UI is served (reserved).
    #[serde(default)]
    pub ui: bool,
    /// Log level filter (e.g. `info`, `debug`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Maximum request duration in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Skip `mlockall` (development without `CAP_IPC_LOCK`).
    #[serde(default)]
    pub disable_mlock: bool,
    /// Audit file sink path (optional).
    #[serde(default)]
    pub audit_file: Option<String>,
}

/// Storage stanza.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageStanza {
    /// Replicated store (production default).
    Raft {
        /// Data directory.
        path: String,
        /// Stable node ID.
        node_id: String,
    },
    /// Standalone `RocksDB` store.
    Rocksdb {
        /// Data directory.
        path: String,
    },
    /// In-memory store (development only).
    Memory {},
}

/// Listener stanza.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerStanza {
    /// Bind address.
    pub address: SocketAddr,
    /// TLS disabled (development).
    #[serde(default)]
    pub tls_disable: bool,
    /// TLS certificate path.
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    /// TLS key path.
    #[serde(default)]
    pub tls_key_file: Option<String>,
}

/// Seal stanza.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SealStanza {
    /// Operator-held Shamir shares.
    #[default]
    Shamir,
    /// External wrapper keyed from a file (KMS stand-in).
    Kms {
        /// Path to the 32-byte wrapping key (hex or base64).
        key_file: String,
    },
    /// Static key material from an environment variable.
    Static {
        /// Environment variable holding the key (hex or base64).
        env_var: String,
    },
}

/// Telemetry stanza.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryStanza {
    /// Seconds between usage-gauge emissions (0 disables).
    #[serde(default)]
    pub usage_gauge_period_secs: u64,
}

fn default_listeners() -> Vec<ListenerStanza> {
    vec![ListenerStanza {
        address: SocketAddr::from(([127, 0, 0, 1], 8200)),
        tls_disable: true,
        tls_cert_file: None,
        tls_key_file: None,
    }]
}

fn default_lease_ttl() -> i64 {
    32 * 24 * 3600
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_request_timeout() -> u64 {
    90
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or malformed.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config '{}': {e}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config '{}': {e}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// A development default: in-memory storage, localhost listener.
    #[must_use]
    pub fn dev_default() -> Self {
        let mut config = Self {
            storage: StorageStanza::Memory {},
            listener: default_listeners(),
            seal: SealStanza::Shamir,
            telemetry: TelemetryStanza::default(),
            api_addr: None,
            cluster_addr: None,
            cache_size: 0,
            default_lease_ttl: default_lease_ttl(),
            max_lease_ttl: default_lease_ttl(),
            ui: false,
            log_level: default_log_level(),
            request_timeout_secs: default_request_timeout(),
            disable_mlock: false,
            audit_file: None,
        };
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("STRONGBOX_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(addr) = std::env::var("STRONGBOX_API_ADDR") {
            self.api_addr = Some(addr);
        }
        if let Ok(value) = std::env::var("STRONGBOX_DISABLE_MLOCK") {
            self.disable_mlock = value == "true" || value == "1";
        }
        if let Ok(path) = std::env::var("STRONGBOX_AUDIT_FILE") {
            self.audit_file = Some(path);
        }
        if let Ok(addr) = std::env::var("STRONGBOX_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                if let Some(first) = self.listener.first_mut() {
                    first.address = parsed;
                }
            }
        }
    }

    /// The first listener's bind address.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        self.listener
            .first()
            .map_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8200)), |l| l.address)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = serde_json::json!({
            "storage": {"type": "raft", "path": "/var/lib/strongbox", "node_id": "node-1"},
            "listener": [{"address": "0.0.0.0:8200", "tls_disable": true}],
            "seal": {"type": "kms", "key_file": "/etc/strongbox/seal.key"},
            "api_addr": "https://vault.example.com:8200",
            "default_lease_ttl": 3600,
            "max_lease_ttl": 86400,
            "ui": true
        });
        let config: ServerConfig = serde_json::from_value(raw).unwrap();

        assert!(matches!(config.storage, StorageStanza::Raft { .. }));
        assert!(matches!(config.seal, SealStanza::Kms { .. }));
        assert_eq!(config.default_lease_ttl, 3600);
        assert_eq!(config.bind_addr().port(), 8200);
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let raw = serde_json::json!({
            "storage": {"type": "memory"}
        });
        let config: ServerConfig = serde_json::from_value(raw).unwrap();
        assert!(matches!(config.seal, SealStanza::Shamir));
        assert_eq!(config.request_timeout_secs, 90);
        assert_eq!(config.listener.len(), 1);
    }

    #[test]
    fn dev_default_is_memory() {
        let config = ServerConfig::dev_default();
        assert!(matches!(config.storage, StorageStanza::Memory {}));
    }
}
