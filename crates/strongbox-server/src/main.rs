//! Server entry point.
//!
//! Bootstraps hardening, logging, the storage backend, and the core, then
//! serves the `/v1` API with graceful shutdown. SIGHUP reloads the log
//! level. Exit codes: 0 clean shutdown, 1 startup error, 2 runtime fatal.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, reload};

use strongbox_core::audit_file::FileAuditSink;
use strongbox_core::core::{Core, CoreConfig, SealKind};
use strongbox_core::crypto::AeadAlgorithm;
use strongbox_core::seal::{FileKeyWrapper, key_material_from_env};
use strongbox_raft::RaftStore;
use strongbox_storage::{MemoryBackend, StorageBackend};

use strongbox_server::build_router;
use strongbox_server::config::{SealStanza, ServerConfig, StorageStanza};
use strongbox_server::hardening::Hardening;
use strongbox_server::state::AppState;

fn main() -> ExitCode {
    // A panicking worker means deterministic state is gone (FSM apply
    // divergence); the process must not keep serving.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(2);
    }));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            #[allow(clippy::print_stderr)]
            {
                eprintln!("failed to start runtime: {e}");
            }
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            #[allow(clippy::print_stderr)]
            {
                eprintln!("strongbox: {e:#}");
            }
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = load_config()?;

    apply_hardening(&config);

    // Structured JSON logging with a reloadable level filter (SIGHUP).
    let (filter, filter_handle) = reload::Layer::new(
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
    );
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(storage = ?storage_kind(&config), "strongbox starting");

    let storage = open_storage(&config)?;
    let seal = build_seal(&config)?;

    let core_config = CoreConfig {
        node_id: node_id(&config),
        api_addr: config.api_addr.clone(),
        cluster_addr: config.cluster_addr.clone(),
        default_lease_ttl_secs: config.default_lease_ttl,
        max_lease_ttl_secs: config.max_lease_ttl,
        ha_enabled: true,
        ha_lock_ttl_secs: 15,
        aead_algorithm: AeadAlgorithm::Aes256Gcm,
    };
    let core = Core::new(storage, seal, core_config).await;

    if let Some(audit_path) = &config.audit_file {
        core.audit()
            .add_device("file", Arc::new(FileAuditSink::new(audit_path, false)))
            .await;
        info!(path = %audit_path, "config-file audit device registered");
    }

    // Shutdown signal fan-out.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // HA heartbeat / promotion loop.
    let ha_handle = tokio::spawn(Arc::clone(&core).run_ha(shutdown_rx.clone()));

    // SIGHUP: reload the log level from config (listener TLS material
    // would reload here too; storage never does).
    spawn_sighup_reload(config.log_level.clone(), filter_handle);

    let state = AppState::new(Arc::clone(&core), config.request_timeout_secs);
    let app = build_router(state);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "strongbox listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers");
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), ha_handle).await;

    info!("strongbox stopped");
    Ok(())
}

fn load_config() -> anyhow::Result<ServerConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("STRONGBOX_CONFIG").ok());
    match path {
        Some(path) => ServerConfig::from_file(path),
        None => Ok(ServerConfig::dev_default()),
    }
}

fn storage_kind(config: &ServerConfig) -> &'static str {
    match config.storage {
        StorageStanza::Raft { .. } => "raft",
        StorageStanza::Rocksdb { .. } => "rocksdb",
        StorageStanza::Memory {} => "memory",
    }
}

fn node_id(config: &ServerConfig) -> String {
    match &config.storage {
        StorageStanza::Raft { node_id, .. } => node_id.clone(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

fn open_storage(config: &ServerConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match &config.storage {
        StorageStanza::Raft { path, node_id } => {
            std::fs::create_dir_all(path)
                .with_context(|| format!("cannot create data dir '{path}'"))?;
            let store = RaftStore::open(
                std::path::Path::new(path).join("strongbox.db"),
                node_id.clone(),
            )
            .context("failed to open the replicated store")?;
            Ok(store as Arc<dyn StorageBackend>)
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageStanza::Rocksdb { path } => {
            let backend = strongbox_storage::RocksDbBackend::open(path)
                .context("failed to open RocksDB storage")?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageStanza::Rocksdb { .. } => {
            anyhow::bail!("rocksdb storage requested but the 'rocksdb-backend' feature is off")
        }
        StorageStanza::Memory {} => {
            warn!("using in-memory storage; data will not survive a restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

fn build_seal(config: &ServerConfig) -> anyhow::Result<SealKind> {
    match &config.seal {
        SealStanza::Shamir => Ok(SealKind::Shamir),
        SealStanza::Kms { key_file } => {
            let wrapper = FileKeyWrapper::from_file(key_file)
                .map_err(|e| anyhow::anyhow!("seal key file: {e}"))?;
            Ok(SealKind::Auto(Arc::new(wrapper)))
        }
        SealStanza::Static { env_var } => {
            let key = key_material_from_env(env_var)
                .map_err(|e| anyhow::anyhow!("static seal: {e}"))?;
            Ok(SealKind::Static(key))
        }
    }
}

fn apply_hardening(config: &ServerConfig) {
    // Runs before logging exists, so warnings go to stderr.
    #[allow(clippy::print_stderr)]
    for warning in Hardening::from_config(config).apply() {
        eprintln!("WARNING: {warning}");
    }
}

fn spawn_sighup_reload(
    default_level: String,
    handle: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let Ok(mut hup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            return;
        };
        while hup.recv().await.is_some() {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&default_level));
            if handle.reload(filter).is_ok() {
                info!("log filter reloaded on SIGHUP");
            }
        }
    });
    #[cfg(not(unix))]
    {
        let _ = (default_level, handle);
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
