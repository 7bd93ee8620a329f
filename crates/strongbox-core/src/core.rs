//! The core: composition, lifecycle, HA, and the request pipeline.
//!
//! One [`Core`] is created at process startup and owns every subsystem
//! exclusively. Lifecycle states: `uninitialized → sealed → (standby |
//! active)`, with `recovery` reserved for operational repair. The active
//! node runs post-unseal setup (mount tables, expiration restore, HA lock
//! acquisition); a standby keeps the barrier unsealed and surfaces the
//! leader's address for request forwarding.
//!
//! The request pipeline: state check → token validation → ACL evaluation
//! (with sudo enforcement on reserved paths) → audit → router dispatch →
//! lease registration → response wrapping → audit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{error, info, warn};

use crate::engine::Engine;

use strongbox_storage::StorageBackend;

use crate::audit::{AuditBroker, AuditDeviceEntry, AuditDeviceInfo, AuditEntry, AuditSink};
use crate::audit_file::FileAuditSink;
use crate::barrier::Barrier;
use crate::crypto::{self, AeadAlgorithm, EncryptionKey};
use crate::engine::{CubbyholeEngine, EngineRegistry};
use crate::error::{CoreError, MountError, SealError};
use crate::expiration::ExpirationManager;
use crate::identity::IdentityStore;
use crate::mount::{MountEntry, MountKind, MountTable};
use crate::policy::PolicyStore;
use crate::rekey::{GenerateRootManager, RekeyManager};
use crate::router::{BarrierView, Operation, Request, Response, RouteEntry, Router, WrapInfo};
use crate::seal::{InitKeys, KeyWrapper, SealManager, UnsealProgress};
use crate::token::{CreateTokenParams, TokenEntry, TokenStore};

/// Cleartext physical path of the HA lock record.
const HA_LOCK_PATH: &str = "core/lock";

/// Storage prefix for persisted audit-device records.
const AUDIT_DEVICE_PREFIX: &str = "core/audit/";

/// Paths requiring `sudo` capability (beyond a plain grant).
const SUDO_PATHS: &[&str] = &[
    "sys/rotate",
    "sys/seal",
    "sys/step-down",
    "sys/audit",
    "sys/remount",
];

/// Cubbyhole key under which wrapped responses are stored.
const WRAPPED_RESPONSE_KEY: &str = "response";

/// Core lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreState {
    /// No seal configuration exists yet.
    Uninitialized,
    /// Initialized but the barrier is sealed.
    Sealed,
    /// Unsealed, not holding the HA lock; forwards to the active node.
    Standby,
    /// Unsealed and holding the HA lock.
    Active,
    /// Operational-repair mode.
    Recovery,
}

/// Which seal provider the core runs with.
pub enum SealKind {
    /// Operator-held Shamir shares.
    Shamir,
    /// External key wrapper (auto-unseal).
    Auto(Arc<dyn KeyWrapper>),
    /// Static key material.
    Static(EncryptionKey),
}

/// Static core configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Stable node identifier.
    pub node_id: String,
    /// This node's client-facing address (redirect target).
    pub api_addr: Option<String>,
    /// This node's cluster address.
    pub cluster_addr: Option<String>,
    /// Default lease TTL when an engine does not specify one.
    pub default_lease_ttl_secs: i64,
    /// Ceiling on lease TTLs.
    pub max_lease_ttl_secs: i64,
    /// Whether to run HA leader election.
    pub ha_enabled: bool,
    /// HA lock lease in seconds.
    pub ha_lock_ttl_secs: i64,
    /// Barrier AEAD algorithm for new installs.
    pub aead_algorithm: AeadAlgorithm,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            api_addr: None,
            cluster_addr: None,
            default_lease_ttl_secs: 32 * 24 * 3600,
            max_lease_ttl_secs: 32 * 24 * 3600,
            ha_enabled: true,
            ha_lock_ttl_secs: 15,
            aead_algorithm: AeadAlgorithm::Aes256Gcm,
        }
    }
}

/// Result of initialization.
pub struct InitResult {
    /// Unseal / recovery key shares (shown once).
    pub keys: InitKeys,
    /// The initial root token.
    pub root_token: String,
}

/// HA lock record (cleartext — standbys poll it to find the leader).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaLockRecord {
    /// Node ID of the holder.
    pub holder: String,
    /// Holder's API address for redirects.
    pub api_addr: Option<String>,
    /// Unix time of the last heartbeat.
    pub heartbeat_unix: i64,
    /// Seconds after which the lock is considered stale.
    pub ttl_secs: i64,
}

impl HaLockRecord {
    fn is_stale(&self) -> bool {
        Utc::now().timestamp() > self.heartbeat_unix + self.ttl_secs
    }
}

/// The composed server core.
pub struct Core {
    config: CoreConfig,
    barrier: Arc<Barrier>,
    seal_mgr: Arc<SealManager>,
    rekey: RekeyManager,
    generate_root: GenerateRootManager,
    router: Arc<Router>,
    mounts: Arc<MountTable>,
    registry: Arc<EngineRegistry>,
    policies: Arc<PolicyStore>,
    tokens: Arc<TokenStore>,
    identity: Arc<IdentityStore>,
    expiration: Arc<ExpirationManager>,
    audit: Arc<AuditBroker>,
    cubbyhole: RwLock<Option<Arc<CubbyholeEngine>>>,
    /// The state lock: request handling reads it, lifecycle transitions
    /// write it.
    ha_state: RwLock<CoreState>,
    expiration_shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl Core {
    /// Build a core over a physical storage backend with the given seal.
    pub async fn new(
        storage: Arc<dyn StorageBackend>,
        seal: SealKind,
        config: CoreConfig,
    ) -> Arc<Self> {
        let barrier = Arc::new(Barrier::new(storage));
        let seal_mgr = Arc::new(match seal {
            SealKind::Shamir => {
                SealManager::new_shamir(Arc::clone(&barrier), config.aead_algorithm)
            }
            SealKind::Auto(wrapper) => {
                SealManager::new_auto(Arc::clone(&barrier), wrapper, config.aead_algorithm)
            }
            SealKind::Static(key) => {
                SealManager::new_static(Arc::clone(&barrier), key, config.aead_algorithm)
            }
        });

        let router = Arc::new(Router::new());
        let tokens = Arc::new(TokenStore::new(Arc::clone(&barrier)));
        let registry = Arc::new(EngineRegistry::new());
        registry.register_builtins().await;

        let core = Arc::new(Self {
            rekey: RekeyManager::new(Arc::clone(&seal_mgr)),
            generate_root: GenerateRootManager::new(Arc::clone(&seal_mgr)),
            mounts: Arc::new(MountTable::new(Arc::clone(&barrier))),
            policies: Arc::new(PolicyStore::new(Arc::clone(&barrier))),
            identity: Arc::new(IdentityStore::new(Arc::clone(&barrier))),
            expiration: Arc::new(ExpirationManager::new(
                Arc::clone(&barrier),
                Arc::clone(&router),
                Arc::clone(&tokens),
            )),
            audit: Arc::new(AuditBroker::new(Vec::new())),
            cubbyhole: RwLock::new(None),
            ha_state: RwLock::new(CoreState::Sealed),
            expiration_shutdown: Mutex::new(None),
            barrier,
            seal_mgr,
            router,
            tokens,
            registry,
            config,
        });

        // Auto and static seals unseal themselves at startup when a stored
        // key exists.
        if core.seal_mgr.is_initialized().await.unwrap_or(false) {
            match core.seal_mgr.unseal_with_stored_keys().await {
                Ok(()) => {
                    if let Err(e) = core.post_unseal().await {
                        error!(error = %e, "post-unseal failed after auto-unseal");
                        core.seal_mgr.seal().await;
                    }
                }
                Err(SealError::Unsupported { .. }) => {}
                Err(e) => warn!(error = %e, "auto-unseal failed; awaiting manual unseal"),
            }
        }

        core
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> CoreState {
        if !self.seal_mgr.is_initialized().await.unwrap_or(false) {
            return CoreState::Uninitialized;
        }
        if !self.barrier.is_unsealed().await {
            return CoreState::Sealed;
        }
        *self.ha_state.read().await
    }

    /// The seal manager (status, configs).
    #[must_use]
    pub fn seal_manager(&self) -> &Arc<SealManager> {
        &self.seal_mgr
    }

    /// The rekey ceremony driver.
    #[must_use]
    pub fn rekey(&self) -> &RekeyManager {
        &self.rekey
    }

    /// The policy store.
    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    /// The token store.
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// The identity store.
    #[must_use]
    pub fn identity(&self) -> &Arc<IdentityStore> {
        &self.identity
    }

    /// The expiration manager.
    #[must_use]
    pub fn expiration(&self) -> &Arc<ExpirationManager> {
        &self.expiration
    }

    /// The audit broker.
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditBroker> {
        &self.audit
    }

    /// The static configuration.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Initialize: create the barrier, wrap the root key, set up default
    /// mounts, and mint the root token. Leaves the core unsealed and
    /// active.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::AlreadyInitialized`] and validation errors via
    /// [`CoreError::Seal`].
    pub async fn initialize(&self, shares: u8, threshold: u8) -> Result<InitResult, CoreError> {
        let keys = self.seal_mgr.initialize(shares, threshold).await?;
        self.post_unseal().await?;

        let root_token = self.tokens.create_root().await?;
        info!("core initialization complete");
        Ok(InitResult { keys, root_token })
    }

    /// Submit an unseal share; runs post-unseal when the threshold is met.
    ///
    /// # Errors
    ///
    /// See [`SealManager::submit_unseal_share`].
    pub async fn unseal_submit(
        &self,
        share: &str,
    ) -> Result<Option<UnsealProgress>, CoreError> {
        let progress = self.seal_mgr.submit_unseal_share(share).await?;
        if progress.is_none() {
            self.post_unseal().await?;
        }
        Ok(progress)
    }

    /// Reset unseal progress.
    pub async fn unseal_reset(&self) {
        self.seal_mgr.reset_unseal().await;
    }

    /// Seal the core: tear down the active state and zeroize the keyring.
    ///
    /// Sealing an already-sealed core is a no-op.
    pub async fn seal(&self) -> Result<(), CoreError> {
        if self.barrier.is_unsealed().await {
            self.pre_seal().await;
        }
        self.seal_mgr.seal().await;
        *self.ha_state.write().await = CoreState::Sealed;
        Ok(())
    }

    /// Voluntarily release the HA lock and drop to standby without
    /// sealing the barrier.
    pub async fn step_down(&self) -> Result<(), CoreError> {
        let mut state = self.ha_state.write().await;
        if *state != CoreState::Active {
            return Ok(());
        }
        drop(state);

        self.pre_seal().await;
        self.release_ha_lock().await;
        *self.ha_state.write().await = CoreState::Standby;
        info!("stepped down to standby");
        Ok(())
    }

    /// The current leader's lock record, if any.
    pub async fn leader(&self) -> Result<Option<HaLockRecord>, CoreError> {
        let Some(bytes) = self.barrier.get_raw(HA_LOCK_PATH).await? else {
            return Ok(None);
        };
        let record: HaLockRecord =
            serde_json::from_slice(&bytes).map_err(|e| CoreError::Internal {
                reason: format!("corrupt HA lock record: {e}"),
            })?;
        if record.is_stale() {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Post-unseal: load mounts into the router, derive the audit key,
    /// restore the lease queue, start the expiration loop, and run the HA
    /// election.
    async fn post_unseal(&self) -> Result<(), CoreError> {
        // First unseal ever: create the default mounts.
        if self.mounts.load(MountKind::Secret).await?.is_empty() {
            self.mounts
                .mount(MountKind::Secret, &MountEntry::new("secret/", "kv"), false)
                .await?;
            self.mounts
                .mount(
                    MountKind::Secret,
                    &MountEntry::new("cubbyhole/", "cubbyhole"),
                    true,
                )
                .await?;
        }

        // Mount every table entry into the router.
        for entry in self.mounts.load(MountKind::Secret).await? {
            self.mount_into_router(entry).await?;
        }

        // Audit HMAC key derives from the root key.
        let root_key = self.barrier.root_key().await?;
        let audit_key = crypto::derive_key(&root_key, None, b"audit-hmac-v1")
            .map_err(|e| CoreError::Internal {
                reason: format!("audit key derivation failed: {e}"),
            })?;
        self.audit.set_hmac_key(audit_key.as_bytes().to_vec());

        // Re-register persisted audit devices. A record that no longer
        // builds must not hold the unseal hostage; it stays listed for the
        // operator to repair or disable.
        for entry in self.list_audit_devices().await? {
            match build_audit_sink(&entry) {
                Ok(sink) => self.audit.add_device(entry.name.clone(), sink).await,
                Err(e) => warn!(name = %entry.name, error = %e, "audit device not restored"),
            }
        }

        // Lease recovery: everything persisted re-queues (at-least-once).
        self.expiration.restore().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.expiration_shutdown.lock().await = Some(shutdown_tx);
        tokio::spawn(Arc::clone(&self.expiration).run(shutdown_rx));

        // HA election.
        let state = if !self.config.ha_enabled || self.try_acquire_ha_lock().await {
            CoreState::Active
        } else {
            CoreState::Standby
        };
        *self.ha_state.write().await = state;
        info!(state = ?state, "post-unseal complete");
        Ok(())
    }

    /// Pre-seal teardown: stop the expiration loop and unload the router.
    /// The barrier is untouched.
    async fn pre_seal(&self) {
        if let Some(shutdown) = self.expiration_shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }
        self.router.clear().await;
        *self.cubbyhole.write().await = None;
        self.release_ha_lock().await;
    }

    async fn mount_into_router(&self, entry: MountEntry) -> Result<(), CoreError> {
        let view = BarrierView::new(Arc::clone(&self.barrier), entry.storage_prefix());
        let engine = self
            .registry
            .instantiate(&entry.engine_type, view.clone())
            .await?;
        engine.initialize().await?;

        if entry.engine_type == "cubbyhole" {
            let concrete = Arc::new(CubbyholeEngine::new(view));
            self.expiration.set_cubbyhole(Arc::clone(&concrete)).await;
            *self.cubbyhole.write().await = Some(concrete);
        }

        self.router.mount(RouteEntry { mount: entry, engine }).await;
        Ok(())
    }

    // ── HA lock ─────────────────────────────────────────────────────

    async fn try_acquire_ha_lock(&self) -> bool {
        match self.leader().await {
            Ok(Some(record)) if record.holder != self.config.node_id => false,
            // Absent, stale, or already ours: (re)write our claim.
            _ => self.write_ha_lock().await,
        }
    }

    async fn write_ha_lock(&self) -> bool {
        let record = HaLockRecord {
            holder: self.config.node_id.clone(),
            api_addr: self.config.api_addr.clone(),
            heartbeat_unix: Utc::now().timestamp(),
            ttl_secs: self.config.ha_lock_ttl_secs,
        };
        let Ok(bytes) = serde_json::to_vec(&record) else {
            return false;
        };
        self.barrier.put_raw(HA_LOCK_PATH, &bytes).await.is_ok()
    }

    async fn release_ha_lock(&self) {
        if let Ok(Some(record)) = self.leader().await {
            if record.holder == self.config.node_id {
                let _ = self.barrier.delete_raw(HA_LOCK_PATH).await;
            }
        }
    }

    /// Run the HA heartbeat/promotion loop until shutdown. Active nodes
    /// refresh the lock; standbys watch for staleness and promote.
    pub async fn run_ha(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval_secs = (self.config.ha_lock_ttl_secs / 3).max(1);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.unsigned_abs()));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.barrier.is_unsealed().await {
                        continue;
                    }
                    let state = *self.ha_state.read().await;
                    match state {
                        CoreState::Active => {
                            if !self.write_ha_lock().await {
                                warn!("HA heartbeat failed; dropping to standby");
                                let _ = self.step_down().await;
                            }
                        }
                        CoreState::Standby => {
                            if self.try_acquire_ha_lock().await {
                                info!("HA lock acquired; promoting to active");
                                // Full post-unseal setup: a step-down tore
                                // the router and expiration loop down.
                                if let Err(e) = self.post_unseal().await {
                                    error!(error = %e, "promotion failed; staying standby");
                                    self.release_ha_lock().await;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    // ── request pipeline ────────────────────────────────────────────

    /// Handle a logical request end-to-end.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] kinds mapped to HTTP statuses by the
    /// transport.
    pub async fn handle_request(&self, mut request: Request) -> Result<Response, CoreError> {
        match self.state().await {
            CoreState::Active => {}
            CoreState::Uninitialized => return Err(CoreError::Uninitialized),
            CoreState::Sealed | CoreState::Recovery => return Err(CoreError::Sealed),
            CoreState::Standby => {
                let leader = self.leader().await?.and_then(|r| r.api_addr);
                return Err(CoreError::Standby { leader });
            }
        }

        // Authenticate.
        let token = request
            .client_token
            .clone()
            .ok_or_else(|| CoreError::PermissionDenied {
                reason: "missing client token".to_owned(),
            })?;
        let entry = self.tokens.lookup(&token).await?;
        check_cidr_binding(&entry, request.remote_addr.as_deref())?;

        let entity = match &entry.entity_id {
            Some(id) => self.identity.get(id).await?,
            None => None,
        };
        if entity.as_ref().is_some_and(|e| e.disabled) {
            return Err(CoreError::PermissionDenied {
                reason: "entity is disabled".to_owned(),
            });
        }

        // Authorize.
        let decision = self
            .policies
            .authorize(
                &entry.policies,
                entity.as_ref(),
                &request.path,
                request.operation,
                request.data_object(),
            )
            .await?;

        if !decision.root
            && !decision.sudo
            && SUDO_PATHS.iter().any(|p| request.path.starts_with(p))
        {
            return Err(CoreError::SudoRequired {
                path: request.path.clone(),
            });
        }

        // Clamp pagination to the policy ceiling.
        if let Some(ceiling) = decision.pagination_limit {
            request.limit = Some(match request.limit {
                Some(requested) if requested >= 0 => requested.min(ceiling),
                _ => ceiling,
            });
        }

        request.token_entry = Some(entry.clone());
        self.audit_event(&request, &entry, "request", None).await?;

        // Dispatch.
        let result = self.router.route(request.clone()).await;
        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                let message = e.to_string();
                // Failed requests are audited too; a broken audit device
                // still fails the request.
                self.audit_event(&request, &entry, "response", Some(&message))
                    .await?;
                return Err(CoreError::Engine(e));
            }
        };
        response.request_id.clone_from(&request.id);

        // Lease registration for leased secrets.
        if response.auth.is_none() && response.lease_id.is_none() {
            if let Some(ttl) = response.lease_duration.filter(|ttl| *ttl > 0) {
                let ttl = ttl.min(self.config.max_lease_ttl_secs);
                let lease_id = self
                    .expiration
                    .register(
                        &request.path,
                        response.data.clone(),
                        ttl,
                        self.config.max_lease_ttl_secs,
                        &entry.token_hash,
                        &request.namespace,
                        response.renewable,
                    )
                    .await?;
                response.lease_id = Some(lease_id);
            }
        }

        // Response wrapping.
        if let Some(requested) = request.wrap_ttl.filter(|ttl| *ttl > 0) {
            let mut wrap_ttl = requested;
            if let Some(min) = decision.min_wrapping_ttl {
                wrap_ttl = wrap_ttl.max(min);
            }
            if let Some(max) = decision.max_wrapping_ttl {
                wrap_ttl = wrap_ttl.min(max);
            }
            response = self.wrap_response(response, wrap_ttl).await?;
        }

        self.audit_event(&request, &entry, "response", None).await?;
        Ok(response)
    }

    /// Store a response in a single-use cubbyhole and return the wrapping
    /// envelope.
    async fn wrap_response(
        &self,
        response: Response,
        wrap_ttl: i64,
    ) -> Result<Response, CoreError> {
        let (wrap_token, wrap_entry) = self
            .tokens
            .create(CreateTokenParams {
                policies: vec!["response-wrapping".to_owned()],
                ttl_secs: wrap_ttl,
                renewable: false,
                orphan: true,
                display_name: "wrapping-token".to_owned(),
                ..CreateTokenParams::default()
            })
            .await?;

        let guard = self.cubbyhole.read().await;
        let cubbyhole = guard.as_ref().ok_or_else(|| CoreError::Internal {
            reason: "cubbyhole engine not mounted".to_owned(),
        })?;

        let payload = serde_json::to_vec(&response).map_err(|e| CoreError::Internal {
            reason: format!("wrapped response serialization failed: {e}"),
        })?;
        let mut store_request = Request::new(
            Operation::Create,
            WRAPPED_RESPONSE_KEY,
        )
        .with_data(serde_json::json!({
            "response": String::from_utf8_lossy(&payload),
        }));
        store_request.token_entry = Some(wrap_entry.clone());
        let mount = MountEntry::new("cubbyhole/", "cubbyhole");
        cubbyhole
            .handle(&mount, &store_request)
            .await
            .map_err(CoreError::Engine)?;
        drop(guard);

        self.expiration.register_auth(&wrap_entry, "sys/wrapping").await?;

        Ok(Response {
            request_id: response.request_id.clone(),
            wrap_info: Some(WrapInfo {
                token: wrap_token,
                ttl: wrap_ttl,
                creation_time: Utc::now(),
            }),
            ..Response::default()
        })
    }

    /// Unwrap a wrapped response: read the cubbyhole, revoke the wrapping
    /// token, return the original response.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PermissionDenied`] for unknown/expired
    /// wrapping tokens.
    pub async fn unwrap_response(&self, wrap_token: &str) -> Result<Response, CoreError> {
        let entry = self.tokens.lookup(wrap_token).await?;

        let guard = self.cubbyhole.read().await;
        let cubbyhole = guard.as_ref().ok_or_else(|| CoreError::Internal {
            reason: "cubbyhole engine not mounted".to_owned(),
        })?;

        let mut read_request = Request::new(Operation::Read, WRAPPED_RESPONSE_KEY);
        read_request.token_entry = Some(entry.clone());
        let mount = MountEntry::new("cubbyhole/", "cubbyhole");
        let stored = cubbyhole
            .handle(&mount, &read_request)
            .await
            .map_err(|_| CoreError::PermissionDenied {
                reason: "wrapping token has no stored response".to_owned(),
            })?;
        drop(guard);

        // Single use: the wrapping token dies on unwrap.
        self.revoke_token_internal(&entry.token_hash).await?;

        let payload = stored
            .data
            .as_ref()
            .and_then(|d| d.get("response"))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| CoreError::Internal {
                reason: "malformed wrapped response".to_owned(),
            })?;
        let response: serde_json::Value =
            serde_json::from_str(payload).map_err(|e| CoreError::Internal {
                reason: format!("wrapped response deserialization failed: {e}"),
            })?;

        Ok(Response::ok(response))
    }

    // ── token operations ────────────────────────────────────────────

    /// Create a child token of `parent_token` and register its auth lease.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Token`] variants.
    pub async fn create_token(
        &self,
        parent_token: &str,
        mut params: CreateTokenParams,
    ) -> Result<(String, TokenEntry), CoreError> {
        let parent = self.tokens.lookup(parent_token).await?;
        if parent.token_type == crate::token::TokenType::Batch {
            return Err(CoreError::Token(
                crate::error::TokenError::BatchTokenUnsupported,
            ));
        }

        // Orphan creation requires root/sudo; enforced by the caller's ACL
        // on the create-orphan path. A child may not outlive its parent's
        // policies: default to inheriting them.
        if params.policies.is_empty() {
            params.policies.clone_from(&parent.policies);
        }
        if !params.orphan {
            params.parent_hash = Some(parent.token_hash.clone());
        }
        if params.ttl_secs == 0 && !parent.is_root() {
            params.ttl_secs = self.config.default_lease_ttl_secs;
        }

        let (token, entry) = self.tokens.create(params).await?;
        self.expiration
            .register_auth(&entry, "auth/token/create")
            .await?;
        Ok((token, entry))
    }

    /// Authenticate a token and authorize `operation` on `path` (used by
    /// the transport for system endpoints that bypass the router).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] authentication/authorization kinds.
    pub async fn authorize_token(
        &self,
        token: &str,
        path: &str,
        operation: Operation,
        params: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<TokenEntry, CoreError> {
        match self.state().await {
            CoreState::Active => {}
            CoreState::Uninitialized => return Err(CoreError::Uninitialized),
            CoreState::Sealed | CoreState::Recovery => return Err(CoreError::Sealed),
            CoreState::Standby => {
                let leader = self.leader().await?.and_then(|r| r.api_addr);
                return Err(CoreError::Standby { leader });
            }
        }

        let entry = self.tokens.lookup(token).await?;
        let entity = match &entry.entity_id {
            Some(id) => self.identity.get(id).await?,
            None => None,
        };
        let decision = self
            .policies
            .authorize(&entry.policies, entity.as_ref(), path, operation, params)
            .await?;
        if !decision.root
            && !decision.sudo
            && SUDO_PATHS.iter().any(|p| path.starts_with(p))
        {
            return Err(CoreError::SudoRequired {
                path: path.to_owned(),
            });
        }
        Ok(entry)
    }

    /// Renew a service token and move its auth lease along.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Token`] variants.
    pub async fn renew_token(
        &self,
        token: &str,
        increment_secs: i64,
    ) -> Result<TokenEntry, CoreError> {
        let entry = self.tokens.renew(token, increment_secs).await?;
        if let Some(expires) = entry.expires_at() {
            self.expiration
                .sync_auth_lease(&entry.token_hash, expires)
                .await?;
        }
        Ok(entry)
    }

    /// Revoke a token: cascade children, revoke its leases, wipe its
    /// cubbyhole.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Token`] / [`CoreError::Lease`] variants.
    pub async fn revoke_token(&self, token: &str) -> Result<(), CoreError> {
        let entry = self.tokens.lookup(token).await?;
        self.revoke_token_internal(&entry.token_hash).await
    }

    async fn revoke_token_internal(&self, token_hash: &str) -> Result<(), CoreError> {
        // Walk the whole subtree first: every descendant's leases and
        // cubbyhole go with it.
        let mut subtree = vec![token_hash.to_owned()];
        let mut cursor = 0;
        while cursor < subtree.len() {
            let children = self.tokens.children_of(&subtree[cursor]).await?;
            subtree.extend(children);
            cursor += 1;
        }

        // Leaves before parents, so child leases never outlive revocation.
        for hash in subtree.iter().rev() {
            self.expiration.revoke_by_token(hash).await?;
            if let Some(cubbyhole) = self.cubbyhole.read().await.as_ref() {
                cubbyhole.wipe(hash).await.map_err(CoreError::Engine)?;
            }
        }
        self.tokens.revoke_by_hash(token_hash).await?;
        Ok(())
    }

    // ── mount operations ────────────────────────────────────────────

    /// Mount a new engine and insert it into the router.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mount`] variants.
    pub async fn mount(
        &self,
        path: &str,
        engine_type: &str,
        description: String,
        options: HashMap<String, String>,
    ) -> Result<MountEntry, CoreError> {
        let mut entry = MountEntry::new(path, engine_type);
        entry.description = description;
        entry.options = options;

        // Instantiate first so an unknown engine type fails before any
        // state is persisted.
        let view = BarrierView::new(Arc::clone(&self.barrier), entry.storage_prefix());
        self.registry
            .instantiate(engine_type, view)
            .await
            .map_err(|_| MountError::UnknownEngineType {
                engine_type: engine_type.to_owned(),
            })?;

        self.mounts.mount(MountKind::Secret, &entry, false).await?;
        self.mount_into_router(entry.clone()).await?;
        Ok(entry)
    }

    /// Unmount an engine: revoke its leases, drop the route, remove the
    /// table entry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mount`] variants.
    pub async fn unmount(&self, path: &str) -> Result<(), CoreError> {
        let entry = self.mounts.unmount(MountKind::Secret, path).await?;
        self.expiration.revoke_prefix(&entry.path, false).await?;
        self.router.unmount(&entry.path).await;
        Ok(())
    }

    /// Atomically rename a mount, rewriting its leases.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mount`] variants.
    pub async fn remount(&self, from: &str, to: &str) -> Result<MountEntry, CoreError> {
        let entry = self.mounts.remount(MountKind::Secret, from, to).await?;
        let from_norm = if from.ends_with('/') {
            from.to_owned()
        } else {
            format!("{from}/")
        };
        self.expiration
            .rewrite_prefix(&from_norm, &entry.path)
            .await?;
        self.router.unmount(&from_norm).await;
        self.mount_into_router(entry.clone()).await?;
        Ok(entry)
    }

    /// List mounted engines.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mount`] variants.
    pub async fn list_mounts(&self) -> Result<Vec<MountEntry>, CoreError> {
        Ok(self.mounts.load(MountKind::Secret).await?)
    }

    /// Tune a mount via check-and-set.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mount`] variants.
    pub async fn tune_mount(
        &self,
        path: &str,
        description: Option<String>,
        options: Option<HashMap<String, String>>,
        expected_version: u64,
    ) -> Result<MountEntry, CoreError> {
        Ok(self
            .mounts
            .tune(MountKind::Secret, path, description, options, expected_version)
            .await?)
    }

    // ── audit devices ───────────────────────────────────────────────

    /// Enable an audit device: build its sink, register it with the
    /// broker, and persist the record so it survives seal cycles.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRequest`] for unknown sink types or
    /// missing options.
    pub async fn enable_audit_device(&self, entry: AuditDeviceEntry) -> Result<(), CoreError> {
        if entry.name.is_empty() || entry.name.contains('/') {
            return Err(CoreError::InvalidRequest {
                reason: "audit device name must be a single non-empty path segment".to_owned(),
            });
        }

        let sink = build_audit_sink(&entry)?;
        let bytes = serde_json::to_vec(&entry).map_err(|e| CoreError::Internal {
            reason: format!("audit device serialization failed: {e}"),
        })?;
        self.barrier
            .put(&format!("{AUDIT_DEVICE_PREFIX}{}", entry.name), &bytes)
            .await?;
        self.audit.add_device(entry.name.clone(), sink).await;

        info!(name = %entry.name, sink = %entry.sink_type, "audit device enabled");
        Ok(())
    }

    /// Disable an audit device and remove its persisted record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoHandler`] when the device does not exist.
    pub async fn disable_audit_device(&self, name: &str) -> Result<(), CoreError> {
        let key = format!("{AUDIT_DEVICE_PREFIX}{name}");
        let persisted = self.barrier.get(&key).await?.is_some();
        let registered = self.audit.remove_device(name).await;
        if !persisted && !registered {
            return Err(CoreError::NoHandler {
                path: format!("sys/audit/{name}"),
            });
        }
        self.barrier.delete(&key).await?;

        info!(name = %name, "audit device disabled");
        Ok(())
    }

    /// The persisted audit-device records.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Barrier`] on storage failure.
    pub async fn list_audit_devices(&self) -> Result<Vec<AuditDeviceEntry>, CoreError> {
        let mut entries = Vec::new();
        for key in self.barrier.list(AUDIT_DEVICE_PREFIX).await? {
            let Some(bytes) = self.barrier.get(&key).await? else {
                continue;
            };
            let entry = serde_json::from_slice(&bytes).map_err(|e| CoreError::Internal {
                reason: format!("corrupt audit device record '{key}': {e}"),
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// The currently registered devices (persisted or startup-configured).
    pub async fn registered_audit_devices(&self) -> Vec<AuditDeviceInfo> {
        self.audit.devices().await
    }

    // ── privileged ceremonies ───────────────────────────────────────

    /// Rotate the barrier's data key (append a new keyring term).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Barrier`] variants.
    pub async fn rotate(&self) -> Result<u32, CoreError> {
        Ok(self.barrier.rotate().await?)
    }

    /// Start the generate-root ceremony.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Seal`] variants.
    pub async fn generate_root_init(&self) -> Result<String, CoreError> {
        Ok(self.generate_root.init().await?)
    }

    /// Submit a share to the generate-root ceremony; returns the fresh
    /// root token when the quorum completes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Seal`] variants.
    pub async fn generate_root_submit(
        &self,
        nonce: &str,
        share: &str,
    ) -> Result<Option<String>, CoreError> {
        if self.generate_root.submit_share(nonce, share).await? {
            let token = self.tokens.create_root().await?;
            return Ok(Some(token));
        }
        Ok(None)
    }

    /// Cancel the generate-root ceremony.
    pub async fn generate_root_cancel(&self) {
        self.generate_root.cancel().await;
    }

    /// The generate-root ceremony status.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Seal`] variants.
    pub async fn generate_root_status(
        &self,
    ) -> Result<crate::rekey::GenerateRootStatus, CoreError> {
        Ok(self.generate_root.status().await?)
    }

    async fn audit_event(
        &self,
        request: &Request,
        token: &TokenEntry,
        entry_type: &str,
        error: Option<&str>,
    ) -> Result<(), CoreError> {
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            entry_type: entry_type.to_owned(),
            operation: request.operation.to_string(),
            path: request.path.clone(),
            token_hmac: self.audit.hmac(
                request.client_token.as_deref().unwrap_or_default(),
            ),
            policies: token.policies.clone(),
            remote_addr: request.remote_addr.clone(),
            error: error.map(ToOwned::to_owned),
        };
        self.audit.log(&entry).await?;
        Ok(())
    }
}

/// Build the sink described by an audit-device record.
fn build_audit_sink(entry: &AuditDeviceEntry) -> Result<Arc<dyn AuditSink>, CoreError> {
    match entry.sink_type.as_str() {
        "file" => {
            let path = entry.options.get("file_path").ok_or_else(|| {
                CoreError::InvalidRequest {
                    reason: "file audit device requires a 'file_path' option".to_owned(),
                }
            })?;
            Ok(Arc::new(FileAuditSink::new(path, entry.blocking)))
        }
        other => Err(CoreError::InvalidRequest {
            reason: format!("unknown audit device type: {other}"),
        }),
    }
}

/// Check a token's CIDR bindings against the request source.
fn check_cidr_binding(
    token: &TokenEntry,
    remote_addr: Option<&str>,
) -> Result<(), CoreError> {
    if token.bound_cidrs.is_empty() {
        return Ok(());
    }
    let Some(addr) = remote_addr else {
        return Err(CoreError::PermissionDenied {
            reason: "token is CIDR-bound but the request has no source address".to_owned(),
        });
    };
    let Ok(ip) = addr
        .split(':')
        .next()
        .unwrap_or(addr)
        .parse::<std::net::Ipv4Addr>()
    else {
        return Err(CoreError::PermissionDenied {
            reason: "unparseable source address".to_owned(),
        });
    };

    for cidr in &token.bound_cidrs {
        if cidr_contains(cidr, ip) {
            return Ok(());
        }
    }
    Err(CoreError::PermissionDenied {
        reason: "source address outside the token's bound CIDRs".to_owned(),
    })
}

fn cidr_contains(cidr: &str, ip: std::net::Ipv4Addr) -> bool {
    let (network, bits) = match cidr.split_once('/') {
        Some((network, bits)) => (network, bits),
        None => (cidr, "32"),
    };
    let (Ok(network), Ok(bits)) = (network.parse::<std::net::Ipv4Addr>(), bits.parse::<u32>())
    else {
        return false;
    };
    if bits > 32 {
        return false;
    }
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("node_id", &self.config.node_id)
            .finish_non_exhaustive()
    }
}
