//! The expiration manager.
//!
//! Tracks leases on everything the server hands out: secrets with TTLs and
//! auth tokens. An in-memory priority queue orders leases by
//! `expire_time`, backed by persisted records under
//! `sys/expire/id/<sha256(lease_id)>` so a crash mid-revocation re-queues
//! on recovery (at-least-once delivery).
//!
//! A background loop pops due leases and invokes the revoker for the
//! lease's path (the issuing engine via the router, or the token store for
//! auth leases). Failed revocations retry with exponential backoff up to a
//! cap, then are marked irrevocable — queryable, and retried by a periodic
//! sweep. Forced revocation removes the record without contacting the
//! engine; the operator explicitly accepts orphaned side effects.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{info, warn};

use crate::barrier::Barrier;
use crate::engine::CubbyholeEngine;
use crate::error::{EngineError, LeaseError};
use crate::router::{Operation, Request, Router};
use crate::token::{TokenEntry, TokenStore};

/// Storage prefix for lease records, keyed by `sha256(lease_id)`.
const LEASE_PREFIX: &str = "sys/expire/id/";
/// Storage prefix for the token → lease index.
const TOKEN_INDEX_PREFIX: &str = "sys/expire/token/";

/// Revocation attempts before a lease is marked irrevocable.
const MAX_REVOKE_ATTEMPTS: u32 = 6;
/// Base of the exponential revocation backoff.
const REVOKE_BACKOFF_BASE_SECS: i64 = 10;
/// Background loop tick.
const TICK_INTERVAL: StdDuration = StdDuration::from_secs(1);
/// Ticks between irrevocable-lease sweeps.
const SWEEP_EVERY_TICKS: u64 = 600;

/// A persisted lease record. Exactly one of `secret_data` /
/// `auth_token_hash` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseEntry {
    /// Full lease ID (`<path>/<random>`).
    pub lease_id: String,
    /// Hash of the client token the lease was issued to.
    pub client_token_hash: String,
    /// The issuing request path (routes revocation back to the engine).
    pub path: String,
    /// Engine data needed for revocation (dynamic secrets).
    pub secret_data: Option<serde_json::Value>,
    /// For auth leases: the token this lease expires.
    pub auth_token_hash: Option<String>,
    /// When the lease was issued.
    pub issue_time: DateTime<Utc>,
    /// When the lease expires.
    pub expire_time: DateTime<Utc>,
    /// Last successful renewal.
    pub last_renewal: Option<DateTime<Utc>>,
    /// Renewal ceiling measured from issue time (0 = none).
    pub max_ttl_secs: i64,
    /// Owning namespace.
    pub namespace: String,
    /// Whether the lease may be renewed.
    pub renewable: bool,
    /// Failed revocation attempts so far.
    #[serde(default)]
    pub revoke_attempts: u32,
    /// Set when revocation gave up; the sweep retries these.
    #[serde(default)]
    pub irrevocable: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueItem {
    expire_time: DateTime<Utc>,
    lease_id: String,
}

/// Lease registration, renewal, revocation, and the expiry loop.
pub struct ExpirationManager {
    barrier: Arc<Barrier>,
    router: Arc<Router>,
    token_store: Arc<TokenStore>,
    cubbyhole: RwLock<Option<Arc<CubbyholeEngine>>>,
    queue: Mutex<BinaryHeap<Reverse<QueueItem>>>,
}

impl ExpirationManager {
    /// Create an expiration manager.
    #[must_use]
    pub fn new(
        barrier: Arc<Barrier>,
        router: Arc<Router>,
        token_store: Arc<TokenStore>,
    ) -> Self {
        Self {
            barrier,
            router,
            token_store,
            cubbyhole: RwLock::new(None),
            queue: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Attach the cubbyhole engine so expiring auth leases wipe the
    /// token's compartment.
    pub async fn set_cubbyhole(&self, engine: Arc<CubbyholeEngine>) {
        *self.cubbyhole.write().await = Some(engine);
    }

    /// Register a lease for a secret returned with a TTL.
    ///
    /// Returns the lease ID.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] on storage failure.
    pub async fn register(
        &self,
        path: &str,
        secret_data: Option<serde_json::Value>,
        ttl_secs: i64,
        max_ttl_secs: i64,
        client_token_hash: &str,
        namespace: &str,
        renewable: bool,
    ) -> Result<String, LeaseError> {
        let lease_id = format!("{path}/{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now();
        let entry = LeaseEntry {
            lease_id: lease_id.clone(),
            client_token_hash: client_token_hash.to_owned(),
            path: path.to_owned(),
            secret_data,
            auth_token_hash: None,
            issue_time: now,
            expire_time: now + Duration::seconds(ttl_secs.max(1)),
            last_renewal: None,
            max_ttl_secs,
            namespace: namespace.to_owned(),
            renewable,
            revoke_attempts: 0,
            irrevocable: None,
        };

        self.persist(&entry).await?;
        self.index_by_token(&entry).await?;
        self.enqueue(&entry).await;

        info!(lease_id = %lease_id, ttl = ttl_secs, "secret lease registered");
        Ok(lease_id)
    }

    /// Register the auth lease for a newly issued service token.
    ///
    /// Non-expiring tokens (TTL 0) get no lease. Returns the lease ID when
    /// one was created.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] on storage failure.
    pub async fn register_auth(
        &self,
        token: &TokenEntry,
        path: &str,
    ) -> Result<Option<String>, LeaseError> {
        let Some(expire_time) = token.expires_at() else {
            return Ok(None);
        };

        let lease_id = format!("{path}/{}", uuid::Uuid::new_v4().simple());
        let entry = LeaseEntry {
            lease_id: lease_id.clone(),
            client_token_hash: token.token_hash.clone(),
            path: path.to_owned(),
            secret_data: None,
            auth_token_hash: Some(token.token_hash.clone()),
            issue_time: token.creation_time,
            expire_time,
            last_renewal: None,
            max_ttl_secs: token.explicit_max_ttl_secs,
            namespace: "root".to_owned(),
            renewable: token.renewable,
            revoke_attempts: 0,
            irrevocable: None,
        };

        self.persist(&entry).await?;
        self.index_by_token(&entry).await?;
        self.enqueue(&entry).await;

        info!(lease_id = %lease_id, "auth lease registered");
        Ok(Some(lease_id))
    }

    /// Look up a lease.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::NotFound`] for unknown lease IDs.
    pub async fn lookup(&self, lease_id: &str) -> Result<LeaseEntry, LeaseError> {
        self.load(lease_id).await?.ok_or_else(|| LeaseError::NotFound {
            lease_id: lease_id.to_owned(),
        })
    }

    /// Renew a lease.
    ///
    /// The new expiry is `min(now + increment, issue_time + max_ttl)`.
    /// Engine-side renewal is attempted first (engines that track external
    /// state must extend it); engine failure leaves the old expiration in
    /// place. Expiry never moves backwards.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] / [`LeaseError::NotRenewable`].
    /// - [`LeaseError::RevocationFailed`] if the engine rejected renewal.
    pub async fn renew(
        &self,
        lease_id: &str,
        increment_secs: i64,
    ) -> Result<LeaseEntry, LeaseError> {
        let mut entry = self.lookup(lease_id).await?;
        if !entry.renewable {
            return Err(LeaseError::NotRenewable {
                lease_id: lease_id.to_owned(),
            });
        }

        // Engine-side renewal for secret leases (e.g. database password
        // extension). Engines without renewal state report unsupported,
        // which is fine; real failures abort with the old expiry intact.
        if entry.auth_token_hash.is_none() {
            let mut request = Request::new(Operation::Renew, &entry.path);
            request.data = entry.secret_data.clone();
            match self.router.route(request).await {
                Ok(_)
                | Err(EngineError::UnsupportedOperation { .. })
                | Err(EngineError::NotFound { .. }) => {}
                Err(e) => {
                    return Err(LeaseError::RevocationFailed {
                        lease_id: lease_id.to_owned(),
                        reason: format!("engine renewal failed: {e}"),
                    });
                }
            }
        }

        let now = Utc::now();
        let mut new_expiry = now + Duration::seconds(increment_secs.max(1));
        if entry.max_ttl_secs > 0 {
            let ceiling = entry.issue_time + Duration::seconds(entry.max_ttl_secs);
            if new_expiry > ceiling {
                new_expiry = ceiling;
            }
        }
        // Monotonic: a renewal cannot shorten the lease.
        if new_expiry > entry.expire_time {
            entry.expire_time = new_expiry;
        }
        entry.last_renewal = Some(now);

        self.persist(&entry).await?;
        self.enqueue(&entry).await;

        info!(lease_id = %lease_id, expire = %entry.expire_time, "lease renewed");
        Ok(entry)
    }

    /// Revoke a lease now.
    ///
    /// With `force`, the record is removed without contacting the engine —
    /// any data-source side effects are orphaned.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] for unknown lease IDs.
    /// - [`LeaseError::RevocationFailed`] if the engine refused (the
    ///   record is kept and retried by the background loop).
    pub async fn revoke(&self, lease_id: &str, force: bool) -> Result<(), LeaseError> {
        let entry = self.lookup(lease_id).await?;
        if force {
            self.remove(&entry).await?;
            info!(lease_id = %lease_id, "lease force-revoked");
            return Ok(());
        }
        self.revoke_entry(entry).await
    }

    /// Revoke every lease issued to a token (used when a token dies).
    /// Child-lease failures are left to the background retry machinery.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] on storage failure.
    pub async fn revoke_by_token(&self, token_hash: &str) -> Result<(), LeaseError> {
        let index_prefix = format!("{TOKEN_INDEX_PREFIX}{token_hash}/");
        for index_key in self.barrier.list(&index_prefix).await? {
            let Some(bytes) = self.barrier.get(&index_key).await? else {
                continue;
            };
            let lease_id = String::from_utf8_lossy(&bytes).into_owned();
            if let Ok(entry) = self.lookup(&lease_id).await {
                if let Err(e) = self.revoke_entry(entry).await {
                    warn!(lease_id = %lease_id, error = %e, "token-cascade revocation deferred");
                }
            }
        }
        Ok(())
    }

    /// Revoke every lease whose path starts with `prefix` (engine
    /// unmount).
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] on storage failure.
    pub async fn revoke_prefix(&self, prefix: &str, force: bool) -> Result<u64, LeaseError> {
        let mut count = 0;
        for entry in self.all_leases().await? {
            if !entry.path.starts_with(prefix) {
                continue;
            }
            let result = if force {
                self.remove(&entry).await
            } else {
                self.revoke_entry(entry).await
            };
            match result {
                Ok(()) => count += 1,
                Err(e) => warn!(error = %e, "prefix revocation deferred"),
            }
        }
        info!(prefix = %prefix, count, "leases revoked by prefix");
        Ok(count)
    }

    /// Rewrite lease paths under `old` to `new` (remount).
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] on storage failure.
    pub async fn rewrite_prefix(&self, old: &str, new: &str) -> Result<(), LeaseError> {
        for entry in self.all_leases().await? {
            let Some(rest) = entry.lease_id.strip_prefix(old) else {
                continue;
            };
            let mut moved = entry.clone();
            moved.lease_id = format!("{new}{rest}");
            moved.path = entry
                .path
                .strip_prefix(old)
                .map_or_else(|| entry.path.clone(), |p| format!("{new}{p}"));

            self.remove(&entry).await?;
            self.persist(&moved).await?;
            self.index_by_token(&moved).await?;
            self.enqueue(&moved).await;
        }
        Ok(())
    }

    /// Leases whose revocation has been given up on (until the next
    /// sweep).
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] on storage failure.
    pub async fn irrevocable_leases(&self) -> Result<Vec<LeaseEntry>, LeaseError> {
        Ok(self
            .all_leases()
            .await?
            .into_iter()
            .filter(|entry| entry.irrevocable.is_some())
            .collect())
    }

    /// Move a token's auth lease to a new expiry (after token renewal).
    /// Expiry never moves backwards.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] on storage failure.
    pub async fn sync_auth_lease(
        &self,
        token_hash: &str,
        expire_time: DateTime<Utc>,
    ) -> Result<(), LeaseError> {
        let index_prefix = format!("{TOKEN_INDEX_PREFIX}{token_hash}/");
        for index_key in self.barrier.list(&index_prefix).await? {
            let Some(bytes) = self.barrier.get(&index_key).await? else {
                continue;
            };
            let lease_id = String::from_utf8_lossy(&bytes).into_owned();
            let Some(mut entry) = self.load(&lease_id).await? else {
                continue;
            };
            if entry.auth_token_hash.as_deref() != Some(token_hash) {
                continue;
            }
            if expire_time > entry.expire_time {
                entry.expire_time = expire_time;
                entry.last_renewal = Some(Utc::now());
                self.persist(&entry).await?;
                self.enqueue(&entry).await;
            }
        }
        Ok(())
    }

    /// Number of persisted lease records.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] on storage failure.
    pub async fn lease_count(&self) -> Result<usize, LeaseError> {
        Ok(self.barrier.list(LEASE_PREFIX).await?.len())
    }

    /// Reload every persisted lease into the queue (post-unseal restore).
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] on storage failure.
    pub async fn restore(&self) -> Result<usize, LeaseError> {
        let leases = self.all_leases().await?;
        let count = leases.len();
        let mut queue = self.queue.lock().await;
        queue.clear();
        for entry in leases {
            queue.push(Reverse(QueueItem {
                expire_time: entry.expire_time,
                lease_id: entry.lease_id,
            }));
        }
        drop(queue);
        info!(count, "lease queue restored");
        Ok(count)
    }

    /// Run the expiry loop until `shutdown` flips. Spawn on a worker task.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        let mut ticks: u64 = 0;
        info!("expiration loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    ticks = ticks.wrapping_add(1);
                    self.tick().await;
                    if ticks % SWEEP_EVERY_TICKS == 0 {
                        self.sweep_irrevocable().await;
                    }
                }
                _ = shutdown.changed() => {
                    info!("expiration loop stopping");
                    return;
                }
            }
        }
    }

    /// One pass over due queue items. Exposed for deterministic tests.
    pub async fn tick(&self) {
        let now = Utc::now();
        loop {
            let item = {
                let mut queue = self.queue.lock().await;
                match queue.peek() {
                    Some(Reverse(item)) if item.expire_time <= now => {
                        queue.pop().map(|Reverse(item)| item)
                    }
                    _ => None,
                }
            };
            let Some(item) = item else { return };

            let entry = match self.load(&item.lease_id).await {
                Ok(Some(entry)) => entry,
                // Already revoked or renamed; the queue item is stale.
                Ok(None) => continue,
                Err(e) => {
                    warn!(lease_id = %item.lease_id, error = %e, "lease load failed during expiry");
                    continue;
                }
            };

            // A renewal moved the expiry; requeue at the new time.
            if entry.expire_time > now {
                self.enqueue(&entry).await;
                continue;
            }
            if entry.irrevocable.is_some() {
                continue;
            }

            if let Err(e) = self.revoke_entry(entry).await {
                warn!(lease_id = %item.lease_id, error = %e, "lease revocation deferred");
            }
        }
    }

    /// Requeue irrevocable leases for another round of attempts.
    async fn sweep_irrevocable(&self) {
        let leases = match self.irrevocable_leases().await {
            Ok(leases) => leases,
            Err(e) => {
                warn!(error = %e, "irrevocable sweep failed");
                return;
            }
        };
        for mut entry in leases {
            entry.irrevocable = None;
            entry.revoke_attempts = 0;
            entry.expire_time = Utc::now();
            if self.persist(&entry).await.is_ok() {
                self.enqueue(&entry).await;
            }
        }
    }

    /// Attempt revocation; on failure, schedule a backoff retry or mark
    /// irrevocable once attempts are exhausted.
    async fn revoke_entry(&self, mut entry: LeaseEntry) -> Result<(), LeaseError> {
        match self.run_revoker(&entry).await {
            Ok(()) => {
                self.remove(&entry).await?;
                info!(lease_id = %entry.lease_id, "lease revoked");
                Ok(())
            }
            Err(reason) => {
                entry.revoke_attempts = entry.revoke_attempts.saturating_add(1);
                if entry.revoke_attempts >= MAX_REVOKE_ATTEMPTS {
                    entry.irrevocable = Some(reason.clone());
                    self.persist(&entry).await?;
                    warn!(lease_id = %entry.lease_id, %reason, "lease marked irrevocable");
                } else {
                    let backoff = REVOKE_BACKOFF_BASE_SECS
                        .saturating_mul(1_i64 << entry.revoke_attempts.min(16));
                    entry.expire_time = Utc::now() + Duration::seconds(backoff);
                    self.persist(&entry).await?;
                    self.enqueue(&entry).await;
                }
                Err(LeaseError::RevocationFailed {
                    lease_id: entry.lease_id.clone(),
                    reason,
                })
            }
        }
    }

    async fn run_revoker(&self, entry: &LeaseEntry) -> Result<(), String> {
        if let Some(token_hash) = &entry.auth_token_hash {
            self.token_store
                .revoke_by_hash(token_hash)
                .await
                .map_err(|e| e.to_string())?;
            if let Some(cubbyhole) = self.cubbyhole.read().await.as_ref() {
                cubbyhole
                    .wipe(token_hash)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            return Ok(());
        }

        let mut request = Request::new(Operation::Revoke, &entry.path);
        request.data = entry.secret_data.clone();
        match self.router.route(request).await {
            Ok(_) => Ok(()),
            // The mount is gone; there is nothing left to contact.
            Err(EngineError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn enqueue(&self, entry: &LeaseEntry) {
        self.queue.lock().await.push(Reverse(QueueItem {
            expire_time: entry.expire_time,
            lease_id: entry.lease_id.clone(),
        }));
    }

    async fn persist(&self, entry: &LeaseEntry) -> Result<(), LeaseError> {
        let bytes = serde_json::to_vec(entry).map_err(|e| LeaseError::Corrupt {
            reason: e.to_string(),
        })?;
        self.barrier
            .put(&format!("{LEASE_PREFIX}{}", hash_lease_id(&entry.lease_id)), &bytes)
            .await?;
        Ok(())
    }

    async fn index_by_token(&self, entry: &LeaseEntry) -> Result<(), LeaseError> {
        self.barrier
            .put(
                &format!(
                    "{TOKEN_INDEX_PREFIX}{}/{}",
                    entry.client_token_hash,
                    hash_lease_id(&entry.lease_id)
                ),
                entry.lease_id.as_bytes(),
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, entry: &LeaseEntry) -> Result<(), LeaseError> {
        self.barrier
            .delete(&format!("{LEASE_PREFIX}{}", hash_lease_id(&entry.lease_id)))
            .await?;
        self.barrier
            .delete(&format!(
                "{TOKEN_INDEX_PREFIX}{}/{}",
                entry.client_token_hash,
                hash_lease_id(&entry.lease_id)
            ))
            .await?;
        Ok(())
    }

    async fn load(&self, lease_id: &str) -> Result<Option<LeaseEntry>, LeaseError> {
        let key = format!("{LEASE_PREFIX}{}", hash_lease_id(lease_id));
        let Some(bytes) = self.barrier.get(&key).await? else {
            return Ok(None);
        };
        let entry = serde_json::from_slice(&bytes).map_err(|e| LeaseError::Corrupt {
            reason: e.to_string(),
        })?;
        Ok(Some(entry))
    }

    async fn all_leases(&self) -> Result<Vec<LeaseEntry>, LeaseError> {
        let mut leases = Vec::new();
        for key in self.barrier.list(LEASE_PREFIX).await? {
            let Some(bytes) = self.barrier.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice(&bytes) {
                Ok(entry) => leases.push(entry),
                Err(e) => warn!(key = %key, error = %e, "skipping corrupt lease record"),
            }
        }
        Ok(leases)
    }
}

fn hash_lease_id(lease_id: &str) -> String {
    hex::encode(Sha256::digest(lease_id.as_bytes()))
}

impl std::fmt::Debug for ExpirationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::AeadAlgorithm;
    use crate::engine::KvEngine;
    use crate::mount::MountEntry;
    use crate::router::{BarrierView, RouteEntry};
    use crate::token::CreateTokenParams;
    use strongbox_storage::MemoryBackend;

    struct Fixture {
        barrier: Arc<Barrier>,
        router: Arc<Router>,
        tokens: Arc<TokenStore>,
        expiration: Arc<ExpirationManager>,
    }

    async fn fixture() -> Fixture {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        barrier.initialize(AeadAlgorithm::Aes256Gcm).await.unwrap();
        let router = Arc::new(Router::new());

        let mount = MountEntry::new("secret/", "kv");
        let view = BarrierView::new(Arc::clone(&barrier), mount.storage_prefix());
        router
            .mount(RouteEntry {
                mount,
                engine: Arc::new(KvEngine::new(view)),
            })
            .await;

        let tokens = Arc::new(TokenStore::new(Arc::clone(&barrier)));
        let expiration = Arc::new(ExpirationManager::new(
            Arc::clone(&barrier),
            Arc::clone(&router),
            Arc::clone(&tokens),
        ));
        Fixture {
            barrier,
            router,
            tokens,
            expiration,
        }
    }

    async fn backdate(fixture: &Fixture, lease_id: &str) {
        let mut entry = fixture.expiration.lookup(lease_id).await.unwrap();
        entry.expire_time = Utc::now() - Duration::seconds(5);
        fixture.expiration.persist(&entry).await.unwrap();
        fixture.expiration.enqueue(&entry).await;
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let fixture = fixture().await;
        let lease_id = fixture
            .expiration
            .register("secret/data/app", None, 600, 3600, "tok-hash", "root", true)
            .await
            .unwrap();

        let entry = fixture.expiration.lookup(&lease_id).await.unwrap();
        assert_eq!(entry.path, "secret/data/app");
        assert!(entry.renewable);
    }

    #[tokio::test]
    async fn unknown_lease_is_not_found() {
        let fixture = fixture().await;
        assert!(matches!(
            fixture.expiration.lookup("nope").await,
            Err(LeaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn renewal_is_monotonic_and_clamped() {
        let fixture = fixture().await;
        let lease_id = fixture
            .expiration
            .register("secret/data/app", None, 600, 1200, "tok", "root", true)
            .await
            .unwrap();

        let before = fixture.expiration.lookup(&lease_id).await.unwrap();
        let renewed = fixture.expiration.renew(&lease_id, 900).await.unwrap();
        assert!(renewed.expire_time >= before.expire_time);

        // A huge increment clamps to issue_time + max_ttl.
        let renewed = fixture.expiration.renew(&lease_id, 1_000_000).await.unwrap();
        let ceiling = renewed.issue_time + Duration::seconds(1200);
        assert!(renewed.expire_time <= ceiling + Duration::seconds(1));

        // Renewal past the ceiling cannot shorten the lease either.
        let again = fixture.expiration.renew(&lease_id, 1).await.unwrap();
        assert!(again.expire_time >= renewed.expire_time - Duration::seconds(1));
    }

    #[tokio::test]
    async fn expired_lease_is_revoked_by_tick() {
        let fixture = fixture().await;
        let lease_id = fixture
            .expiration
            .register("secret/data/app", None, 1, 0, "tok", "root", true)
            .await
            .unwrap();
        backdate(&fixture, &lease_id).await;

        fixture.expiration.tick().await;

        assert!(matches!(
            fixture.expiration.lookup(&lease_id).await,
            Err(LeaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn renewed_lease_survives_stale_queue_item() {
        let fixture = fixture().await;
        let lease_id = fixture
            .expiration
            .register("secret/data/app", None, 1, 0, "tok", "root", true)
            .await
            .unwrap();

        // Renew far into the future; the original queue item is now stale.
        fixture.expiration.renew(&lease_id, 3600).await.unwrap();
        fixture.expiration.tick().await;

        fixture.expiration.lookup(&lease_id).await.unwrap();
    }

    #[tokio::test]
    async fn auth_lease_revocation_kills_token() {
        let fixture = fixture().await;
        let (token, entry) = fixture
            .tokens
            .create(CreateTokenParams {
                policies: vec!["default".to_owned()],
                ttl_secs: 1,
                renewable: true,
                display_name: "short".to_owned(),
                ..CreateTokenParams::default()
            })
            .await
            .unwrap();

        let lease_id = fixture
            .expiration
            .register_auth(&entry, "auth/token/create")
            .await
            .unwrap()
            .unwrap();
        backdate(&fixture, &lease_id).await;

        fixture.expiration.tick().await;

        assert!(fixture.tokens.lookup(&token).await.is_err());
        assert!(matches!(
            fixture.expiration.lookup(&lease_id).await,
            Err(LeaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn non_expiring_token_gets_no_lease() {
        let fixture = fixture().await;
        let (_token, entry) = fixture
            .tokens
            .create(CreateTokenParams {
                policies: vec!["root".to_owned()],
                ttl_secs: 0,
                display_name: "root".to_owned(),
                ..CreateTokenParams::default()
            })
            .await
            .unwrap();
        let lease = fixture
            .expiration
            .register_auth(&entry, "auth/token/create")
            .await
            .unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test]
    async fn revoke_by_token_clears_all_leases() {
        let fixture = fixture().await;
        for i in 0..3 {
            fixture
                .expiration
                .register(
                    &format!("secret/data/a{i}"),
                    None,
                    600,
                    0,
                    "shared-token-hash",
                    "root",
                    true,
                )
                .await
                .unwrap();
        }

        fixture
            .expiration
            .revoke_by_token("shared-token-hash")
            .await
            .unwrap();

        let remaining = fixture.expiration.all_leases().await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn unmounted_engine_revocation_succeeds() {
        let fixture = fixture().await;
        let lease_id = fixture
            .expiration
            .register("ghost/creds/x", None, 1, 0, "tok", "root", true)
            .await
            .unwrap();
        // No mount at ghost/ — revocation treats it as nothing-to-do.
        fixture.expiration.revoke(&lease_id, false).await.unwrap();
        assert!(fixture.expiration.all_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_revoke_skips_the_engine() {
        let fixture = fixture().await;
        let lease_id = fixture
            .expiration
            .register("secret/data/app", None, 600, 0, "tok", "root", true)
            .await
            .unwrap();
        fixture.expiration.revoke(&lease_id, true).await.unwrap();
        assert!(matches!(
            fixture.expiration.lookup(&lease_id).await,
            Err(LeaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn restore_requeues_persisted_leases() {
        let fixture = fixture().await;
        fixture
            .expiration
            .register("secret/data/app", None, 600, 0, "tok", "root", true)
            .await
            .unwrap();

        // A fresh manager over the same storage sees the records.
        let fresh = Arc::new(ExpirationManager::new(
            Arc::clone(&fixture.barrier),
            Arc::clone(&fixture.router),
            Arc::clone(&fixture.tokens),
        ));
        let count = fresh.restore().await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn rewrite_prefix_moves_leases() {
        let fixture = fixture().await;
        let lease_id = fixture
            .expiration
            .register("old/creds/x", None, 600, 0, "tok", "root", true)
            .await
            .unwrap();

        fixture.expiration.rewrite_prefix("old/", "new/").await.unwrap();

        assert!(matches!(
            fixture.expiration.lookup(&lease_id).await,
            Err(LeaseError::NotFound { .. })
        ));
        let moved = fixture.expiration.all_leases().await.unwrap();
        assert_eq!(moved.len(), 1);
        assert!(moved[0].lease_id.starts_with("new/creds/x/"));
        assert!(moved[0].path.starts_with("new/"));
    }
}
