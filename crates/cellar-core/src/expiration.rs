//! Lease expiration manager for `cellar`.
//!
//! Every lease handed out by a backend (and every token with a TTL) is
//! recorded here and revoked when it expires, is explicitly revoked, or its
//! owning token is revoked.
//!
//! # Lifecycle
//!
//! ```text
//! Active ──renew──▶ Active (new expiry)
//!   │
//!   └─expiry / revoke / token revoked──▶ Revoking ──backend ok──▶ (record deleted)
//!                                          │
//!                                          └─retries exhausted──▶ Stuck | dropped
//! ```
//!
//! A lease record is only deleted once its backend confirms revocation (or an
//! operator forces it). Failed revocations are retried with exponential
//! backoff; once the retry budget is spent the configured
//! [`ExhaustedRevocationPolicy`] decides between flagging the lease as stuck
//! and dropping it.
//!
//! # Scheduling
//!
//! Wake-ups live in one min-heap drained by a single loop. Due leases are
//! revoked as independent tasks, at most `workers` at a time, so a slow
//! backend never holds up other timers. Renewals push a new heap entry and
//! bump the lease's generation, which turns older entries into no-ops.
//! Renew and revoke on the same lease are serialized by a per-lease lock.
//!
//! # Storage layout
//!
//! - `sys/expire/id/<lease-id>`: the lease record
//! - `sys/expire/token/<token-hash>/<lease-id>`: leases owned by a token

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::SecretLease;
use crate::barrier::Barrier;
use crate::config::{CoreConfig, ExhaustedRevocationPolicy};
use crate::error::{ErrorKind, LeaseError, TokenError};
use crate::mount::MountEntry;
use crate::router::Router;
use crate::token::{TokenStore, short_hash};

/// Storage prefix for lease records.
pub const LEASE_PREFIX: &str = "sys/expire/id/";

/// Storage prefix for the token → lease index.
pub const TOKEN_INDEX_PREFIX: &str = "sys/expire/token/";

/// Issuing path recorded on token leases.
pub const TOKEN_LEASE_PATH: &str = "auth/token/create";

/// How long the loop sleeps when nothing is scheduled.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// Longest single sleep; later deadlines are re-armed when reached.
const MAX_SLEEP: Duration = Duration::from_secs(24 * 3600);

/// What a lease grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseKind {
    /// A secret issued by a mounted backend.
    Secret,
    /// An authentication token.
    Token,
}

/// Revocation state of a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LeaseState {
    /// Valid until `expire_at`.
    Active,
    /// Revocation has started and not yet been confirmed.
    Revoking {
        /// Failed attempts so far.
        attempts: u32,
        /// Most recent failure.
        last_error: Option<String>,
    },
    /// Retries are exhausted; waiting for an operator.
    Stuck {
        /// Failed attempts so far.
        attempts: u32,
        /// Most recent failure.
        last_error: String,
    },
}

/// A persisted lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseEntry {
    /// `<mount-uuid>.<random>` for secrets, `auth.<random>` for tokens.
    pub lease_id: String,
    /// Full logical path the lease was issued for.
    pub path: String,
    /// Hash of the token that requested the lease.
    pub token_hash: Option<String>,
    /// What the lease grants.
    pub kind: LeaseKind,
    /// Opaque backend data handed back on renew and revoke.
    pub internal: serde_json::Value,
    /// When the lease was issued.
    pub issued_at: DateTime<Utc>,
    /// When the lease was last renewed.
    pub last_renewed: Option<DateTime<Utc>>,
    /// When the lease expires.
    pub expire_at: DateTime<Utc>,
    /// TTL granted at issue or last renewal, in seconds.
    pub ttl_secs: u64,
    /// Whether the lease may be renewed.
    pub renewable: bool,
    /// Revocation state.
    pub state: LeaseState,
}

impl LeaseEntry {
    /// Time left before expiry.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        (self.expire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// `base + ttl`, saturating at the latest representable time.
pub(crate) fn expiry_after(base: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| base.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// A caller asked for the revocation.
    Explicit,
    /// The lease's timer fired.
    Timer,
    /// The owning token tree is being revoked by the caller, so token leases
    /// are only forgotten, not recursed into.
    Cascade,
}

struct Tracked {
    path: String,
    generation: u64,
    stuck: bool,
    /// Why the record could not be read back on restore.
    unreadable: Option<String>,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Wakeup {
    at: Instant,
    generation: u64,
    lease_id: String,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Tracks, renews, and revokes leases.
pub struct ExpirationManager {
    barrier: Arc<Barrier>,
    router: Arc<Router>,
    tokens: Arc<TokenStore>,
    config: CoreConfig,
    /// Every non-terminal lease known to this process.
    tracked: DashMap<String, Tracked>,
    heap: Mutex<BinaryHeap<Reverse<Wakeup>>>,
    generation: AtomicU64,
    locks: DashMap<String, Arc<Mutex<()>>>,
    wake: Notify,
    worker: Mutex<Option<Worker>>,
}

impl ExpirationManager {
    /// Create a manager. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(
        barrier: Arc<Barrier>,
        router: Arc<Router>,
        tokens: Arc<TokenStore>,
        config: CoreConfig,
    ) -> Self {
        Self {
            barrier,
            router,
            tokens,
            config,
            tracked: DashMap::new(),
            heap: Mutex::new(BinaryHeap::new()),
            generation: AtomicU64::new(0),
            locks: DashMap::new(),
            wake: Notify::new(),
            worker: Mutex::new(None),
        }
    }

    /// Record a lease issued by the backend mounted at `mount`.
    ///
    /// The TTL is the backend's request or the mount default, clamped to the
    /// mount's (and the system's) maximum.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] if the record cannot be persisted.
    pub async fn register(
        &self,
        mount: &MountEntry,
        path: &str,
        token_hash: Option<&str>,
        secret: &SecretLease,
    ) -> Result<LeaseEntry, LeaseError> {
        let max = mount.config.max_ttl(self.config.max_lease_ttl);
        let ttl = secret
            .ttl
            .unwrap_or_else(|| {
                mount
                    .config
                    .default_ttl(self.config.default_lease_ttl, self.config.max_lease_ttl)
            })
            .min(max);
        let lease_id = format!("{}.{}", mount.uuid, uuid::Uuid::new_v4().simple());

        self.record(
            lease_id,
            path,
            token_hash,
            LeaseKind::Secret,
            secret.internal.clone(),
            ttl,
            secret.renewable,
        )
        .await
    }

    /// Record the lease backing a token with a TTL.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] if the record cannot be persisted.
    pub async fn register_token(
        &self,
        token_hash: &str,
        ttl: Duration,
        renewable: bool,
    ) -> Result<LeaseEntry, LeaseError> {
        let lease_id = format!("auth.{}", uuid::Uuid::new_v4().simple());
        self.record(
            lease_id,
            TOKEN_LEASE_PATH,
            Some(token_hash),
            LeaseKind::Token,
            serde_json::Value::Null,
            ttl.min(self.config.max_lease_ttl),
            renewable,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        lease_id: String,
        path: &str,
        token_hash: Option<&str>,
        kind: LeaseKind,
        internal: serde_json::Value,
        ttl: Duration,
        renewable: bool,
    ) -> Result<LeaseEntry, LeaseError> {
        let now = Utc::now();
        let entry = LeaseEntry {
            lease_id,
            path: path.to_owned(),
            token_hash: token_hash.map(str::to_owned),
            kind,
            internal,
            issued_at: now,
            last_renewed: None,
            expire_at: expiry_after(now, ttl),
            ttl_secs: ttl.as_secs(),
            renewable,
            state: LeaseState::Active,
        };

        self.persist(&entry).await?;
        if let Some(hash) = &entry.token_hash {
            self.barrier
                .put(&token_index_key(hash, &entry.lease_id), b"")
                .await?;
        }
        self.schedule(&entry.lease_id, &entry.path, entry.expire_at)
            .await;

        info!(
            lease_id = %entry.lease_id,
            path = %entry.path,
            ttl_secs = entry.ttl_secs,
            "lease registered"
        );
        Ok(entry)
    }

    /// Fetch a lease record.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if no such lease exists.
    /// - [`LeaseError::Barrier`] if storage fails.
    pub async fn lookup(&self, lease_id: &str) -> Result<LeaseEntry, LeaseError> {
        self.load(lease_id)
            .await?
            .ok_or_else(|| LeaseError::NotFound {
                lease_id: lease_id.to_owned(),
            })
    }

    /// IDs of every tracked lease issued at or under `prefix`.
    ///
    /// A prefix without a trailing `/` is a whole path segment: `kv` covers
    /// `kv` and `kv/...` but not `kvx/...`.
    pub fn lease_ids(&self, prefix: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tracked
            .iter()
            .filter(|tracked| path_is_under(&tracked.value().path, prefix))
            .map(|tracked| tracked.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// The auth lease backing a token. Tokens created without a TTL have none.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] if the index cannot be read.
    pub async fn token_lease(&self, token_hash: &str) -> Result<Option<LeaseEntry>, LeaseError> {
        for id in self.token_leases(token_hash).await? {
            if let Some(entry) = self.load(&id).await? {
                if entry.kind == LeaseKind::Token {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }

    /// Extend a lease.
    ///
    /// `increment` defaults to the lease's current TTL. The result is clamped
    /// to what the backend grants, the mount's maximum, and the system
    /// maximum measured from issue time.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if the lease does not exist or has expired.
    /// - [`LeaseError::NotRenewable`] if it is not renewable or is being revoked.
    /// - [`LeaseError::Renewal`] if the backend refuses.
    pub async fn renew(
        &self,
        lease_id: &str,
        increment: Option<Duration>,
    ) -> Result<LeaseEntry, LeaseError> {
        let lock = self.lease_lock(lease_id);
        let guard = lock.lock().await;
        let result = self.renew_locked(lease_id, increment).await;
        drop(guard);
        drop(lock);
        self.release_lock(lease_id);
        result
    }

    async fn renew_locked(
        &self,
        lease_id: &str,
        increment: Option<Duration>,
    ) -> Result<LeaseEntry, LeaseError> {
        let not_found = || LeaseError::NotFound {
            lease_id: lease_id.to_owned(),
        };
        let mut entry = self.load(lease_id).await?.ok_or_else(not_found)?;

        let now = Utc::now();
        if entry.state != LeaseState::Active || !entry.renewable {
            return Err(LeaseError::NotRenewable {
                lease_id: lease_id.to_owned(),
            });
        }
        if entry.expire_at <= now {
            return Err(not_found());
        }

        let requested = increment.unwrap_or(Duration::from_secs(entry.ttl_secs));
        let granted = match entry.kind {
            LeaseKind::Secret => self
                .router
                .route_renew(&entry.path, lease_id, &entry.internal, requested)
                .await
                .map_err(|source| LeaseError::Renewal {
                    lease_id: lease_id.to_owned(),
                    source,
                })?,
            LeaseKind::Token => requested,
        };

        let max = self.max_ttl_for(&entry).await;
        let ttl = granted.min(requested).min(max);
        let expire_at = expiry_after(now, ttl).min(expiry_after(entry.issued_at, max));

        if let (LeaseKind::Token, Some(hash)) = (entry.kind, &entry.token_hash) {
            self.tokens
                .set_expiry(hash, expire_at)
                .await
                .map_err(|source| LeaseError::Token {
                    lease_id: lease_id.to_owned(),
                    source,
                })?;
        }

        entry.expire_at = expire_at;
        entry.last_renewed = Some(now);
        entry.ttl_secs = u64::try_from((expire_at - now).num_seconds()).unwrap_or(0);
        self.persist(&entry).await?;
        self.schedule(&entry.lease_id, &entry.path, entry.expire_at)
            .await;

        info!(lease_id, ttl_secs = entry.ttl_secs, "lease renewed");
        Ok(entry)
    }

    /// Revoke a lease now.
    ///
    /// Revoking an unknown or already revoked lease succeeds. If the backend
    /// fails, the lease stays recorded in `Revoking` and is retried in the
    /// background; the error is still returned.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::Revocation`] if the backend did not confirm.
    /// - [`LeaseError::Barrier`] if storage fails.
    pub async fn revoke(&self, lease_id: &str) -> Result<(), LeaseError> {
        self.revoke_lease(lease_id, Trigger::Explicit).await
    }

    /// Revoke every lease issued at or under `prefix` (see
    /// [`lease_ids`](Self::lease_ids)). A prefix naming an existing lease ID
    /// revokes just that lease.
    ///
    /// Every lease is attempted even if some fail. Returns the number revoked.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Incomplete`] if any lease could not be revoked.
    pub async fn revoke_prefix(&self, prefix: &str) -> Result<usize, LeaseError> {
        if !prefix.is_empty() && !prefix.ends_with('/') && self.load(prefix).await?.is_some() {
            self.revoke(prefix).await?;
            return Ok(1);
        }
        let ids = self.lease_ids(prefix);
        let revoked = self.revoke_all(prefix, &ids, Trigger::Explicit).await?;
        info!(prefix, revoked, "lease prefix revoked");
        Ok(revoked)
    }

    /// Revoke every lease owned by `token_hash`, then the token itself and
    /// its descendants, deepest first.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Incomplete`] / [`LeaseError::Token`] if part of
    /// the tree could not be revoked. Tokens whose leases failed are kept so
    /// the revocation can be retried.
    pub async fn revoke_token_tree(&self, token_hash: &str) -> Result<(), LeaseError> {
        self.revoke_tree_boxed(token_hash.to_owned(), None).await
    }

    /// Stuck leases awaiting operator action.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] if storage fails.
    pub async fn stuck_leases(&self) -> Result<Vec<LeaseEntry>, LeaseError> {
        let ids: Vec<String> = self
            .tracked
            .iter()
            .filter(|tracked| tracked.value().stuck)
            .map(|tracked| tracked.key().clone())
            .collect();

        let mut stuck = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.unreadable_entry(&id) {
                stuck.push(entry);
            } else if let Some(entry) = self.load(&id).await? {
                stuck.push(entry);
            }
        }
        stuck.sort_by(|a, b| a.lease_id.cmp(&b.lease_id));
        Ok(stuck)
    }

    /// Delete a lease record without backend confirmation. Also clears
    /// records that could not be read back on restore.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if no such lease exists.
    /// - [`LeaseError::Barrier`] if storage fails.
    pub async fn force_revoke(&self, lease_id: &str) -> Result<LeaseEntry, LeaseError> {
        let lock = self.lease_lock(lease_id);
        let guard = lock.lock().await;
        let result = async {
            let entry = match self.unreadable_entry(lease_id) {
                Some(entry) => entry,
                None => self.lookup(lease_id).await?,
            };
            self.remove_record(&entry).await?;
            Ok(entry)
        }
        .await;
        drop(guard);
        drop(lock);
        self.release_lock(lease_id);

        if let Ok(entry) = &result {
            warn!(lease_id, path = %entry.path, "lease force-revoked without backend confirmation");
        }
        result
    }

    /// Re-read every persisted lease and re-arm its timer. Runs once after unseal.
    ///
    /// A record that cannot be read is tracked as stuck under the mount its
    /// ID names, so it blocks unmount and shows up among the stuck leases
    /// until an operator force-revokes it. Returns the number of leases
    /// restored.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] if the lease index cannot be listed.
    pub async fn restore(&self) -> Result<usize, LeaseError> {
        let ids = self.barrier.list(LEASE_PREFIX).await?;
        let mut restored = 0usize;
        let mut stuck = 0usize;
        let mut failed = 0usize;

        for id in ids.iter().filter(|id| !id.ends_with('/')) {
            let entry = match self.load(id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) if e.kind() == ErrorKind::Sealed => return Err(e),
                Err(e) => {
                    failed = failed.saturating_add(1);
                    let path = self.fallback_path(id).await;
                    error!(
                        lease_id = %id,
                        path = %path,
                        error = %e,
                        "lease record unreadable, holding it as stuck"
                    );
                    self.insert_stuck(id, &path, Some(e.to_string()));
                    continue;
                }
            };

            match &entry.state {
                LeaseState::Active => {
                    self.schedule(&entry.lease_id, &entry.path, entry.expire_at)
                        .await;
                }
                LeaseState::Revoking { .. } => {
                    self.schedule(&entry.lease_id, &entry.path, Utc::now())
                        .await;
                }
                LeaseState::Stuck { .. } => {
                    self.track_stuck(&entry.lease_id, &entry.path);
                    stuck = stuck.saturating_add(1);
                }
            }
            restored = restored.saturating_add(1);
        }

        info!(restored, stuck, failed, "leases restored");
        Ok(restored)
    }

    /// Start the background expiry loop. No-op if already running.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let (shutdown, rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.run(rx).await });
        *worker = Some(Worker { shutdown, handle });
        info!(workers = self.config.expiry.workers, "expiration loop started");
    }

    /// Stop the loop and wait for in-flight revocations to finish.
    pub async fn stop(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if worker.shutdown.send(true).is_err() {
                debug!("expiration loop already gone");
            }
            if let Err(e) = worker.handle.await {
                error!(error = %e, "expiration loop terminated abnormally");
            }
        }
    }

    /// Forget every tracked lease. Runs on seal, after [`stop`](Self::stop).
    pub async fn clear(&self) {
        self.heap.lock().await.clear();
        self.tracked.clear();
        self.locks.clear();
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.config.expiry.workers.max(1)));
        let mut in_flight = JoinSet::new();

        loop {
            let (due, next) = self.due_leases().await;
            for lease_id in due {
                let manager = Arc::clone(&self);
                let permits = Arc::clone(&permits);
                in_flight.spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    manager.expire(&lease_id).await;
                });
            }

            let deadline = next.unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                () = self.wake.notified() => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "lease revocation task failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "lease revocation task failed");
            }
        }
        info!("expiration loop stopped");
    }

    async fn expire(&self, lease_id: &str) {
        if let Err(e) = self.revoke_lease(lease_id, Trigger::Timer).await {
            debug!(lease_id, error = %e, "timed revocation did not complete");
        }
    }

    /// Pop every current wake-up that is due. Also returns the next deadline.
    async fn due_leases(&self) -> (Vec<String>, Option<Instant>) {
        let mut heap = self.heap.lock().await;
        let now = Instant::now();
        let mut due = Vec::new();

        while let Some(Reverse(next)) = heap.peek() {
            if next.at > now {
                return (due, Some(next.at));
            }
            let Some(Reverse(wakeup)) = heap.pop() else {
                break;
            };
            let current = self.tracked.get(&wakeup.lease_id).is_some_and(|tracked| {
                tracked.generation == wakeup.generation && !tracked.stuck
            });
            if current {
                due.push(wakeup.lease_id);
            }
        }
        (due, None)
    }

    async fn schedule(&self, lease_id: &str, path: &str, at: DateTime<Utc>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        self.tracked.insert(
            lease_id.to_owned(),
            Tracked {
                path: path.to_owned(),
                generation,
                stuck: false,
                unreadable: None,
            },
        );

        let delay = (at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_SLEEP);
        self.heap.lock().await.push(Reverse(Wakeup {
            at: Instant::now() + delay,
            generation,
            lease_id: lease_id.to_owned(),
        }));
        self.wake.notify_one();
    }

    async fn schedule_retry(&self, lease_id: &str, path: &str, delay: Duration) {
        self.schedule(lease_id, path, expiry_after(Utc::now(), delay))
            .await;
    }

    fn track_stuck(&self, lease_id: &str, path: &str) {
        self.insert_stuck(lease_id, path, None);
    }

    fn insert_stuck(&self, lease_id: &str, path: &str, unreadable: Option<String>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        self.tracked.insert(
            lease_id.to_owned(),
            Tracked {
                path: path.to_owned(),
                generation,
                stuck: true,
                unreadable,
            },
        );
    }

    /// Owning path for a lease whose record cannot be read: the mount named
    /// by the ID's UUID, so prefix revocation and unmount still see it.
    async fn fallback_path(&self, lease_id: &str) -> String {
        if lease_id.starts_with("auth.") {
            return TOKEN_LEASE_PATH.to_owned();
        }
        let uuid = lease_id.split_once('.').map_or(lease_id, |(uuid, _)| uuid);
        self.router
            .mount_by_uuid(uuid)
            .await
            .map(|mount| mount.path)
            .unwrap_or_default()
    }

    /// The unreadable-record placeholder for `lease_id`, if it is one.
    fn unreadable_entry(&self, lease_id: &str) -> Option<LeaseEntry> {
        let tracked = self.tracked.get(lease_id)?;
        let reason = tracked.unreadable.as_ref()?;
        Some(placeholder_entry(lease_id, &tracked.path, reason))
    }

    async fn revoke_all(
        &self,
        root: &str,
        ids: &[String],
        trigger: Trigger,
    ) -> Result<usize, LeaseError> {
        let mut revoked = 0usize;
        let mut first_failure = None;
        for id in ids {
            match self.revoke_lease(id, trigger).await {
                Ok(()) => revoked = revoked.saturating_add(1),
                Err(e) => {
                    first_failure.get_or_insert(e);
                }
            }
        }
        match first_failure {
            None => Ok(revoked),
            Some(first) => Err(LeaseError::Incomplete {
                root: root.to_owned(),
                revoked,
                total: ids.len(),
                first: Box::new(first),
            }),
        }
    }

    async fn revoke_lease(&self, lease_id: &str, trigger: Trigger) -> Result<(), LeaseError> {
        let lock = self.lease_lock(lease_id);
        let guard = lock.lock().await;
        let result = self.revoke_locked(lease_id, trigger).await;
        drop(guard);
        drop(lock);
        self.release_lock(lease_id);
        result
    }

    async fn revoke_locked(&self, lease_id: &str, trigger: Trigger) -> Result<(), LeaseError> {
        let Some(mut entry) = self.load(lease_id).await? else {
            self.tracked.remove(lease_id);
            return Ok(());
        };

        if trigger == Trigger::Timer
            && entry.state == LeaseState::Active
            && entry.expire_at > Utc::now()
        {
            // Renewed, or woken early by the sleep cap.
            self.schedule(&entry.lease_id, &entry.path, entry.expire_at)
                .await;
            return Ok(());
        }

        let (attempts, was_stuck) = match &entry.state {
            LeaseState::Active => (0, false),
            LeaseState::Revoking { attempts, .. } => (*attempts, false),
            LeaseState::Stuck { attempts, .. } => (*attempts, true),
        };
        if entry.state == LeaseState::Active {
            entry.state = LeaseState::Revoking {
                attempts: 0,
                last_error: None,
            };
            self.persist(&entry).await?;
        }

        match self.revoke_in_backend(&entry, trigger).await {
            Ok(()) => {
                self.remove_record(&entry).await?;
                info!(lease_id, path = %entry.path, "lease revoked");
                Ok(())
            }
            Err(err) => {
                self.record_failure(entry, attempts.saturating_add(1), was_stuck, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn revoke_in_backend(
        &self,
        entry: &LeaseEntry,
        trigger: Trigger,
    ) -> Result<(), LeaseError> {
        match entry.kind {
            LeaseKind::Secret => self
                .router
                .route_revoke(&entry.path, &entry.lease_id, &entry.internal)
                .await
                .map_err(|source| LeaseError::Revocation {
                    lease_id: entry.lease_id.clone(),
                    source,
                }),
            LeaseKind::Token => match (&entry.token_hash, trigger) {
                (None, _) | (_, Trigger::Cascade) => Ok(()),
                (Some(hash), _) => {
                    self.revoke_tree_boxed(hash.clone(), Some(entry.lease_id.clone()))
                        .await
                }
            },
        }
    }

    /// Apply retry or exhaustion handling after a failed attempt.
    async fn record_failure(
        &self,
        mut entry: LeaseEntry,
        attempts: u32,
        was_stuck: bool,
        err: &LeaseError,
    ) {
        if err.kind() == ErrorKind::Sealed {
            return;
        }
        let lease_id = entry.lease_id.clone();
        let last_error = err.to_string();
        let expiry = &self.config.expiry;

        if !was_stuck && attempts < expiry.max_revoke_attempts {
            let backoff = expiry.backoff(attempts);
            entry.state = LeaseState::Revoking {
                attempts,
                last_error: Some(last_error.clone()),
            };
            if let Err(e) = self.persist(&entry).await {
                error!(lease_id = %lease_id, error = %e, "failed to record revocation attempt");
            }
            self.schedule_retry(&lease_id, &entry.path, backoff).await;
            warn!(
                lease_id = %lease_id,
                attempts,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                error = %last_error,
                "lease revocation failed, retrying"
            );
            return;
        }

        if !was_stuck && expiry.exhausted_policy == ExhaustedRevocationPolicy::ForceExpire {
            if let Err(e) = self.remove_record(&entry).await {
                error!(lease_id = %lease_id, error = %e, "failed to drop lease after exhausted retries");
            }
            error!(
                lease_id = %lease_id,
                path = %entry.path,
                attempts,
                error = %last_error,
                "lease revocation retries exhausted, record dropped without backend confirmation"
            );
            return;
        }

        entry.state = LeaseState::Stuck {
            attempts,
            last_error: last_error.clone(),
        };
        if let Err(e) = self.persist(&entry).await {
            error!(lease_id = %lease_id, error = %e, "failed to mark lease stuck");
        }
        self.track_stuck(&lease_id, &entry.path);
        error!(
            lease_id = %lease_id,
            path = %entry.path,
            attempts,
            error = %last_error,
            "lease revocation stuck, operator action required"
        );
    }

    fn revoke_tree_boxed(
        &self,
        root: String,
        skip: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), LeaseError>> + Send + '_>> {
        Box::pin(async move {
            let context = skip
                .clone()
                .unwrap_or_else(|| format!("token {}", short_hash(&root)));
            let token_error = |source: TokenError| LeaseError::Token {
                lease_id: context.clone(),
                source,
            };

            // Post-order: children before their parent.
            let mut order = Vec::new();
            let mut seen = HashSet::new();
            let mut stack = vec![(root.clone(), false)];
            while let Some((hash, expanded)) = stack.pop() {
                if expanded {
                    order.push(hash);
                    continue;
                }
                if !seen.insert(hash.clone()) {
                    continue;
                }
                let children = self.tokens.children(&hash).await.map_err(token_error)?;
                stack.push((hash, true));
                stack.extend(children.into_iter().map(|child| (child, false)));
            }

            for hash in &order {
                let owned = self.token_leases(hash).await?;
                let ids: Vec<String> = owned
                    .into_iter()
                    .filter(|id| Some(id) != skip.as_ref())
                    .collect();
                self.revoke_all(hash, &ids, Trigger::Cascade).await?;
                self.tokens.delete(hash).await.map_err(token_error)?;
            }

            info!(token = %short_hash(&root), tokens = order.len(), "token tree revoked");
            Ok(())
        })
    }

    async fn token_leases(&self, token_hash: &str) -> Result<Vec<String>, LeaseError> {
        let prefix = format!("{TOKEN_INDEX_PREFIX}{token_hash}/");
        Ok(self
            .barrier
            .list(&prefix)
            .await?
            .into_iter()
            .filter(|id| !id.ends_with('/'))
            .collect())
    }

    async fn max_ttl_for(&self, entry: &LeaseEntry) -> Duration {
        match entry.kind {
            LeaseKind::Secret => self
                .router
                .matching_mount(&entry.path)
                .await
                .map_or(self.config.max_lease_ttl, |mount| {
                    mount.config.max_ttl(self.config.max_lease_ttl)
                }),
            LeaseKind::Token => self.config.max_lease_ttl,
        }
    }

    async fn load(&self, lease_id: &str) -> Result<Option<LeaseEntry>, LeaseError> {
        match self.barrier.get(&format!("{LEASE_PREFIX}{lease_id}")).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| LeaseError::Serialization {
                    reason: format!("lease {lease_id}: {e}"),
                }),
        }
    }

    async fn persist(&self, entry: &LeaseEntry) -> Result<(), LeaseError> {
        let bytes = serde_json::to_vec(entry).map_err(|e| LeaseError::Serialization {
            reason: format!("lease {}: {e}", entry.lease_id),
        })?;
        self.barrier
            .put(&format!("{LEASE_PREFIX}{}", entry.lease_id), &bytes)
            .await?;
        Ok(())
    }

    async fn remove_record(&self, entry: &LeaseEntry) -> Result<(), LeaseError> {
        self.barrier
            .delete(&format!("{LEASE_PREFIX}{}", entry.lease_id))
            .await?;
        if let Some(hash) = &entry.token_hash {
            self.barrier
                .delete(&token_index_key(hash, &entry.lease_id))
                .await?;
        }
        self.tracked.remove(&entry.lease_id);
        Ok(())
    }

    fn lease_lock(&self, lease_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(lease_id.to_owned()).or_default())
    }

    fn release_lock(&self, lease_id: &str) {
        self.locks
            .remove_if(lease_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn placeholder_entry(lease_id: &str, path: &str, reason: &str) -> LeaseEntry {
    LeaseEntry {
        lease_id: lease_id.to_owned(),
        path: path.to_owned(),
        token_hash: None,
        kind: if path == TOKEN_LEASE_PATH {
            LeaseKind::Token
        } else {
            LeaseKind::Secret
        },
        internal: serde_json::Value::Null,
        issued_at: DateTime::<Utc>::UNIX_EPOCH,
        last_renewed: None,
        expire_at: DateTime::<Utc>::UNIX_EPOCH,
        ttl_secs: 0,
        renewable: false,
        state: LeaseState::Stuck {
            attempts: 0,
            last_error: format!("lease record unreadable: {reason}"),
        },
    }
}

fn path_is_under(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || prefix.ends_with('/') {
        return path.starts_with(prefix);
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn token_index_key(token_hash: &str, lease_id: &str) -> String {
    format!("{TOKEN_INDEX_PREFIX}{token_hash}/{lease_id}")
}

impl std::fmt::Debug for ExpirationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationManager")
            .field("tracked", &self.tracked.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    use cellar_storage::{MemoryBackend, StorageBackend};
    use serde_json::json;

    use super::*;
    use crate::backend::{
        Backend, BackendFactory, BackendRegistry, BackendRequest, BackendResponse, LeaseData,
    };
    use crate::config::ExpiryConfig;
    use crate::crypto::EncryptionKey;
    use crate::error::BackendError;
    use crate::mount::MountConfig;
    use crate::token::CreateToken;
    use crate::view::StorageView;

    /// Counts revocations; fails the first `failures` of them.
    #[derive(Default)]
    struct Recorder {
        revokes: AtomicUsize,
        failures: AtomicU32,
        renew_cap: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl Backend for Recorder {
        async fn handle_request(
            &self,
            _req: &BackendRequest,
        ) -> Result<BackendResponse, BackendError> {
            Ok(BackendResponse::default())
        }

        async fn handle_revoke(&self, _lease: &LeaseData) -> Result<(), BackendError> {
            self.revokes.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(BackendError::Internal {
                    reason: "remote unavailable".to_owned(),
                });
            }
            Ok(())
        }

        async fn handle_renew(
            &self,
            _lease: &LeaseData,
            requested: Duration,
        ) -> Result<Duration, BackendError> {
            Ok(self.renew_cap.map_or(requested, |cap| requested.min(cap)))
        }
    }

    struct Harness {
        manager: Arc<ExpirationManager>,
        router: Arc<Router>,
        tokens: Arc<TokenStore>,
        barrier: Arc<Barrier>,
        storage: MemoryBackend,
        recorder: Arc<Recorder>,
        mount: MountEntry,
    }

    fn fast_config(policy: ExhaustedRevocationPolicy) -> CoreConfig {
        CoreConfig {
            expiry: ExpiryConfig {
                workers: 4,
                max_revoke_attempts: 3,
                base_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
                exhausted_policy: policy,
            },
            ..CoreConfig::default()
        }
    }

    async fn harness_with(recorder: Recorder, config: CoreConfig, mount_config: MountConfig) -> Harness {
        let storage = MemoryBackend::new();
        let barrier = Arc::new(Barrier::new(Arc::new(storage.clone())));
        let root = EncryptionKey::generate();
        barrier.initialize(&root).await.unwrap();
        barrier.unseal(root).await.unwrap();

        let recorder = Arc::new(recorder);
        let shared = Arc::clone(&recorder);
        let factory: BackendFactory =
            Arc::new(move |_view: StorageView, _entry: &MountEntry| -> Arc<dyn Backend> {
                Arc::clone(&shared) as Arc<dyn Backend>
            });
        let mut registry = BackendRegistry::with_builtins();
        registry.register("recorder", factory);

        let router = Arc::new(Router::new(Arc::clone(&barrier), registry));
        let mount = router
            .mount(MountEntry::new("rec/", "recorder", "", mount_config).unwrap())
            .await
            .unwrap();
        let tokens = Arc::new(TokenStore::new(Arc::clone(&barrier)));
        let manager = Arc::new(ExpirationManager::new(
            Arc::clone(&barrier),
            Arc::clone(&router),
            Arc::clone(&tokens),
            config,
        ));

        Harness {
            manager,
            router,
            tokens,
            barrier,
            storage,
            recorder,
            mount,
        }
    }

    async fn harness() -> Harness {
        harness_with(
            Recorder::default(),
            fast_config(ExhaustedRevocationPolicy::RequireOperator),
            MountConfig::default(),
        )
        .await
    }

    fn secret(ttl: Option<Duration>) -> SecretLease {
        SecretLease {
            ttl,
            renewable: true,
            internal: json!({"user": "tmp"}),
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..250 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(check().await, "condition not reached in time");
    }

    #[tokio::test]
    async fn register_uses_mount_uuid_and_default_ttl() {
        let h = harness_with(
            Recorder::default(),
            fast_config(ExhaustedRevocationPolicy::RequireOperator),
            MountConfig {
                default_lease_ttl: 30,
                max_lease_ttl: 60,
            },
        )
        .await;

        let lease = h
            .manager
            .register(&h.mount, "rec/a", None, &secret(None))
            .await
            .unwrap();
        assert!(lease.lease_id.starts_with(&format!("{}.", h.mount.uuid)));
        assert_eq!(lease.ttl_secs, 30);

        let clamped = h
            .manager
            .register(&h.mount, "rec/b", None, &secret(Some(Duration::from_secs(600))))
            .await
            .unwrap();
        assert_eq!(clamped.ttl_secs, 60);

        assert_eq!(h.manager.lookup(&lease.lease_id).await.unwrap(), lease);
    }

    #[tokio::test]
    async fn expired_lease_is_revoked_by_the_loop() {
        let h = harness().await;
        h.manager.start().await;
        let lease = h
            .manager
            .register(&h.mount, "rec/a", None, &secret(Some(Duration::from_secs(1))))
            .await
            .unwrap();

        let recorder = Arc::clone(&h.recorder);
        eventually(|| {
            let recorder = Arc::clone(&recorder);
            async move { recorder.revokes.load(Ordering::SeqCst) == 1 }
        })
        .await;

        let manager = Arc::clone(&h.manager);
        let id = lease.lease_id.clone();
        eventually(|| {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            async move { matches!(manager.lookup(&id).await, Err(LeaseError::NotFound { .. })) }
        })
        .await;

        h.manager.revoke(&lease.lease_id).await.unwrap();
        h.manager.revoke(&lease.lease_id).await.unwrap();
        assert_eq!(h.recorder.revokes.load(Ordering::SeqCst), 1);
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn explicit_revoke_is_idempotent() {
        let h = harness().await;
        let lease = h
            .manager
            .register(&h.mount, "rec/a", None, &secret(None))
            .await
            .unwrap();

        h.manager.revoke(&lease.lease_id).await.unwrap();
        h.manager.revoke(&lease.lease_id).await.unwrap();
        h.manager.revoke("never-existed").await.unwrap();
        assert_eq!(h.recorder.revokes.load(Ordering::SeqCst), 1);
        assert!(h.manager.lease_ids("").is_empty());
    }

    #[tokio::test]
    async fn renew_clamps_to_backend_and_mount_max() {
        let h = harness_with(
            Recorder {
                renew_cap: Some(Duration::from_secs(50)),
                ..Recorder::default()
            },
            fast_config(ExhaustedRevocationPolicy::RequireOperator),
            MountConfig {
                default_lease_ttl: 10,
                max_lease_ttl: 100,
            },
        )
        .await;

        let lease = h
            .manager
            .register(&h.mount, "rec/a", None, &secret(None))
            .await
            .unwrap();
        let renewed = h
            .manager
            .renew(&lease.lease_id, Some(Duration::from_secs(1000)))
            .await
            .unwrap();
        assert!(renewed.ttl_secs <= 50);
        assert!(renewed.ttl_secs >= 49);
        assert!(renewed.last_renewed.is_some());

        h.router
            .tune(
                "rec/",
                MountConfig {
                    default_lease_ttl: 10,
                    max_lease_ttl: 20,
                },
            )
            .await
            .unwrap();
        let renewed = h
            .manager
            .renew(&lease.lease_id, Some(Duration::from_secs(1000)))
            .await
            .unwrap();
        assert!(renewed.ttl_secs <= 20);
    }

    #[tokio::test]
    async fn renew_errors() {
        let h = harness().await;
        assert!(matches!(
            h.manager.renew("missing", None).await,
            Err(LeaseError::NotFound { .. })
        ));

        let fixed = h
            .manager
            .register(
                &h.mount,
                "rec/a",
                None,
                &SecretLease {
                    ttl: None,
                    renewable: false,
                    internal: json!(null),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            h.manager.renew(&fixed.lease_id, None).await,
            Err(LeaseError::NotRenewable { .. })
        ));
    }

    #[tokio::test]
    async fn renewal_postpones_expiry() {
        let h = harness().await;
        h.manager.start().await;
        let lease = h
            .manager
            .register(&h.mount, "rec/a", None, &secret(Some(Duration::from_secs(1))))
            .await
            .unwrap();
        h.manager
            .renew(&lease.lease_id, Some(Duration::from_secs(60)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.recorder.revokes.load(Ordering::SeqCst), 0);
        assert!(h.manager.lookup(&lease.lease_id).await.is_ok());
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn failing_revocation_becomes_stuck() {
        let h = harness_with(
            Recorder {
                failures: AtomicU32::new(u32::MAX),
                ..Recorder::default()
            },
            fast_config(ExhaustedRevocationPolicy::RequireOperator),
            MountConfig::default(),
        )
        .await;
        h.manager.start().await;
        let lease = h
            .manager
            .register(&h.mount, "rec/a", None, &secret(Some(Duration::ZERO)))
            .await
            .unwrap();

        let manager = Arc::clone(&h.manager);
        eventually(|| {
            let manager = Arc::clone(&manager);
            async move { manager.stuck_leases().await.unwrap().len() == 1 }
        })
        .await;
        h.manager.stop().await;

        assert_eq!(h.recorder.revokes.load(Ordering::SeqCst), 3);
        let stuck = h.manager.lookup(&lease.lease_id).await.unwrap();
        assert!(matches!(stuck.state, LeaseState::Stuck { attempts: 3, .. }));

        // An operator retry that fails again keeps it stuck.
        assert!(h.manager.revoke(&lease.lease_id).await.is_err());
        assert!(matches!(
            h.manager.lookup(&lease.lease_id).await.unwrap().state,
            LeaseState::Stuck { attempts: 4, .. }
        ));

        h.manager.force_revoke(&lease.lease_id).await.unwrap();
        assert!(h.manager.stuck_leases().await.unwrap().is_empty());
        assert!(matches!(
            h.manager.lookup(&lease.lease_id).await,
            Err(LeaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn force_expire_policy_drops_the_record() {
        let h = harness_with(
            Recorder {
                failures: AtomicU32::new(u32::MAX),
                ..Recorder::default()
            },
            fast_config(ExhaustedRevocationPolicy::ForceExpire),
            MountConfig::default(),
        )
        .await;
        h.manager.start().await;
        let lease = h
            .manager
            .register(&h.mount, "rec/a", None, &secret(Some(Duration::ZERO)))
            .await
            .unwrap();

        let manager = Arc::clone(&h.manager);
        let id = lease.lease_id.clone();
        eventually(|| {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            async move { matches!(manager.lookup(&id).await, Err(LeaseError::NotFound { .. })) }
        })
        .await;
        h.manager.stop().await;
        assert_eq!(h.recorder.revokes.load(Ordering::SeqCst), 3);
        assert!(h.manager.stuck_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_explicit_revoke_is_retried_in_background() {
        let h = harness_with(
            Recorder {
                failures: AtomicU32::new(1),
                ..Recorder::default()
            },
            fast_config(ExhaustedRevocationPolicy::RequireOperator),
            MountConfig::default(),
        )
        .await;
        let lease = h
            .manager
            .register(&h.mount, "rec/a", None, &secret(None))
            .await
            .unwrap();

        let err = h.manager.revoke(&lease.lease_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(err.to_string().contains(&lease.lease_id));
        assert!(matches!(
            h.manager.lookup(&lease.lease_id).await.unwrap().state,
            LeaseState::Revoking { attempts: 1, .. }
        ));

        h.manager.start().await;
        let manager = Arc::clone(&h.manager);
        let id = lease.lease_id.clone();
        eventually(|| {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            async move { matches!(manager.lookup(&id).await, Err(LeaseError::NotFound { .. })) }
        })
        .await;
        h.manager.stop().await;
        assert_eq!(h.recorder.revokes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn revoke_prefix_is_exhaustive() {
        let h = harness().await;
        for path in ["rec/a/1", "rec/a/2", "rec/a/b/3", "rec/z"] {
            h.manager
                .register(&h.mount, path, None, &secret(None))
                .await
                .unwrap();
        }

        assert_eq!(h.manager.revoke_prefix("rec/a/").await.unwrap(), 3);
        assert_eq!(h.recorder.revokes.load(Ordering::SeqCst), 3);
        assert_eq!(h.manager.lease_ids("rec/").len(), 1);
    }

    #[tokio::test]
    async fn revoke_prefix_stops_at_segment_boundaries() {
        let h = harness().await;
        let sibling = h
            .router
            .mount(MountEntry::new("recx/", "recorder", "", MountConfig::default()).unwrap())
            .await
            .unwrap();
        let own = h
            .manager
            .register(&h.mount, "rec/a", None, &secret(None))
            .await
            .unwrap();
        let other = h
            .manager
            .register(&sibling, "recx/a", None, &secret(None))
            .await
            .unwrap();

        assert_eq!(h.manager.lease_ids("rec"), vec![own.lease_id.clone()]);
        assert_eq!(h.manager.revoke_prefix("rec").await.unwrap(), 1);
        assert!(matches!(
            h.manager.lookup(&own.lease_id).await,
            Err(LeaseError::NotFound { .. })
        ));
        assert!(h.manager.lookup(&other.lease_id).await.is_ok());

        // A lease ID on its own revokes just that lease.
        let second = h
            .manager
            .register(&sibling, "recx/b", None, &secret(None))
            .await
            .unwrap();
        assert_eq!(h.manager.revoke_prefix(&second.lease_id).await.unwrap(), 1);
        assert_eq!(h.manager.lease_ids("recx/"), vec![other.lease_id.clone()]);
        assert_eq!(h.recorder.revokes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn prefixes_match_whole_segments() {
        assert!(path_is_under("kv/a", "kv"));
        assert!(path_is_under("kv", "kv"));
        assert!(path_is_under("kv/a", "kv/"));
        assert!(path_is_under("kv/a", ""));
        assert!(!path_is_under("kvx/a", "kv"));
        assert!(!path_is_under("kvx/a", "kv/"));
        assert!(!path_is_under("kv/ab", "kv/a/"));
    }

    #[tokio::test]
    async fn revoke_prefix_reports_incomplete() {
        let h = harness_with(
            Recorder {
                failures: AtomicU32::new(1),
                ..Recorder::default()
            },
            fast_config(ExhaustedRevocationPolicy::RequireOperator),
            MountConfig::default(),
        )
        .await;
        for path in ["rec/1", "rec/2"] {
            h.manager
                .register(&h.mount, path, None, &secret(None))
                .await
                .unwrap();
        }

        let err = h.manager.revoke_prefix("rec/").await.unwrap_err();
        assert!(matches!(
            err,
            LeaseError::Incomplete {
                revoked: 1,
                total: 2,
                ..
            }
        ));
        assert_eq!(h.manager.lease_ids("rec/").len(), 1);
    }

    #[tokio::test]
    async fn restore_rearms_persisted_leases() {
        let h = harness().await;
        let expired = h
            .manager
            .register(&h.mount, "rec/a", None, &secret(Some(Duration::ZERO)))
            .await
            .unwrap();
        let live = h
            .manager
            .register(&h.mount, "rec/b", None, &secret(Some(Duration::from_secs(600))))
            .await
            .unwrap();

        // A fresh manager stands in for a restarted process.
        let restarted = Arc::new(ExpirationManager::new(
            Arc::clone(&h.barrier),
            Arc::clone(&h.router),
            Arc::clone(&h.tokens),
            fast_config(ExhaustedRevocationPolicy::RequireOperator),
        ));
        assert_eq!(restarted.restore().await.unwrap(), 2);
        restarted.start().await;

        let manager = Arc::clone(&restarted);
        let id = expired.lease_id.clone();
        eventually(|| {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            async move { matches!(manager.lookup(&id).await, Err(LeaseError::NotFound { .. })) }
        })
        .await;
        restarted.stop().await;

        assert!(restarted.lookup(&live.lease_id).await.is_ok());
        assert_eq!(h.recorder.revokes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreadable_lease_record_is_held_as_stuck() {
        let h = harness().await;
        let damaged = h
            .manager
            .register(&h.mount, "rec/a", None, &secret(None))
            .await
            .unwrap();
        let healthy = h
            .manager
            .register(&h.mount, "rec/b", None, &secret(None))
            .await
            .unwrap();
        h.storage
            .put(&format!("{LEASE_PREFIX}{}", damaged.lease_id), b"not a sealed value")
            .await
            .unwrap();

        let restarted = ExpirationManager::new(
            Arc::clone(&h.barrier),
            Arc::clone(&h.router),
            Arc::clone(&h.tokens),
            fast_config(ExhaustedRevocationPolicy::RequireOperator),
        );
        assert_eq!(restarted.restore().await.unwrap(), 1);

        let stuck = restarted.stuck_leases().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].lease_id, damaged.lease_id);
        assert_eq!(stuck[0].path, "rec/");
        assert!(matches!(stuck[0].state, LeaseState::Stuck { .. }));

        // The mount cannot be emptied while the grant is unaccounted for.
        let err = restarted.revoke_prefix("rec/").await.unwrap_err();
        assert!(matches!(
            err,
            LeaseError::Incomplete {
                revoked: 1,
                total: 2,
                ..
            }
        ));
        assert!(matches!(
            restarted.lookup(&healthy.lease_id).await,
            Err(LeaseError::NotFound { .. })
        ));

        let forced = restarted.force_revoke(&damaged.lease_id).await.unwrap();
        assert_eq!(forced.lease_id, damaged.lease_id);
        assert!(restarted.stuck_leases().await.unwrap().is_empty());
        assert!(restarted.lease_ids("").is_empty());
        let record = format!("{LEASE_PREFIX}{}", damaged.lease_id);
        assert_eq!(h.storage.get(&record).await.unwrap(), None);
    }

    #[tokio::test]
    async fn token_tree_revocation_cascades() {
        let h = harness().await;
        let parent = h.tokens.create_root().await.unwrap();
        let child = h
            .tokens
            .create(CreateToken {
                parent_hash: Some(parent.entry.token_hash.clone()),
                ttl: Some(Duration::from_secs(600)),
                ..CreateToken::default()
            })
            .await
            .unwrap();
        let grandchild = h
            .tokens
            .create(CreateToken {
                parent_hash: Some(child.entry.token_hash.clone()),
                ..CreateToken::default()
            })
            .await
            .unwrap();
        h.manager
            .register_token(&child.entry.token_hash, Duration::from_secs(600), true)
            .await
            .unwrap();

        for (path, hash) in [
            ("rec/p", &parent.entry.token_hash),
            ("rec/c", &child.entry.token_hash),
            ("rec/g", &grandchild.entry.token_hash),
        ] {
            h.manager
                .register(&h.mount, path, Some(hash), &secret(None))
                .await
                .unwrap();
        }
        assert_eq!(h.manager.lease_ids("").len(), 4);

        h.manager
            .revoke_token_tree(&child.entry.token_hash)
            .await
            .unwrap();

        assert_eq!(h.recorder.revokes.load(Ordering::SeqCst), 2);
        assert_eq!(h.manager.lease_ids(""), h.manager.lease_ids("rec/p"));
        assert!(h.tokens.lookup(&child.token).await.is_err());
        assert!(h.tokens.lookup(&grandchild.token).await.is_err());
        assert!(h.tokens.lookup(&parent.token).await.is_ok());
    }

    #[tokio::test]
    async fn token_lease_expiry_revokes_the_token() {
        let h = harness().await;
        let issued = h
            .tokens
            .create(CreateToken {
                ttl: Some(Duration::from_secs(1)),
                ..CreateToken::default()
            })
            .await
            .unwrap();
        h.manager
            .register(&h.mount, "rec/x", Some(&issued.entry.token_hash), &secret(None))
            .await
            .unwrap();
        h.manager
            .register_token(&issued.entry.token_hash, Duration::from_secs(1), false)
            .await
            .unwrap();
        h.manager.start().await;

        let manager = Arc::clone(&h.manager);
        eventually(|| {
            let manager = Arc::clone(&manager);
            async move { manager.lease_ids("").is_empty() }
        })
        .await;
        h.manager.stop().await;

        assert_eq!(h.recorder.revokes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            h.tokens.lookup_by_hash(&issued.entry.token_hash).await,
            Ok(None)
        ));
    }

    #[test]
    fn expiry_saturates() {
        let far = expiry_after(Utc::now(), Duration::from_secs(u64::MAX));
        assert_eq!(far, DateTime::<Utc>::MAX_UTC);
    }
}
