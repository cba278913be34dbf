//! The `cellar` core: one instance of every subsystem and the seal lifecycle
//! that ties them together.
//!
//! Transports hold an `Arc<Core>` and call into it; nothing here knows about
//! HTTP. Seal-state transitions (initialize, unseal, seal, rekey, shutdown)
//! run under a single lifecycle lock. Everything else fails fast with
//! [`CoreError::Sealed`] while the barrier is sealed.
//!
//! On unseal the mount table is loaded, persisted leases are restored, and
//! the expiry loop is started. Sealing reverses that in the opposite order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cellar_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::backend::{BackendRegistry, BackendRequest, Operation};
use crate::barrier::{Barrier, KeyStatus};
use crate::config::CoreConfig;
use crate::error::{CoreError, TokenError};
use crate::expiration::{ExpirationManager, LeaseEntry};
use crate::mount::{self, MountConfig, MountEntry};
use crate::policy::{Capability, DEFAULT_POLICY, Policy, PolicyStore};
use crate::router::Router;
use crate::seal::{InitResult, SealManager, SealState, SealStatus};
use crate::token::{CreateToken, TokenEntry, TokenStore, hash_token, short_hash};

/// Path of the `kv` mount created at initialization.
pub const DEFAULT_MOUNT_PATH: &str = "secret/";

/// What `initialize` hands back. Shown once.
#[derive(Debug, Clone, Serialize)]
pub struct InitResponse {
    /// Base64-encoded unseal shares.
    pub shares: Vec<String>,
    /// Shares needed to unseal.
    pub threshold: u8,
    /// Plaintext root token.
    pub root_token: String,
}

/// Lease details attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Lease identifier, used to renew or revoke.
    pub lease_id: String,
    /// Seconds until expiry.
    pub ttl_secs: u64,
    /// Whether the lease may be renewed.
    pub renewable: bool,
}

impl From<&LeaseEntry> for LeaseInfo {
    fn from(entry: &LeaseEntry) -> Self {
        Self {
            lease_id: entry.lease_id.clone(),
            ttl_secs: entry.ttl_secs,
            renewable: entry.renewable,
        }
    }
}

/// Response to a logical request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Backend payload.
    pub data: Option<serde_json::Value>,
    /// Present when the backend granted a lease.
    pub lease: Option<LeaseInfo>,
}

/// Parameters for a child token.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenRequest {
    /// Policies for the child. Empty inherits the parent's.
    pub policies: Vec<String>,
    /// TTL. `None` uses the system default lease TTL.
    #[serde(with = "opt_secs")]
    pub ttl: Option<Duration>,
    /// Uses before the token is revoked. `0` means unlimited.
    pub num_uses: u32,
    /// Whether the token's lease may be renewed.
    pub renewable: bool,
    /// Arbitrary metadata.
    pub metadata: BTreeMap<String, String>,
    /// Display name for logs.
    pub display_name: String,
}

/// A freshly created child token.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedToken {
    /// Plaintext token. Returned once.
    pub token: String,
    /// Stored entry.
    pub entry: TokenEntry,
    /// The auth lease backing the token.
    pub lease: LeaseInfo,
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

/// The `cellar` core.
pub struct Core {
    barrier: Arc<Barrier>,
    seal: SealManager,
    router: Arc<Router>,
    tokens: Arc<TokenStore>,
    policies: PolicyStore,
    expiration: Arc<ExpirationManager>,
    config: CoreConfig,
    lifecycle: Mutex<()>,
}

impl Core {
    /// Build a sealed core over `storage`.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        config: CoreConfig,
        registry: BackendRegistry,
    ) -> Self {
        let barrier = Arc::new(Barrier::new(storage));
        let router = Arc::new(Router::new(Arc::clone(&barrier), registry));
        let tokens = Arc::new(TokenStore::new(Arc::clone(&barrier)));
        let expiration = Arc::new(ExpirationManager::new(
            Arc::clone(&barrier),
            Arc::clone(&router),
            Arc::clone(&tokens),
            config.clone(),
        ));

        Self {
            seal: SealManager::new(Arc::clone(&barrier)),
            policies: PolicyStore::new(Arc::clone(&barrier)),
            barrier,
            router,
            tokens,
            expiration,
            config,
            lifecycle: Mutex::new(()),
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ── Seal lifecycle ───────────────────────────────────────────────

    /// Initialize a new vault: generate the root key, split it into
    /// `shares` shares, create the root token, and mount `secret/`.
    ///
    /// The vault is left sealed.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Seal`] if the vault is already initialized or the
    ///   share parameters are invalid.
    /// - Any storage error raised while bootstrapping.
    pub async fn initialize(&self, shares: u8, threshold: u8) -> Result<InitResponse, CoreError> {
        let _lifecycle = self.lifecycle.lock().await;
        let InitResult {
            root_key,
            shares: split,
            ..
        } = self.seal.init(shares, threshold).await?;

        self.barrier.unseal(root_key).await?;
        let bootstrap = self.bootstrap().await;
        self.router.clear().await;
        self.barrier.seal().await;
        let root_token = bootstrap?;

        info!(shares, threshold, "vault bootstrapped");
        Ok(InitResponse {
            shares: split.iter().map(|share| share.to_base64()).collect(),
            threshold,
            root_token,
        })
    }

    async fn bootstrap(&self) -> Result<String, CoreError> {
        self.router
            .mount(MountEntry::new(
                DEFAULT_MOUNT_PATH,
                crate::kv::BACKEND_TYPE,
                "key/value secret storage",
                MountConfig::default(),
            )?)
            .await?;
        Ok(self.tokens.create_root().await?.token)
    }

    /// Submit one unseal share.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Seal`] for malformed shares, mismatches, or an
    ///   uninitialized / already unsealed vault.
    /// - Any error raised while loading mounts or restoring leases; the
    ///   vault is sealed again in that case.
    pub async fn unseal(&self, share: &str) -> Result<SealState, CoreError> {
        let _lifecycle = self.lifecycle.lock().await;
        let state = self.seal.submit_share(share).await?;
        if state != SealState::Unsealed {
            return Ok(state);
        }

        if let Err(e) = self.post_unseal().await {
            error!(error = %e, "post-unseal setup failed, sealing again");
            self.teardown().await;
            return Err(e);
        }
        Ok(state)
    }

    async fn post_unseal(&self) -> Result<(), CoreError> {
        self.router.load().await?;
        self.expiration.restore().await?;
        self.expiration.start().await;
        Ok(())
    }

    /// Discard shares submitted for the current unseal attempt.
    pub async fn reset_unseal(&self) {
        self.seal.reset_unseal().await;
    }

    /// Seal the vault. The expiry loop is stopped first; in-flight
    /// revocations are allowed to finish.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Seal`] if the vault is already sealed.
    pub async fn seal(&self) -> Result<(), CoreError> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.barrier.is_unsealed().await {
            return Err(crate::error::SealError::AlreadySealed.into());
        }
        self.expiration.stop().await;
        self.expiration.clear().await;
        self.router.clear().await;
        self.seal.seal().await?;
        Ok(())
    }

    async fn teardown(&self) {
        self.expiration.stop().await;
        self.expiration.clear().await;
        self.router.clear().await;
        self.barrier.seal().await;
    }

    /// Seal status for health and status endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Seal`] if the seal records cannot be read.
    pub async fn seal_status(&self) -> Result<SealStatus, CoreError> {
        Ok(self.seal.status().await?)
    }

    /// Replace the root key; the old shares stop working.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Seal`] if sealed or the parameters are invalid.
    pub async fn rekey(&self, shares: u8, threshold: u8) -> Result<Vec<String>, CoreError> {
        let _lifecycle = self.lifecycle.lock().await;
        let split = self.seal.rekey(shares, threshold).await?;
        Ok(split.iter().map(|share| share.to_base64()).collect())
    }

    /// Install a new keyring term for future writes. Returns the new term.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Barrier`] if sealed or the keyring cannot be written.
    pub async fn rotate(&self) -> Result<u32, CoreError> {
        let _lifecycle = self.lifecycle.lock().await;
        Ok(self.barrier.rotate().await?)
    }

    /// The active keyring term.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Barrier`] if sealed.
    pub async fn key_status(&self) -> Result<KeyStatus, CoreError> {
        Ok(self.barrier.key_status().await?)
    }

    /// Stop background work and seal. Used at process exit.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
        self.seal.reset_unseal().await;
        info!("core shut down");
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Serve a logical request on behalf of `token`.
    ///
    /// Charges one token use, checks policy, routes the request, and
    /// registers a lease if the backend granted one. A token whose last use
    /// this was is revoked afterwards.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Sealed`] while sealed.
    /// - [`CoreError::Token`] / [`CoreError::Policy`] if access is refused.
    /// - [`CoreError::Router`] if no mount matches or the backend fails.
    /// - [`CoreError::Lease`] if the lease cannot be recorded.
    pub async fn handle_request(
        &self,
        token: &str,
        operation: Operation,
        path: &str,
        data: Option<serde_json::Value>,
    ) -> Result<Response, CoreError> {
        self.require_unsealed().await?;
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(CoreError::InvalidRequest {
                reason: "request path is empty".to_owned(),
            });
        }

        let usage = self.tokens.use_token(token).await?;
        let result = self
            .dispatch(&usage.entry, operation, path, data)
            .await;

        if usage.exhausted {
            let hash = &usage.entry.token_hash;
            info!(token = %short_hash(hash), "token uses exhausted, revoking");
            if let Err(e) = self.expiration.revoke_token_tree(hash).await {
                error!(token = %short_hash(hash), error = %e, "failed to revoke exhausted token");
            }
        }
        result
    }

    async fn dispatch(
        &self,
        caller: &TokenEntry,
        operation: Operation,
        path: &str,
        data: Option<serde_json::Value>,
    ) -> Result<Response, CoreError> {
        self.policies
            .check(&caller.policies, path, Capability::for_operation(operation))
            .await?;

        let request = BackendRequest {
            operation,
            path: path.to_owned(),
            data,
        };
        // The mount stays bound until the lease is recorded, so an unmount or
        // remount cannot slip in between and miss it.
        let routed = self.router.route(&request).await?;

        let lease = match &routed.response.secret {
            Some(secret) if routed.response.data.is_some() => {
                let entry = self
                    .expiration
                    .register(&routed.mount, path, Some(&caller.token_hash), secret)
                    .await?;
                Some(LeaseInfo::from(&entry))
            }
            _ => None,
        };

        Ok(Response {
            data: routed.response.data,
            lease,
        })
    }

    /// Validate `token` and check it holds one of `wanted` on `path`.
    /// Used by transports to guard `sys/` and `auth/` endpoints. Does not
    /// charge a use.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Sealed`] while sealed.
    /// - [`CoreError::Token`] / [`CoreError::Policy`] if access is refused.
    pub async fn authorize(
        &self,
        token: &str,
        path: &str,
        wanted: &[Capability],
    ) -> Result<TokenEntry, CoreError> {
        self.require_unsealed().await?;
        let entry = self.tokens.lookup(token).await?;
        self.policies.check(&entry.policies, path, wanted).await?;
        Ok(entry)
    }

    // ── Mounts ───────────────────────────────────────────────────────

    /// Mount a backend.
    ///
    /// # Errors
    ///
    /// [`CoreError::Router`] for conflicts, reserved paths, or unknown types.
    pub async fn mount(
        &self,
        path: &str,
        backend_type: &str,
        description: &str,
        config: MountConfig,
    ) -> Result<MountEntry, CoreError> {
        self.require_unsealed().await?;
        config.validate(self.config.max_lease_ttl)?;
        let entry = MountEntry::new(path, backend_type, description, config)?;
        Ok(self.router.mount(entry).await?)
    }

    /// Revoke every lease under a mount, then remove it and its data.
    ///
    /// If any lease cannot be revoked the mount is left in place.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Router`] if nothing is mounted at `path`.
    /// - [`CoreError::Lease`] if revocation was incomplete.
    pub async fn unmount(&self, path: &str) -> Result<MountEntry, CoreError> {
        self.require_unsealed().await?;
        let path = mount::normalize_path(path)?;
        self.router.taint(&path).await?;

        if let Err(e) = self.expiration.revoke_prefix(&path).await {
            self.router.untaint(&path).await;
            warn!(path = %path, error = %e, "unmount aborted, leases remain");
            return Err(e.into());
        }
        Ok(self.router.unmount(&path).await?)
    }

    /// Move a mount. Leases issued under the old path are revoked first.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Router`] if `from` is not mounted or `to` is taken.
    /// - [`CoreError::Lease`] if revocation was incomplete.
    pub async fn remount(&self, from: &str, to: &str) -> Result<MountEntry, CoreError> {
        self.require_unsealed().await?;
        let from = mount::normalize_path(from)?;
        let to = mount::normalize_path(to)?;
        self.router.taint(&from).await?;

        let moved = async {
            self.expiration.revoke_prefix(&from).await?;
            Ok::<_, CoreError>(self.router.remount(&from, &to).await?)
        }
        .await;
        if moved.is_err() {
            self.router.untaint(&from).await;
        }
        moved
    }

    /// Change a mount's TTL settings. Existing leases keep their expiry.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Mount`] if the default TTL exceeds the maximum.
    /// - [`CoreError::Router`] if nothing is mounted at `path`.
    pub async fn tune(&self, path: &str, config: MountConfig) -> Result<MountEntry, CoreError> {
        self.require_unsealed().await?;
        config.validate(self.config.max_lease_ttl)?;
        Ok(self.router.tune(path, config).await?)
    }

    /// Every mount, ordered by path.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Sealed`] while sealed.
    pub async fn mounts(&self) -> Result<Vec<MountEntry>, CoreError> {
        self.require_unsealed().await?;
        Ok(self.router.mounts().await)
    }

    // ── Leases ───────────────────────────────────────────────────────

    /// Fetch a lease.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Lease`] if it does not exist.
    pub async fn lookup_lease(&self, lease_id: &str) -> Result<LeaseEntry, CoreError> {
        self.require_unsealed().await?;
        Ok(self.expiration.lookup(lease_id).await?)
    }

    /// Lease IDs under a path prefix.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Sealed`] while sealed.
    pub async fn list_leases(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        self.require_unsealed().await?;
        Ok(self.expiration.lease_ids(prefix))
    }

    /// Renew a lease.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Lease`] if it is missing, not renewable, or the
    /// backend refuses.
    pub async fn renew_lease(
        &self,
        lease_id: &str,
        increment: Option<Duration>,
    ) -> Result<LeaseEntry, CoreError> {
        self.require_unsealed().await?;
        Ok(self.expiration.renew(lease_id, increment).await?)
    }

    /// Revoke a lease. Unknown leases succeed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Lease`] if the backend did not confirm; the lease
    /// is retried in the background.
    pub async fn revoke_lease(&self, lease_id: &str) -> Result<(), CoreError> {
        self.require_unsealed().await?;
        Ok(self.expiration.revoke(lease_id).await?)
    }

    /// Revoke every lease under a path prefix. Returns the number revoked.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Lease`] if any lease could not be revoked.
    pub async fn revoke_prefix(&self, prefix: &str) -> Result<usize, CoreError> {
        self.require_unsealed().await?;
        Ok(self.expiration.revoke_prefix(prefix.trim_start_matches('/')).await?)
    }

    /// Drop a lease record without backend confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Lease`] if it does not exist.
    pub async fn force_revoke_lease(&self, lease_id: &str) -> Result<LeaseEntry, CoreError> {
        self.require_unsealed().await?;
        Ok(self.expiration.force_revoke(lease_id).await?)
    }

    /// Leases whose revocation gave up and needs an operator.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Lease`] if the records cannot be read.
    pub async fn stuck_leases(&self) -> Result<Vec<LeaseEntry>, CoreError> {
        self.require_unsealed().await?;
        Ok(self.expiration.stuck_leases().await?)
    }

    // ── Tokens ───────────────────────────────────────────────────────

    /// Create a child of `parent_token`.
    ///
    /// A non-root parent may only hand out policies it holds itself. Every
    /// child carries `default` and is backed by an auth lease.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Token`] if the parent is invalid.
    /// - [`CoreError::InvalidRequest`] if a requested policy exceeds the parent's.
    pub async fn create_token(
        &self,
        parent_token: &str,
        request: TokenRequest,
    ) -> Result<CreatedToken, CoreError> {
        self.require_unsealed().await?;
        let parent = self.tokens.lookup(parent_token).await?;

        let mut policies = if request.policies.is_empty() {
            parent.policies.clone()
        } else {
            request.policies
        };
        if !parent.is_root() {
            if let Some(extra) = policies
                .iter()
                .find(|p| *p != DEFAULT_POLICY && !parent.policies.contains(p))
            {
                return Err(CoreError::InvalidRequest {
                    reason: format!("parent token does not hold policy '{extra}'"),
                });
            }
        }
        if !policies.iter().any(|p| p == DEFAULT_POLICY) {
            policies.push(DEFAULT_POLICY.to_owned());
        }
        policies.sort();
        policies.dedup();

        let ttl = request
            .ttl
            .unwrap_or(self.config.default_lease_ttl)
            .min(self.config.max_lease_ttl);
        let issued = self
            .tokens
            .create(CreateToken {
                policies,
                ttl: Some(ttl),
                num_uses: request.num_uses,
                renewable: request.renewable,
                parent_hash: Some(parent.token_hash.clone()),
                metadata: request.metadata,
                display_name: request.display_name,
            })
            .await?;

        let lease = self
            .expiration
            .register_token(&issued.entry.token_hash, ttl, request.renewable)
            .await?;

        Ok(CreatedToken {
            token: issued.token,
            entry: issued.entry,
            lease: LeaseInfo::from(&lease),
        })
    }

    /// Look up the entry for `token`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Token`] if it is missing or expired.
    pub async fn lookup_token(&self, token: &str) -> Result<TokenEntry, CoreError> {
        self.require_unsealed().await?;
        Ok(self.tokens.lookup(token).await?)
    }

    /// Renew the auth lease backing `token`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Token`] if the token is missing or expired.
    /// - [`CoreError::InvalidRequest`] if the token has no lease (root tokens).
    /// - [`CoreError::Lease`] if the lease is not renewable.
    pub async fn renew_token(
        &self,
        token: &str,
        increment: Option<Duration>,
    ) -> Result<LeaseEntry, CoreError> {
        self.require_unsealed().await?;
        let entry = self.tokens.lookup(token).await?;
        let Some(lease) = self.expiration.token_lease(&entry.token_hash).await? else {
            return Err(CoreError::InvalidRequest {
                reason: "token has no lease to renew".to_owned(),
            });
        };
        Ok(self.expiration.renew(&lease.lease_id, increment).await?)
    }

    /// Revoke `token`, its descendants, and every lease they own. Revoking
    /// an unknown token succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Lease`] if part of the tree could not be revoked.
    pub async fn revoke_token(&self, token: &str) -> Result<(), CoreError> {
        self.require_unsealed().await?;
        let hash = hash_token(token);
        match self.tokens.lookup_by_hash(&hash).await {
            Ok(Some(_)) => Ok(self.expiration.revoke_token_tree(&hash).await?),
            Ok(None) | Err(TokenError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ── Policies ─────────────────────────────────────────────────────

    /// Write a policy.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Policy`] for built-in names or invalid documents.
    pub async fn put_policy(&self, policy: &Policy) -> Result<(), CoreError> {
        self.require_unsealed().await?;
        Ok(self.policies.put(policy).await?)
    }

    /// Read a policy.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Policy`] if it does not exist.
    pub async fn get_policy(&self, name: &str) -> Result<Policy, CoreError> {
        self.require_unsealed().await?;
        Ok(self.policies.get(name).await?)
    }

    /// Delete a policy.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Policy`] for built-in names.
    pub async fn delete_policy(&self, name: &str) -> Result<(), CoreError> {
        self.require_unsealed().await?;
        Ok(self.policies.delete(name).await?)
    }

    /// Every policy name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Sealed`] while sealed.
    pub async fn list_policies(&self) -> Result<Vec<String>, CoreError> {
        self.require_unsealed().await?;
        Ok(self.policies.list().await?)
    }

    async fn require_unsealed(&self) -> Result<(), CoreError> {
        if self.barrier.is_unsealed().await {
            Ok(())
        } else {
            Err(CoreError::Sealed)
        }
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("router", &self.router)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cellar_storage::MemoryBackend;
    use serde_json::json;

    use super::*;
    use crate::error::{ErrorKind, SealError};

    fn core() -> Core {
        Core::new(
            Arc::new(MemoryBackend::new()),
            CoreConfig::default(),
            BackendRegistry::with_builtins(),
        )
    }

    async fn unsealed(shares: u8, threshold: u8) -> (Core, InitResponse) {
        let core = core();
        let init = core.initialize(shares, threshold).await.unwrap();
        for share in init.shares.iter().take(usize::from(threshold)) {
            core.unseal(share).await.unwrap();
        }
        (core, init)
    }

    #[tokio::test]
    async fn initialize_leaves_the_vault_sealed() {
        let core = core();
        let init = core.initialize(3, 2).await.unwrap();
        assert_eq!(init.shares.len(), 3);
        assert!(!init.root_token.is_empty());

        let status = core.seal_status().await.unwrap();
        assert!(status.initialized);
        assert!(status.sealed);
        assert!(matches!(
            core.handle_request(&init.root_token, Operation::Read, "secret/x", None)
                .await,
            Err(CoreError::Sealed)
        ));
        assert!(matches!(
            core.initialize(3, 2).await,
            Err(CoreError::Seal(SealError::AlreadyInitialized))
        ));
    }

    #[tokio::test]
    async fn unseal_restores_mounts_and_serves_requests() {
        let (core, init) = unsealed(3, 2).await;
        let mounts = core.mounts().await.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].path, DEFAULT_MOUNT_PATH);

        let token = &init.root_token;
        core.handle_request(token, Operation::Write, "secret/db", Some(json!({"pw": "x", "ttl": 30})))
            .await
            .unwrap();
        let read = core
            .handle_request(token, Operation::Read, "/secret/db", None)
            .await
            .unwrap();
        assert_eq!(read.data.unwrap()["pw"], "x");
        let lease = read.lease.unwrap();
        assert!(lease.ttl_secs <= 30);

        let entry = core.lookup_lease(&lease.lease_id).await.unwrap();
        assert_eq!(entry.path, "secret/db");
        core.shutdown().await;
    }

    #[tokio::test]
    async fn seal_then_unseal_keeps_data_and_leases() {
        let (core, init) = unsealed(1, 1).await;
        let token = &init.root_token;
        core.handle_request(token, Operation::Write, "secret/a", Some(json!({"v": 1})))
            .await
            .unwrap();
        let lease = core
            .handle_request(token, Operation::Read, "secret/a", None)
            .await
            .unwrap()
            .lease
            .unwrap();

        core.seal().await.unwrap();
        assert!(matches!(core.mounts().await, Err(CoreError::Sealed)));
        assert!(matches!(
            core.seal().await,
            Err(CoreError::Seal(SealError::AlreadySealed))
        ));

        assert_eq!(core.unseal(&init.shares[0]).await.unwrap(), SealState::Unsealed);
        assert!(core.lookup_lease(&lease.lease_id).await.is_ok());
        core.shutdown().await;
    }

    #[tokio::test]
    async fn policy_gates_requests() {
        let (core, init) = unsealed(1, 1).await;
        core.put_policy(&Policy {
            name: "reader".to_owned(),
            rules: vec![crate::policy::PolicyRule {
                path: "secret/**".to_owned(),
                capabilities: vec![Capability::Read],
            }],
        })
        .await
        .unwrap();

        let child = core
            .create_token(
                &init.root_token,
                TokenRequest {
                    policies: vec!["reader".to_owned()],
                    ..TokenRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(child.entry.policies, vec!["default", "reader"]);

        core.handle_request(&child.token, Operation::Read, "secret/x", None)
            .await
            .unwrap();
        let err = core
            .handle_request(&child.token, Operation::Write, "secret/x", Some(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        // A non-root parent cannot escalate.
        let err = core
            .create_token(
                &child.token,
                TokenRequest {
                    policies: vec!["root".to_owned()],
                    ..TokenRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        core.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_token_is_revoked() {
        let (core, init) = unsealed(1, 1).await;
        let child = core
            .create_token(
                &init.root_token,
                TokenRequest {
                    num_uses: 2,
                    ..TokenRequest::default()
                },
            )
            .await
            .unwrap();

        for _ in 0..2 {
            core.handle_request(&child.token, Operation::Read, "secret/x", None)
                .await
                .unwrap();
        }
        let err = core
            .handle_request(&child.token, Operation::Read, "secret/x", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(core.lookup_lease(&child.lease.lease_id).await.is_err());
        core.shutdown().await;
    }

    #[tokio::test]
    async fn revoking_a_token_revokes_its_leases() {
        let (core, init) = unsealed(1, 1).await;
        let child = core
            .create_token(&init.root_token, TokenRequest::default())
            .await
            .unwrap();
        core.handle_request(&init.root_token, Operation::Write, "secret/a", Some(json!({"v": 1})))
            .await
            .unwrap();
        let lease = core
            .handle_request(&child.token, Operation::Read, "secret/a", None)
            .await
            .unwrap()
            .lease
            .unwrap();

        core.revoke_token(&child.token).await.unwrap();
        core.revoke_token(&child.token).await.unwrap();
        assert!(core.lookup_token(&child.token).await.is_err());
        assert_eq!(
            core.lookup_lease(&lease.lease_id).await.unwrap_err().kind(),
            ErrorKind::LeaseNotFound
        );
        assert!(core.lookup_token(&init.root_token).await.is_ok());
        core.shutdown().await;
    }

    #[tokio::test]
    async fn unmount_revokes_leases_and_remount_moves_data() {
        let (core, init) = unsealed(1, 1).await;
        let token = &init.root_token;
        core.mount("app", "kv", "", MountConfig::default()).await.unwrap();
        core.handle_request(token, Operation::Write, "app/a", Some(json!({"v": 1})))
            .await
            .unwrap();
        let lease = core
            .handle_request(token, Operation::Read, "app/a", None)
            .await
            .unwrap()
            .lease
            .unwrap();

        core.remount("app/", "moved/").await.unwrap();
        assert!(core.lookup_lease(&lease.lease_id).await.is_err());
        let read = core
            .handle_request(token, Operation::Read, "moved/a", None)
            .await
            .unwrap();
        assert_eq!(read.data.unwrap()["v"], 1);

        core.unmount("moved/").await.unwrap();
        assert!(core.list_leases("moved/").await.unwrap().is_empty());
        assert_eq!(
            core.handle_request(token, Operation::Read, "moved/a", None)
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::NoBackend
        );
        assert_eq!(
            core.unmount("moved/").await.unwrap_err().kind(),
            ErrorKind::NotMounted
        );
        core.shutdown().await;
    }

    #[tokio::test]
    async fn token_lease_renews_and_root_has_none() {
        let (core, init) = unsealed(1, 1).await;
        let child = core
            .create_token(
                &init.root_token,
                TokenRequest {
                    ttl: Some(Duration::from_secs(600)),
                    renewable: true,
                    ..TokenRequest::default()
                },
            )
            .await
            .unwrap();

        let renewed = core
            .renew_token(&child.token, Some(Duration::from_secs(120)))
            .await
            .unwrap();
        assert_eq!(renewed.lease_id, child.lease.lease_id);
        assert_eq!(renewed.ttl_secs, 120);

        assert_eq!(
            core.renew_token(&init.root_token, None)
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidRequest
        );
        core.shutdown().await;
    }

    #[tokio::test]
    async fn tune_rejects_default_above_max() {
        let (core, _init) = unsealed(1, 1).await;
        let tuned = core
            .tune(
                "secret",
                MountConfig {
                    default_lease_ttl: 40,
                    max_lease_ttl: 80,
                },
            )
            .await
            .unwrap();
        assert_eq!(tuned.config.max_lease_ttl, 80);

        let err = core
            .tune(
                "secret/",
                MountConfig {
                    default_lease_ttl: 120,
                    max_lease_ttl: 80,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(core.mounts().await.unwrap()[0].config.default_lease_ttl, 40);
        core.shutdown().await;
    }

    #[tokio::test]
    async fn rekey_and_rotate() {
        let (core, init) = unsealed(3, 2).await;
        assert_eq!(core.rotate().await.unwrap(), 2);
        assert_eq!(core.key_status().await.unwrap().term, 2);

        let fresh = core.rekey(2, 2).await.unwrap();
        core.seal().await.unwrap();

        core.unseal(&init.shares[0]).await.unwrap();
        assert_eq!(
            core.unseal(&init.shares[1]).await.unwrap_err().kind(),
            ErrorKind::ShareMismatch
        );
        core.unseal(&fresh[0]).await.unwrap();
        assert_eq!(core.unseal(&fresh[1]).await.unwrap(), SealState::Unsealed);
        core.shutdown().await;
    }
}
