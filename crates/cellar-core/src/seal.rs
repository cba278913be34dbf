//! Seal/unseal lifecycle for `cellar`.
//!
//! The root key is split with Shamir's Secret Sharing and never stored.
//!
//! 1. **Init**: generate a root key, split it into N shares with threshold T,
//!    store a verification value derived from it, and write a keyring wrapped
//!    under it. The shares are returned once and never persisted.
//!
//! 2. **Unseal**: operators submit shares one at a time. Once T distinct
//!    shares are held, the candidate root key is reconstructed and checked
//!    against the verification value before it ever touches the keyring. A
//!    mismatch discards every accumulated share.
//!
//! 3. **Seal**: drop the keyring and root key from memory.
//!
//! 4. **Rekey**: while unsealed, generate a new root key, re-wrap the keyring
//!    under it, and hand out a fresh share set. Old shares stop working.
//!
//! The seal configuration (`core/seal-config`) and verification value
//! (`core/seal-verification`) are stored raw because they must be readable
//! while sealed. Neither reveals anything about the root key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sharks::{Share, Sharks};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::barrier::Barrier;
use crate::crypto::{self, EncryptionKey};
use crate::error::SealError;

/// Storage key for the seal configuration.
pub const SEAL_CONFIG_PATH: &str = "core/seal-config";

/// Storage key for the root key verification value.
pub const VERIFICATION_PATH: &str = "core/seal-verification";

/// Encoded share length: one x-coordinate byte plus one y byte per key byte.
const SHARE_LEN: usize = 33;

/// Persisted seal configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealConfig {
    /// Total number of unseal shares.
    pub shares: u8,
    /// Minimum shares required to reconstruct the root key.
    pub threshold: u8,
}

impl SealConfig {
    /// Validate the share count and threshold: `1 <= threshold <= shares`.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidConfig`] if out of range.
    pub fn new(shares: u8, threshold: u8) -> Result<Self, SealError> {
        if shares == 0 {
            return Err(SealError::InvalidConfig {
                reason: "share count must be at least 1".to_owned(),
            });
        }
        if threshold == 0 {
            return Err(SealError::InvalidConfig {
                reason: "threshold must be at least 1".to_owned(),
            });
        }
        if threshold > shares {
            return Err(SealError::InvalidConfig {
                reason: format!("threshold ({threshold}) cannot exceed share count ({shares})"),
            });
        }
        Ok(Self { shares, threshold })
    }
}

#[derive(Serialize, Deserialize)]
struct VerificationRecord {
    value: String,
}

/// One shard of the root key.
///
/// The first byte is the share's x-coordinate, which doubles as its index.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare(Vec<u8>);

impl KeyShare {
    /// Decode a base64 share and check its shape.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidShare`] if the input is not a well-formed share.
    pub fn from_base64(encoded: &str) -> Result<Self, SealError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| SealError::InvalidShare {
                reason: format!("base64 decode failed: {e}"),
            })?;
        Self::from_bytes(bytes)
    }

    fn from_bytes(bytes: Vec<u8>) -> Result<Self, SealError> {
        let share = Self(bytes);
        if share.0.len() != SHARE_LEN {
            return Err(SealError::InvalidShare {
                reason: format!("expected {SHARE_LEN} bytes, got {}", share.0.len()),
            });
        }
        if share.index() == 0 {
            return Err(SealError::InvalidShare {
                reason: "share index 0 is not a valid x-coordinate".to_owned(),
            });
        }
        Ok(share)
    }

    /// The share's index (x-coordinate, 1-255).
    #[must_use]
    pub fn index(&self) -> u8 {
        self.0.first().copied().unwrap_or_default()
    }

    /// Base64 encoding for handing the share to an operator.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("index", &self.index())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Result of a successful initialization.
#[derive(Debug)]
pub struct InitResult {
    /// The freshly generated root key. Callers use it once to finish setup
    /// and then drop it.
    pub root_key: EncryptionKey,
    /// The key shares. Shown once, never stored.
    pub shares: Vec<KeyShare>,
    /// Verification value persisted for unseal checks.
    pub verification: [u8; 32],
}

/// The seal state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SealState {
    /// No key is held and no shares are pending.
    Sealed,
    /// Shares with these indices have been accepted for the current attempt.
    Unsealing {
        /// Indices submitted so far.
        progress: Vec<u8>,
        /// Shares required.
        threshold: u8,
    },
    /// The barrier holds the root key.
    Unsealed,
}

/// Current seal status of the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    /// Whether the vault has been initialized.
    pub initialized: bool,
    /// Whether the vault is currently sealed.
    pub sealed: bool,
    /// Threshold of shares required to unseal.
    pub threshold: u8,
    /// Total number of shares.
    pub shares: u8,
    /// Number of shares submitted so far in the current unseal attempt.
    pub progress: u8,
}

/// Drives the barrier between sealed and unsealed.
///
/// Every transition (share submission, seal, rekey) runs under one mutex,
/// so they never interleave.
pub struct SealManager {
    barrier: Arc<Barrier>,
    /// Distinct shares accepted for the current attempt, keyed by index.
    pending: Mutex<BTreeMap<u8, KeyShare>>,
}

impl SealManager {
    /// Create a new seal manager wrapping the given barrier.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Initialize a new vault.
    ///
    /// The vault is left **sealed**.
    ///
    /// # Errors
    ///
    /// - [`SealError::InvalidConfig`] if share count or threshold are out of range.
    /// - [`SealError::AlreadyInitialized`] if the vault has already been initialized.
    /// - [`SealError::Barrier`] if writing the keyring or seal records fails.
    pub async fn init(&self, shares: u8, threshold: u8) -> Result<InitResult, SealError> {
        let config = SealConfig::new(shares, threshold)?;
        let _guard = self.pending.lock().await;

        if self.is_initialized().await? {
            return Err(SealError::AlreadyInitialized);
        }

        let root_key = EncryptionKey::generate();
        let split = split_root_key(&root_key, config);
        let verification = crypto::verification_value(&root_key)?;

        self.barrier.initialize(&root_key).await.map_err(|e| match e {
            crate::error::BarrierError::AlreadyInitialized => SealError::AlreadyInitialized,
            other => SealError::Barrier(other),
        })?;
        self.store_verification(&verification).await?;
        self.store_config(config).await?;

        info!(shares, threshold, "vault initialized");

        Ok(InitResult {
            root_key,
            shares: split,
            verification,
        })
    }

    /// Submit one unseal share.
    ///
    /// Returns the state after the share was applied. Resubmitting an index
    /// already held for this attempt changes nothing.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInitialized`] if the vault has not been initialized.
    /// - [`SealError::AlreadyUnsealed`] if the vault is already unsealed.
    /// - [`SealError::InvalidShare`] if the share is malformed.
    /// - [`SealError::ShareMismatch`] if the threshold was reached but the
    ///   reconstruction failed verification. All pending shares are discarded.
    pub async fn submit_share(&self, share_b64: &str) -> Result<SealState, SealError> {
        let share = KeyShare::from_base64(share_b64)?;
        let mut pending = self.pending.lock().await;

        if !self.is_initialized().await? {
            return Err(SealError::NotInitialized);
        }
        if self.barrier.is_unsealed().await {
            return Err(SealError::AlreadyUnsealed);
        }

        let config = self.load_config().await?;
        let index = share.index();
        if pending.insert(index, share).is_some() {
            info!(index, "unseal share already submitted, ignoring");
        }

        let progress = u8::try_from(pending.len()).unwrap_or(u8::MAX);
        if progress < config.threshold {
            info!(progress, threshold = config.threshold, "unseal share accepted");
            return Ok(SealState::Unsealing {
                progress: pending.keys().copied().collect(),
                threshold: config.threshold,
            });
        }

        let candidate = recover_root_key(&pending, config.threshold);
        pending.clear();

        let Some(root_key) = candidate else {
            warn!("unseal shares could not be combined, progress reset");
            return Err(SealError::ShareMismatch);
        };

        let expected = self.load_verification().await?;
        if !crypto::verify_root_key(&root_key, &expected) {
            warn!("reconstructed root key failed verification, progress reset");
            return Err(SealError::ShareMismatch);
        }

        self.barrier.unseal(root_key).await?;
        info!("vault unsealed");
        Ok(SealState::Unsealed)
    }

    /// Discard any shares submitted for the current attempt.
    pub async fn reset_unseal(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            info!(discarded = pending.len(), "unseal progress reset");
        }
        pending.clear();
    }

    /// Seal the vault, zeroizing the root key and keyring.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::AlreadySealed`] if the vault is already sealed.
    pub async fn seal(&self) -> Result<(), SealError> {
        let mut pending = self.pending.lock().await;
        if !self.barrier.is_unsealed().await {
            return Err(SealError::AlreadySealed);
        }
        pending.clear();
        self.barrier.seal().await;
        info!("vault sealed");
        Ok(())
    }

    /// Replace the root key and issue a fresh share set.
    ///
    /// # Errors
    ///
    /// - [`SealError::InvalidConfig`] if share count or threshold are out of range.
    /// - [`SealError::Sealed`] if the vault is sealed.
    /// - [`SealError::Barrier`] if the keyring or seal records cannot be written.
    pub async fn rekey(&self, shares: u8, threshold: u8) -> Result<Vec<KeyShare>, SealError> {
        let config = SealConfig::new(shares, threshold)?;
        let mut pending = self.pending.lock().await;
        if !self.barrier.is_unsealed().await {
            return Err(SealError::Sealed);
        }
        pending.clear();

        let root_key = EncryptionKey::generate();
        let split = split_root_key(&root_key, config);
        let verification = crypto::verification_value(&root_key)?;

        let old_verification = self.barrier.get_raw(VERIFICATION_PATH).await?;
        let old_config = self.barrier.get_raw(SEAL_CONFIG_PATH).await?;

        let previous = self.barrier.rewrap(root_key).await?;
        let committed = async {
            self.store_verification(&verification).await?;
            self.store_config(config).await
        }
        .await;
        if let Err(e) = committed {
            // The new shares are never handed out, so the old ones must keep working.
            self.restore_seal_records(previous, old_verification, old_config)
                .await;
            return Err(e);
        }

        info!(shares, threshold, "vault rekeyed");
        Ok(split)
    }

    async fn restore_seal_records(
        &self,
        previous: EncryptionKey,
        verification: Option<Vec<u8>>,
        config: Option<Vec<u8>>,
    ) {
        if let Err(e) = self.barrier.rewrap(previous).await {
            error!(error = %e, "failed to restore keyring after aborted rekey");
        }
        for (key, value) in [(VERIFICATION_PATH, verification), (SEAL_CONFIG_PATH, config)] {
            let Some(value) = value else { continue };
            if let Err(e) = self.barrier.put_raw(key, &value).await {
                error!(key, error = %e, "failed to restore seal record after aborted rekey");
            }
        }
        warn!("rekey aborted, previous root key kept");
    }

    /// Whether the vault has been initialized.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if the storage backend fails.
    pub async fn is_initialized(&self) -> Result<bool, SealError> {
        Ok(self.barrier.get_raw(SEAL_CONFIG_PATH).await?.is_some()
            && self.barrier.is_initialized().await?)
    }

    /// Get the current seal status.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if the storage backend fails.
    pub async fn status(&self) -> Result<SealStatus, SealError> {
        let initialized = self.is_initialized().await?;
        let sealed = !self.barrier.is_unsealed().await;

        let (threshold, shares, progress) = if initialized {
            let config = self.load_config().await?;
            let pending = self.pending.lock().await;
            let submitted = u8::try_from(pending.len()).unwrap_or(u8::MAX);
            (config.threshold, config.shares, submitted)
        } else {
            (0, 0, 0)
        };

        Ok(SealStatus {
            initialized,
            sealed,
            threshold,
            shares,
            progress,
        })
    }

    async fn load_config(&self) -> Result<SealConfig, SealError> {
        let bytes = self
            .barrier
            .get_raw(SEAL_CONFIG_PATH)
            .await?
            .ok_or(SealError::NotInitialized)?;
        serde_json::from_slice(&bytes).map_err(|e| SealError::InvalidConfig {
            reason: format!("failed to deserialize seal config: {e}"),
        })
    }

    async fn store_config(&self, config: SealConfig) -> Result<(), SealError> {
        let bytes = serde_json::to_vec(&config).map_err(|e| SealError::InvalidConfig {
            reason: format!("failed to serialize seal config: {e}"),
        })?;
        self.barrier.put_raw(SEAL_CONFIG_PATH, &bytes).await?;
        Ok(())
    }

    async fn load_verification(&self) -> Result<Vec<u8>, SealError> {
        let bytes = self
            .barrier
            .get_raw(VERIFICATION_PATH)
            .await?
            .ok_or(SealError::NotInitialized)?;
        let record: VerificationRecord =
            serde_json::from_slice(&bytes).map_err(|e| SealError::InvalidConfig {
                reason: format!("malformed verification record: {e}"),
            })?;
        hex::decode(&record.value).map_err(|e| SealError::InvalidConfig {
            reason: format!("verification value is not hex: {e}"),
        })
    }

    async fn store_verification(&self, value: &[u8; 32]) -> Result<(), SealError> {
        let record = VerificationRecord {
            value: hex::encode(value),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| SealError::InvalidConfig {
            reason: format!("failed to serialize verification record: {e}"),
        })?;
        self.barrier.put_raw(VERIFICATION_PATH, &bytes).await?;
        Ok(())
    }
}

impl fmt::Debug for SealManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealManager")
            .field("barrier", &self.barrier)
            .finish_non_exhaustive()
    }
}

fn split_root_key(root_key: &EncryptionKey, config: SealConfig) -> Vec<KeyShare> {
    Sharks(config.threshold)
        .dealer(root_key.as_bytes())
        .take(usize::from(config.shares))
        .map(|share| KeyShare(Vec::from(&share)))
        .collect()
}

/// Combine pending shares into a candidate root key. `None` if the shares
/// cannot be combined at all.
fn recover_root_key(pending: &BTreeMap<u8, KeyShare>, threshold: u8) -> Option<EncryptionKey> {
    let shares: Vec<Share> = pending
        .values()
        .filter_map(|share| Share::try_from(share.0.as_slice()).ok())
        .collect();
    if shares.len() != pending.len() {
        return None;
    }
    let secret = Zeroizing::new(Sharks(threshold).recover(&shares).ok()?);
    EncryptionKey::from_slice(&secret)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use cellar_storage::{MemoryBackend, StorageBackend, StorageError};

    use super::*;

    /// Memory storage that refuses writes to one key while armed.
    struct FailingWrites {
        inner: MemoryBackend,
        key: &'static str,
        armed: AtomicBool,
    }

    impl FailingWrites {
        fn new(key: &'static str) -> Self {
            Self {
                inner: MemoryBackend::new(),
                key,
                armed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl StorageBackend for FailingWrites {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            if key == self.key && self.armed.load(Ordering::SeqCst) {
                return Err(StorageError::Write {
                    key: key.to_owned(),
                    reason: "disk full".to_owned(),
                });
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list(prefix).await
        }
    }

    fn make_seal_manager() -> SealManager {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        SealManager::new(barrier)
    }

    fn encoded(result: &InitResult) -> Vec<String> {
        result.shares.iter().map(KeyShare::to_base64).collect()
    }

    #[test]
    fn config_bounds() {
        assert!(SealConfig::new(5, 3).is_ok());
        assert!(SealConfig::new(1, 1).is_ok());
        assert!(SealConfig::new(255, 255).is_ok());
        assert!(matches!(
            SealConfig::new(0, 0),
            Err(SealError::InvalidConfig { .. })
        ));
        assert!(matches!(
            SealConfig::new(3, 0),
            Err(SealError::InvalidConfig { .. })
        ));
        assert!(matches!(
            SealConfig::new(3, 4),
            Err(SealError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn init_leaves_vault_sealed_and_initialized() {
        let mgr = make_seal_manager();
        assert!(!mgr.is_initialized().await.unwrap());
        let result = mgr.init(5, 3).await.unwrap();
        assert_eq!(result.shares.len(), 5);
        assert!(mgr.is_initialized().await.unwrap());
        let status = mgr.status().await.unwrap();
        assert!(status.sealed);
        assert_eq!(status.progress, 0);
    }

    #[tokio::test]
    async fn init_twice_is_rejected() {
        let mgr = make_seal_manager();
        mgr.init(3, 2).await.unwrap();
        assert!(matches!(
            mgr.init(3, 2).await,
            Err(SealError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn shares_carry_distinct_indices() {
        let mgr = make_seal_manager();
        let result = mgr.init(5, 3).await.unwrap();
        let indices: Vec<u8> = result.shares.iter().map(KeyShare::index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn any_three_of_five_reconstruct_the_root_key() {
        let mgr = make_seal_manager();
        let result = mgr.init(5, 3).await.unwrap();

        for combo in [[0, 1, 2], [0, 2, 4], [1, 3, 4], [2, 3, 4]] {
            let pending: BTreeMap<u8, KeyShare> = combo
                .iter()
                .map(|&i| (result.shares[i].index(), result.shares[i].clone()))
                .collect();
            let recovered = recover_root_key(&pending, 3).unwrap();
            assert_eq!(recovered, result.root_key);
        }
    }

    #[tokio::test]
    async fn two_of_five_fail_verification() {
        let mgr = make_seal_manager();
        let result = mgr.init(5, 3).await.unwrap();

        let pending: BTreeMap<u8, KeyShare> = result.shares[..2]
            .iter()
            .map(|s| (s.index(), s.clone()))
            .collect();
        let candidate = recover_root_key(&pending, 2).unwrap();
        assert!(!crypto::verify_root_key(&candidate, &result.verification));
    }

    #[tokio::test]
    async fn unseal_full_flow_with_threshold() {
        let mgr = make_seal_manager();
        let result = mgr.init(5, 3).await.unwrap();
        let shares = encoded(&result);

        let state = mgr.submit_share(&shares[0]).await.unwrap();
        assert_eq!(
            state,
            SealState::Unsealing {
                progress: vec![1],
                threshold: 3
            }
        );
        mgr.submit_share(&shares[3]).await.unwrap();
        let state = mgr.submit_share(&shares[4]).await.unwrap();
        assert_eq!(state, SealState::Unsealed);
        assert!(mgr.barrier.is_unsealed().await);
    }

    #[tokio::test]
    async fn duplicate_share_is_not_counted() {
        let mgr = make_seal_manager();
        let result = mgr.init(5, 3).await.unwrap();
        let shares = encoded(&result);

        mgr.submit_share(&shares[0]).await.unwrap();
        mgr.submit_share(&shares[1]).await.unwrap();
        let state = mgr.submit_share(&shares[1]).await.unwrap();
        assert_eq!(
            state,
            SealState::Unsealing {
                progress: vec![1, 2],
                threshold: 3
            }
        );
        assert_eq!(mgr.status().await.unwrap().progress, 2);
        assert!(!mgr.barrier.is_unsealed().await);
    }

    #[tokio::test]
    async fn mismatched_shares_reset_progress() {
        let mgr = make_seal_manager();
        let result = mgr.init(3, 2).await.unwrap();
        let other = make_seal_manager().init(3, 2).await.unwrap();

        mgr.submit_share(&result.shares[0].to_base64()).await.unwrap();
        let err = mgr
            .submit_share(&other.shares[1].to_base64())
            .await
            .unwrap_err();
        assert!(matches!(err, SealError::ShareMismatch));
        assert_eq!(mgr.status().await.unwrap().progress, 0);

        mgr.submit_share(&result.shares[0].to_base64()).await.unwrap();
        let state = mgr.submit_share(&result.shares[2].to_base64()).await.unwrap();
        assert_eq!(state, SealState::Unsealed);
    }

    #[tokio::test]
    async fn threshold_of_one_unseals_immediately() {
        let mgr = make_seal_manager();
        let result = mgr.init(1, 1).await.unwrap();
        let state = mgr.submit_share(&result.shares[0].to_base64()).await.unwrap();
        assert_eq!(state, SealState::Unsealed);
    }

    #[tokio::test]
    async fn malformed_shares_are_rejected() {
        let mgr = make_seal_manager();
        mgr.init(3, 2).await.unwrap();
        assert!(matches!(
            mgr.submit_share("not base64!!").await,
            Err(SealError::InvalidShare { .. })
        ));
        assert!(matches!(
            mgr.submit_share(&BASE64.encode([1u8; 5])).await,
            Err(SealError::InvalidShare { .. })
        ));
        assert!(matches!(
            mgr.submit_share(&BASE64.encode([0u8; SHARE_LEN])).await,
            Err(SealError::InvalidShare { .. })
        ));
    }

    #[tokio::test]
    async fn submit_before_init_fails() {
        let mgr = make_seal_manager();
        let share = BASE64.encode([1u8; SHARE_LEN]);
        assert!(matches!(
            mgr.submit_share(&share).await,
            Err(SealError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn submit_while_unsealed_fails() {
        let mgr = make_seal_manager();
        let result = mgr.init(1, 1).await.unwrap();
        let share = result.shares[0].to_base64();
        mgr.submit_share(&share).await.unwrap();
        assert!(matches!(
            mgr.submit_share(&share).await,
            Err(SealError::AlreadyUnsealed)
        ));
    }

    #[tokio::test]
    async fn reset_unseal_discards_progress() {
        let mgr = make_seal_manager();
        let result = mgr.init(3, 2).await.unwrap();
        mgr.submit_share(&result.shares[0].to_base64()).await.unwrap();
        mgr.reset_unseal().await;
        assert_eq!(mgr.status().await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn seal_and_reunseal() {
        let mgr = make_seal_manager();
        let result = mgr.init(2, 2).await.unwrap();
        let shares = encoded(&result);
        mgr.submit_share(&shares[0]).await.unwrap();
        mgr.submit_share(&shares[1]).await.unwrap();

        mgr.seal().await.unwrap();
        assert!(matches!(mgr.seal().await, Err(SealError::AlreadySealed)));

        mgr.submit_share(&shares[1]).await.unwrap();
        assert_eq!(
            mgr.submit_share(&shares[0]).await.unwrap(),
            SealState::Unsealed
        );
    }

    #[tokio::test]
    async fn rekey_invalidates_old_shares() {
        let mgr = make_seal_manager();
        let result = mgr.init(3, 2).await.unwrap();
        let old = encoded(&result);
        mgr.submit_share(&old[0]).await.unwrap();
        mgr.submit_share(&old[1]).await.unwrap();
        mgr.barrier.put("logical/x", b"kept").await.unwrap();

        let new_shares = mgr.rekey(5, 3).await.unwrap();
        assert_eq!(new_shares.len(), 5);
        let status = mgr.status().await.unwrap();
        assert_eq!((status.shares, status.threshold), (5, 3));

        mgr.seal().await.unwrap();
        mgr.submit_share(&old[0]).await.unwrap();
        mgr.submit_share(&old[1]).await.unwrap();
        assert!(matches!(
            mgr.submit_share(&old[2]).await,
            Err(SealError::ShareMismatch)
        ));

        for share in &new_shares[2..] {
            mgr.submit_share(&share.to_base64()).await.unwrap();
        }
        assert!(mgr.barrier.is_unsealed().await);
        assert_eq!(
            mgr.barrier.get("logical/x").await.unwrap(),
            Some(b"kept".to_vec())
        );
    }

    #[tokio::test]
    async fn failed_rekey_keeps_the_old_shares() {
        for failing in [VERIFICATION_PATH, SEAL_CONFIG_PATH] {
            let storage = Arc::new(FailingWrites::new(failing));
            let mgr = SealManager::new(Arc::new(Barrier::new(storage.clone())));
            let old = encoded(&mgr.init(2, 1).await.unwrap());
            mgr.submit_share(&old[0]).await.unwrap();
            mgr.barrier.put("logical/x", b"kept").await.unwrap();

            storage.armed.store(true, Ordering::SeqCst);
            assert!(matches!(mgr.rekey(3, 2).await, Err(SealError::Barrier(_))));
            storage.armed.store(false, Ordering::SeqCst);

            let status = mgr.status().await.unwrap();
            assert_eq!((status.shares, status.threshold), (2, 1), "{failing}");

            mgr.seal().await.unwrap();
            assert_eq!(
                mgr.submit_share(&old[1]).await.unwrap(),
                SealState::Unsealed,
                "{failing}"
            );
            assert_eq!(
                mgr.barrier.get("logical/x").await.unwrap(),
                Some(b"kept".to_vec())
            );
        }
    }

    #[tokio::test]
    async fn rekey_requires_unsealed() {
        let mgr = make_seal_manager();
        mgr.init(3, 2).await.unwrap();
        assert!(matches!(mgr.rekey(3, 2).await, Err(SealError::Sealed)));
    }

    #[test]
    fn share_debug_is_redacted() {
        let share = KeyShare::from_bytes(vec![7u8; SHARE_LEN]).unwrap();
        let debug = format!("{share:?}");
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains("index: 7"));
    }
}
