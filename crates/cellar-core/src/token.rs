//! Token store for `cellar`.
//!
//! Tokens identify the caller of every request and carry its policies.
//! Tokens are never stored in plaintext: the random token is returned once at
//! creation and persisted only as its SHA-256 hash.
//!
//! Tokens form a strict tree. Each child is recorded under its parent in a
//! `sys/token/parent/<parent-hash>/<child-hash>` index, and revocation walks
//! that index rather than following references, so there are no cycles to
//! chase. The walk itself lives in the expiration manager, because revoking a
//! token also revokes every lease it owns.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::barrier::Barrier;
use crate::error::TokenError;
use crate::expiration::expiry_after;

/// Storage prefix for token entries.
const TOKEN_PREFIX: &str = "sys/token/id/";

/// Storage prefix for the parent→children index.
const TOKEN_CHILDREN_PREFIX: &str = "sys/token/parent/";

/// Policy attached to the root token.
pub const ROOT_POLICY: &str = "root";

/// A stored token entry (persisted through the barrier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    /// SHA-256 hash of the token (hex). This is the storage key.
    pub token_hash: String,
    /// Hash of the parent token. `None` for root tokens.
    pub parent_hash: Option<String>,
    /// Policies attached to this token.
    pub policies: Vec<String>,
    /// When the token was created.
    pub created_at: DateTime<Utc>,
    /// When the token expires. `None` means never.
    pub expires_at: Option<DateTime<Utc>>,
    /// Requested TTL in seconds, `0` for tokens that never expire.
    pub ttl_secs: u64,
    /// Remaining uses. `0` means unlimited.
    pub num_uses: u32,
    /// Whether the token's lease may be renewed.
    pub renewable: bool,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Display name for logs.
    #[serde(default)]
    pub display_name: String,
}

impl TokenEntry {
    /// Whether this token holds the root policy.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.policies.iter().any(|p| p == ROOT_POLICY)
    }
}

/// Parameters for creating a new token.
#[derive(Debug, Clone, Default)]
pub struct CreateToken {
    /// Policies to attach.
    pub policies: Vec<String>,
    /// Time-to-live from now. `None` means the token never expires.
    pub ttl: Option<Duration>,
    /// Number of uses before the token is revoked. `0` means unlimited.
    pub num_uses: u32,
    /// Whether the token can be renewed.
    pub renewable: bool,
    /// Parent token hash.
    pub parent_hash: Option<String>,
    /// Arbitrary metadata.
    pub metadata: BTreeMap<String, String>,
    /// Display name for logs.
    pub display_name: String,
}

/// A freshly created token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// The plaintext token. Returned once, never stored.
    pub token: String,
    /// The stored entry.
    pub entry: TokenEntry,
}

/// Result of charging one use against a token.
#[derive(Debug, Clone)]
pub struct TokenUse {
    /// The entry after the use was recorded.
    pub entry: TokenEntry,
    /// `true` if that was the token's last use.
    pub exhausted: bool,
}

/// Manages token creation, lookup, use accounting, and deletion.
pub struct TokenStore {
    barrier: Arc<Barrier>,
    /// Serializes use-count updates so concurrent requests cannot overspend.
    uses: Mutex<()>,
}

impl TokenStore {
    /// Create a new token store backed by the given barrier.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier,
            uses: Mutex::new(()),
        }
    }

    /// Create a new token and persist its hash.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] if `parent_hash` names a missing token.
    /// - [`TokenError::Barrier`] if storage fails.
    pub async fn create(&self, params: CreateToken) -> Result<IssuedToken, TokenError> {
        if let Some(parent) = &params.parent_hash {
            if self.lookup_by_hash(parent).await?.is_none() {
                return Err(TokenError::NotFound);
            }
        }

        let token = uuid::Uuid::new_v4().to_string();
        let token_hash = hash_token(&token);
        let now = Utc::now();

        let entry = TokenEntry {
            token_hash: token_hash.clone(),
            parent_hash: params.parent_hash,
            policies: params.policies,
            created_at: now,
            expires_at: params.ttl.map(|ttl| expiry_after(now, ttl)),
            ttl_secs: params.ttl.map_or(0, |ttl| ttl.as_secs()),
            num_uses: params.num_uses,
            renewable: params.renewable,
            metadata: params.metadata,
            display_name: params.display_name,
        };

        self.store(&entry).await?;
        if let Some(parent) = &entry.parent_hash {
            let child_key = format!("{TOKEN_CHILDREN_PREFIX}{parent}/{token_hash}");
            self.barrier.put(&child_key, b"").await?;
        }

        info!(
            display_name = %entry.display_name,
            has_parent = entry.parent_hash.is_some(),
            "token created"
        );
        Ok(IssuedToken { token, entry })
    }

    /// Create a root token: `root` policy, no parent, no expiry.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] if storage fails.
    pub async fn create_root(&self) -> Result<IssuedToken, TokenError> {
        self.create(CreateToken {
            policies: vec![ROOT_POLICY.to_owned()],
            display_name: "root".to_owned(),
            ..CreateToken::default()
        })
        .await
    }

    /// Look up a token by its plaintext value.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] if the token does not exist.
    /// - [`TokenError::Expired`] if its TTL has passed.
    /// - [`TokenError::Barrier`] if storage fails.
    pub async fn lookup(&self, token: &str) -> Result<TokenEntry, TokenError> {
        let entry = self
            .lookup_by_hash(&hash_token(token))
            .await?
            .ok_or(TokenError::NotFound)?;
        check_expiry(&entry)?;
        Ok(entry)
    }

    /// Fetch an entry by hash without checking expiry.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] / [`TokenError::Serialization`] on failure.
    pub async fn lookup_by_hash(&self, token_hash: &str) -> Result<Option<TokenEntry>, TokenError> {
        let key = format!("{TOKEN_PREFIX}{token_hash}");
        match self.barrier.get(&key).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| TokenError::Serialization {
                    reason: format!("token deserialization failed: {e}"),
                }),
        }
    }

    /// Validate a token and charge one use against it.
    ///
    /// # Errors
    ///
    /// Same as [`lookup`](Self::lookup).
    pub async fn use_token(&self, token: &str) -> Result<TokenUse, TokenError> {
        let _guard = self.uses.lock().await;
        let mut entry = self.lookup(token).await?;
        if entry.num_uses == 0 {
            return Ok(TokenUse {
                entry,
                exhausted: false,
            });
        }

        entry.num_uses = entry.num_uses.saturating_sub(1);
        let exhausted = entry.num_uses == 0;
        if !exhausted {
            self.store(&entry).await?;
        }
        Ok(TokenUse { entry, exhausted })
    }

    /// Move a token's expiry (used when its lease is renewed).
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] if the token does not exist.
    /// - [`TokenError::Barrier`] if storage fails.
    pub async fn set_expiry(
        &self,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<TokenEntry, TokenError> {
        let mut entry = self
            .lookup_by_hash(token_hash)
            .await?
            .ok_or(TokenError::NotFound)?;
        entry.expires_at = Some(expires_at);
        self.store(&entry).await?;
        Ok(entry)
    }

    /// Hashes of the direct children of a token.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] if storage fails.
    pub async fn children(&self, token_hash: &str) -> Result<Vec<String>, TokenError> {
        let prefix = format!("{TOKEN_CHILDREN_PREFIX}{token_hash}/");
        let children = self.barrier.list(&prefix).await?;
        Ok(children
            .into_iter()
            .filter(|child| !child.ends_with('/'))
            .collect())
    }

    /// Delete one token and its index entries. Children are left untouched;
    /// callers revoke them first.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] if storage fails.
    pub async fn delete(&self, token_hash: &str) -> Result<(), TokenError> {
        let parent = self
            .lookup_by_hash(token_hash)
            .await?
            .and_then(|entry| entry.parent_hash);

        for child in self.children(token_hash).await? {
            self.barrier
                .delete(&format!("{TOKEN_CHILDREN_PREFIX}{token_hash}/{child}"))
                .await?;
        }
        if let Some(parent) = parent {
            self.barrier
                .delete(&format!("{TOKEN_CHILDREN_PREFIX}{parent}/{token_hash}"))
                .await?;
        }
        self.barrier
            .delete(&format!("{TOKEN_PREFIX}{token_hash}"))
            .await?;

        debug!(token = %short_hash(token_hash), "token deleted");
        Ok(())
    }

    async fn store(&self, entry: &TokenEntry) -> Result<(), TokenError> {
        let bytes = serde_json::to_vec(entry).map_err(|e| TokenError::Serialization {
            reason: format!("token serialization failed: {e}"),
        })?;
        self.barrier
            .put(&format!("{TOKEN_PREFIX}{}", entry.token_hash), &bytes)
            .await?;
        Ok(())
    }
}

fn check_expiry(entry: &TokenEntry) -> Result<(), TokenError> {
    match entry.expires_at {
        Some(expires_at) if Utc::now() >= expires_at => Err(TokenError::Expired {
            expired_at: expires_at.to_rfc3339(),
        }),
        _ => Ok(()),
    }
}

/// Hash a plaintext token with SHA-256, returning the hex digest.
#[must_use]
pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// First eight characters of a token hash, for logs.
#[must_use]
pub fn short_hash(token_hash: &str) -> &str {
    token_hash.get(..8).unwrap_or(token_hash)
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}
