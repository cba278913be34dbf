//! Encryption barrier for `cellar`.
//!
//! Every byte that touches the storage backend passes through the barrier's
//! encrypt/decrypt. The storage layer only ever sees ciphertext.
//!
//! # Keyring
//!
//! Values are encrypted with the active term of a versioned keyring rather
//! than with the root key directly. Each stored value is framed as
//!
//! ```text
//! term (u32, big endian) || nonce (12) || ciphertext || tag (16)
//! ```
//!
//! and the storage key is bound in as associated data, so a ciphertext moved
//! to a different key fails authentication. [`Barrier::rotate`] installs a new
//! term for future writes; older terms stay in the keyring so existing data
//! remains readable. Existing ciphertexts are never rewritten.
//!
//! The keyring itself is persisted at `core/keyring`, wrapped under the root
//! key. The root key lives only in process memory and is zeroized on seal.
//!
//! When sealed, every operation fails with [`BarrierError::Sealed`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cellar_storage::StorageBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{self, EncryptionKey};
use crate::error::{BarrierError, CryptoError};

/// Storage key of the wrapped keyring record.
pub const KEYRING_PATH: &str = "core/keyring";

/// Length of the term header on every framed value.
const TERM_LEN: usize = 4;

/// Status of the active encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatus {
    /// Active term used for new writes.
    pub term: u32,
    /// When the active term was installed.
    pub installed_at: DateTime<Utc>,
    /// Number of terms retained for decryption.
    pub terms: usize,
}

#[derive(Clone)]
struct KeyTerm {
    key: EncryptionKey,
    installed_at: DateTime<Utc>,
}

/// In-memory keyring. Exists only while unsealed.
#[derive(Clone)]
struct Keyring {
    root_key: EncryptionKey,
    active_term: u32,
    terms: BTreeMap<u32, KeyTerm>,
}

impl Keyring {
    fn new(root_key: EncryptionKey) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(
            1,
            KeyTerm {
                key: EncryptionKey::generate(),
                installed_at: Utc::now(),
            },
        );
        Self {
            root_key,
            active_term: 1,
            terms,
        }
    }

    fn active(&self) -> Result<&KeyTerm, BarrierError> {
        self.terms
            .get(&self.active_term)
            .ok_or_else(|| BarrierError::Keyring {
                reason: format!("active term {} missing from keyring", self.active_term),
            })
    }

    fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let term = self.active()?;
        let sealed = crypto::encrypt(&term.key, plaintext, key.as_bytes())?;
        let mut framed = Vec::with_capacity(TERM_LEN.saturating_add(sealed.len()));
        framed.extend_from_slice(&self.active_term.to_be_bytes());
        framed.extend_from_slice(&sealed);
        Ok(framed)
    }

    fn decrypt(&self, key: &str, framed: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let integrity = || BarrierError::Integrity {
            key: key.to_owned(),
        };
        if framed.len() < TERM_LEN {
            return Err(integrity());
        }
        let (header, sealed) = framed.split_at(TERM_LEN);
        let term_bytes: [u8; TERM_LEN] = header.try_into().map_err(|_| integrity())?;
        let term = u32::from_be_bytes(term_bytes);
        let entry = self.terms.get(&term).ok_or_else(|| BarrierError::UnknownTerm {
            key: key.to_owned(),
            term,
        })?;
        crypto::decrypt(&entry.key, sealed, key.as_bytes()).map_err(|e| match e {
            CryptoError::Authentication | CryptoError::CiphertextTooShort { .. } => integrity(),
            other => BarrierError::Crypto(other),
        })
    }

    /// Serialize the term table and wrap it under the root key.
    fn to_record(&self) -> Result<KeyringRecord, BarrierError> {
        let payload = KeyringPayload {
            terms: self
                .terms
                .iter()
                .map(|(term, entry)| TermRecord {
                    term: *term,
                    key: BASE64.encode(entry.key.as_bytes()),
                    installed_at: entry.installed_at,
                })
                .collect(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload).map_err(|e| {
            BarrierError::Keyring {
                reason: format!("keyring serialization failed: {e}"),
            }
        })?);
        let wrapped = crypto::encrypt(&self.root_key, &plaintext, KEYRING_PATH.as_bytes())?;
        Ok(KeyringRecord {
            active_term: self.active_term,
            wrapped: BASE64.encode(wrapped),
        })
    }

    /// Unwrap a persisted record with a candidate root key.
    fn from_record(record: &KeyringRecord, root_key: EncryptionKey) -> Result<Self, BarrierError> {
        let wrapped = BASE64
            .decode(&record.wrapped)
            .map_err(|e| BarrierError::Keyring {
                reason: format!("wrapped keyring is not base64: {e}"),
            })?;
        let plaintext = Zeroizing::new(
            crypto::decrypt(&root_key, &wrapped, KEYRING_PATH.as_bytes()).map_err(|_| {
                BarrierError::Integrity {
                    key: KEYRING_PATH.to_owned(),
                }
            })?,
        );
        let payload: KeyringPayload =
            serde_json::from_slice(&plaintext).map_err(|e| BarrierError::Keyring {
                reason: format!("keyring deserialization failed: {e}"),
            })?;

        let mut terms = BTreeMap::new();
        for entry in &payload.terms {
            let bytes = Zeroizing::new(BASE64.decode(&entry.key).map_err(|e| {
                BarrierError::Keyring {
                    reason: format!("term {} key is not base64: {e}", entry.term),
                }
            })?);
            let key = EncryptionKey::from_slice(&bytes).ok_or_else(|| BarrierError::Keyring {
                reason: format!("term {} key is not 32 bytes", entry.term),
            })?;
            terms.insert(
                entry.term,
                KeyTerm {
                    key,
                    installed_at: entry.installed_at,
                },
            );
        }

        let keyring = Self {
            root_key,
            active_term: record.active_term,
            terms,
        };
        keyring.active()?;
        Ok(keyring)
    }
}

/// Persisted form of the keyring: the active term in the clear, the term
/// table wrapped under the root key.
#[derive(Debug, Serialize, Deserialize)]
struct KeyringRecord {
    active_term: u32,
    wrapped: String,
}

#[derive(Serialize, Deserialize)]
struct KeyringPayload {
    terms: Vec<TermRecord>,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct TermRecord {
    term: u32,
    key: String,
    #[zeroize(skip)]
    installed_at: DateTime<Utc>,
}

/// The encryption barrier wrapping a storage backend.
///
/// All reads decrypt, all writes encrypt. Operations hold the state read lock
/// for their duration, so a seal waits for in-flight I/O and later I/O sees
/// [`BarrierError::Sealed`].
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    state: RwLock<Option<Keyring>>,
}

impl Barrier {
    /// Create a new sealed barrier wrapping the given storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            state: RwLock::new(None),
        }
    }

    /// Whether a keyring has been written to storage.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the backend fails.
    pub async fn is_initialized(&self) -> Result<bool, BarrierError> {
        Ok(self.storage.exists(KEYRING_PATH).await?)
    }

    /// Create and persist a fresh keyring wrapped under `root_key`.
    ///
    /// The barrier stays sealed; call [`unseal`](Self::unseal) afterwards.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::AlreadyInitialized`] if a keyring already exists.
    /// - [`BarrierError::Crypto`] / [`BarrierError::Storage`] on failure.
    pub async fn initialize(&self, root_key: &EncryptionKey) -> Result<(), BarrierError> {
        if self.is_initialized().await? {
            return Err(BarrierError::AlreadyInitialized);
        }
        let keyring = Keyring::new(root_key.clone());
        self.persist_keyring(&keyring).await?;
        info!(term = keyring.active_term, "barrier keyring initialized");
        Ok(())
    }

    /// Unseal the barrier with the root key.
    ///
    /// Loads and unwraps the keyring. A wrong root key surfaces as
    /// [`BarrierError::Integrity`] on the keyring record.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::NotInitialized`] if no keyring exists.
    /// - [`BarrierError::Integrity`] if the root key cannot unwrap the keyring.
    pub async fn unseal(&self, root_key: EncryptionKey) -> Result<(), BarrierError> {
        let record = self.load_keyring_record().await?;
        let keyring = Keyring::from_record(&record, root_key)?;
        let term = keyring.active_term;
        *self.state.write().await = Some(keyring);
        info!(term, "barrier unsealed");
        Ok(())
    }

    /// Seal the barrier, dropping (and thereby zeroizing) every key.
    pub async fn seal(&self) {
        let mut guard = self.state.write().await;
        *guard = None;
    }

    /// Whether the barrier is currently unsealed.
    pub async fn is_unsealed(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Install a new keyring term and make it active for future writes.
    ///
    /// Returns the new term number.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Storage`] if the keyring cannot be persisted; the
    ///   in-memory keyring is left unchanged in that case.
    pub async fn rotate(&self) -> Result<u32, BarrierError> {
        let mut guard = self.state.write().await;
        let current = guard.as_ref().ok_or(BarrierError::Sealed)?;

        let mut next = current.clone();
        let term = next.active_term.checked_add(1).ok_or_else(|| BarrierError::Keyring {
            reason: "key term space exhausted".to_owned(),
        })?;
        next.terms.insert(
            term,
            KeyTerm {
                key: EncryptionKey::generate(),
                installed_at: Utc::now(),
            },
        );
        next.active_term = term;

        self.persist_keyring(&next).await?;
        *guard = Some(next);

        info!(term, "barrier key rotated");
        Ok(term)
    }

    /// Drop a retired term from the keyring.
    ///
    /// Anything still encrypted under that term becomes unreadable and fails
    /// with [`BarrierError::UnknownTerm`].
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Keyring`] if `term` is active or not present.
    pub async fn remove_term(&self, term: u32) -> Result<(), BarrierError> {
        let mut guard = self.state.write().await;
        let current = guard.as_ref().ok_or(BarrierError::Sealed)?;

        if term == current.active_term {
            return Err(BarrierError::Keyring {
                reason: format!("cannot remove active term {term}"),
            });
        }
        if !current.terms.contains_key(&term) {
            return Err(BarrierError::Keyring {
                reason: format!("term {term} is not in the keyring"),
            });
        }

        let mut next = current.clone();
        next.terms.remove(&term);
        self.persist_keyring(&next).await?;
        *guard = Some(next);

        warn!(term, "barrier key term removed");
        Ok(())
    }

    /// Re-wrap the keyring under a new root key (used by rekey). Returns the
    /// root key it replaced, so a failed rekey can put it back.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Storage`] if the keyring cannot be persisted.
    pub async fn rewrap(&self, new_root_key: EncryptionKey) -> Result<EncryptionKey, BarrierError> {
        let mut guard = self.state.write().await;
        let current = guard.as_ref().ok_or(BarrierError::Sealed)?;

        let mut next = current.clone();
        let previous = std::mem::replace(&mut next.root_key, new_root_key);
        self.persist_keyring(&next).await?;
        *guard = Some(next);

        info!("barrier keyring re-wrapped under new root key");
        Ok(previous)
    }

    /// Report the active term.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] if sealed.
    pub async fn key_status(&self) -> Result<KeyStatus, BarrierError> {
        let guard = self.state.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;
        let active = keyring.active()?;
        Ok(KeyStatus {
            term: keyring.active_term,
            installed_at: active.installed_at,
            terms: keyring.terms.len(),
        })
    }

    /// Read a value, decrypting it through the barrier.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Integrity`] if the value fails authentication.
    /// - [`BarrierError::UnknownTerm`] if its term was removed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        let guard = self.state.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;

        match self.storage.get(key).await? {
            None => Ok(None),
            Some(framed) => keyring.decrypt(key, &framed).map(Some),
        }
    }

    /// Encrypt and write a value under the active term.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Crypto`] if encryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        let guard = self.state.read().await;
        let keyring = guard.as_ref().ok_or(BarrierError::Sealed)?;

        let framed = keyring.encrypt(key, value)?;
        self.storage.put(key, &framed).await?;
        Ok(())
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        let guard = self.state.read().await;
        guard.as_ref().ok_or(BarrierError::Sealed)?;
        self.storage.delete(key).await?;
        Ok(())
    }

    /// List the immediate children of `prefix`.
    ///
    /// Keys are not encrypted, only values, so listing needs no decryption.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        let guard = self.state.read().await;
        guard.as_ref().ok_or(BarrierError::Sealed)?;
        Ok(self.storage.list(prefix).await?)
    }

    /// Check whether a key exists.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn exists(&self, key: &str) -> Result<bool, BarrierError> {
        let guard = self.state.read().await;
        guard.as_ref().ok_or(BarrierError::Sealed)?;
        Ok(self.storage.exists(key).await?)
    }

    /// Write raw bytes WITHOUT encryption.
    ///
    /// Only for records that must be readable while sealed (seal
    /// configuration, verification value). Never for secret data.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the storage backend fails.
    pub async fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        self.storage.put(key, value).await?;
        Ok(())
    }

    /// Read raw bytes WITHOUT decryption.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the storage backend fails.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        Ok(self.storage.get(key).await?)
    }

    async fn load_keyring_record(&self) -> Result<KeyringRecord, BarrierError> {
        let bytes = self
            .storage
            .get(KEYRING_PATH)
            .await?
            .ok_or(BarrierError::NotInitialized)?;
        serde_json::from_slice(&bytes).map_err(|e| BarrierError::Keyring {
            reason: format!("keyring record is malformed: {e}"),
        })
    }

    async fn persist_keyring(&self, keyring: &Keyring) -> Result<(), BarrierError> {
        let record = keyring.to_record()?;
        let bytes = serde_json::to_vec(&record).map_err(|e| BarrierError::Keyring {
            reason: format!("keyring record serialization failed: {e}"),
        })?;
        self.storage.put(KEYRING_PATH, &bytes).await?;
        Ok(())
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}
