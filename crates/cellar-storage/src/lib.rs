//! Storage backend abstraction for `cellar`.
//!
//! This crate defines the [`StorageBackend`] trait: a raw, ordered key-value
//! byte store that knows nothing about secrets, encryption, or mounts. The
//! barrier in `cellar-core` wraps a backend so that only ciphertext ever
//! reaches this layer.
//!
//! Two implementations are provided:
//!
//! - [`MemoryBackend`]: in-memory, for tests and development
//! - [`RocksDbBackend`]: persistent, backed by `RocksDB` (feature `rocksdb-backend`)

mod error;
mod memory;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `core/keyring`,
/// `logical/<uuid>/foo`). Values are opaque byte arrays. No transactional
/// guarantees are assumed beyond per-key atomicity.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. Deleting a non-existent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List the immediate children of `prefix`, in key order.
    ///
    /// Entries are relative to the prefix. A child that has descendants of
    /// its own is returned once, with a trailing `/`. For keys `a/b` and
    /// `a/c/d`, `list("a/")` yields `["b", "c/"]`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Check whether a key exists in storage.
    ///
    /// The default implementation calls [`get`](StorageBackend::get) and checks
    /// for `Some`. Backends may override this with a cheaper check.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Fold a sorted run of full keys under `prefix` into immediate child names.
///
/// Shared by every backend so that `list` behaves identically regardless of
/// the persistence engine.
pub(crate) fn immediate_children<'a, I>(prefix: &str, keys: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut children: Vec<String> = Vec::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let child = match rest.find('/') {
            Some(idx) => &rest[..=idx],
            None => rest,
        };
        if children.last().map(String::as_str) != Some(child) {
            children.push(child.to_owned());
        }
    }
    children
}
