//! `RocksDB` storage backend.
//!
//! Wraps the `rocksdb` crate behind the [`StorageBackend`] trait. Every call
//! is moved onto the blocking pool with [`tokio::task::spawn_blocking`] since
//! `RocksDB` is a synchronous C++ library. Keys sort bytewise, which keeps
//! prefix iteration and child listing in storage order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};

use crate::{StorageBackend, StorageError, immediate_children};

type Db = DBWithThreadMode<MultiThreaded>;

/// A storage backend backed by `RocksDB`.
///
/// # Examples
///
/// ```no_run
/// # use cellar_storage::RocksDbBackend;
/// let backend = RocksDbBackend::open("/var/lib/cellar/data").unwrap();
/// ```
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<Db>,
    path: PathBuf,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    /// Open (or create) a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if `RocksDB` cannot open the directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = Db::open(&opts, path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!(path = %path.display(), "rocksdb storage opened");

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Filesystem path of this database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn join_failure(e: &tokio::task::JoinError) -> String {
    format!("blocking task failed: {e}")
}

#[async_trait::async_trait]
impl StorageBackend for RocksDbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let db = Arc::clone(&self.db);
        let owned = key.to_owned();
        tokio::task::spawn_blocking(move || {
            db.get(owned.as_bytes()).map_err(|e| StorageError::Read {
                key: owned,
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Read {
            key: key.to_owned(),
            reason: join_failure(&e),
        })?
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let owned = key.to_owned();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || {
            db.put(owned.as_bytes(), &value)
                .map_err(|e| StorageError::Write {
                    key: owned,
                    reason: e.to_string(),
                })
        })
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: join_failure(&e),
        })?
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let owned = key.to_owned();
        tokio::task::spawn_blocking(move || {
            db.delete(owned.as_bytes()).map_err(|e| StorageError::Delete {
                key: owned,
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Delete {
            key: key.to_owned(),
            reason: join_failure(&e),
        })?
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let db = Arc::clone(&self.db);
        let owned = prefix.to_owned();
        tokio::task::spawn_blocking(move || {
            let iter = db.iterator(IteratorMode::From(owned.as_bytes(), Direction::Forward));

            let mut keys = Vec::new();
            for item in iter {
                let (k, _) = item.map_err(|e| StorageError::List {
                    prefix: owned.clone(),
                    reason: e.to_string(),
                })?;
                let key = String::from_utf8(k.to_vec()).map_err(|e| StorageError::InvalidKey {
                    reason: e.to_string(),
                })?;
                if !key.starts_with(&owned) {
                    break;
                }
                keys.push(key);
            }
            Ok(immediate_children(&owned, keys.iter().map(String::as_str)))
        })
        .await
        .map_err(|e| StorageError::List {
            prefix: prefix.to_owned(),
            reason: join_failure(&e),
        })?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = RocksDbBackend::open(dir.path()).unwrap();
            backend.put("core/keyring", b"wrapped").await.unwrap();
        }
        let backend = RocksDbBackend::open(dir.path()).unwrap();
        assert_eq!(
            backend.get("core/keyring").await.unwrap(),
            Some(b"wrapped".to_vec())
        );
    }

    #[tokio::test]
    async fn list_folds_children() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksDbBackend::open(dir.path()).unwrap();
        backend.put("sys/a", b"1").await.unwrap();
        backend.put("sys/b/c", b"2").await.unwrap();
        backend.put("sysx", b"3").await.unwrap();
        assert_eq!(backend.list("sys/").await.unwrap(), vec!["a", "b/"]);
    }
}
