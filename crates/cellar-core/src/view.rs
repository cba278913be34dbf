//! Prefix-scoped views over the barrier.
//!
//! Every mount gets a [`StorageView`] rooted at `logical/<mount-uuid>/`.
//! Keys passed to a view are relative to its prefix, so a backend can only
//! ever address its own subtree.

use std::sync::Arc;

use crate::barrier::Barrier;
use crate::error::BarrierError;

/// A barrier-backed key namespace.
#[derive(Clone)]
pub struct StorageView {
    barrier: Arc<Barrier>,
    prefix: String,
}

impl StorageView {
    /// Create a view rooted at `prefix`. A trailing `/` is added if missing.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, prefix: &str) -> Self {
        let mut prefix = prefix.to_owned();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { barrier, prefix }
    }

    fn absolute(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.trim_start_matches('/'))
    }

    /// Read and decrypt a value.
    ///
    /// # Errors
    ///
    /// Propagates [`BarrierError`] from the barrier.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        self.barrier.get(&self.absolute(key)).await
    }

    /// Encrypt and write a value.
    ///
    /// # Errors
    ///
    /// Propagates [`BarrierError`] from the barrier.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        self.barrier.put(&self.absolute(key), value).await
    }

    /// Delete a value.
    ///
    /// # Errors
    ///
    /// Propagates [`BarrierError`] from the barrier.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.barrier.delete(&self.absolute(key)).await
    }

    /// List immediate children of `prefix` within the view.
    ///
    /// # Errors
    ///
    /// Propagates [`BarrierError`] from the barrier.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        self.barrier.list(&self.absolute(prefix)).await
    }

    /// Check whether a key exists.
    ///
    /// # Errors
    ///
    /// Propagates [`BarrierError`] from the barrier.
    pub async fn exists(&self, key: &str) -> Result<bool, BarrierError> {
        self.barrier.exists(&self.absolute(key)).await
    }

    /// Recursively collect every leaf key under `prefix`, relative to the view.
    ///
    /// # Errors
    ///
    /// Propagates [`BarrierError`] from the barrier.
    pub async fn collect_keys(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        let mut keys = Vec::new();
        let mut pending = vec![prefix.to_owned()];

        while let Some(folder) = pending.pop() {
            for child in self.list(&folder).await? {
                let path = format!("{folder}{child}");
                if child.ends_with('/') {
                    pending.push(path);
                } else {
                    keys.push(path);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Delete every key in the view. Returns the number of keys removed.
    ///
    /// # Errors
    ///
    /// Propagates [`BarrierError`] from the barrier.
    pub async fn clear(&self) -> Result<usize, BarrierError> {
        let keys = self.collect_keys("").await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }
}

impl std::fmt::Debug for StorageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageView")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
