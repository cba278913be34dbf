//! Mount table for `cellar`.
//!
//! The mount table maps path prefixes to backend instances. Paths are
//! normalized to a single trailing `/` and form a prefix tree in which no
//! entry may be a prefix of another, so every request path has at most one
//! owning mount.
//!
//! The table is plain data. Locking and persistence (at `core/mounts`,
//! through the barrier) belong to the [`Router`](crate::router::Router).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MountError;

/// Storage key for the serialized mount table.
pub const MOUNT_TABLE_PATH: &str = "core/mounts";

/// Prefixes owned by the system itself.
pub const RESERVED_PREFIXES: &[&str] = &["sys/", "auth/"];

/// Per-mount TTL overrides, in seconds. `0` means "use the system value".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Default lease TTL for secrets issued under this mount.
    #[serde(default)]
    pub default_lease_ttl: u64,
    /// Maximum lease TTL for secrets issued under this mount.
    #[serde(default)]
    pub max_lease_ttl: u64,
}

impl MountConfig {
    /// Effective maximum TTL, never above the system maximum.
    #[must_use]
    pub fn max_ttl(&self, system_max: Duration) -> Duration {
        match self.max_lease_ttl {
            0 => system_max,
            secs => Duration::from_secs(secs).min(system_max),
        }
    }

    /// Effective default TTL, never above the effective maximum.
    #[must_use]
    pub fn default_ttl(&self, system_default: Duration, system_max: Duration) -> Duration {
        let default = match self.default_lease_ttl {
            0 => system_default,
            secs => Duration::from_secs(secs),
        };
        default.min(self.max_ttl(system_max))
    }

    /// Reject a default above the effective maximum.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::InvalidConfig`] if the default TTL exceeds the
    /// mount maximum (or, without one, the system maximum).
    pub fn validate(&self, system_max: Duration) -> Result<(), MountError> {
        if self.default_lease_ttl == 0 {
            return Ok(());
        }
        let max = match self.max_lease_ttl {
            0 => system_max.as_secs(),
            secs => secs,
        };
        if self.default_lease_ttl > max {
            return Err(MountError::InvalidConfig {
                reason: format!(
                    "default lease TTL {}s exceeds maximum {max}s",
                    self.default_lease_ttl
                ),
            });
        }
        Ok(())
    }
}

/// A single mount entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Normalized mount path, always ending in `/` (e.g. `secret/`).
    pub path: String,
    /// Backend type used to build the instance (e.g. `kv`).
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// TTL overrides.
    #[serde(default)]
    pub config: MountConfig,
    /// Stable identifier. Names the mount's storage namespace and prefixes
    /// every lease it issues.
    pub uuid: String,
}

impl MountEntry {
    /// Build a new entry with a fresh UUID.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::InvalidPath`] if `path` is malformed.
    pub fn new(
        path: &str,
        backend_type: &str,
        description: &str,
        config: MountConfig,
    ) -> Result<Self, MountError> {
        if backend_type.trim().is_empty() {
            return Err(MountError::InvalidPath {
                reason: "backend type cannot be empty".to_owned(),
            });
        }
        Ok(Self {
            path: normalize_path(path)?,
            backend_type: backend_type.to_owned(),
            description: description.to_owned(),
            config,
            uuid: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Barrier prefix holding this mount's data.
    #[must_use]
    pub fn storage_prefix(&self) -> String {
        format!("logical/{}/", self.uuid)
    }
}

/// Normalize a mount path: strip surrounding slashes, reject empty or
/// traversal segments, and append a single trailing `/`.
///
/// # Errors
///
/// Returns [`MountError::InvalidPath`] if the path is empty or malformed.
pub fn normalize_path(path: &str) -> Result<String, MountError> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(MountError::InvalidPath {
            reason: "mount path cannot be empty".to_owned(),
        });
    }
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(MountError::InvalidPath {
                reason: format!("invalid segment in mount path '{path}'"),
            });
        }
    }
    Ok(format!("{trimmed}/"))
}

/// The full mount table, keyed by normalized path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountTable {
    entries: BTreeMap<String, MountEntry>,
}

impl MountTable {
    /// Ensure `path` (already normalized) can be mounted.
    ///
    /// `ignore` names an existing mount to leave out of the overlap check,
    /// which lets a remount move a mount below or above its old location.
    ///
    /// # Errors
    ///
    /// - [`MountError::Reserved`] if the path is under a system prefix.
    /// - [`MountError::PathConflict`] if it overlaps an existing mount.
    pub fn check_available(&self, path: &str, ignore: Option<&str>) -> Result<(), MountError> {
        if RESERVED_PREFIXES
            .iter()
            .any(|reserved| path.starts_with(reserved))
        {
            return Err(MountError::Reserved {
                path: path.to_owned(),
            });
        }

        let conflict = self
            .entries
            .keys()
            .filter(|existing| Some(existing.as_str()) != ignore)
            .find(|existing| path.starts_with(existing.as_str()) || existing.starts_with(path));

        match conflict {
            Some(existing) => Err(MountError::PathConflict {
                path: path.to_owned(),
                existing: existing.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Insert a new entry.
    ///
    /// # Errors
    ///
    /// Same as [`check_available`](Self::check_available).
    pub fn insert(&mut self, entry: MountEntry) -> Result<(), MountError> {
        self.check_available(&entry.path, None)?;
        self.entries.insert(entry.path.clone(), entry);
        Ok(())
    }

    /// Remove the entry at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NotMounted`] if nothing is mounted there.
    pub fn remove(&mut self, path: &str) -> Result<MountEntry, MountError> {
        self.entries
            .remove(path)
            .ok_or_else(|| MountError::NotMounted {
                path: path.to_owned(),
            })
    }

    /// Move the entry at `from` to `to`, keeping its UUID.
    ///
    /// # Errors
    ///
    /// - [`MountError::NotMounted`] if `from` does not exist.
    /// - [`MountError::Reserved`] / [`MountError::PathConflict`] if `to` is taken.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<MountEntry, MountError> {
        if !self.entries.contains_key(from) {
            return Err(MountError::NotMounted {
                path: from.to_owned(),
            });
        }
        self.check_available(to, Some(from))?;
        let mut entry = self.remove(from)?;
        entry.path = to.to_owned();
        self.entries.insert(to.to_owned(), entry.clone());
        Ok(entry)
    }

    /// The entry mounted exactly at `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&MountEntry> {
        self.entries.get(path)
    }

    /// Mutable access to the entry mounted exactly at `path`.
    pub fn get_mut(&mut self, path: &str) -> Option<&mut MountEntry> {
        self.entries.get_mut(path)
    }

    /// Longest mount whose path is a prefix of `request_path`.
    ///
    /// `kv` matches a mount at `kv/` so the mount root is addressable
    /// without a trailing slash.
    #[must_use]
    pub fn longest_prefix(&self, request_path: &str) -> Option<&MountEntry> {
        self.entries
            .values()
            .filter(|entry| {
                request_path.starts_with(entry.path.as_str())
                    || entry.path.strip_suffix('/') == Some(request_path)
            })
            .max_by_key(|entry| entry.path.len())
    }

    /// Every entry, ordered by path.
    pub fn entries(&self) -> impl Iterator<Item = &MountEntry> {
        self.entries.values()
    }

    /// Number of mounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
