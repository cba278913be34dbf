//! Backend contract.
//!
//! A backend is a pluggable handler mounted at a path prefix. It serves
//! requests, and may attach a lease to a response; the expiration manager
//! later calls back into the same backend to renew or revoke that lease.
//! The router holds instances as `Arc<dyn Backend>` and never switches on
//! backend type.
//!
//! Instances are built by a [`BackendFactory`] registered per backend type
//! in a [`BackendRegistry`]. Each instance receives a [`StorageView`] scoped
//! to its mount, so it cannot reach another mount's data.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, MountError};
use crate::mount::MountEntry;
use crate::view::StorageView;

/// Logical operation on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Read a value.
    Read,
    /// Create or update a value.
    Write,
    /// Delete a value.
    Delete,
    /// List keys under a prefix.
    List,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::List => "list",
        };
        f.write_str(name)
    }
}

/// A request as seen by a backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Operation type.
    pub operation: Operation,
    /// Path relative to the mount (the mount prefix is already stripped).
    pub path: String,
    /// Request payload (for writes).
    pub data: Option<serde_json::Value>,
}

/// Lease information attached to a backend response.
#[derive(Debug, Clone, PartialEq)]
pub struct SecretLease {
    /// Requested TTL. `None` means the mount default.
    pub ttl: Option<Duration>,
    /// Whether the lease may be renewed.
    pub renewable: bool,
    /// Opaque data handed back to the backend on renew and revoke.
    pub internal: serde_json::Value,
}

/// A backend's answer to a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendResponse {
    /// Response payload. `None` for "nothing here" or write acknowledgements.
    pub data: Option<serde_json::Value>,
    /// Present when the response grants a lease.
    pub secret: Option<SecretLease>,
}

impl BackendResponse {
    /// A response carrying only data.
    #[must_use]
    pub fn with_data(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            secret: None,
        }
    }
}

/// The lease fields a backend sees on renew and revoke.
#[derive(Debug, Clone)]
pub struct LeaseData {
    /// Lease identifier.
    pub lease_id: String,
    /// Issuing path relative to the mount.
    pub path: String,
    /// The `internal` value from the issuing [`SecretLease`].
    pub internal: serde_json::Value,
}

/// A mounted secret backend.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Serve a request.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the request is invalid or the backend fails.
    async fn handle_request(&self, req: &BackendRequest) -> Result<BackendResponse, BackendError>;

    /// Revoke whatever a lease granted. Must tolerate being called again for
    /// a lease it already revoked.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if revocation could not be confirmed.
    async fn handle_revoke(&self, lease: &LeaseData) -> Result<(), BackendError>;

    /// Extend a lease. Returns the TTL the backend is willing to grant, which
    /// may be shorter than `requested`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the backend refuses the renewal.
    async fn handle_renew(
        &self,
        lease: &LeaseData,
        requested: Duration,
    ) -> Result<Duration, BackendError>;
}

/// Builds a backend instance for a mount.
pub type BackendFactory =
    Arc<dyn Fn(StorageView, &MountEntry) -> Arc<dyn Backend> + Send + Sync>;

/// Backend factories keyed by backend type.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `kv` backend.
    #[must_use]
    pub fn with_builtins() -> Self {
        let kv: BackendFactory =
            Arc::new(|view: StorageView, _entry: &MountEntry| -> Arc<dyn Backend> {
                Arc::new(crate::kv::KvBackend::new(view))
            });
        let mut registry = Self::new();
        registry.register(crate::kv::BACKEND_TYPE, kv);
        registry
    }

    /// Register (or replace) the factory for `backend_type`.
    pub fn register(&mut self, backend_type: &str, factory: BackendFactory) {
        self.factories.insert(backend_type.to_owned(), factory);
    }

    /// Whether a factory exists for `backend_type`.
    #[must_use]
    pub fn contains(&self, backend_type: &str) -> bool {
        self.factories.contains_key(backend_type)
    }

    /// Build the backend for `entry`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::UnknownBackendType`] if no factory is registered.
    pub fn create(
        &self,
        entry: &MountEntry,
        view: StorageView,
    ) -> Result<Arc<dyn Backend>, MountError> {
        let factory =
            self.factories
                .get(&entry.backend_type)
                .ok_or_else(|| MountError::UnknownBackendType {
                    backend_type: entry.backend_type.clone(),
                })?;
        Ok(factory(view, entry))
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("BackendRegistry")
            .field("types", &types)
            .finish()
    }
}
