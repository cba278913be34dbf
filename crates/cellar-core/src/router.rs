//! Request router for `cellar`.
//!
//! The router owns the mount table and one backend instance per mount. A
//! request path is matched against the table by longest prefix, the mount
//! prefix is stripped, and the remainder is handed to the mount's backend.
//!
//! Routing holds the table's read lock for the whole dispatch; mount, unmount,
//! remount, and tune take the write lock. A table mutation therefore waits for
//! in-flight requests to finish against the old binding, and no request ever
//! sees a half-applied change.
//!
//! A mount can be *tainted* while its leases are being revoked ahead of an
//! unmount or remount. New requests to a tainted mount are rejected with
//! [`RouterError::NoBackend`]; renewals and revocations still reach it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{info, warn};

use crate::backend::{Backend, BackendRegistry, BackendRequest, BackendResponse, LeaseData};
use crate::barrier::Barrier;
use crate::error::{MountError, RouterError};
use crate::mount::{self, MOUNT_TABLE_PATH, MountConfig, MountEntry, MountTable};
use crate::view::StorageView;

/// A routed response together with the mount that produced it.
///
/// Holds the mount table's read lock until dropped, so a lease registered
/// for the response is recorded before any unmount or remount of the mount
/// can start revoking.
pub struct RoutedResponse<'a> {
    /// The mount that served the request.
    pub mount: MountEntry,
    /// The backend's response.
    pub response: BackendResponse,
    _binding: RwLockReadGuard<'a, RouteTable>,
}

impl fmt::Debug for RoutedResponse<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedResponse")
            .field("mount", &self.mount)
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RouteTable {
    mounts: MountTable,
    /// Backend instances keyed by mount UUID.
    backends: HashMap<String, Arc<dyn Backend>>,
    tainted: HashSet<String>,
}

impl RouteTable {
    /// Resolve `path` to its mount, backend, and mount-relative remainder.
    fn resolve(&self, path: &str) -> Result<(&MountEntry, &Arc<dyn Backend>, String), RouterError> {
        let no_backend = || RouterError::NoBackend {
            path: path.to_owned(),
        };
        let entry = self.mounts.longest_prefix(path).ok_or_else(no_backend)?;
        let backend = self.backends.get(&entry.uuid).ok_or_else(no_backend)?;
        let remainder = path.strip_prefix(entry.path.as_str()).unwrap_or_default();
        Ok((entry, backend, remainder.to_owned()))
    }
}

/// Dispatches requests to mounted backends.
pub struct Router {
    barrier: Arc<Barrier>,
    registry: BackendRegistry,
    table: RwLock<RouteTable>,
}

impl Router {
    /// Create a router with an empty table.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, registry: BackendRegistry) -> Self {
        Self {
            barrier,
            registry,
            table: RwLock::new(RouteTable::default()),
        }
    }

    /// Load the persisted mount table and build every backend. Runs after unseal.
    ///
    /// # Errors
    ///
    /// - [`MountError::Barrier`] if the table cannot be read.
    /// - [`MountError::Serialization`] if it is malformed.
    /// - [`MountError::UnknownBackendType`] if a persisted mount names a type
    ///   with no registered factory.
    pub async fn load(&self) -> Result<usize, RouterError> {
        let mounts = match self.barrier.get(MOUNT_TABLE_PATH).await.map_err(MountError::from)? {
            Some(bytes) => {
                serde_json::from_slice::<MountTable>(&bytes).map_err(|e| {
                    MountError::Serialization {
                        reason: format!("mount table is malformed: {e}"),
                    }
                })?
            }
            None => MountTable::default(),
        };

        let mut backends = HashMap::with_capacity(mounts.len());
        for entry in mounts.entries() {
            let backend = self.registry.create(entry, self.view_for(entry))?;
            backends.insert(entry.uuid.clone(), backend);
        }

        let count = mounts.len();
        *self.table.write().await = RouteTable {
            mounts,
            backends,
            tainted: HashSet::new(),
        };
        info!(mounts = count, "mount table loaded");
        Ok(count)
    }

    /// Drop every mount from memory. Runs before seal.
    pub async fn clear(&self) {
        *self.table.write().await = RouteTable::default();
    }

    /// Mount a new backend.
    ///
    /// # Errors
    ///
    /// - [`MountError::UnknownBackendType`] if the type has no factory.
    /// - [`MountError::Reserved`] / [`MountError::PathConflict`] if the path is taken.
    /// - [`MountError::Barrier`] if the table cannot be persisted.
    pub async fn mount(&self, entry: MountEntry) -> Result<MountEntry, RouterError> {
        let mut entry = entry;
        entry.path = mount::normalize_path(&entry.path)?;
        let backend = self.registry.create(&entry, self.view_for(&entry))?;

        let mut table = self.table.write().await;
        let mut next = table.mounts.clone();
        next.insert(entry.clone())?;
        self.persist(&next).await?;

        table.mounts = next;
        table.backends.insert(entry.uuid.clone(), backend);

        info!(path = %entry.path, backend_type = %entry.backend_type, "backend mounted");
        Ok(entry)
    }

    /// Remove a mount and erase its data.
    ///
    /// Leases under the mount must already be revoked.
    ///
    /// # Errors
    ///
    /// - [`MountError::NotMounted`] if nothing is mounted at `path`.
    /// - [`MountError::Barrier`] if the table cannot be persisted or the data
    ///   cannot be cleared.
    pub async fn unmount(&self, path: &str) -> Result<MountEntry, RouterError> {
        let path = mount::normalize_path(path)?;

        let mut table = self.table.write().await;
        let mut next = table.mounts.clone();
        let entry = next.remove(&path)?;
        self.persist(&next).await?;

        table.mounts = next;
        table.backends.remove(&entry.uuid);
        table.tainted.remove(&path);
        drop(table);

        let removed = self
            .view_for(&entry)
            .clear()
            .await
            .map_err(MountError::from)?;

        info!(path = %path, keys_removed = removed, "backend unmounted");
        Ok(entry)
    }

    /// Move a mount to a new path, keeping its data and backend instance.
    ///
    /// # Errors
    ///
    /// - [`MountError::NotMounted`] if `from` does not exist.
    /// - [`MountError::Reserved`] / [`MountError::PathConflict`] if `to` is taken.
    /// - [`MountError::Barrier`] if the table cannot be persisted.
    pub async fn remount(&self, from: &str, to: &str) -> Result<MountEntry, RouterError> {
        let from = mount::normalize_path(from)?;
        let to = mount::normalize_path(to)?;

        let mut table = self.table.write().await;
        let mut next = table.mounts.clone();
        let entry = next.rename(&from, &to)?;
        self.persist(&next).await?;

        table.mounts = next;
        table.tainted.remove(&from);

        info!(from = %from, to = %to, "backend remounted");
        Ok(entry)
    }

    /// Update a mount's TTL configuration.
    ///
    /// # Errors
    ///
    /// - [`MountError::NotMounted`] if nothing is mounted at `path`.
    /// - [`MountError::Barrier`] if the table cannot be persisted.
    pub async fn tune(&self, path: &str, config: MountConfig) -> Result<MountEntry, RouterError> {
        let path = mount::normalize_path(path)?;

        let mut table = self.table.write().await;
        let mut next = table.mounts.clone();
        let entry = next.get_mut(&path).ok_or_else(|| MountError::NotMounted {
            path: path.clone(),
        })?;
        entry.config = config;
        let updated = entry.clone();
        self.persist(&next).await?;
        table.mounts = next;

        info!(
            path = %path,
            default_lease_ttl = config.default_lease_ttl,
            max_lease_ttl = config.max_lease_ttl,
            "mount tuned"
        );
        Ok(updated)
    }

    /// Reject new requests to the mount at `path` until it is untainted,
    /// unmounted, or remounted.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NotMounted`] if nothing is mounted at `path`.
    pub async fn taint(&self, path: &str) -> Result<(), RouterError> {
        let path = mount::normalize_path(path)?;
        let mut table = self.table.write().await;
        if table.mounts.get(&path).is_none() {
            return Err(MountError::NotMounted { path }.into());
        }
        table.tainted.insert(path);
        Ok(())
    }

    /// Accept requests to `path` again.
    pub async fn untaint(&self, path: &str) {
        if let Ok(path) = mount::normalize_path(path) {
            self.table.write().await.tainted.remove(&path);
        }
    }

    /// Every mount, ordered by path.
    pub async fn mounts(&self) -> Vec<MountEntry> {
        self.table.read().await.mounts.entries().cloned().collect()
    }

    /// The mount with the given UUID, if any.
    pub async fn mount_by_uuid(&self, uuid: &str) -> Option<MountEntry> {
        self.table
            .read()
            .await
            .mounts
            .entries()
            .find(|entry| entry.uuid == uuid)
            .cloned()
    }

    /// The mount that owns `path`, if any.
    pub async fn matching_mount(&self, path: &str) -> Option<MountEntry> {
        self.table.read().await.mounts.longest_prefix(path).cloned()
    }

    /// Dispatch a request. `req.path` is the full logical path.
    ///
    /// The returned value keeps the table read-locked; drop it once any
    /// lease for the response is recorded.
    ///
    /// # Errors
    ///
    /// - [`RouterError::NoBackend`] if no mount matches or the mount is tainted.
    /// - [`RouterError::Backend`] if the backend fails.
    pub async fn route(&self, req: &BackendRequest) -> Result<RoutedResponse<'_>, RouterError> {
        let table = self.table.read().await;
        let (entry, backend, remainder) = table.resolve(&req.path)?;
        if table.tainted.contains(&entry.path) {
            return Err(RouterError::NoBackend {
                path: req.path.clone(),
            });
        }
        let entry = entry.clone();
        let backend = Arc::clone(backend);

        let scoped = BackendRequest {
            operation: req.operation,
            path: remainder,
            data: req.data.clone(),
        };
        let response = backend
            .handle_request(&scoped)
            .await
            .map_err(|source| RouterError::Backend {
                mount: entry.path.clone(),
                source,
            })?;

        Ok(RoutedResponse {
            mount: entry,
            response,
            _binding: table,
        })
    }

    /// Ask the backend owning `path` to revoke a lease.
    ///
    /// # Errors
    ///
    /// - [`RouterError::NoBackend`] if no mount owns `path`.
    /// - [`RouterError::Backend`] if the backend does not confirm revocation.
    pub async fn route_revoke(
        &self,
        path: &str,
        lease_id: &str,
        internal: &serde_json::Value,
    ) -> Result<(), RouterError> {
        let table = self.table.read().await;
        let (entry, backend, remainder) = table.resolve(path)?;
        let lease = LeaseData {
            lease_id: lease_id.to_owned(),
            path: remainder,
            internal: internal.clone(),
        };
        backend.handle_revoke(&lease).await.map_err(|source| {
            warn!(lease_id, mount = %entry.path, error = %source, "backend revoke failed");
            RouterError::Backend {
                mount: entry.path.clone(),
                source,
            }
        })
    }

    /// Ask the backend owning `path` to renew a lease.
    ///
    /// # Errors
    ///
    /// - [`RouterError::NoBackend`] if no mount owns `path`.
    /// - [`RouterError::Backend`] if the backend refuses.
    pub async fn route_renew(
        &self,
        path: &str,
        lease_id: &str,
        internal: &serde_json::Value,
        requested: Duration,
    ) -> Result<Duration, RouterError> {
        let table = self.table.read().await;
        let (entry, backend, remainder) = table.resolve(path)?;
        let lease = LeaseData {
            lease_id: lease_id.to_owned(),
            path: remainder,
            internal: internal.clone(),
        };
        backend
            .handle_renew(&lease, requested)
            .await
            .map_err(|source| RouterError::Backend {
                mount: entry.path.clone(),
                source,
            })
    }

    fn view_for(&self, entry: &MountEntry) -> StorageView {
        StorageView::new(Arc::clone(&self.barrier), &entry.storage_prefix())
    }

    async fn persist(&self, mounts: &MountTable) -> Result<(), MountError> {
        let bytes = serde_json::to_vec(mounts).map_err(|e| MountError::Serialization {
            reason: e.to_string(),
        })?;
        self.barrier.put(MOUNT_TABLE_PATH, &bytes).await?;
        Ok(())
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cellar_storage::MemoryBackend;
    use serde_json::json;

    use super::*;
    use crate::backend::{BackendFactory, Operation};
    use crate::crypto::EncryptionKey;
    use crate::error::BackendError;

    async fn barrier() -> Arc<Barrier> {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        let root = EncryptionKey::generate();
        barrier.initialize(&root).await.unwrap();
        barrier.unseal(root).await.unwrap();
        barrier
    }

    async fn router() -> Router {
        Router::new(barrier().await, BackendRegistry::with_builtins())
    }

    fn kv(path: &str) -> MountEntry {
        MountEntry::new(path, "kv", "", MountConfig::default()).unwrap()
    }

    fn write(path: &str) -> BackendRequest {
        BackendRequest {
            operation: Operation::Write,
            path: path.to_owned(),
            data: Some(json!({"v": path})),
        }
    }

    fn read(path: &str) -> BackendRequest {
        BackendRequest {
            operation: Operation::Read,
            path: path.to_owned(),
            data: None,
        }
    }

    #[tokio::test]
    async fn nested_mount_is_a_conflict() {
        let router = router().await;
        router.mount(kv("a/")).await.unwrap();
        let err = router.mount(kv("a/b/")).await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::Mount(MountError::PathConflict { .. })
        ));
    }

    #[tokio::test]
    async fn longest_prefix_match_and_strip() {
        let router = router().await;
        router.mount(kv("a/")).await.unwrap();
        router.mount(kv("secret/")).await.unwrap();

        router.route(&write("a/b/c")).await.unwrap();
        let routed = router.route(&read("a/b/c")).await.unwrap();
        assert_eq!(routed.mount.path, "a/");
        assert_eq!(routed.response.data.unwrap()["v"], "a/b/c");

        let other = router.route(&read("secret/b/c")).await.unwrap();
        assert!(other.response.data.is_none());
    }

    #[tokio::test]
    async fn unmatched_path_is_no_backend() {
        let router = router().await;
        assert!(matches!(
            router.route(&read("nowhere/x")).await,
            Err(RouterError::NoBackend { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_backend_type_is_rejected() {
        let router = router().await;
        let entry = MountEntry::new("x/", "nope", "", MountConfig::default()).unwrap();
        assert!(matches!(
            router.mount(entry).await,
            Err(RouterError::Mount(MountError::UnknownBackendType { .. }))
        ));
    }

    #[tokio::test]
    async fn unmount_erases_data() {
        let router = router().await;
        let entry = router.mount(kv("a/")).await.unwrap();
        router.route(&write("a/x")).await.unwrap();

        router.unmount("a").await.unwrap();
        assert!(matches!(
            router.route(&read("a/x")).await,
            Err(RouterError::NoBackend { .. })
        ));
        assert!(
            router
                .view_for(&entry)
                .collect_keys("")
                .await
                .unwrap()
                .is_empty()
        );
        assert!(matches!(
            router.unmount("a/").await,
            Err(RouterError::Mount(MountError::NotMounted { .. }))
        ));
    }

    #[tokio::test]
    async fn remount_moves_data() {
        let router = router().await;
        router.mount(kv("old/")).await.unwrap();
        router.route(&write("old/x")).await.unwrap();

        router.remount("old/", "new/").await.unwrap();
        assert!(matches!(
            router.route(&read("old/x")).await,
            Err(RouterError::NoBackend { .. })
        ));
        let routed = router.route(&read("new/x")).await.unwrap();
        assert_eq!(routed.response.data.unwrap()["v"], "old/x");
    }

    #[tokio::test]
    async fn table_survives_reload() {
        let router = router().await;
        router.mount(kv("a/")).await.unwrap();
        router.route(&write("a/x")).await.unwrap();
        router
            .tune(
                "a/",
                MountConfig {
                    default_lease_ttl: 10,
                    max_lease_ttl: 20,
                },
            )
            .await
            .unwrap();

        router.clear().await;
        assert!(router.mounts().await.is_empty());
        assert_eq!(router.load().await.unwrap(), 1);

        let mounts = router.mounts().await;
        assert_eq!(mounts[0].config.max_lease_ttl, 20);
        assert!(router.route(&read("a/x")).await.unwrap().response.data.is_some());
    }

    #[tokio::test]
    async fn tainted_mount_rejects_requests_but_revokes() {
        let router = router().await;
        router.mount(kv("a/")).await.unwrap();
        router.taint("a/").await.unwrap();

        assert!(matches!(
            router.route(&read("a/x")).await,
            Err(RouterError::NoBackend { .. })
        ));
        router.route_revoke("a/x", "lease", &json!({})).await.unwrap();

        router.untaint("a/").await;
        router.route(&read("a/x")).await.unwrap();
    }

    struct Failing {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Backend for Failing {
        async fn handle_request(
            &self,
            _req: &BackendRequest,
        ) -> Result<BackendResponse, BackendError> {
            Err(BackendError::Internal {
                reason: "down".to_owned(),
            })
        }

        async fn handle_revoke(&self, _lease: &LeaseData) -> Result<(), BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Internal {
                reason: "down".to_owned(),
            })
        }

        async fn handle_renew(
            &self,
            _lease: &LeaseData,
            _requested: Duration,
        ) -> Result<Duration, BackendError> {
            Err(BackendError::Unsupported {
                operation: "renew".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn backend_errors_carry_mount_context() {
        let failing = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });
        let shared = Arc::clone(&failing);
        let factory: BackendFactory =
            Arc::new(move |_view: StorageView, _entry: &MountEntry| -> Arc<dyn Backend> {
                Arc::clone(&shared) as Arc<dyn Backend>
            });
        let mut registry = BackendRegistry::with_builtins();
        registry.register("failing", factory);

        let router = Router::new(barrier().await, registry);
        router
            .mount(MountEntry::new("f/", "failing", "", MountConfig::default()).unwrap())
            .await
            .unwrap();

        let err = router.route(&read("f/x")).await.unwrap_err();
        assert!(err.to_string().contains("f/"));
        assert_eq!(err.kind(), crate::error::ErrorKind::Backend);

        assert!(router.route_revoke("f/x", "l1", &json!({})).await.is_err());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    }
}
