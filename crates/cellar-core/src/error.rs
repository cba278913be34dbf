//! Error types for `cellar-core`.
//!
//! Each subsystem owns an error enum. Higher layers wrap lower errors and add
//! context (mount path, lease ID) without discarding the original, so every
//! error can still report its [`ErrorKind`] to a caller. Messages never
//! include key material, share bytes, or secret payloads.

use cellar_storage::StorageError;

/// Caller-facing classification of a failure.
///
/// Transports map kinds onto status codes; retry logic inspects them to
/// decide whether an operation is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation attempted while sealed. Retryable after unseal.
    Sealed,
    /// AEAD authentication failed. Fatal, never retried.
    Integrity,
    /// Mount path overlaps an existing mount.
    PathConflict,
    /// Mount path does not exist.
    NotMounted,
    /// No mount matches the request path.
    NoBackend,
    /// Lease does not exist.
    LeaseNotFound,
    /// Lease is not renewable.
    NotRenewable,
    /// A backend failed while handling a request, renewal, or revocation.
    Backend,
    /// Reconstructed key failed verification; share accumulation was reset.
    ShareMismatch,
    /// Token missing, expired, or not allowed by policy.
    PermissionDenied,
    /// Malformed or out-of-range input.
    InvalidRequest,
    /// Anything else (storage outage, serialization bug).
    Internal,
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// Authentication tag did not verify (wrong key, corrupted or tampered data).
    #[error("message authentication failed")]
    Authentication,

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },
}

/// Errors from the encryption barrier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The barrier is sealed: nothing can be read or written.
    #[error("barrier is sealed")]
    Sealed,

    /// The value stored at `key` failed authentication.
    #[error("integrity check failed for '{key}'")]
    Integrity { key: String },

    /// The value at `key` was written under a keyring term that no longer exists.
    #[error("value at '{key}' was encrypted with unknown key term {term}")]
    UnknownTerm { key: String, term: u32 },

    /// No keyring has been written yet.
    #[error("barrier is not initialized")]
    NotInitialized,

    /// A keyring already exists.
    #[error("barrier is already initialized")]
    AlreadyInitialized,

    /// The keyring record is malformed or an invalid keyring change was requested.
    #[error("keyring error: {reason}")]
    Keyring { reason: String },

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),
}

impl BarrierError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sealed => ErrorKind::Sealed,
            Self::Integrity { .. } | Self::UnknownTerm { .. } => ErrorKind::Integrity,
            Self::NotInitialized | Self::AlreadyInitialized => ErrorKind::InvalidRequest,
            Self::Keyring { .. } | Self::Crypto(_) | Self::Storage(_) => ErrorKind::Internal,
        }
    }
}

/// Errors from the unseal coordinator.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// The vault has already been initialized.
    #[error("vault is already initialized")]
    AlreadyInitialized,

    /// The vault has not been initialized yet.
    #[error("vault is not initialized")]
    NotInitialized,

    /// The vault is already unsealed.
    #[error("vault is already unsealed")]
    AlreadyUnsealed,

    /// The vault is already sealed.
    #[error("vault is already sealed")]
    AlreadySealed,

    /// The operation needs an unsealed vault.
    #[error("vault is sealed")]
    Sealed,

    /// Invalid share count / threshold.
    #[error("invalid seal config: {reason}")]
    InvalidConfig { reason: String },

    /// A submitted share could not be decoded.
    #[error("invalid unseal share: {reason}")]
    InvalidShare { reason: String },

    /// The reconstructed key did not match the verification value.
    #[error("unseal shares did not reconstruct a valid key; progress has been reset")]
    ShareMismatch,

    /// A cryptographic operation failed.
    #[error("seal crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The barrier returned an error.
    #[error("seal barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl SealError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sealed => ErrorKind::Sealed,
            Self::ShareMismatch => ErrorKind::ShareMismatch,
            Self::AlreadyInitialized
            | Self::NotInitialized
            | Self::AlreadyUnsealed
            | Self::AlreadySealed
            | Self::InvalidConfig { .. }
            | Self::InvalidShare { .. } => ErrorKind::InvalidRequest,
            Self::Crypto(_) => ErrorKind::Internal,
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from mount table operations.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// The path overlaps an existing mount in the prefix tree.
    #[error("mount path '{path}' conflicts with existing mount '{existing}'")]
    PathConflict { path: String, existing: String },

    /// No mount exists at the given path.
    #[error("no mount at '{path}'")]
    NotMounted { path: String },

    /// The path is malformed.
    #[error("invalid mount path: {reason}")]
    InvalidPath { reason: String },

    /// The TTL settings are inconsistent.
    #[error("invalid mount config: {reason}")]
    InvalidConfig { reason: String },

    /// The path lies under a prefix reserved for the system.
    #[error("mount path '{path}' is reserved")]
    Reserved { path: String },

    /// No backend factory is registered for the type.
    #[error("unknown backend type: {backend_type}")]
    UnknownBackendType { backend_type: String },

    /// The mount table could not be encoded or decoded.
    #[error("mount table serialization failed: {reason}")]
    Serialization { reason: String },

    /// The barrier returned an error.
    #[error("mount barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl MountError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PathConflict { .. } | Self::Reserved { .. } => ErrorKind::PathConflict,
            Self::NotMounted { .. } => ErrorKind::NotMounted,
            Self::InvalidPath { .. }
            | Self::InvalidConfig { .. }
            | Self::UnknownBackendType { .. } => ErrorKind::InvalidRequest,
            Self::Serialization { .. } => ErrorKind::Internal,
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors returned by backend implementations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Nothing exists at the requested path.
    #[error("nothing found at '{path}'")]
    NotFound { path: String },

    /// The request was malformed.
    #[error("invalid backend request: {reason}")]
    InvalidRequest { reason: String },

    /// The backend does not implement the operation.
    #[error("operation '{operation}' is not supported")]
    Unsupported { operation: String },

    /// The backend's storage view failed.
    #[error("backend storage error: {0}")]
    Storage(#[from] BarrierError),

    /// Backend-specific failure (e.g. the remote system refused a revoke).
    #[error("backend failure: {reason}")]
    Internal { reason: String },
}

impl BackendError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NoBackend,
            Self::InvalidRequest { .. } | Self::Unsupported { .. } => ErrorKind::InvalidRequest,
            Self::Storage(e) => match e.kind() {
                ErrorKind::Internal => ErrorKind::Backend,
                other => other,
            },
            Self::Internal { .. } => ErrorKind::Backend,
        }
    }
}

/// Errors from request routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// No mount matches the path.
    #[error("no backend mounted for path '{path}'")]
    NoBackend { path: String },

    /// The mount table rejected a change.
    #[error(transparent)]
    Mount(#[from] MountError),

    /// The backend mounted at `mount` failed.
    #[error("backend at '{mount}' failed: {source}")]
    Backend {
        mount: String,
        #[source]
        source: BackendError,
    },
}

impl RouterError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoBackend { .. } => ErrorKind::NoBackend,
            Self::Mount(e) => e.kind(),
            Self::Backend { source, .. } => source.kind(),
        }
    }
}

/// Errors from the expiration manager.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The lease does not exist (or was already revoked).
    #[error("lease not found: {lease_id}")]
    NotFound { lease_id: String },

    /// The lease is not renewable.
    #[error("lease is not renewable: {lease_id}")]
    NotRenewable { lease_id: String },

    /// The owning backend failed to revoke the lease. The lease stays recorded.
    #[error("revocation of lease {lease_id} failed: {source}")]
    Revocation {
        lease_id: String,
        #[source]
        source: RouterError,
    },

    /// The owning backend refused to renew the lease.
    #[error("renewal of lease {lease_id} failed: {source}")]
    Renewal {
        lease_id: String,
        #[source]
        source: RouterError,
    },

    /// Token bookkeeping failed while revoking an auth lease or token tree.
    #[error("token revocation for lease {lease_id} failed: {source}")]
    Token {
        lease_id: String,
        #[source]
        source: TokenError,
    },

    /// A tree revocation could not revoke every lease under `root`.
    #[error("revoked {revoked} of {total} leases under '{root}'; first failure: {first}")]
    Incomplete {
        root: String,
        revoked: usize,
        total: usize,
        first: Box<LeaseError>,
    },

    /// A lease record could not be encoded or decoded.
    #[error("lease serialization failed: {reason}")]
    Serialization { reason: String },

    /// The barrier returned an error.
    #[error("lease barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl LeaseError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::LeaseNotFound,
            Self::NotRenewable { .. } => ErrorKind::NotRenewable,
            Self::Revocation { source, .. } | Self::Renewal { source, .. } => {
                match source.kind() {
                    ErrorKind::Sealed => ErrorKind::Sealed,
                    ErrorKind::Integrity => ErrorKind::Integrity,
                    _ => ErrorKind::Backend,
                }
            }
            Self::Token { source, .. } => source.kind(),
            Self::Incomplete { first, .. } => first.kind(),
            Self::Serialization { .. } => ErrorKind::Internal,
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token was not found in storage.
    #[error("token not found")]
    NotFound,

    /// The token has expired.
    #[error("token expired at {expired_at}")]
    Expired { expired_at: String },

    /// A token entry could not be encoded or decoded.
    #[error("token serialization failed: {reason}")]
    Serialization { reason: String },

    /// The barrier returned an error.
    #[error("token barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl TokenError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound | Self::Expired { .. } => ErrorKind::PermissionDenied,
            Self::Serialization { .. } => ErrorKind::Internal,
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from policy operations.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The requested policy was not found.
    #[error("policy not found: {name}")]
    NotFound { name: String },

    /// The policy document is invalid.
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// Cannot modify a built-in policy.
    #[error("cannot modify built-in policy: {name}")]
    BuiltIn { name: String },

    /// Access denied by policy evaluation.
    #[error("permission denied on path '{path}' for capability '{capability}'")]
    Denied { path: String, capability: String },

    /// The barrier returned an error.
    #[error("policy barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl PolicyError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::Invalid { .. } | Self::BuiltIn { .. } => {
                ErrorKind::InvalidRequest
            }
            Self::Denied { .. } => ErrorKind::PermissionDenied,
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Top-level error returned by [`Core`](crate::core::Core).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The vault is sealed.
    #[error("vault is sealed")]
    Sealed,

    /// The request itself was invalid.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Seal lifecycle failure.
    #[error(transparent)]
    Seal(#[from] SealError),

    /// Barrier failure.
    #[error(transparent)]
    Barrier(#[from] BarrierError),

    /// Mount table failure.
    #[error(transparent)]
    Mount(#[from] MountError),

    /// Routing or backend failure.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Lease failure.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Token failure.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Policy failure.
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl CoreError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sealed => ErrorKind::Sealed,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Seal(e) => e.kind(),
            Self::Barrier(e) => e.kind(),
            Self::Mount(e) => e.kind(),
            Self::Router(e) => e.kind(),
            Self::Lease(e) => e.kind(),
            Self::Token(e) => e.kind(),
            Self::Policy(e) => e.kind(),
        }
    }
}
