//! Lease management routes: `/v1/sys/leases/*`
//!
//! Lookup, list, renew, and revoke leases, plus the operator views of
//! leases whose revocation is stuck.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use cellar_core::expiration::{LeaseEntry, LeaseKind, LeaseState};
use cellar_core::policy::Capability;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::routes::mounts::TtlValue;
use crate::state::AppState;

/// Build the `/v1/sys/leases` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_leases))
        .route("/lookup", post(lookup_lease).put(lookup_lease))
        .route("/renew", post(renew_lease).put(renew_lease))
        .route("/revoke", post(revoke_lease).put(revoke_lease))
        .route("/revoke-prefix/{*prefix}", post(revoke_prefix).put(revoke_prefix))
        .route("/revoke-force/{lease_id}", post(force_revoke).put(force_revoke))
        .route("/stuck", get(stuck_leases))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LeaseIdRequest {
    pub lease_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LeaseRenewRequest {
    pub lease_id: String,
    /// Requested TTL. Defaults to the lease's current TTL.
    pub increment: Option<TtlValue>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Serialize)]
pub struct LeaseListResponse {
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RevokePrefixResponse {
    pub revoked: usize,
}

/// Lease details. Backend-internal data is never returned.
#[derive(Debug, Serialize)]
pub struct LeaseResponse {
    pub lease_id: String,
    pub path: String,
    pub kind: LeaseKind,
    pub issued_at: String,
    pub last_renewed: Option<String>,
    pub expire_time: String,
    /// Seconds left before expiry.
    pub ttl: u64,
    pub renewable: bool,
    pub state: LeaseState,
}

impl From<&LeaseEntry> for LeaseResponse {
    fn from(entry: &LeaseEntry) -> Self {
        Self {
            lease_id: entry.lease_id.clone(),
            path: entry.path.clone(),
            kind: entry.kind,
            issued_at: entry.issued_at.to_rfc3339(),
            last_renewed: entry.last_renewed.map(|t| t.to_rfc3339()),
            expire_time: entry.expire_at.to_rfc3339(),
            ttl: entry.remaining().as_secs(),
            renewable: entry.renewable,
            state: entry.state.clone(),
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

/// List lease IDs issued under a path prefix.
async fn list_leases(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<LeaseListResponse>, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/leases", &[Capability::List, Capability::Sudo])
        .await?;
    let keys = state.core.list_leases(&query.prefix).await?;
    Ok(Json(LeaseListResponse { keys }))
}

/// Look up a lease by ID.
async fn lookup_lease(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<LeaseIdRequest>,
) -> Result<Json<LeaseResponse>, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/leases/lookup", &[Capability::Update])
        .await?;
    let entry = state.core.lookup_lease(&body.lease_id).await?;
    Ok(Json(LeaseResponse::from(&entry)))
}

/// Renew a lease.
async fn renew_lease(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<LeaseRenewRequest>,
) -> Result<Json<LeaseResponse>, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/leases/renew", &[Capability::Update])
        .await?;
    let increment = match &body.increment {
        Some(ttl) => Some(Duration::from_secs(ttl.seconds()?)),
        None => None,
    };
    let entry = state.core.renew_lease(&body.lease_id, increment).await?;
    Ok(Json(LeaseResponse::from(&entry)))
}

/// Revoke a lease. Unknown leases succeed.
async fn revoke_lease(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<LeaseIdRequest>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/leases/revoke", &[Capability::Update])
        .await?;
    state.core.revoke_lease(&body.lease_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Revoke every lease issued under a path prefix.
async fn revoke_prefix(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(prefix): Path<String>,
) -> Result<Json<RevokePrefixResponse>, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/leases/revoke-prefix", &[Capability::Sudo])
        .await?;
    let revoked = state.core.revoke_prefix(&prefix).await?;
    Ok(Json(RevokePrefixResponse { revoked }))
}

/// Drop a lease without waiting for its backend to confirm.
async fn force_revoke(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(lease_id): Path<String>,
) -> Result<Json<LeaseResponse>, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/leases/revoke-force", &[Capability::Sudo])
        .await?;
    let entry = state.core.force_revoke_lease(&lease_id).await?;
    Ok(Json(LeaseResponse::from(&entry)))
}

/// Leases whose revocation exhausted its retries.
async fn stuck_leases(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<LeaseResponse>>, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/leases/stuck", &[Capability::Read, Capability::Sudo])
        .await?;
    let stuck = state.core.stuck_leases().await?;
    Ok(Json(stuck.iter().map(LeaseResponse::from).collect()))
}
