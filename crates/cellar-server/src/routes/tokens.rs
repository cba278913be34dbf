//! Token routes: `/v1/auth/token/*`
//!
//! Create child tokens, inspect the caller's token, renew its lease, and
//! revoke tokens. Revocation cascades to every descendant token and lease.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use cellar_core::core::{LeaseInfo, TokenRequest};
use cellar_core::policy::Capability;
use cellar_core::token::{TokenEntry, short_hash};

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::routes::leases::LeaseResponse;
use crate::routes::mounts::TtlValue;
use crate::state::AppState;

/// Build the `/v1/auth/token` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/create", post(create_token))
        .route("/lookup-self", get(lookup_self))
        .route("/renew-self", post(renew_self))
        .route("/revoke", post(revoke_token))
        .route("/revoke-self", post(revoke_self))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CreateTokenResponse {
    /// Plaintext token. Shown once.
    pub client_token: String,
    pub policies: Vec<String>,
    pub lease: LeaseInfo,
}

#[derive(Debug, Serialize)]
pub struct TokenLookupResponse {
    pub policies: Vec<String>,
    pub display_name: String,
    pub metadata: BTreeMap<String, String>,
    pub creation_time: String,
    pub expire_time: Option<String>,
    pub num_uses: u32,
    pub renewable: bool,
    pub orphan: bool,
}

impl From<TokenEntry> for TokenLookupResponse {
    fn from(entry: TokenEntry) -> Self {
        Self {
            policies: entry.policies,
            display_name: entry.display_name,
            metadata: entry.metadata,
            creation_time: entry.created_at.to_rfc3339(),
            expire_time: entry.expires_at.map(|t| t.to_rfc3339()),
            num_uses: entry.num_uses,
            renewable: entry.renewable,
            orphan: entry.parent_hash.is_none(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RenewSelfRequest {
    pub increment: Option<TtlValue>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeTokenRequest {
    pub token: String,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// Create a child of the calling token.
async fn create_token(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<TokenRequest>,
) -> Result<Json<CreateTokenResponse>, AppError> {
    state
        .core
        .authorize(
            &auth.token,
            "auth/token/create",
            &[Capability::Create, Capability::Update],
        )
        .await?;
    let created = state.core.create_token(&auth.token, body).await?;

    info!(
        parent = %short_hash(&auth.token_hash),
        token = %short_hash(&created.entry.token_hash),
        "token created over http"
    );

    Ok(Json(CreateTokenResponse {
        client_token: created.token,
        policies: created.entry.policies,
        lease: created.lease,
    }))
}

/// Describe the calling token.
async fn lookup_self(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<TokenLookupResponse>, AppError> {
    let entry = state
        .core
        .authorize(&auth.token, "auth/token/lookup-self", &[Capability::Read])
        .await?;
    Ok(Json(TokenLookupResponse::from(entry)))
}

/// Extend the calling token's lease.
async fn renew_self(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Json<LeaseResponse>, AppError> {
    state
        .core
        .authorize(&auth.token, "auth/token/renew-self", &[Capability::Update])
        .await?;
    // The body is optional; an empty one renews by the current TTL.
    let request: Option<RenewSelfRequest> = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?)
    };
    let increment = match request.and_then(|r| r.increment) {
        Some(ttl) => Some(Duration::from_secs(ttl.seconds()?)),
        None => None,
    };
    let lease = state.core.renew_token(&auth.token, increment).await?;
    Ok(Json(LeaseResponse::from(&lease)))
}

/// Revoke a token and everything beneath it.
async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<RevokeTokenRequest>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(&auth.token, "auth/token/revoke", &[Capability::Update])
        .await?;
    state.core.revoke_token(&body.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Revoke the calling token.
async fn revoke_self(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(&auth.token, "auth/token/revoke-self", &[Capability::Update])
        .await?;
    state.core.revoke_token(&auth.token).await?;
    Ok(StatusCode::NO_CONTENT)
}
