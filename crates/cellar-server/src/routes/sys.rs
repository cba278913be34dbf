//! System routes: `/v1/sys/*`
//!
//! Handles initialization, the seal/unseal lifecycle, keyring maintenance,
//! and health checks. Init, unseal, seal-status, and health are public so an
//! operator can bring a sealed vault up; everything else needs `sudo` on its
//! own `sys/` path.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use cellar_core::barrier::KeyStatus;
use cellar_core::core::InitResponse;
use cellar_core::policy::Capability;
use cellar_core::seal::SealStatus;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

/// Routes reachable without a token.
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/init", post(init))
        .route("/unseal", post(unseal))
        .route("/seal-status", get(seal_status))
        .route("/health", get(health))
}

/// Routes that need a token holding `sudo`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/seal", post(seal))
        .route("/rekey", post(rekey))
        .route("/rotate", post(rotate))
        .route("/key-status", get(key_status))
}

// ── Request / Response types ─────────────────────────────────────────

/// Request body for `POST /v1/sys/init` and `POST /v1/sys/rekey`.
#[derive(Debug, Deserialize)]
pub struct SharesRequest {
    /// Number of unseal key shares to generate.
    #[serde(alias = "secret_shares")]
    pub shares: u8,
    /// Minimum shares required to unseal.
    #[serde(alias = "secret_threshold")]
    pub threshold: u8,
}

/// Request body for `POST /v1/sys/unseal`.
#[derive(Debug, Deserialize)]
pub struct UnsealRequest {
    /// Base64-encoded unseal key share.
    #[serde(default, alias = "share")]
    pub key: Option<String>,
    /// Discard shares submitted so far instead of adding one.
    #[serde(default)]
    pub reset: bool,
}

/// Response body for `POST /v1/sys/rekey`.
#[derive(Debug, Serialize)]
pub struct RekeyResponse {
    /// The new base64-encoded shares. Shown once.
    pub shares: Vec<String>,
}

/// Response body for `POST /v1/sys/rotate`.
#[derive(Debug, Serialize)]
pub struct RotateResponse {
    /// The new active keyring term.
    pub term: u32,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// Initialize a new vault. The vault is left sealed.
async fn init(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SharesRequest>,
) -> Result<Json<InitResponse>, AppError> {
    let result = state.core.initialize(body.shares, body.threshold).await?;
    Ok(Json(result))
}

/// Submit an unseal key share, or reset the current attempt.
async fn unseal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UnsealRequest>,
) -> Result<Json<SealStatus>, AppError> {
    if body.reset {
        state.core.reset_unseal().await;
        info!("unseal progress reset");
    } else {
        let Some(key) = body.key else {
            return Err(AppError::BadRequest("'key' is required".to_owned()));
        };
        state.core.unseal(&key).await?;
    }
    Ok(Json(state.core.seal_status().await?))
}

/// Get the current seal status.
async fn seal_status(State(state): State<Arc<AppState>>) -> Result<Json<SealStatus>, AppError> {
    Ok(Json(state.core.seal_status().await?))
}

/// Health check endpoint.
///
/// Returns 200 if unsealed, 503 if sealed, 501 if not initialized.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.core.seal_status().await {
        Ok(status) if !status.initialized => (StatusCode::NOT_IMPLEMENTED, Json(status)),
        Ok(status) if status.sealed => (StatusCode::SERVICE_UNAVAILABLE, Json(status)),
        Ok(status) => (StatusCode::OK, Json(status)),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SealStatus {
                initialized: false,
                sealed: true,
                threshold: 0,
                shares: 0,
                progress: 0,
            }),
        ),
    }
}

/// Seal the vault, dropping all key material from memory.
async fn seal(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/seal", &[Capability::Sudo])
        .await?;
    state.core.seal().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Replace the unseal shares. The old shares stop working.
async fn rekey(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<SharesRequest>,
) -> Result<Json<RekeyResponse>, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/rekey", &[Capability::Sudo])
        .await?;
    let shares = state.core.rekey(body.shares, body.threshold).await?;
    Ok(Json(RekeyResponse { shares }))
}

/// Install a new keyring term for future writes.
async fn rotate(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<RotateResponse>, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/rotate", &[Capability::Sudo])
        .await?;
    let term = state.core.rotate().await?;
    Ok(Json(RotateResponse { term }))
}

async fn key_status(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<KeyStatus>, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/key-status", &[Capability::Read, Capability::Sudo])
        .await?;
    Ok(Json(state.core.key_status().await?))
}
