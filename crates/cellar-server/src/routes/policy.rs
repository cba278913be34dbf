//! Policy management routes: `/v1/sys/policies/*`
//!
//! CRUD for named ACL policies. The built-in `root` and `default` policies
//! can be read but not changed.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use cellar_core::policy::{Capability, Policy, PolicyRule};

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

/// Build the `/v1/sys/policies` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_policies)).route(
        "/{name}",
        get(read_policy)
            .put(write_policy)
            .post(write_policy)
            .delete(delete_policy),
    )
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PolicyListResponse {
    pub policies: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PolicyRequest {
    pub rules: Vec<PolicyRule>,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn list_policies(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<PolicyListResponse>, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/policies", &[Capability::List, Capability::Sudo])
        .await?;
    let policies = state.core.list_policies().await?;
    Ok(Json(PolicyListResponse { policies }))
}

async fn read_policy(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Json<Policy>, AppError> {
    state
        .core
        .authorize(
            &auth.token,
            &format!("sys/policies/{name}"),
            &[Capability::Read, Capability::Sudo],
        )
        .await?;
    Ok(Json(state.core.get_policy(&name).await?))
}

/// Create or replace a policy.
async fn write_policy(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
    Json(body): Json<PolicyRequest>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(&auth.token, &format!("sys/policies/{name}"), &[Capability::Sudo])
        .await?;
    state
        .core
        .put_policy(&Policy {
            name,
            rules: body.rules,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_policy(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(&auth.token, &format!("sys/policies/{name}"), &[Capability::Sudo])
        .await?;
    state.core.delete_policy(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
