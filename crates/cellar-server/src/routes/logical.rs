//! Logical routes: `/v1/{*path}`
//!
//! Everything not claimed by a system route is handed to the backend
//! mounted at the longest matching prefix. `GET` reads (or lists with
//! `?list=true`), `PUT`/`POST` write, and `DELETE` deletes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use cellar_core::backend::Operation;
use cellar_core::core::Response as CoreResponse;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

/// Build the catch-all `/v1/{*path}` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/v1/{*path}",
        get(read).put(write).post(write).delete(delete),
    )
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    pub list: Option<String>,
}

impl ReadQuery {
    fn wants_list(&self) -> bool {
        matches!(self.list.as_deref(), Some("true" | "1"))
    }
}

/// Body returned for reads and for writes that produce data.
#[derive(Debug, Serialize)]
pub struct LogicalResponse {
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub lease_id: String,
    /// Lease TTL in seconds, `0` when no lease was granted.
    pub lease_duration: u64,
    pub renewable: bool,
}

impl LogicalResponse {
    fn from_core(response: CoreResponse) -> Option<Self> {
        let data = response.data?;
        let (lease_id, lease_duration, renewable) = response
            .lease
            .map_or((String::new(), 0, false), |lease| {
                (lease.lease_id, lease.ttl_secs, lease.renewable)
            });
        Some(Self {
            data,
            lease_id,
            lease_duration,
            renewable,
        })
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn read(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<LogicalResponse>, AppError> {
    let operation = if query.wants_list() {
        Operation::List
    } else {
        Operation::Read
    };
    let response = state
        .core
        .handle_request(&auth.token, operation, &path, None)
        .await?;
    LogicalResponse::from_core(response)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("nothing found at '{path}'")))
}

async fn write(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(path): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, AppError> {
    let response = state
        .core
        .handle_request(&auth.token, Operation::Write, &path, Some(body))
        .await?;
    Ok(respond(response))
}

async fn delete(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let response = state
        .core
        .handle_request(&auth.token, Operation::Delete, &path, None)
        .await?;
    Ok(respond(response))
}

fn respond(response: CoreResponse) -> Response {
    match LogicalResponse::from_core(response) {
        Some(body) => Json(body).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
