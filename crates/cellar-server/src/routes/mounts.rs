//! Mount management routes: `/v1/sys/mounts/*` and `/v1/sys/remount`
//!
//! Mount, unmount, move, list, and tune backends. A trailing `/tune` on a
//! mount path addresses that mount's TTL settings.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use cellar_core::error::CoreError;
use cellar_core::kv::parse_duration;
use cellar_core::mount::{self, MountConfig, MountEntry};
use cellar_core::policy::Capability;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

const TUNE_SUFFIX: &str = "/tune";

/// Build the `/v1/sys/mounts` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_mounts)).route(
        "/{*path}",
        get(read_mount)
            .post(write_mount)
            .put(write_mount)
            .delete(unmount),
    )
}

// ── Request / Response types ─────────────────────────────────────────

/// One entry of the mount listing, keyed by path.
#[derive(Debug, Serialize)]
pub struct MountInfo {
    #[serde(rename = "type")]
    pub backend_type: String,
    pub description: String,
    pub config: MountConfig,
}

impl From<MountEntry> for MountInfo {
    fn from(entry: MountEntry) -> Self {
        Self {
            backend_type: entry.backend_type,
            description: entry.description,
            config: entry.config,
        }
    }
}

/// A TTL given as whole seconds or a duration string such as `"72h"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TtlValue {
    Seconds(u64),
    Text(String),
}

impl TtlValue {
    pub(crate) fn seconds(&self) -> Result<u64, AppError> {
        match self {
            Self::Seconds(secs) => Ok(*secs),
            Self::Text(text) => parse_duration(text)
                .map(|d| d.as_secs())
                .map_err(|e| AppError::BadRequest(e.to_string())),
        }
    }
}

/// TTL fields accepted when mounting or tuning. Missing fields keep their
/// current value.
#[derive(Debug, Default, Deserialize)]
pub struct TuneRequest {
    pub default_lease_ttl: Option<TtlValue>,
    pub max_lease_ttl: Option<TtlValue>,
}

impl TuneRequest {
    fn apply(&self, mut config: MountConfig) -> Result<MountConfig, AppError> {
        if let Some(ttl) = &self.default_lease_ttl {
            config.default_lease_ttl = ttl.seconds()?;
        }
        if let Some(ttl) = &self.max_lease_ttl {
            config.max_lease_ttl = ttl.seconds()?;
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
pub struct MountRequest {
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: TuneRequest,
}

#[derive(Debug, Deserialize)]
pub struct RemountRequest {
    pub from: String,
    pub to: String,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// List every mount as a map from path to settings.
async fn list_mounts(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<BTreeMap<String, MountInfo>>, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/mounts", &[Capability::Read, Capability::Sudo])
        .await?;

    let mounts = state
        .core
        .mounts()
        .await?
        .into_iter()
        .map(|entry| (entry.path.clone(), MountInfo::from(entry)))
        .collect();
    Ok(Json(mounts))
}

/// Read one mount, or its TTL settings when the path ends in `/tune`.
async fn read_mount(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(path): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (target, tune) = split_tune(&path);
    let entry = find_mount(&state, &auth, target, &[Capability::Read, Capability::Sudo]).await?;
    let body = if tune {
        serde_json::to_value(entry.config)
    } else {
        serde_json::to_value(MountInfo::from(entry))
    }
    .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(body))
}

/// Mount a backend, or tune an existing mount when the path ends in `/tune`.
async fn write_mount(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(path): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<StatusCode, AppError> {
    let (target, tune) = split_tune(&path);

    if tune {
        let request: TuneRequest =
            serde_json::from_value(body).map_err(|e| AppError::BadRequest(e.to_string()))?;
        let entry = find_mount(&state, &auth, target, &[Capability::Sudo]).await?;
        let config = request.apply(entry.config)?;
        state.core.tune(&entry.path, config).await?;
        return Ok(StatusCode::NO_CONTENT);
    }

    let request: MountRequest =
        serde_json::from_value(body).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let path = normalize(target)?;
    state
        .core
        .authorize(&auth.token, &format!("sys/mounts/{path}"), &[Capability::Sudo])
        .await?;
    let config = request.config.apply(MountConfig::default())?;
    state
        .core
        .mount(&path, &request.backend_type, &request.description, config)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Unmount a backend, revoking its leases and deleting its data.
async fn unmount(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(path): Path<String>,
) -> Result<StatusCode, AppError> {
    let path = normalize(&path)?;
    state
        .core
        .authorize(&auth.token, &format!("sys/mounts/{path}"), &[Capability::Sudo])
        .await?;
    state.core.unmount(&path).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Move a mount. Leases issued under the old path are revoked.
pub async fn remount(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<RemountRequest>,
) -> Result<StatusCode, AppError> {
    state
        .core
        .authorize(&auth.token, "sys/remount", &[Capability::Sudo])
        .await?;
    state.core.remount(&body.from, &body.to).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn split_tune(path: &str) -> (&str, bool) {
    match path.strip_suffix(TUNE_SUFFIX) {
        Some(target) if !target.is_empty() => (target, true),
        _ => (path, false),
    }
}

fn normalize(path: &str) -> Result<String, AppError> {
    mount::normalize_path(path).map_err(|e| AppError::from(CoreError::from(e)))
}

async fn find_mount(
    state: &AppState,
    auth: &AuthContext,
    path: &str,
    wanted: &[Capability],
) -> Result<MountEntry, AppError> {
    let path = normalize(path)?;
    state
        .core
        .authorize(&auth.token, &format!("sys/mounts/{path}"), wanted)
        .await?;
    state
        .core
        .mounts()
        .await?
        .into_iter()
        .find(|entry| entry.path == path)
        .ok_or_else(|| AppError::NotFound(format!("no mount at '{path}'")))
}
