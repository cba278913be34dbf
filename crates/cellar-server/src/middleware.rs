//! Authentication middleware for `cellar`.
//!
//! Extracts the `X-Cellar-Token` header, validates it against the token
//! store, and injects an [`AuthContext`] into the request extensions for
//! downstream handlers. Only routes that need a caller identity are layered
//! with it; init, unseal, seal-status, and health stay public.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the client token (`X-Cellar-Token`).
pub const TOKEN_HEADER: &str = "x-cellar-token";

/// Authentication context injected into request extensions.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The plaintext token, passed on to core calls.
    pub token: String,
    /// The token hash (for logging).
    pub token_hash: String,
    /// Policies attached to this token.
    pub policies: Vec<String>,
    /// Display name for logs.
    pub display_name: String,
}

/// Middleware that validates the `X-Cellar-Token` header.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let Some(token) = token else {
        return AppError::Unauthorized("missing X-Cellar-Token header".to_owned()).into_response();
    };

    match state.core.lookup_token(&token).await {
        Ok(entry) => {
            let ctx = AuthContext {
                token,
                token_hash: entry.token_hash,
                policies: entry.policies,
                display_name: entry.display_name,
            };
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(e) => {
            debug!(path = %req.uri().path(), error = %e, "request rejected by token check");
            AppError::from(e).into_response()
        }
    }
}
