//! HTTP route handlers for `cellar`.
//!
//! Routes are organized by subsystem:
//! - `sys`: Seal lifecycle, keyring, and health
//! - `mounts`: Mount table management and tuning
//! - `leases`: Lease lookup, renewal, and revocation
//! - `policy`: Policy CRUD
//! - `tokens`: Token creation, lookup, renewal, and revocation
//! - `logical`: Everything else under `/v1/`, served by mounted backends

pub mod leases;
pub mod logical;
pub mod mounts;
pub mod policy;
pub mod sys;
pub mod tokens;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware as axum_mw;
use axum::routing::post;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::{TOKEN_HEADER, auth_middleware};
use crate::state::AppState;

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Authenticated routes go through the auth middleware layer.
    let authenticated_routes = Router::new()
        .nest("/v1/sys", sys::router())
        .nest("/v1/sys/mounts", mounts::router())
        .route("/v1/sys/remount", post(mounts::remount))
        .nest("/v1/sys/leases", leases::router())
        .nest("/v1/sys/policies", policy::router())
        .nest("/v1/auth/token", tokens::router())
        .merge(logical::router())
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static(TOKEN_HEADER),
        ]);

    Router::new()
        .nest(
            "/v1/sys",
            sys::public_router().layer(tower::limit::ConcurrencyLimitLayer::new(10)),
        )
        .merge(authenticated_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}
