//! HTTP server library for `cellar`.
//!
//! Maps JSON routes onto [`Core`](cellar_core::core::Core) calls. The binary
//! in `main.rs` loads [`config::ServerConfig`], applies process hardening,
//! and serves [`routes::build_router`].

pub mod config;
pub mod error;
pub mod hardening;
pub mod middleware;
pub mod routes;
pub mod state;
