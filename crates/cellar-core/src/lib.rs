//! Core library for `cellar`.
//!
//! Contains the encryption barrier and its keyring, the Shamir unseal
//! coordinator, the mount table and request router, the lease expiration
//! manager, the token and policy stores, the built-in `kv` backend, and the
//! [`Core`](core::Core) orchestrator that transports call into. This crate
//! depends on `cellar-storage` for the storage backend trait and knows
//! nothing about HTTP.

pub mod backend;
pub mod barrier;
pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod expiration;
pub mod kv;
pub mod mount;
pub mod policy;
pub mod router;
pub mod seal;
pub mod token;
pub mod view;
