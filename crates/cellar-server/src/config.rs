//! Server configuration for `cellar`.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `CELLAR_*` environment variables.
//! Unset variables take their default; set but malformed ones are an error
//! rather than being silently replaced.

use std::net::SocketAddr;
use std::time::Duration;

use cellar_core::config::{CoreConfig, ExhaustedRevocationPolicy, ExpiryConfig};
use cellar_core::kv::parse_duration;

/// Errors from reading the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable was set to something that could not be parsed.
    #[error("invalid value '{value}' for {var}: expected {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend type.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Whether to skip `mlock` (for development without root/`CAP_IPC_LOCK`).
    pub disable_mlock: bool,
    /// Settings handed to the core.
    pub core: CoreConfig,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// `RocksDB` persistent storage.
    RocksDb { path: String },
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8200)),
            storage_backend: StorageBackendType::Memory,
            log_level: "info".to_owned(),
            disable_mlock: false,
            core: CoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CELLAR_BIND_ADDR`: bind address (default: `127.0.0.1:8200`)
    /// - `CELLAR_STORAGE`: `memory` or `rocksdb` (default: `memory`)
    /// - `CELLAR_STORAGE_PATH`: path for persistent backends (default: `./data`)
    /// - `CELLAR_LOG_LEVEL`: log filter (default: `info`)
    /// - `CELLAR_DEFAULT_LEASE_TTL`: e.g. `768h` or seconds (default: 32 days)
    /// - `CELLAR_MAX_LEASE_TTL`: ceiling for every lease (default: 32 days)
    /// - `CELLAR_EXPIRY_WORKERS`: concurrent revocations (default: `8`)
    /// - `CELLAR_REVOKE_MAX_ATTEMPTS`: attempts before giving up (default: `6`)
    /// - `CELLAR_REVOKE_BACKOFF_MS`: first retry delay (default: `1000`)
    /// - `CELLAR_REVOKE_EXHAUSTED`: `operator` or `expire` (default: `operator`)
    /// - `CELLAR_DISABLE_MLOCK`: skip `mlockall` for dev environments (default: `false`)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is set but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_addr = match lookup("CELLAR_BIND_ADDR") {
            Some(addr) => addr.parse().map_err(|_| ConfigError::Invalid {
                var: "CELLAR_BIND_ADDR",
                value: addr,
                expected: "a socket address such as 127.0.0.1:8200",
            })?,
            None => defaults.bind_addr,
        };

        let storage_path = lookup("CELLAR_STORAGE_PATH").unwrap_or_else(|| "./data".to_owned());
        let storage_backend = match lookup("CELLAR_STORAGE") {
            None => StorageBackendType::Memory,
            Some(kind) => match kind.to_lowercase().as_str() {
                "memory" => StorageBackendType::Memory,
                "rocksdb" => StorageBackendType::RocksDb { path: storage_path },
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "CELLAR_STORAGE",
                        value: kind,
                        expected: "memory or rocksdb",
                    });
                }
            },
        };

        let log_level = lookup("CELLAR_LOG_LEVEL").unwrap_or(defaults.log_level);

        let disable_mlock = lookup("CELLAR_DISABLE_MLOCK").is_some_and(|v| v == "true" || v == "1");

        let base = defaults.core;
        let default_lease_ttl = duration(&lookup, "CELLAR_DEFAULT_LEASE_TTL")?
            .unwrap_or(base.default_lease_ttl);
        let max_lease_ttl =
            duration(&lookup, "CELLAR_MAX_LEASE_TTL")?.unwrap_or(base.max_lease_ttl);

        let expiry = ExpiryConfig {
            workers: number(&lookup, "CELLAR_EXPIRY_WORKERS")?.unwrap_or(base.expiry.workers),
            max_revoke_attempts: number(&lookup, "CELLAR_REVOKE_MAX_ATTEMPTS")?
                .unwrap_or(base.expiry.max_revoke_attempts),
            base_backoff: number(&lookup, "CELLAR_REVOKE_BACKOFF_MS")?
                .map_or(base.expiry.base_backoff, Duration::from_millis),
            max_backoff: base.expiry.max_backoff,
            exhausted_policy: match lookup("CELLAR_REVOKE_EXHAUSTED") {
                None => base.expiry.exhausted_policy,
                Some(v) => match v.as_str() {
                    "operator" => ExhaustedRevocationPolicy::RequireOperator,
                    "expire" => ExhaustedRevocationPolicy::ForceExpire,
                    _ => {
                        return Err(ConfigError::Invalid {
                            var: "CELLAR_REVOKE_EXHAUSTED",
                            value: v,
                            expected: "operator or expire",
                        });
                    }
                },
            },
        };

        Ok(Self {
            bind_addr,
            storage_backend,
            log_level,
            disable_mlock,
            core: CoreConfig {
                default_lease_ttl: default_lease_ttl.min(max_lease_ttl),
                max_lease_ttl,
                expiry,
            },
        })
    }
}

fn duration(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    lookup(var)
        .map(|value| {
            parse_duration(&value).map_err(|_| ConfigError::Invalid {
                var,
                value,
                expected: "a duration such as 3600, 60s, 5m or 1h30m",
            })
        })
        .transpose()
}

fn number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::Invalid {
                var,
                value,
                expected: "a non-negative integer",
            })
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8200)));
        assert_eq!(config.storage_backend, StorageBackendType::Memory);
        assert_eq!(config.log_level, "info");
        assert!(!config.disable_mlock);
        assert_eq!(config.core, CoreConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = load(&[
            ("CELLAR_BIND_ADDR", "0.0.0.0:9000"),
            ("CELLAR_STORAGE", "RocksDB"),
            ("CELLAR_STORAGE_PATH", "/var/lib/cellar"),
            ("CELLAR_LOG_LEVEL", "debug"),
            ("CELLAR_DEFAULT_LEASE_TTL", "1h"),
            ("CELLAR_MAX_LEASE_TTL", "24h"),
            ("CELLAR_EXPIRY_WORKERS", "2"),
            ("CELLAR_REVOKE_MAX_ATTEMPTS", "3"),
            ("CELLAR_REVOKE_BACKOFF_MS", "250"),
            ("CELLAR_REVOKE_EXHAUSTED", "expire"),
            ("CELLAR_DISABLE_MLOCK", "true"),
        ])
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(
            config.storage_backend,
            StorageBackendType::RocksDb {
                path: "/var/lib/cellar".to_owned()
            }
        );
        assert_eq!(config.log_level, "debug");
        assert!(config.disable_mlock);
        assert_eq!(config.core.default_lease_ttl, Duration::from_secs(3600));
        assert_eq!(config.core.max_lease_ttl, Duration::from_secs(86_400));
        assert_eq!(config.core.expiry.workers, 2);
        assert_eq!(config.core.expiry.max_revoke_attempts, 3);
        assert_eq!(config.core.expiry.base_backoff, Duration::from_millis(250));
        assert_eq!(
            config.core.expiry.exhausted_policy,
            ExhaustedRevocationPolicy::ForceExpire
        );
    }

    #[test]
    fn default_ttl_is_capped_by_max() {
        let config = load(&[
            ("CELLAR_DEFAULT_LEASE_TTL", "48h"),
            ("CELLAR_MAX_LEASE_TTL", "24h"),
        ])
        .unwrap();
        assert_eq!(config.core.default_lease_ttl, config.core.max_lease_ttl);
    }

    #[test]
    fn malformed_values_are_rejected() {
        for (var, value) in [
            ("CELLAR_BIND_ADDR", "not-an-addr"),
            ("CELLAR_STORAGE", "postgres"),
            ("CELLAR_MAX_LEASE_TTL", "forever"),
            ("CELLAR_EXPIRY_WORKERS", "-1"),
            ("CELLAR_REVOKE_EXHAUSTED", "ignore"),
        ] {
            let err = load(&[(var, value)]).unwrap_err();
            assert!(err.to_string().contains(var), "{var}: {err}");
        }
    }
}
