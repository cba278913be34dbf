//! Runtime configuration for the core.
//!
//! Transports build a [`CoreConfig`] (the server reads it from the
//! environment) and hand it to [`Core::new`](crate::core::Core::new).

use std::time::Duration;

/// 32 days, the system-wide default and ceiling for lease TTLs.
const DEFAULT_SYSTEM_TTL: Duration = Duration::from_secs(32 * 24 * 60 * 60);

/// Top-level core configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Lease TTL used when neither the backend nor the mount picks one.
    pub default_lease_ttl: Duration,
    /// Ceiling for every lease TTL, including renewals.
    pub max_lease_ttl: Duration,
    /// Expiration manager tuning.
    pub expiry: ExpiryConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_lease_ttl: DEFAULT_SYSTEM_TTL,
            max_lease_ttl: DEFAULT_SYSTEM_TTL,
            expiry: ExpiryConfig::default(),
        }
    }
}

/// What happens to a lease whose revocation keeps failing after every retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExhaustedRevocationPolicy {
    /// Keep the lease record, flag it as stuck, and wait for an operator to
    /// retry or force-revoke it.
    #[default]
    RequireOperator,
    /// Drop the lease record and log the failure at error level.
    ForceExpire,
}

/// Expiration manager tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryConfig {
    /// Maximum number of revocations running at once.
    pub workers: usize,
    /// Attempts per lease before the exhausted policy applies.
    pub max_revoke_attempts: u32,
    /// Delay before the first retry. Doubles on every further attempt.
    pub base_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
    /// Policy once `max_revoke_attempts` is reached.
    pub exhausted_policy: ExhaustedRevocationPolicy,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            max_revoke_attempts: 6,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            exhausted_policy: ExhaustedRevocationPolicy::default(),
        }
    }
}

impl ExpiryConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}
