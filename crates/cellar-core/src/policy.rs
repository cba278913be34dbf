//! Policy store for `cellar`.
//!
//! Policies are named JSON documents of path rules. Each rule maps a glob
//! over logical paths to a set of capabilities:
//!
//! - `secret/app/db` matches exactly
//! - `secret/app/*` matches one segment
//! - `secret/**` matches every descendant
//!
//! A caller holds a capability on a path if any of its policies grants it
//! through a matching rule and no matching rule carries `deny`.
//!
//! `root` (everything) and `default` (token self-service and lease renewal)
//! are built in and cannot be written or deleted.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::Operation;
use crate::barrier::Barrier;
use crate::error::PolicyError;
use crate::token::ROOT_POLICY;

/// Storage prefix for policy documents.
const POLICY_PREFIX: &str = "sys/policy/";

/// Name of the policy attached to every non-root token.
pub const DEFAULT_POLICY: &str = "default";

/// A policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy name.
    pub name: String,
    /// Access rules.
    pub rules: Vec<PolicyRule>,
}

/// One rule within a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Path glob.
    pub path: String,
    /// Capabilities granted (or denied) on matching paths.
    pub capabilities: Vec<Capability>,
}

/// An access capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Read values.
    Read,
    /// List keys under a prefix.
    List,
    /// Create new values.
    Create,
    /// Update existing values.
    Update,
    /// Delete values.
    Delete,
    /// Administrative operations under `sys/`.
    Sudo,
    /// Deny everything on matching paths.
    Deny,
}

impl Capability {
    /// Capabilities that allow `operation`. Holding any one is enough.
    #[must_use]
    pub fn for_operation(operation: Operation) -> &'static [Capability] {
        match operation {
            Operation::Read => &[Capability::Read],
            Operation::List => &[Capability::List],
            Operation::Write => &[Capability::Create, Capability::Update],
            Operation::Delete => &[Capability::Delete],
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Sudo => "sudo",
            Self::Deny => "deny",
        };
        f.write_str(name)
    }
}

/// Stores and evaluates policies.
pub struct PolicyStore {
    barrier: Arc<Barrier>,
}

impl PolicyStore {
    /// Create a policy store over `barrier`.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Write or replace a policy.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] for `root` or `default`.
    /// - [`PolicyError::Invalid`] for a bad name or an empty rule set.
    /// - [`PolicyError::Barrier`] if storage fails.
    pub async fn put(&self, policy: &Policy) -> Result<(), PolicyError> {
        if is_builtin(&policy.name) {
            return Err(PolicyError::BuiltIn {
                name: policy.name.clone(),
            });
        }
        validate_name(&policy.name)?;
        if policy.rules.is_empty() {
            return Err(PolicyError::Invalid {
                reason: "policy must have at least one rule".to_owned(),
            });
        }
        if let Some(rule) = policy.rules.iter().find(|rule| rule.path.is_empty()) {
            return Err(PolicyError::Invalid {
                reason: format!("rule with capabilities {:?} has an empty path", rule.capabilities),
            });
        }

        let bytes = serde_json::to_vec(policy).map_err(|e| PolicyError::Invalid {
            reason: format!("serialization failed: {e}"),
        })?;
        self.barrier
            .put(&format!("{POLICY_PREFIX}{}", policy.name), &bytes)
            .await?;

        info!(name = %policy.name, rules = policy.rules.len(), "policy written");
        Ok(())
    }

    /// Read a policy.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::NotFound`] if no such policy exists.
    /// - [`PolicyError::Barrier`] if storage fails.
    pub async fn get(&self, name: &str) -> Result<Policy, PolicyError> {
        match name {
            ROOT_POLICY => return Ok(root_policy()),
            DEFAULT_POLICY => return Ok(default_policy()),
            _ => {}
        }

        let bytes = self
            .barrier
            .get(&format!("{POLICY_PREFIX}{name}"))
            .await?
            .ok_or_else(|| PolicyError::NotFound {
                name: name.to_owned(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| PolicyError::Invalid {
            reason: format!("stored policy '{name}' is malformed: {e}"),
        })
    }

    /// Delete a policy. Deleting a missing policy succeeds.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] for `root` or `default`.
    /// - [`PolicyError::Barrier`] if storage fails.
    pub async fn delete(&self, name: &str) -> Result<(), PolicyError> {
        if is_builtin(name) {
            return Err(PolicyError::BuiltIn {
                name: name.to_owned(),
            });
        }
        self.barrier.delete(&format!("{POLICY_PREFIX}{name}")).await?;
        info!(name, "policy deleted");
        Ok(())
    }

    /// Every policy name, built-ins included, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Barrier`] if storage fails.
    pub async fn list(&self) -> Result<Vec<String>, PolicyError> {
        let mut names: Vec<String> = self
            .barrier
            .list(POLICY_PREFIX)
            .await?
            .into_iter()
            .filter(|name| !name.ends_with('/'))
            .collect();
        for builtin in [ROOT_POLICY, DEFAULT_POLICY] {
            if !names.iter().any(|name| name == builtin) {
                names.push(builtin.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Check that `policies` grant one of `wanted` on `path`.
    ///
    /// Unknown policy names are skipped.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::Denied`] if nothing grants access or a rule denies it.
    /// - [`PolicyError::Barrier`] if a policy cannot be loaded.
    pub async fn check(
        &self,
        policies: &[String],
        path: &str,
        wanted: &[Capability],
    ) -> Result<(), PolicyError> {
        let denied = || PolicyError::Denied {
            path: path.to_owned(),
            capability: wanted
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|"),
        };

        let mut granted = false;
        for name in policies {
            let policy = match self.get(name).await {
                Ok(policy) => policy,
                Err(PolicyError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            for rule in policy.rules.iter().filter(|rule| path_matches(&rule.path, path)) {
                if rule.capabilities.contains(&Capability::Deny) {
                    return Err(denied());
                }
                granted |= wanted.iter().any(|cap| rule.capabilities.contains(cap));
            }
        }

        if granted { Ok(()) } else { Err(denied()) }
    }
}

/// The built-in `root` policy.
#[must_use]
pub fn root_policy() -> Policy {
    Policy {
        name: ROOT_POLICY.to_owned(),
        rules: vec![PolicyRule {
            path: "**".to_owned(),
            capabilities: vec![
                Capability::Read,
                Capability::List,
                Capability::Create,
                Capability::Update,
                Capability::Delete,
                Capability::Sudo,
            ],
        }],
    }
}

/// The built-in `default` policy.
#[must_use]
pub fn default_policy() -> Policy {
    let rule = |path: &str, capabilities: &[Capability]| PolicyRule {
        path: path.to_owned(),
        capabilities: capabilities.to_vec(),
    };
    Policy {
        name: DEFAULT_POLICY.to_owned(),
        rules: vec![
            rule("auth/token/lookup-self", &[Capability::Read]),
            rule("auth/token/renew-self", &[Capability::Update]),
            rule("auth/token/revoke-self", &[Capability::Update]),
            rule("sys/leases/lookup", &[Capability::Update]),
            rule("sys/leases/renew", &[Capability::Update]),
        ],
    }
}

fn is_builtin(name: &str) -> bool {
    name == ROOT_POLICY || name == DEFAULT_POLICY
}

fn validate_name(name: &str) -> Result<(), PolicyError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PolicyError::Invalid {
            reason: format!("policy name '{name}' must be non-empty [A-Za-z0-9._-]"),
        })
    }
}

fn path_matches(pattern: &str, path: &str) -> bool {
    glob_match::glob_match(pattern, path)
}

impl fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}
