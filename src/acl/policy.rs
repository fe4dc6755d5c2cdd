//! Instance-wide access policy
//!
//! Everything the resolvers consume from configuration rather than from a
//! project's own grants: the site administrators, the external committer
//! groups, the required-group rules and the pull-request-only switch.

use crate::acl::external::ExternalOverridePolicy;
use crate::config::AppConfig;
use crate::error::ConfigError;
use glob::Pattern;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Instance administrators
#[derive(Debug, Clone, Default)]
pub struct SiteAdmins {
    users: BTreeSet<String>,
    groups: BTreeSet<String>,
}

impl SiteAdmins {
    pub fn new<U, G>(users: U, groups: G) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        G: IntoIterator,
        G::Item: Into<String>,
    {
        Self {
            users: users.into_iter().map(Into::into).collect(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_admin_user(&self, user: &str) -> bool {
        self.users.contains(user)
    }

    pub fn is_admin_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

/// Project-fullname patterns that require group membership
#[derive(Debug, Clone, Default)]
pub struct RequiredGroups {
    rules: Vec<RequiredGroupRule>,
}

#[derive(Debug, Clone)]
struct RequiredGroupRule {
    pattern: Pattern,
    groups: BTreeSet<String>,
}

impl RequiredGroups {
    pub fn new<'a, I>(rules: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a String, &'a Vec<String>)>,
    {
        let mut compiled = Vec::new();
        for (pattern, groups) in rules {
            let glob = Pattern::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            compiled.push(RequiredGroupRule {
                pattern: glob,
                groups: groups.iter().cloned().collect(),
            });
        }
        // Deterministic evaluation order regardless of map iteration order
        compiled.sort_by(|a, b| a.pattern.as_str().cmp(b.pattern.as_str()));

        Ok(Self { rules: compiled })
    }

    /// Check a user's groups against every rule matching the project
    ///
    /// Returns the group list of the first unsatisfied rule.
    pub fn check<'a, I>(&self, project: &str, user_groups: I) -> Result<(), Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let user_groups: BTreeSet<&str> = user_groups.into_iter().collect();
        for rule in &self.rules {
            if !rule.pattern.matches(project) {
                continue;
            }
            if !rule.groups.iter().any(|g| user_groups.contains(g.as_str())) {
                return Err(rule.groups.iter().cloned().collect());
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Compiled instance policy
#[derive(Debug, Clone, Default)]
pub struct InstancePolicy {
    pub site_admins: SiteAdmins,
    pub external: ExternalOverridePolicy,
    pub required_groups: RequiredGroups,
    /// Pushes to non-fork main repositories require a pull request
    pub pr_only: bool,
}

impl InstancePolicy {
    /// Compile the policy from configuration
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            site_admins: SiteAdmins::new(
                config.site_admins.users.iter().cloned(),
                config.site_admins.groups.iter().cloned(),
            ),
            external: ExternalOverridePolicy::new(&config.external_committers),
            required_groups: RequiredGroups::new(&config.required_groups)?,
            pr_only: config.acl.pr_only,
        })
    }

    /// A policy with no admins, no overrides and no required groups
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Shared, reloadable handle on the current [`InstancePolicy`]
///
/// Readers clone the inner `Arc` and keep using that snapshot even if a
/// reload happens meanwhile.
#[derive(Debug, Default)]
pub struct PolicyHandle {
    current: RwLock<Arc<InstancePolicy>>,
}

impl PolicyHandle {
    pub fn new(policy: InstancePolicy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
        }
    }

    /// The policy in effect right now
    pub fn current(&self) -> Arc<InstancePolicy> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| {
                warn!("policy lock poisoned, recovering");
                poisoned.into_inner()
            })
            .clone()
    }

    /// Recompile from configuration and swap it in
    ///
    /// On error the previous policy stays in effect.
    pub fn reload(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let policy = Arc::new(InstancePolicy::from_config(config)?);
        let mut guard = self.current.write().unwrap_or_else(|poisoned| {
            warn!("policy lock poisoned, recovering");
            poisoned.into_inner()
        });
        *guard = policy;
        info!("Instance policy reloaded");
        Ok(())
    }
}
