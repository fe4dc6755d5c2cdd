//! State files
//!
//! A state file describes a forge in one document, TOML or JSON:
//!
//! ```toml
//! users = ["pingou", "foo", "kevin"]
//!
//! [groups]
//! packagers = ["foo"]
//!
//! [[projects]]
//! name = "test"
//! owner = "pingou"
//!
//! [projects.users]
//! foo = { tier = "commit" }
//! kevin = { tier = "collaborator", branches = "f*" }
//!
//! [projects.groups]
//! packagers = { tier = "ticket" }
//!
//! [projects.watchers]
//! foo = { watch_issues = false, watch_commits = false }
//!
//! [projects.deploy_keys]
//! ci = true
//! ```

use crate::acl::patterns;
use crate::acl::types::Tier;
use crate::acl::watch::WatcherRecord;
use crate::error::{GrantError, StateError};
use crate::store::model::{NewProject, StoredGrant};
use crate::store::ForgeStore;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Whole-forge state document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForgeSeed {
    pub users: Vec<String>,
    pub groups: BTreeMap<String, Vec<String>>,
    pub projects: Vec<ProjectSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSeed {
    #[serde(flatten)]
    pub project: NewProject,
    #[serde(default)]
    pub users: BTreeMap<String, StoredGrant>,
    #[serde(default)]
    pub groups: BTreeMap<String, StoredGrant>,
    #[serde(default)]
    pub watchers: BTreeMap<String, WatcherRecord>,
    #[serde(default)]
    pub deploy_keys: BTreeMap<String, bool>,
}

impl ForgeSeed {
    /// Read a state file; `.json` files are JSON, anything else TOML
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(&content).map_err(|e| StateError::Parse(e.to_string()))
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, StateError> {
        toml::from_str(content).map_err(|e| StateError::Parse(e.to_string()))
    }

    /// Build a store from this document
    ///
    /// Grants are inserted as stored, without the required-group checks or
    /// the compile gate of live mutations; every project starts writable.
    pub fn into_store(self) -> Result<ForgeStore, StateError> {
        let store = ForgeStore::new();

        for user in &self.users {
            store.add_user(user)?;
        }
        for (group, members) in &self.groups {
            store.add_group(group, members)?;
        }

        for seed in self.projects {
            let fullname = store.create_project(seed.project)?;
            store.load_grants(&fullname, seed.users, seed.groups, seed.deploy_keys)?;
            store.load_watchers(&fullname, seed.watchers)?;
        }

        info!(
            users = self.users.len(),
            groups = self.groups.len(),
            projects = store.project_names().len(),
            "Loaded forge state"
        );
        Ok(store)
    }
}

impl ForgeStore {
    fn load_grants(
        &self,
        project: &str,
        users: BTreeMap<String, StoredGrant>,
        groups: BTreeMap<String, StoredGrant>,
        deploy_keys: BTreeMap<String, bool>,
    ) -> Result<(), GrantError> {
        for (user, grant) in &users {
            if !self.has_user(user) {
                return Err(GrantError::UnknownPrincipal {
                    kind: "user",
                    name: user.clone(),
                });
            }
            validate_seed_grant(grant)?;
        }
        for (group, grant) in &groups {
            if !self.has_group(group) {
                return Err(GrantError::UnknownPrincipal {
                    kind: "group",
                    name: group.clone(),
                });
            }
            validate_seed_grant(grant)?;
        }

        self.replace_grants(project, users, groups, deploy_keys)
    }

    fn load_watchers(
        &self,
        project: &str,
        watchers: BTreeMap<String, WatcherRecord>,
    ) -> Result<(), GrantError> {
        if let Some(user) = watchers.keys().find(|u| !self.has_user(u)) {
            return Err(GrantError::UnknownPrincipal {
                kind: "user",
                name: user.clone(),
            });
        }
        self.replace_watchers(project, watchers)
    }
}

fn validate_seed_grant(grant: &StoredGrant) -> Result<(), GrantError> {
    if grant.tier == Tier::None {
        return Err(GrantError::invalid("cannot grant the 'none' tier"));
    }
    if !grant.tier.is_branch_scoped() {
        return Ok(());
    }
    match grant.branches.as_deref() {
        Some(branches) if !branches.split(',').all(|p| p.trim().is_empty()) => {
            patterns::validate_patterns(branches).map_err(GrantError::invalid)
        }
        _ => Err(GrantError::invalid("collaborator grants need a branch pattern")),
    }
}
