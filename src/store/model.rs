//! Stored forge records

use crate::acl::compiler::AccessArtifact;
use crate::acl::types::Tier;
use crate::acl::watch::WatcherRecords;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A grant as stored on a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGrant {
    pub tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<String>,
}

impl StoredGrant {
    pub fn new(tier: Tier, branches: Option<&str>) -> Self {
        Self {
            tier,
            branches: if tier.is_branch_scoped() {
                branches.map(str::to_string)
            } else {
                None
            },
        }
    }
}

/// Input for [`ForgeStore::create_project`](crate::store::ForgeStore::create_project)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NewProject {
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub is_fork: bool,
    #[serde(default)]
    pub pull_request_access_only: bool,
}

impl NewProject {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn fork(mut self) -> Self {
        self.is_fork = true;
        self
    }

    pub fn pull_request_only(mut self) -> Self {
        self.pull_request_access_only = true;
        self
    }

    pub fn fullname(&self) -> String {
        fullname(self.namespace.as_deref(), &self.name)
    }
}

pub(crate) fn fullname(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Compile bookkeeping for one project
///
/// `ticket` increases on every compile request; only the request holding
/// the current ticket may clear `read_only`.
#[derive(Debug, Clone, Default)]
pub(crate) struct CompileState {
    pub ticket: u64,
    pub in_flight: Option<u64>,
    pub last_artifact: Option<AccessArtifact>,
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct ProjectRecord {
    pub id: u64,
    pub fullname: String,
    pub owner: String,
    pub is_fork: bool,
    pub pull_request_access_only: bool,
    pub read_only: bool,
    pub user_grants: BTreeMap<String, StoredGrant>,
    pub group_grants: BTreeMap<String, StoredGrant>,
    pub watchers: WatcherRecords,
    /// key name -> push access
    pub deploy_keys: BTreeMap<String, bool>,
    pub compile: CompileState,
}

impl ProjectRecord {
    pub fn new(id: u64, project: NewProject) -> Self {
        Self {
            id,
            fullname: project.fullname(),
            owner: project.owner,
            is_fork: project.is_fork,
            pull_request_access_only: project.pull_request_access_only,
            read_only: false,
            user_grants: BTreeMap::new(),
            group_grants: BTreeMap::new(),
            watchers: WatcherRecords::new(),
            deploy_keys: BTreeMap::new(),
            compile: CompileState::default(),
        }
    }
}

/// Everything the store holds
#[derive(Debug, Default)]
pub(crate) struct ForgeState {
    /// user -> groups
    pub users: BTreeMap<String, BTreeSet<String>>,
    /// group -> members
    pub groups: BTreeMap<String, BTreeSet<String>>,
    /// fullname -> project
    pub projects: BTreeMap<String, ProjectRecord>,
    pub next_project_id: u64,
}

/// Public view of a project's settings and state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSummary {
    pub id: u64,
    pub fullname: String,
    pub owner: String,
    pub is_fork: bool,
    pub pull_request_access_only: bool,
    pub read_only: bool,
    pub last_compile_failure: Option<String>,
}

impl From<&ProjectRecord> for ProjectSummary {
    fn from(record: &ProjectRecord) -> Self {
        Self {
            id: record.id,
            fullname: record.fullname.clone(),
            owner: record.owner.clone(),
            is_fork: record.is_fork,
            pull_request_access_only: record.pull_request_access_only,
            read_only: record.read_only,
            last_compile_failure: record.compile.last_failure.clone(),
        }
    }
}
