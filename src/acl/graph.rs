//! Access graph snapshot
//!
//! An [`AccessGraph`] is an immutable view of one project's direct grants,
//! taken once per resolution cycle. Every resolver reads from it through the
//! per-tier accessors below; nothing is looked up dynamically.

use crate::acl::patterns::BranchPatternMatcher;
use crate::acl::types::{Principal, Tier};
use std::collections::{BTreeMap, BTreeSet};

/// Project facts the resolvers need besides grants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectInfo {
    /// `namespace/name`, or `name` when the project has no namespace
    pub fullname: String,
    pub is_fork: bool,
    /// Pushes to the main repository must go through a pull request
    pub pull_request_access_only: bool,
}

impl ProjectInfo {
    pub fn new(fullname: impl Into<String>) -> Self {
        Self {
            fullname: fullname.into(),
            ..Default::default()
        }
    }
}

/// One direct grant as seen by the resolvers
#[derive(Debug, Clone)]
pub struct GrantEntry {
    pub tier: Tier,
    /// Raw comma-separated pattern list (collaborator grants only)
    pub branches: Option<String>,
    matcher: BranchPatternMatcher,
}

impl GrantEntry {
    pub fn new(tier: Tier, branches: Option<&str>) -> Self {
        let branches = if tier.is_branch_scoped() {
            branches.map(str::to_string)
        } else {
            None
        };
        let matcher = branches
            .as_deref()
            .map(BranchPatternMatcher::new)
            .unwrap_or_default();

        Self {
            tier,
            branches,
            matcher,
        }
    }

    pub fn matcher(&self) -> &BranchPatternMatcher {
        &self.matcher
    }
}

/// Deploy key registered on the project
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeployKeyEntry {
    pub name: String,
    pub push_access: bool,
}

/// Read-only snapshot of a project's access relationships
#[derive(Debug, Clone)]
pub struct AccessGraph {
    project: ProjectInfo,
    owner: String,
    user_grants: BTreeMap<String, Vec<GrantEntry>>,
    group_grants: BTreeMap<String, Vec<GrantEntry>>,
    /// user -> groups, for every user known to the snapshot
    memberships: BTreeMap<String, BTreeSet<String>>,
    /// group -> members, for every group known to the snapshot
    members: BTreeMap<String, BTreeSet<String>>,
    deploy_keys: Vec<DeployKeyEntry>,
}

impl AccessGraph {
    pub fn builder(project: ProjectInfo, owner: impl Into<String>) -> AccessGraphBuilder {
        AccessGraphBuilder::new(project, owner)
    }

    pub fn project(&self) -> &ProjectInfo {
        &self.project
    }

    pub fn fullname(&self) -> &str {
        &self.project.fullname
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_owner(&self, user: &str) -> bool {
        self.owner == user
    }

    pub fn has_user(&self, user: &str) -> bool {
        self.memberships.contains_key(user)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.members.contains_key(group)
    }

    /// Whether the snapshot knows this principal at all
    pub fn knows(&self, principal: &Principal) -> bool {
        match principal {
            Principal::User(name) => self.has_user(name),
            Principal::Group(name) => self.has_group(name),
        }
    }

    /// Groups a user belongs to
    pub fn groups_of<'a>(&'a self, user: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        self.memberships
            .get(user)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Members of a group
    pub fn members_of<'a>(&'a self, group: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        self.members
            .get(group)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn is_member(&self, user: &str, group: &str) -> bool {
        self.memberships
            .get(user)
            .is_some_and(|groups| groups.contains(group))
    }

    /// Direct grants held by a principal (not including its groups)
    pub fn grants_of(&self, principal: &Principal) -> &[GrantEntry] {
        let grants = match principal {
            Principal::User(name) => self.user_grants.get(name),
            Principal::Group(name) => self.group_grants.get(name),
        };
        grants.map(Vec::as_slice).unwrap_or_default()
    }

    /// Users holding a direct grant of exactly this tier
    pub fn users_with(&self, tier: Tier) -> impl Iterator<Item = &str> {
        Self::holders(&self.user_grants, tier)
    }

    /// Groups holding a direct grant of exactly this tier
    pub fn groups_with(&self, tier: Tier) -> impl Iterator<Item = &str> {
        Self::holders(&self.group_grants, tier)
    }

    fn holders(
        grants: &BTreeMap<String, Vec<GrantEntry>>,
        tier: Tier,
    ) -> impl Iterator<Item = &str> {
        grants
            .iter()
            .filter(move |(_, entries)| entries.iter().any(|g| g.tier == tier))
            .map(|(name, _)| name.as_str())
    }

    /// Every user with a direct grant
    pub fn granted_users(&self) -> impl Iterator<Item = &str> {
        self.user_grants.keys().map(String::as_str)
    }

    /// Every group with a direct grant
    pub fn granted_groups(&self) -> impl Iterator<Item = &str> {
        self.group_grants.keys().map(String::as_str)
    }

    /// Owner plus every principal in every grant, deduplicated and sorted
    pub fn principals(&self) -> Vec<Principal> {
        let mut principals = BTreeSet::new();
        principals.insert(Principal::user(&self.owner));
        principals.extend(self.granted_users().map(Principal::user));
        principals.extend(self.granted_groups().map(Principal::group));
        principals.into_iter().collect()
    }

    pub fn deploy_keys(&self) -> &[DeployKeyEntry] {
        &self.deploy_keys
    }

    pub fn deploy_key(&self, name: &str) -> Option<&DeployKeyEntry> {
        self.deploy_keys.iter().find(|k| k.name == name)
    }

    /// Backend principal name of one of this project's deploy keys
    pub fn deploy_key_principal(&self, key: &str) -> String {
        format!("deploykey_{}_{}", self.project.fullname.replace('/', "_"), key)
    }

    /// The deploy key a backend principal name refers to, if any
    pub fn lookup_deploy_key(&self, principal: &str) -> Option<&DeployKeyEntry> {
        let prefix = format!("deploykey_{}_", self.project.fullname.replace('/', "_"));
        let key = principal.strip_prefix(&prefix)?;
        self.deploy_key(key)
    }

    /// Membership of every group that holds a grant, for backends that need
    /// group definitions
    pub fn granted_group_members(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.granted_groups()
            .map(|group| {
                (
                    group.to_string(),
                    self.members.get(group).cloned().unwrap_or_default(),
                )
            })
            .collect()
    }
}

/// Builder for [`AccessGraph`]
///
/// Users and groups referenced by grants, memberships or ownership are
/// registered implicitly.
#[derive(Debug)]
pub struct AccessGraphBuilder {
    graph: AccessGraph,
}

impl AccessGraphBuilder {
    fn new(project: ProjectInfo, owner: impl Into<String>) -> Self {
        let owner = owner.into();
        let mut memberships = BTreeMap::new();
        memberships.insert(owner.clone(), BTreeSet::new());

        Self {
            graph: AccessGraph {
                project,
                owner,
                user_grants: BTreeMap::new(),
                group_grants: BTreeMap::new(),
                memberships,
                members: BTreeMap::new(),
                deploy_keys: Vec::new(),
            },
        }
    }

    /// Register a user with no grant
    pub fn user(mut self, name: impl Into<String>) -> Self {
        self.graph.memberships.entry(name.into()).or_default();
        self
    }

    /// Register a group and its members
    pub fn group<I, S>(mut self, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let entry = self.graph.members.entry(name.clone()).or_default();
        for member in members {
            let member = member.into();
            entry.insert(member.clone());
            self.graph
                .memberships
                .entry(member)
                .or_default()
                .insert(name.clone());
        }
        self
    }

    /// Add a direct grant
    pub fn grant(mut self, principal: Principal, tier: Tier, branches: Option<&str>) -> Self {
        let entry = GrantEntry::new(tier, branches);
        match principal {
            Principal::User(name) => {
                self.graph.memberships.entry(name.clone()).or_default();
                self.graph.user_grants.entry(name).or_default().push(entry);
            }
            Principal::Group(name) => {
                self.graph.members.entry(name.clone()).or_default();
                self.graph.group_grants.entry(name).or_default().push(entry);
            }
        }
        self
    }

    pub fn deploy_key(mut self, name: impl Into<String>, push_access: bool) -> Self {
        self.graph.deploy_keys.push(DeployKeyEntry {
            name: name.into(),
            push_access,
        });
        self
    }

    pub fn build(mut self) -> AccessGraph {
        self.graph.deploy_keys.sort();
        self.graph
    }
}
