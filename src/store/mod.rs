//! In-memory forge store
//!
//! Holds the user directory, projects, grants, watchers and deploy keys,
//! and enforces the `read_only` compile gate: while a project is read-only
//! every grant mutation and deletion on it fails fast with
//! [`GrantError::ConflictingMutation`].
//!
//! Resolvers never read the store directly; they work on an
//! [`AccessGraph`] snapshot taken with [`ForgeStore::access_graph`].

mod model;
pub mod seed;

pub use model::{NewProject, ProjectSummary, StoredGrant};
pub use seed::ForgeSeed;

use crate::acl::compiler::AccessArtifact;
use crate::acl::graph::{AccessGraph, ProjectInfo};
use crate::acl::patterns;
use crate::acl::policy::InstancePolicy;
use crate::acl::types::{Principal, Tier, is_valid_name};
use crate::acl::watch::{
    WatchLevel, WatchLevelResolver, WatchSet, WatchStatus, WatcherRecords,
};
use crate::error::{CompileError, CompileResult, GrantError, GrantResult, WatchError};
use model::{ForgeState, ProjectRecord};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Thread-safe forge state
#[derive(Debug, Default)]
pub struct ForgeStore {
    state: RwLock<ForgeState>,
}

impl ForgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ForgeState> {
        self.state.read().unwrap_or_else(|poisoned| {
            warn!("forge state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, ForgeState> {
        self.state.write().unwrap_or_else(|poisoned| {
            warn!("forge state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    // ---- directory -------------------------------------------------------

    /// Register a user; registering an existing user is a no-op
    pub fn add_user(&self, name: &str) -> GrantResult<()> {
        if !is_valid_name(name) {
            return Err(GrantError::invalid(format!("invalid user name '{}'", name)));
        }
        self.write().users.entry(name.to_string()).or_default();
        Ok(())
    }

    /// Register a group with its initial members
    pub fn add_group<I, S>(&self, name: &str, members: I) -> GrantResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !is_valid_name(name) {
            return Err(GrantError::invalid(format!("invalid group name '{}'", name)));
        }
        let members: Vec<String> = members
            .into_iter()
            .map(|m| m.as_ref().to_string())
            .collect();

        let mut state = self.write();
        if let Some(unknown) = members.iter().find(|m| !state.users.contains_key(*m)) {
            return Err(unknown_user(unknown));
        }

        state.groups.entry(name.to_string()).or_default();
        for member in members {
            link_member(&mut state, name, &member);
        }
        Ok(())
    }

    /// Add a user to an existing group
    pub fn add_group_member(&self, group: &str, user: &str) -> GrantResult<()> {
        let mut state = self.write();
        if !state.groups.contains_key(group) {
            return Err(unknown_group(group));
        }
        if !state.users.contains_key(user) {
            return Err(unknown_user(user));
        }
        link_member(&mut state, group, user);
        Ok(())
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.read().users.contains_key(name)
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.read().groups.contains_key(name)
    }

    /// Groups a user belongs to
    pub fn groups_of(&self, user: &str) -> BTreeSet<String> {
        self.read().users.get(user).cloned().unwrap_or_default()
    }

    // ---- projects --------------------------------------------------------

    /// Create a project and return its fullname
    pub fn create_project(&self, project: NewProject) -> GrantResult<String> {
        if !is_valid_name(&project.name) {
            return Err(GrantError::invalid(format!(
                "invalid project name '{}'",
                project.name
            )));
        }

        let mut state = self.write();
        if !state.users.contains_key(&project.owner) {
            return Err(unknown_user(&project.owner));
        }
        let fullname = project.fullname();
        if state.projects.contains_key(&fullname) {
            return Err(GrantError::invalid(format!(
                "project '{}' already exists",
                fullname
            )));
        }

        state.next_project_id += 1;
        let id = state.next_project_id;
        state
            .projects
            .insert(fullname.clone(), ProjectRecord::new(id, project));

        info!(project = %fullname, id, "Project created");
        Ok(fullname)
    }

    /// Fullnames of every project, sorted
    pub fn project_names(&self) -> Vec<String> {
        self.read().projects.keys().cloned().collect()
    }

    pub fn project(&self, project: &str) -> Option<ProjectSummary> {
        self.read().projects.get(project).map(ProjectSummary::from)
    }

    pub fn is_read_only(&self, project: &str) -> Option<bool> {
        self.read().projects.get(project).map(|p| p.read_only)
    }

    /// Operator override of the compile gate
    ///
    /// Clearing the flag leaves `last_compile_failure` in place until the
    /// next successful compile.
    pub fn set_read_only(&self, project: &str, read_only: bool) -> GrantResult<()> {
        let mut state = self.write();
        let record = project_mut(&mut state, project)?;
        record.read_only = read_only;
        if !read_only {
            record.compile.in_flight = None;
        }
        warn!(project, read_only, "read_only flag set by operator");
        Ok(())
    }

    /// Delete a project with its grants and watchers
    pub fn delete_project(&self, project: &str) -> GrantResult<()> {
        let mut state = self.write();
        ensure_writable(project_mut(&mut state, project)?)?;
        state.projects.remove(project);
        info!(project, "Project deleted");
        Ok(())
    }

    // ---- grants ----------------------------------------------------------

    /// Grant `tier` on `project` to `new_user`
    ///
    /// Granting a different tier to a user who already has one updates the
    /// grant in place. Re-granting the same tier is rejected, except for
    /// collaborator grants whose branch list may change.
    pub fn add_user_to_project(
        &self,
        policy: &InstancePolicy,
        project: &str,
        new_user: &str,
        actor: &str,
        tier: Tier,
        branches: Option<&str>,
    ) -> GrantResult<&'static str> {
        let mut state = self.write();
        ensure_writable(project_ref(&state, project)?)?;
        check_known_user(&state, actor)?;
        let user_groups = state
            .users
            .get(new_user)
            .cloned()
            .ok_or_else(|| unknown_user(new_user))?;
        let grant = validate_grant(tier, branches)?;

        if tier != Tier::Ticket {
            check_required_groups(policy, project, new_user, &user_groups)?;
        }

        let record = project_mut(&mut state, project)?;
        if record.owner == new_user {
            return Err(GrantError::AlreadyGranted {
                project: project.to_string(),
                principal: new_user.to_string(),
                tier: "owner".to_string(),
            });
        }

        let message = match record.user_grants.get(new_user) {
            Some(existing) if existing.tier == tier && !tier.is_branch_scoped() => {
                return Err(GrantError::AlreadyGranted {
                    project: project.to_string(),
                    principal: new_user.to_string(),
                    tier: tier.to_string(),
                });
            }
            Some(_) => "User access updated",
            None => "User added",
        };

        record.user_grants.insert(new_user.to_string(), grant);
        record.read_only = true;

        info!(project, user = new_user, tier = %tier, agent = actor, "{}", message);
        Ok(message)
    }

    /// Grant `tier` on `project` to `group`
    ///
    /// The actor must be the owner, hold a grant on the project, or be a
    /// site administrator.
    pub fn add_group_to_project(
        &self,
        policy: &InstancePolicy,
        project: &str,
        group: &str,
        actor: &str,
        tier: Tier,
        branches: Option<&str>,
    ) -> GrantResult<&'static str> {
        let mut state = self.write();
        ensure_writable(project_ref(&state, project)?)?;
        let actor_groups = state
            .users
            .get(actor)
            .cloned()
            .ok_or_else(|| unknown_user(actor))?;
        if !state.groups.contains_key(group) {
            return Err(unknown_group(group));
        }
        let grant = validate_grant(tier, branches)?;

        let record = project_mut(&mut state, project)?;
        let site_admin = policy.site_admins.is_admin_user(actor)
            || actor_groups
                .iter()
                .any(|g| policy.site_admins.is_admin_group(g));
        if record.owner != actor && !record.user_grants.contains_key(actor) && !site_admin {
            return Err(GrantError::NotAllowed {
                project: project.to_string(),
                actor: actor.to_string(),
            });
        }

        let message = match record.group_grants.get(group) {
            Some(existing) if existing.tier == tier && !tier.is_branch_scoped() => {
                return Err(GrantError::AlreadyGranted {
                    project: project.to_string(),
                    principal: format!("@{}", group),
                    tier: tier.to_string(),
                });
            }
            Some(_) => "Group access updated",
            None => "Group added",
        };

        record.group_grants.insert(group.to_string(), grant);
        record.read_only = true;

        info!(project, group, tier = %tier, agent = actor, "{}", message);
        Ok(message)
    }

    pub fn remove_user_from_project(
        &self,
        project: &str,
        user: &str,
        actor: &str,
    ) -> GrantResult<&'static str> {
        let mut state = self.write();
        check_known_user(&state, actor)?;
        check_known_user(&state, user)?;
        let record = project_mut(&mut state, project)?;
        ensure_writable(record)?;
        if record.user_grants.remove(user).is_none() {
            return Err(GrantError::NoSuchGrant {
                project: project.to_string(),
                principal: user.to_string(),
            });
        }
        record.read_only = true;

        info!(project, user, agent = actor, "User removed");
        Ok("User removed")
    }

    pub fn remove_group_from_project(
        &self,
        project: &str,
        group: &str,
        actor: &str,
    ) -> GrantResult<&'static str> {
        let mut state = self.write();
        check_known_user(&state, actor)?;
        if !state.groups.contains_key(group) {
            return Err(unknown_group(group));
        }
        let record = project_mut(&mut state, project)?;
        ensure_writable(record)?;
        if record.group_grants.remove(group).is_none() {
            return Err(GrantError::NoSuchGrant {
                project: project.to_string(),
                principal: format!("@{}", group),
            });
        }
        record.read_only = true;

        info!(project, group, agent = actor, "Group removed");
        Ok("Group removed")
    }

    /// Make `new_owner` the owner of `project`
    ///
    /// Any grant the new owner held is dropped. With `retain` set, the
    /// previous owner keeps a direct grant of that tier, which must be
    /// `admin` or `commit`.
    pub fn transfer_ownership(
        &self,
        policy: &InstancePolicy,
        project: &str,
        new_owner: &str,
        retain: Option<Tier>,
    ) -> GrantResult<()> {
        if let Some(tier) = retain
            && !matches!(tier, Tier::Admin | Tier::Commit)
        {
            return Err(GrantError::invalid(format!(
                "previous owner can only be retained as admin or commit, not {}",
                tier
            )));
        }

        let mut state = self.write();
        ensure_writable(project_ref(&state, project)?)?;
        let owner_groups = state
            .users
            .get(new_owner)
            .cloned()
            .ok_or_else(|| unknown_user(new_owner))?;
        check_required_groups(policy, project, new_owner, &owner_groups)?;

        let record = project_mut(&mut state, project)?;
        if record.owner == new_owner {
            return Err(GrantError::invalid(format!(
                "'{}' already owns '{}'",
                new_owner, project
            )));
        }

        record.user_grants.remove(new_owner);
        let previous = std::mem::replace(&mut record.owner, new_owner.to_string());
        if let Some(tier) = retain {
            record
                .user_grants
                .insert(previous.clone(), StoredGrant::new(tier, None));
        }
        record.read_only = true;

        info!(
            project,
            previous = %previous,
            owner = new_owner,
            retained = ?retain,
            "Ownership transferred"
        );
        Ok(())
    }

    /// Register or replace a deploy key
    pub fn add_deploy_key(&self, project: &str, name: &str, push_access: bool) -> GrantResult<()> {
        if !is_valid_name(name) {
            return Err(GrantError::invalid(format!("invalid deploy key name '{}'", name)));
        }
        let mut state = self.write();
        let record = project_mut(&mut state, project)?;
        ensure_writable(record)?;
        record.deploy_keys.insert(name.to_string(), push_access);
        record.read_only = true;

        info!(project, key = name, push_access, "Deploy key added");
        Ok(())
    }

    pub fn remove_deploy_key(&self, project: &str, name: &str) -> GrantResult<()> {
        let mut state = self.write();
        let record = project_mut(&mut state, project)?;
        ensure_writable(record)?;
        if record.deploy_keys.remove(name).is_none() {
            return Err(GrantError::NoSuchGrant {
                project: project.to_string(),
                principal: name.to_string(),
            });
        }
        record.read_only = true;

        info!(project, key = name, "Deploy key removed");
        Ok(())
    }

    pub(crate) fn replace_grants(
        &self,
        project: &str,
        users: BTreeMap<String, StoredGrant>,
        groups: BTreeMap<String, StoredGrant>,
        deploy_keys: BTreeMap<String, bool>,
    ) -> GrantResult<()> {
        let mut state = self.write();
        let record = project_mut(&mut state, project)?;
        record.user_grants = users
            .into_iter()
            .filter(|(user, _)| *user != record.owner)
            .map(|(user, g)| (user, StoredGrant::new(g.tier, g.branches.as_deref())))
            .collect();
        record.group_grants = groups
            .into_iter()
            .map(|(group, g)| (group, StoredGrant::new(g.tier, g.branches.as_deref())))
            .collect();
        record.deploy_keys = deploy_keys;
        Ok(())
    }

    pub(crate) fn replace_watchers(&self, project: &str, watchers: WatcherRecords) -> GrantResult<()> {
        let mut state = self.write();
        project_mut(&mut state, project)?.watchers = watchers;
        Ok(())
    }

    /// The stored grant of one principal, if any
    pub fn grant_of(&self, project: &str, principal: &Principal) -> Option<StoredGrant> {
        let state = self.read();
        let record = state.projects.get(project)?;
        match principal {
            Principal::User(name) => record.user_grants.get(name).cloned(),
            Principal::Group(name) => record.group_grants.get(name).cloned(),
        }
    }

    /// Take an immutable snapshot of a project's access relationships
    ///
    /// The snapshot carries the whole user directory so that principals
    /// without a grant (external committers, site admins) still resolve.
    pub fn access_graph(&self, project: &str) -> GrantResult<AccessGraph> {
        let state = self.read();
        let record = project_ref(&state, project)?;

        let info = ProjectInfo {
            fullname: record.fullname.clone(),
            is_fork: record.is_fork,
            pull_request_access_only: record.pull_request_access_only,
        };
        let mut builder = AccessGraph::builder(info, record.owner.clone());
        for user in state.users.keys() {
            builder = builder.user(user.clone());
        }
        for (group, members) in &state.groups {
            builder = builder.group(group.clone(), members.iter().cloned());
        }
        for (user, grant) in &record.user_grants {
            builder = builder.grant(Principal::user(user), grant.tier, grant.branches.as_deref());
        }
        for (group, grant) in &record.group_grants {
            builder = builder.grant(Principal::group(group), grant.tier, grant.branches.as_deref());
        }
        for (key, push_access) in &record.deploy_keys {
            builder = builder.deploy_key(key.clone(), *push_access);
        }

        debug!(project, "Took access graph snapshot");
        Ok(builder.build())
    }

    // ---- watchers --------------------------------------------------------

    /// Apply a watch-status update and return the message shown to the user
    ///
    /// Watch records are not part of the ACL, so this is allowed while the
    /// project is read-only.
    pub fn update_watch_status(
        &self,
        project: &str,
        user: &str,
        status: WatchStatus,
    ) -> Result<&'static str, WatchError> {
        let mut state = self.write();
        if !state.users.contains_key(user) {
            return Err(WatchError::UnknownUser(user.to_string()));
        }
        let record = state
            .projects
            .get_mut(project)
            .ok_or_else(|| WatchError::UnknownProject(project.to_string()))?;

        let Some(watcher) = status.record() else {
            return Ok(match record.watchers.remove(user) {
                Some(_) => "Watch status reset",
                None => "Watch status is already reset",
            });
        };

        record.watchers.insert(user.to_string(), watcher);
        debug!(project, user, status = status.code(), "Watch status updated");

        Ok(match (watcher.watch_issues, watcher.watch_commits) {
            (true, true) => "You are now watching issues, PRs, and commits on this project",
            (true, false) => "You are now watching issues and PRs on this project",
            (false, true) => "You are now watching commits on this project",
            (false, false) => "You are no longer watching this project",
        })
    }

    pub fn watcher_records(&self, project: &str) -> Result<WatcherRecords, WatchError> {
        self.read()
            .projects
            .get(project)
            .map(|p| p.watchers.clone())
            .ok_or_else(|| WatchError::UnknownProject(project.to_string()))
    }

    /// Resolve the project's watch set
    pub fn watch_set(&self, project: &str) -> Result<WatchSet, WatchError> {
        let records = self.watcher_records(project)?;
        let graph = self
            .access_graph(project)
            .map_err(|_| WatchError::UnknownProject(project.to_string()))?;
        Ok(WatchLevelResolver::watch_set(&graph, &records))
    }

    /// Projects the user watches, with what they watch on each
    pub fn watched_projects(&self, user: &str) -> Result<Vec<(String, WatchLevel)>, WatchError> {
        if !self.has_user(user) {
            return Err(WatchError::UnknownUser(user.to_string()));
        }
        let mut watched = Vec::new();
        for project in self.project_names() {
            let records = self.watcher_records(&project)?;
            let graph = self
                .access_graph(&project)
                .map_err(|_| WatchError::UnknownProject(project.clone()))?;
            let level = WatchLevelResolver::resolve(&graph, &records, user)
                .map_err(|_| WatchError::UnknownUser(user.to_string()))?;
            if level.is_watching() {
                watched.push((project, level));
            }
        }
        Ok(watched)
    }

    // ---- compile gate ----------------------------------------------------

    /// Mark the project read-only and issue a compile ticket
    ///
    /// Any earlier ticket for the same project is superseded.
    pub fn begin_compile(&self, project: &str) -> CompileResult<u64> {
        let mut state = self.write();
        let record = state
            .projects
            .get_mut(project)
            .ok_or_else(|| CompileError::UnknownProject(project.to_string()))?;

        record.read_only = true;
        record.compile.ticket += 1;
        let ticket = record.compile.ticket;
        if let Some(previous) = record.compile.in_flight.replace(ticket) {
            debug!(project, previous, ticket, "Superseding in-flight compile");
        }
        Ok(ticket)
    }

    /// Whether `ticket` is still the one allowed to finish
    pub fn is_current_compile(&self, project: &str, ticket: u64) -> bool {
        self.read()
            .projects
            .get(project)
            .is_some_and(|p| p.compile.in_flight == Some(ticket))
    }

    /// Record a published artifact and clear `read_only`
    ///
    /// Both happen under the same lock, so no reader sees the flag cleared
    /// next to an older artifact. Returns `false` when the ticket was
    /// superseded, in which case nothing changes.
    pub fn complete_compile(&self, project: &str, ticket: u64, artifact: AccessArtifact) -> bool {
        let mut state = self.write();
        let Some(record) = state.projects.get_mut(project) else {
            return false;
        };
        if record.compile.in_flight != Some(ticket) {
            return false;
        }

        record.compile.in_flight = None;
        record.compile.last_artifact = Some(artifact);
        record.compile.last_failure = None;
        record.read_only = false;
        true
    }

    /// Record a compile failure; `read_only` stays set
    pub fn fail_compile(&self, project: &str, ticket: u64, reason: &str) {
        let mut state = self.write();
        let Some(record) = state.projects.get_mut(project) else {
            return;
        };
        if record.compile.in_flight != Some(ticket) {
            return;
        }

        record.compile.in_flight = None;
        record.compile.last_failure = Some(reason.to_string());
        record.read_only = true;
    }

    /// The artifact of the last successful compile
    pub fn last_artifact(&self, project: &str) -> Option<AccessArtifact> {
        self.read()
            .projects
            .get(project)
            .and_then(|p| p.compile.last_artifact.clone())
    }

    pub fn last_compile_failure(&self, project: &str) -> Option<String> {
        self.read()
            .projects
            .get(project)
            .and_then(|p| p.compile.last_failure.clone())
    }
}

fn link_member(state: &mut ForgeState, group: &str, user: &str) {
    state
        .groups
        .entry(group.to_string())
        .or_default()
        .insert(user.to_string());
    state
        .users
        .entry(user.to_string())
        .or_default()
        .insert(group.to_string());
}

fn unknown_user(name: &str) -> GrantError {
    GrantError::UnknownPrincipal {
        kind: "user",
        name: name.to_string(),
    }
}

fn unknown_group(name: &str) -> GrantError {
    GrantError::UnknownPrincipal {
        kind: "group",
        name: name.to_string(),
    }
}

fn check_known_user(state: &ForgeState, user: &str) -> GrantResult<()> {
    if state.users.contains_key(user) {
        Ok(())
    } else {
        Err(unknown_user(user))
    }
}

fn project_ref<'s>(state: &'s ForgeState, project: &str) -> GrantResult<&'s ProjectRecord> {
    state
        .projects
        .get(project)
        .ok_or_else(|| GrantError::UnknownProject {
            project: project.to_string(),
        })
}

fn project_mut<'s>(
    state: &'s mut ForgeState,
    project: &str,
) -> GrantResult<&'s mut ProjectRecord> {
    state
        .projects
        .get_mut(project)
        .ok_or_else(|| GrantError::UnknownProject {
            project: project.to_string(),
        })
}

fn ensure_writable(record: &ProjectRecord) -> GrantResult<()> {
    if record.read_only {
        debug!(project = %record.fullname, "Rejecting mutation on read-only project");
        return Err(GrantError::acl_regeneration(&record.fullname));
    }
    Ok(())
}

fn validate_grant(tier: Tier, branches: Option<&str>) -> GrantResult<StoredGrant> {
    if tier == Tier::None {
        return Err(GrantError::invalid("cannot grant the 'none' tier"));
    }
    if tier.is_branch_scoped() {
        let Some(branches) = branches else {
            return Err(GrantError::invalid(
                "collaborator grants need a branch pattern",
            ));
        };
        if branches.split(',').all(|p| p.trim().is_empty()) {
            return Err(GrantError::invalid("empty branch pattern"));
        }
        patterns::validate_patterns(branches).map_err(GrantError::invalid)?;
    }
    Ok(StoredGrant::new(tier, branches))
}

fn check_required_groups(
    policy: &InstancePolicy,
    project: &str,
    user: &str,
    user_groups: &BTreeSet<String>,
) -> GrantResult<()> {
    policy
        .required_groups
        .check(project, user_groups.iter().map(String::as_str))
        .map_err(|groups| GrantError::RequiredGroup {
            project: project.to_string(),
            user: user.to_string(),
            groups: groups.join(", "),
        })
}
