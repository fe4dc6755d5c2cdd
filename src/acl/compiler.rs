//! ACL compiler
//!
//! Turns a project's access graph into an [`AccessArtifact`] and hands it to
//! an [`AclPublisher`]. Compilation is two-phase:
//!
//! 1. [`AclCompiler::begin_compile`] marks the project read-only, issues a
//!    compile ticket and spawns the compile task.
//! 2. [`AclCompiler::await_compile`] waits for the task. Callers that do not
//!    care about the outcome can drop the handle instead.
//!
//! Only the task holding the project's newest ticket may clear `read_only`.
//! A failed compile leaves the project read-only and records the failure on
//! it, so an operator can see why it is stuck. That includes a compile task
//! that panics.

use crate::acl::graph::AccessGraph;
use crate::acl::policy::{InstancePolicy, PolicyHandle};
use crate::acl::publish::AclPublisher;
use crate::acl::resolver::ResolutionContext;
use crate::acl::types::{AccessLevel, Principal, Tier};
use crate::config::AclConfig;
use crate::error::{CompileError, CompileResult, PublishError};
use crate::store::ForgeStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Ref scope covering every ref of the repository
pub const ALL_REFS: &str = "*";

/// One `(principal, ref scope) -> level` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRecord {
    pub principal: String,
    pub is_group: bool,
    /// [`ALL_REFS`] or a fully qualified glob such as `refs/heads/f*`
    pub ref_pattern: String,
    pub level: AccessLevel,
}

impl AclRecord {
    fn new(principal: &Principal, ref_pattern: impl Into<String>, level: AccessLevel) -> Self {
        Self {
            principal: principal.name().to_string(),
            is_group: principal.is_group(),
            ref_pattern: ref_pattern.into(),
            level,
        }
    }

    pub fn is_scoped(&self) -> bool {
        self.ref_pattern != ALL_REFS
    }
}

/// Compiled access rules of one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessArtifact {
    pub project: String,
    #[serde(default)]
    pub is_fork: bool,
    pub records: Vec<AclRecord>,
    /// Members of every group that appears in `records`
    #[serde(default)]
    pub groups: BTreeMap<String, BTreeSet<String>>,
}

impl AccessArtifact {
    /// Records of one principal, in artifact order
    pub fn records_for<'a>(
        &'a self,
        principal: &'a Principal,
    ) -> impl Iterator<Item = &'a AclRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.principal == principal.name() && r.is_group == principal.is_group())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render as a gitolite configuration fragment
    ///
    /// Groups without members are neither defined nor referenced, since
    /// gitolite rejects undefined groups.
    pub fn render_gitolite(&self) -> String {
        let mut out = String::new();

        let populated: BTreeSet<&str> = self
            .groups
            .iter()
            .filter(|(_, members)| !members.is_empty())
            .map(|(group, _)| group.as_str())
            .collect();

        for group in &populated {
            let members: Vec<&str> = self.groups[*group].iter().map(String::as_str).collect();
            let _ = writeln!(out, "@{} = {}", group, members.join(" "));
        }
        if !populated.is_empty() {
            out.push('\n');
        }

        let prefix = if self.is_fork { "forks/" } else { "" };
        let _ = writeln!(out, "repo {}{}", prefix, self.project);
        for record in &self.records {
            if record.is_group && !populated.contains(record.principal.as_str()) {
                continue;
            }
            let who = if record.is_group {
                format!("@{}", record.principal)
            } else {
                record.principal.clone()
            };
            if record.is_scoped() {
                let _ = writeln!(
                    out,
                    "  {} {} = {}",
                    record.level.gitolite_perm(),
                    glob_to_refex(&record.ref_pattern),
                    who
                );
            } else {
                let _ = writeln!(out, "  {} = {}", record.level.gitolite_perm(), who);
            }
        }

        out
    }
}

/// Translate a shell-style glob into an anchored gitolite refex
fn glob_to_refex(glob: &str) -> String {
    let mut refex = String::with_capacity(glob.len() + 4);
    let mut chars = glob.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        if in_class {
            refex.push(c);
            if c == ']' {
                in_class = false;
            }
            continue;
        }
        match c {
            '*' => refex.push_str(".*"),
            '?' => refex.push('.'),
            '[' => {
                in_class = true;
                refex.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    refex.push('^');
                }
            }
            other => refex.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }

    refex.push('$');
    refex
}

/// Publish settings for the compile task
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Upper bound on one publish attempt
    pub publish_timeout: Duration,
    /// Retries after the first failed attempt
    pub max_retries: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl From<&AclConfig> for CompileOptions {
    fn from(config: &AclConfig) -> Self {
        Self {
            publish_timeout: Duration::from_secs(config.publish_timeout_secs),
            max_retries: config.max_retries,
        }
    }
}

/// An outstanding compile started by [`AclCompiler::begin_compile`]
#[derive(Debug)]
pub struct CompileHandle {
    project: String,
    ticket: u64,
    task: JoinHandle<CompileResult<AccessArtifact>>,
}

impl CompileHandle {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Compiles and publishes project ACLs
pub struct AclCompiler {
    store: Arc<ForgeStore>,
    policy: Arc<PolicyHandle>,
    publisher: Arc<dyn AclPublisher>,
    options: CompileOptions,
    /// Serializes publishes so two tasks never write the backend at once
    publish_lock: Mutex<()>,
}

impl AclCompiler {
    pub fn new(
        store: Arc<ForgeStore>,
        policy: Arc<PolicyHandle>,
        publisher: Arc<dyn AclPublisher>,
        options: CompileOptions,
    ) -> Self {
        Self {
            store,
            policy,
            publisher,
            options,
            publish_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<ForgeStore> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<dyn AclPublisher> {
        &self.publisher
    }

    /// Compile one snapshot
    ///
    /// Every principal in the graph gets a record for its unscoped level.
    /// A principal whose unscoped resolution lands on the collaborator rule
    /// additionally gets one write record per distinct branch pattern of its
    /// own collaborator grants. Rules above the collaborator rule do not
    /// depend on the ref, so those records are exactly the refs for which
    /// the resolver answers write.
    ///
    /// Output order is stable: by principal name, users before groups, the
    /// unscoped record before scoped ones, then level descending, then ref
    /// pattern.
    pub fn compile(graph: &AccessGraph, policy: &InstancePolicy) -> CompileResult<AccessArtifact> {
        let ctx = ResolutionContext::new(graph, policy);
        let mut records = Vec::new();
        let mut groups = BTreeMap::new();

        for principal in graph.principals() {
            let base = ctx
                .resolve(&principal, None)
                .map_err(|e| CompileError::failure(graph.fullname(), e))?;

            let Some(level) = base.level() else {
                continue;
            };
            records.push(AclRecord::new(&principal, ALL_REFS, level));

            if base.tier == Tier::Collaborator {
                let patterns: BTreeSet<&str> = graph
                    .grants_of(&principal)
                    .iter()
                    .filter(|g| g.tier == Tier::Collaborator)
                    .flat_map(|g| g.matcher().qualified())
                    .collect();
                for pattern in patterns {
                    records.push(AclRecord::new(&principal, pattern, AccessLevel::Write));
                }
            }

            if let Principal::Group(name) = &principal {
                groups.insert(
                    name.clone(),
                    graph.members_of(name).map(str::to_string).collect(),
                );
            }
        }

        for key in graph.deploy_keys() {
            let level = if key.push_access {
                AccessLevel::Write
            } else {
                AccessLevel::Read
            };
            let principal = Principal::user(graph.deploy_key_principal(&key.name));
            records.push(AclRecord::new(&principal, ALL_REFS, level));
        }

        records.sort_by(|a, b| {
            a.principal
                .cmp(&b.principal)
                .then(a.is_group.cmp(&b.is_group))
                .then(a.is_scoped().cmp(&b.is_scoped()))
                .then(b.level.cmp(&a.level))
                .then(a.ref_pattern.cmp(&b.ref_pattern))
        });

        debug!(
            project = graph.fullname(),
            records = records.len(),
            "Compiled access artifact"
        );

        Ok(AccessArtifact {
            project: graph.fullname().to_string(),
            is_fork: graph.project().is_fork,
            records,
            groups,
        })
    }

    /// Mark the project read-only and start compiling it
    ///
    /// Must be called from within a Tokio runtime. A newer call for the same
    /// project supersedes this one.
    pub fn begin_compile(self: &Arc<Self>, project: &str) -> CompileResult<CompileHandle> {
        let ticket = self.store.begin_compile(project)?;
        info!(project, ticket, "ACL regeneration requested");

        let compiler = Arc::clone(self);
        let name = project.to_string();
        let inner = tokio::spawn(async move { compiler.run(&name, ticket).await });

        // A task that dies without reporting must not leave the project
        // read-only with nothing recorded, even when the handle is dropped.
        let store = Arc::clone(&self.store);
        let name = project.to_string();
        let task = tokio::spawn(async move {
            inner.await.unwrap_or_else(|e| {
                let reason = format!("compile task aborted: {}", e);
                store.fail_compile(&name, ticket, &reason);
                error!(
                    project = %name,
                    ticket,
                    error = %e,
                    "Compile task aborted, project stays read-only"
                );
                Err(CompileError::Aborted(e.to_string()))
            })
        });

        Ok(CompileHandle {
            project: project.to_string(),
            ticket,
            task,
        })
    }

    /// Wait for a compile started by [`begin_compile`](Self::begin_compile)
    pub async fn await_compile(&self, handle: CompileHandle) -> CompileResult<AccessArtifact> {
        let CompileHandle {
            project,
            ticket,
            task,
        } = handle;

        task.await.map_err(|e| {
            self.store
                .fail_compile(&project, ticket, &format!("compile task aborted: {}", e));
            error!(project = %project, ticket, error = %e, "Compile task aborted");
            CompileError::Aborted(e.to_string())
        })?
    }

    /// Begin and await in one call
    pub async fn regenerate(self: &Arc<Self>, project: &str) -> CompileResult<AccessArtifact> {
        let handle = self.begin_compile(project)?;
        self.await_compile(handle).await
    }

    /// Recompile every project, returning each outcome
    pub async fn regenerate_all(self: &Arc<Self>) -> Vec<(String, CompileResult<AccessArtifact>)> {
        let mut handles = Vec::new();
        let mut outcomes = Vec::new();

        for project in self.store.project_names() {
            match self.begin_compile(&project) {
                Ok(handle) => handles.push(handle),
                Err(e) => outcomes.push((project, Err(e))),
            }
        }
        for handle in handles {
            let project = handle.project().to_string();
            outcomes.push((project, self.await_compile(handle).await));
        }

        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    async fn run(&self, project: &str, ticket: u64) -> CompileResult<AccessArtifact> {
        let _guard = self.publish_lock.lock().await;

        if !self.store.is_current_compile(project, ticket) {
            debug!(project, ticket, "Compile superseded before it started");
            return Err(CompileError::Superseded {
                project: project.to_string(),
            });
        }

        match self.compile_and_publish(project).await {
            Ok(artifact) => {
                if self.store.complete_compile(project, ticket, artifact.clone()) {
                    info!(
                        project,
                        ticket,
                        records = artifact.records.len(),
                        backend = self.publisher.backend_name(),
                        "ACL regenerated"
                    );
                    Ok(artifact)
                } else {
                    debug!(project, ticket, "Compile superseded while publishing");
                    Err(CompileError::Superseded {
                        project: project.to_string(),
                    })
                }
            }
            Err(e) => {
                let reason = match e {
                    CompileError::CompilationFailure { reason, .. } => reason,
                    other => other.to_string(),
                };
                self.store.fail_compile(project, ticket, &reason);
                error!(
                    project,
                    ticket,
                    error = %reason,
                    "ACL compilation failed, project stays read-only"
                );
                Err(CompileError::failure(project, reason))
            }
        }
    }

    async fn compile_and_publish(&self, project: &str) -> CompileResult<AccessArtifact> {
        let graph = self
            .store
            .access_graph(project)
            .map_err(|e| CompileError::failure(project, e))?;
        let policy = self.policy.current();

        let artifact = Self::compile(&graph, &policy)?;
        self.publish_with_retry(&artifact)
            .await
            .map_err(|e| CompileError::failure(project, e))?;

        Ok(artifact)
    }

    async fn publish_with_retry(&self, artifact: &AccessArtifact) -> Result<(), PublishError> {
        let mut last_error = None;

        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                // Exponential backoff: 100ms, 200ms, 400ms, ...
                let delay = Duration::from_millis(
                    100u64.saturating_mul(2u64.saturating_pow(attempt - 1)),
                );
                tokio::time::sleep(delay).await;
                debug!(project = %artifact.project, "Retrying publish (attempt {})", attempt + 1);
            }

            let outcome =
                tokio::time::timeout(self.options.publish_timeout, self.publisher.publish(artifact))
                    .await
                    .unwrap_or(Err(PublishError::Timeout {
                        timeout_secs: self.options.publish_timeout.as_secs(),
                    }));

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(project = %artifact.project, attempt, error = %e, "Publish failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| PublishError::Rejected("no publish attempt made".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::graph::ProjectInfo;

    fn scenario() -> AccessGraph {
        AccessGraph::builder(ProjectInfo::new("test"), "pingou")
            .grant(Principal::user("baz"), Tier::Commit, None)
            .grant(Principal::user("kevin"), Tier::Collaborator, Some("f*"))
            .grant(Principal::user("ralph"), Tier::Collaborator, Some("epel*"))
            .build()
    }

    #[test]
    fn test_compile_scenario() {
        let artifact = AclCompiler::compile(&scenario(), &InstancePolicy::empty()).unwrap();
        let summary: Vec<(&str, &str, AccessLevel)> = artifact
            .records
            .iter()
            .map(|r| (r.principal.as_str(), r.ref_pattern.as_str(), r.level))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("baz", "*", AccessLevel::Write),
                ("kevin", "*", AccessLevel::Read),
                ("kevin", "refs/heads/f*", AccessLevel::Write),
                ("pingou", "*", AccessLevel::Admin),
                ("ralph", "*", AccessLevel::Read),
                ("ralph", "refs/heads/epel*", AccessLevel::Write),
            ]
        );
    }

    #[test]
    fn test_compile_is_idempotent() {
        let graph = scenario();
        let policy = InstancePolicy::empty();
        let first = AclCompiler::compile(&graph, &policy).unwrap();
        let second = AclCompiler::compile(&graph, &policy).unwrap();
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[test]
    fn test_project_wide_grant_suppresses_scoped_records() {
        let graph = AccessGraph::builder(ProjectInfo::new("test"), "pingou")
            .grant(Principal::user("kevin"), Tier::Commit, None)
            .grant(Principal::group("devs"), Tier::Collaborator, Some("f*"))
            .group("devs", ["kevin"])
            .build();
        let artifact = AclCompiler::compile(&graph, &InstancePolicy::empty()).unwrap();

        let kevin = Principal::user("kevin");
        let records: Vec<_> = artifact.records_for(&kevin).collect();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_scoped());

        let devs = Principal::group("devs");
        assert_eq!(artifact.records_for(&devs).count(), 2);
        assert!(artifact.groups["devs"].contains("kevin"));
    }

    #[test]
    fn test_deploy_keys() {
        let graph = AccessGraph::builder(ProjectInfo::new("rpms/test"), "pingou")
            .deploy_key("ci", true)
            .deploy_key("mirror", false)
            .build();
        let artifact = AclCompiler::compile(&graph, &InstancePolicy::empty()).unwrap();

        let ci = Principal::user("deploykey_rpms_test_ci");
        assert_eq!(
            artifact.records_for(&ci).next().map(|r| r.level),
            Some(AccessLevel::Write)
        );
        let mirror = Principal::user("deploykey_rpms_test_mirror");
        assert_eq!(
            artifact.records_for(&mirror).next().map(|r| r.level),
            Some(AccessLevel::Read)
        );
    }

    #[test]
    fn test_glob_to_refex() {
        assert_eq!(glob_to_refex("refs/heads/f*"), r"refs/heads/f.*$");
        assert_eq!(glob_to_refex("refs/heads/v1.?"), r"refs/heads/v1\..$");
        assert_eq!(glob_to_refex("refs/heads/[!x]y"), r"refs/heads/[^x]y$");
    }

    #[test]
    fn test_render_skips_empty_groups() {
        let graph = AccessGraph::builder(ProjectInfo::new("test"), "pingou")
            .grant(Principal::group("empty"), Tier::Commit, None)
            .build();
        let rendered = AclCompiler::compile(&graph, &InstancePolicy::empty())
            .unwrap()
            .render_gitolite();
        assert!(!rendered.contains("@empty"));
        assert!(rendered.contains("RW+ = pingou"));
    }
}
