//! Push gate
//!
//! The per-ref check a git hook runs before accepting an update. Decisions
//! carry the messages shown to the pusher.

use crate::acl::resolver::ResolutionContext;
use crate::acl::types::Principal;
use crate::error::ResolveError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Which repository of a project is being pushed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    #[default]
    Main,
    Docs,
    Tickets,
    Requests,
}

impl FromStr for RepoType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(RepoType::Main),
            "docs" => Ok(RepoType::Docs),
            "tickets" => Ok(RepoType::Tickets),
            "requests" => Ok(RepoType::Requests),
            other => Err(format!("unknown repository type '{}'", other)),
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepoType::Main => "main",
            RepoType::Docs => "docs",
            RepoType::Tickets => "tickets",
            RepoType::Requests => "requests",
        };
        write!(f, "{}", name)
    }
}

/// One ref update to check
#[derive(Debug, Clone, Default)]
pub struct PushRequest {
    /// Pushing user or deploy key principal; `None` for anonymous
    pub user: Option<String>,
    /// Fully qualified ref, e.g. `refs/heads/main`
    pub refname: String,
    pub repo_type: RepoType,
    /// The push is the merge of a pull request
    pub pull_request: bool,
    /// The push was generated by the forge itself
    pub internal: bool,
}

impl PushRequest {
    pub fn new(user: impl Into<String>, refname: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            refname: refname.into(),
            ..Default::default()
        }
    }
}

/// Outcome of [`check_push`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushDecision {
    pub allowed: bool,
    pub messages: Vec<String>,
}

impl PushDecision {
    fn allow(messages: Vec<String>) -> Self {
        Self {
            allowed: true,
            messages,
        }
    }

    fn deny(messages: Vec<String>) -> Self {
        Self {
            allowed: false,
            messages,
        }
    }
}

/// Decide whether a single ref update is allowed
///
/// Order: forge-internal pushes pass; pull-request-only repositories refuse
/// direct pushes to the main repo; anonymous pushes fail; deploy keys use
/// their push flag; everyone else needs write access for the ref.
pub fn check_push(
    ctx: &ResolutionContext<'_>,
    request: &PushRequest,
) -> Result<PushDecision, ResolveError> {
    let graph = ctx.graph();
    let project = graph.project();

    if request.internal {
        return Ok(PushDecision::allow(vec!["Internal push allowed".into()]));
    }

    if request.repo_type == RepoType::Main {
        let pr_only =
            project.pull_request_access_only || (ctx.policy().pr_only && !project.is_fork);
        if pr_only && !request.pull_request {
            return Ok(PushDecision::deny(vec!["Pull request required".into()]));
        }
    }

    let Some(user) = request.user.as_deref() else {
        return Ok(PushDecision::deny(vec!["Anonymous push refused".into()]));
    };

    if let Some(key) = graph.lookup_deploy_key(user) {
        debug!(project = %project.fullname, key = %key.name, "Deploy key push");
        let mut messages = vec![format!("Deploykey used. Push access: {}", key.push_access)];
        messages.push(format!("Has commit access: {}", key.push_access));
        return Ok(if key.push_access {
            PushDecision::allow(messages)
        } else {
            PushDecision::deny(messages)
        });
    }

    let resolution = ctx.resolve(&Principal::user(user), Some(&request.refname))?;
    let allowed = resolution.can_write();
    debug!(
        project = %project.fullname,
        user,
        refname = %request.refname,
        tier = %resolution.tier,
        source = %resolution.source,
        allowed,
        "Push checked"
    );

    let messages = vec![format!("Has commit access: {}", allowed)];
    Ok(if allowed {
        PushDecision::allow(messages)
    } else {
        PushDecision::deny(messages)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::graph::{AccessGraph, ProjectInfo};
    use crate::acl::policy::InstancePolicy;
    use crate::acl::types::Tier;

    fn graph(info: ProjectInfo) -> AccessGraph {
        AccessGraph::builder(info, "pingou")
            .grant(Principal::user("kevin"), Tier::Collaborator, Some("f*"))
            .grant(Principal::user("alice"), Tier::Ticket, None)
            .deploy_key("ci", true)
            .deploy_key("mirror", false)
            .build()
    }

    #[test]
    fn test_collaborator_push_scoped_to_pattern() {
        let graph = graph(ProjectInfo::new("test"));
        let policy = InstancePolicy::empty();
        let ctx = ResolutionContext::new(&graph, &policy);

        assert!(check_push(&ctx, &PushRequest::new("kevin", "refs/heads/f33")).unwrap().allowed);
        assert!(!check_push(&ctx, &PushRequest::new("kevin", "refs/heads/main")).unwrap().allowed);
        assert!(!check_push(&ctx, &PushRequest::new("alice", "refs/heads/main")).unwrap().allowed);
        assert!(check_push(&ctx, &PushRequest::new("pingou", "refs/heads/main")).unwrap().allowed);
    }

    #[test]
    fn test_pull_request_only_project() {
        let mut info = ProjectInfo::new("test");
        info.pull_request_access_only = true;
        let graph = graph(info);
        let policy = InstancePolicy::empty();
        let ctx = ResolutionContext::new(&graph, &policy);

        let direct = check_push(&ctx, &PushRequest::new("pingou", "refs/heads/main")).unwrap();
        assert!(!direct.allowed);
        assert_eq!(direct.messages, vec!["Pull request required"]);

        let merge = PushRequest {
            pull_request: true,
            ..PushRequest::new("pingou", "refs/heads/main")
        };
        assert!(check_push(&ctx, &merge).unwrap().allowed);

        let docs = PushRequest {
            repo_type: RepoType::Docs,
            ..PushRequest::new("pingou", "refs/heads/main")
        };
        assert!(check_push(&ctx, &docs).unwrap().allowed);
    }

    #[test]
    fn test_global_pr_only_skips_forks() {
        let mut fork = ProjectInfo::new("forks/kevin/test");
        fork.is_fork = true;
        let graph = graph(fork);
        let policy = InstancePolicy {
            pr_only: true,
            ..InstancePolicy::empty()
        };
        let ctx = ResolutionContext::new(&graph, &policy);
        assert!(check_push(&ctx, &PushRequest::new("pingou", "refs/heads/main")).unwrap().allowed);
    }

    #[test]
    fn test_internal_and_anonymous() {
        let graph = graph(ProjectInfo::new("test"));
        let policy = InstancePolicy::empty();
        let ctx = ResolutionContext::new(&graph, &policy);

        let internal = PushRequest {
            user: None,
            internal: true,
            refname: "refs/heads/main".into(),
            ..Default::default()
        };
        assert!(check_push(&ctx, &internal).unwrap().allowed);

        let anonymous = PushRequest {
            user: None,
            refname: "refs/heads/main".into(),
            ..Default::default()
        };
        assert!(!check_push(&ctx, &anonymous).unwrap().allowed);
    }

    #[test]
    fn test_deploy_keys() {
        let graph = graph(ProjectInfo::new("test"));
        let policy = InstancePolicy::empty();
        let ctx = ResolutionContext::new(&graph, &policy);

        assert!(check_push(&ctx, &PushRequest::new("deploykey_test_ci", "refs/heads/main")).unwrap().allowed);
        assert!(!check_push(&ctx, &PushRequest::new("deploykey_test_mirror", "refs/heads/main")).unwrap().allowed);
    }

    #[test]
    fn test_unknown_user_is_an_error() {
        let graph = graph(ProjectInfo::new("test"));
        let policy = InstancePolicy::empty();
        let ctx = ResolutionContext::new(&graph, &policy);
        assert!(check_push(&ctx, &PushRequest::new("ghost", "refs/heads/main")).is_err());
    }
}
