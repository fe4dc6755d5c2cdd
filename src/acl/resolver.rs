//! Permission resolver
//!
//! Answers "what tier does principal P have on project X for ref R?" from
//! an [`AccessGraph`] snapshot and the [`InstancePolicy`]. Rules are
//! evaluated in order and the first match wins:
//!
//! 1. Site administrator → `admin`
//! 2. Project owner → `admin`
//! 3. Direct `admin` grant (on the principal or one of its groups) → `admin`
//! 4. Direct `commit` grant → `commit`
//! 5. External committer group → `commit`
//! 6. Collaborator grant matching the ref (any collaborator grant when no
//!    ref is given) → `collaborator`
//! 7. Direct `ticket` grant → `ticket`
//! 8. Otherwise → `none`

use crate::acl::graph::{AccessGraph, GrantEntry};
use crate::acl::policy::InstancePolicy;
use crate::acl::types::{AccessLevel, AccessSource, Principal, Tier};
use crate::error::ResolveError;
use tracing::{debug, trace};

/// Everything a resolution needs, passed explicitly into every call
#[derive(Debug, Clone)]
pub struct ResolutionContext<'a> {
    graph: &'a AccessGraph,
    policy: &'a InstancePolicy,
    actor: Option<Principal>,
}

impl<'a> ResolutionContext<'a> {
    pub fn new(graph: &'a AccessGraph, policy: &'a InstancePolicy) -> Self {
        Self {
            graph,
            policy,
            actor: None,
        }
    }

    /// Attach the principal performing the current request
    pub fn with_actor(mut self, actor: Principal) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn graph(&self) -> &'a AccessGraph {
        self.graph
    }

    pub fn policy(&self) -> &'a InstancePolicy {
        self.policy
    }

    pub fn actor(&self) -> Option<&Principal> {
        self.actor.as_ref()
    }

    /// Resolve any principal against this context
    pub fn resolve(
        &self,
        principal: &Principal,
        refname: Option<&str>,
    ) -> Result<Resolution, ResolveError> {
        PermissionResolver::resolve(self, principal, refname)
    }

    /// Resolve the acting principal; anonymous actors have no access
    pub fn actor_access(&self, refname: Option<&str>) -> Result<Resolution, ResolveError> {
        match &self.actor {
            Some(actor) => self.resolve(actor, refname),
            None => Ok(Resolution::none()),
        }
    }
}

/// Outcome of a resolution: the tier and the rule that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub tier: Tier,
    pub source: AccessSource,
}

impl Resolution {
    fn new(tier: Tier, source: AccessSource) -> Self {
        Self { tier, source }
    }

    pub fn none() -> Self {
        Self::new(Tier::None, AccessSource::NoMatch)
    }

    /// Access level this resolution maps to on the git backend
    ///
    /// A collaborator resolved without a ref only carries read intent; with
    /// a matched ref it is write access scoped to that ref.
    pub fn level(&self) -> Option<AccessLevel> {
        match (self.tier, &self.source) {
            (Tier::Admin, _) => Some(AccessLevel::Admin),
            (Tier::Commit, _) => Some(AccessLevel::Write),
            (Tier::Collaborator, AccessSource::BranchPattern { pattern: None, .. }) => {
                Some(AccessLevel::Read)
            }
            (Tier::Collaborator, _) => Some(AccessLevel::Write),
            (Tier::Ticket, _) => Some(AccessLevel::Read),
            (Tier::None, _) => None,
        }
    }

    /// Whether this resolution allows pushing to the resolved ref
    pub fn can_write(&self) -> bool {
        self.level().is_some_and(|level| level.can_write())
    }

    pub fn is_none(&self) -> bool {
        self.tier == Tier::None
    }
}

/// The ordered rule list
pub struct PermissionResolver;

impl PermissionResolver {
    /// Resolve `principal`'s tier, optionally for one fully qualified ref
    ///
    /// "No access" is a normal `Tier::None` result; only a principal the
    /// snapshot does not know is an error.
    pub fn resolve(
        ctx: &ResolutionContext<'_>,
        principal: &Principal,
        refname: Option<&str>,
    ) -> Result<Resolution, ResolveError> {
        let graph = ctx.graph;
        let policy = ctx.policy;

        if !graph.knows(principal) {
            return Err(match principal {
                Principal::User(name) => ResolveError::unknown_user(name),
                Principal::Group(name) => ResolveError::unknown_group(name),
            });
        }

        debug!(
            project = graph.fullname(),
            principal = %principal,
            refname = ?refname,
            "Resolving access"
        );

        let groups: Vec<&str> = match principal {
            Principal::User(name) => graph.groups_of(name).collect(),
            Principal::Group(_) => Vec::new(),
        };

        // 1. Site administrators
        let site_admin = match principal {
            Principal::User(name) => {
                policy.site_admins.is_admin_user(name)
                    || groups.iter().any(|g| policy.site_admins.is_admin_group(g))
            }
            Principal::Group(name) => policy.site_admins.is_admin_group(name),
        };
        if site_admin {
            trace!("Matched site admin");
            return Ok(Resolution::new(Tier::Admin, AccessSource::SiteAdmin));
        }

        // 2. Project owner
        if let Principal::User(name) = principal
            && graph.is_owner(name)
        {
            trace!("Matched project owner");
            return Ok(Resolution::new(Tier::Admin, AccessSource::Owner));
        }

        // 3 & 4. Project-wide grants
        for tier in [Tier::Admin, Tier::Commit] {
            if let Some((_, via_group)) =
                find_grant(graph, principal, &groups, |g| g.tier == tier)
            {
                trace!(tier = %tier, via_group = ?via_group, "Matched direct grant");
                return Ok(Resolution::new(
                    tier,
                    AccessSource::Grant {
                        tier,
                        via_group: via_group.map(str::to_string),
                    },
                ));
            }
        }

        // 5. External committer groups
        let override_groups: Vec<&str> = match principal {
            Principal::User(_) => groups.clone(),
            Principal::Group(name) => vec![name.as_str()],
        };
        if let Some(group) = policy
            .external
            .evaluate(override_groups, graph.fullname())
        {
            trace!(group = %group, "Matched external committer group");
            return Ok(Resolution::new(
                Tier::Commit,
                AccessSource::ExternalOverride { group },
            ));
        }

        // 6. Branch-scoped collaborator grants
        if let Some(resolution) = resolve_collaborator(graph, principal, &groups, refname) {
            return Ok(resolution);
        }

        // 7. Ticket grants
        if let Some((_, via_group)) =
            find_grant(graph, principal, &groups, |g| g.tier == Tier::Ticket)
        {
            trace!(via_group = ?via_group, "Matched ticket grant");
            return Ok(Resolution::new(
                Tier::Ticket,
                AccessSource::Grant {
                    tier: Tier::Ticket,
                    via_group: via_group.map(str::to_string),
                },
            ));
        }

        // 8. No access
        trace!("No rule matched");
        Ok(Resolution::none())
    }
}

/// Find the first grant satisfying `pred`, looking at the principal's own
/// grants before its groups' grants. Returns the grant and, when inherited,
/// the group it came from.
fn find_grant<'g, F>(
    graph: &'g AccessGraph,
    principal: &Principal,
    groups: &[&'g str],
    pred: F,
) -> Option<(&'g GrantEntry, Option<&'g str>)>
where
    F: Fn(&GrantEntry) -> bool,
{
    if let Some(grant) = graph.grants_of(principal).iter().find(|&g| pred(g)) {
        return Some((grant, None));
    }

    groups.iter().find_map(|group| {
        graph
            .grants_of(&Principal::group(*group))
            .iter()
            .find(|&g| pred(g))
            .map(|grant| (grant, Some(*group)))
    })
}

fn resolve_collaborator(
    graph: &AccessGraph,
    principal: &Principal,
    groups: &[&str],
    refname: Option<&str>,
) -> Option<Resolution> {
    let is_collaborator = |g: &GrantEntry| g.tier == Tier::Collaborator;

    match refname {
        // Read intent: any collaborator grant will do
        None => {
            let (_, via_group) = find_grant(graph, principal, groups, is_collaborator)?;
            trace!(via_group = ?via_group, "Matched collaborator grant (read intent)");
            Some(Resolution::new(
                Tier::Collaborator,
                AccessSource::BranchPattern {
                    pattern: None,
                    via_group: via_group.map(str::to_string),
                },
            ))
        }
        // Every collaborator grant is consulted; the principal's access to the
        // ref is the union of them, not just the first one found.
        Some(refname) => {
            let (grant, via_group) = find_grant(graph, principal, groups, |g| {
                is_collaborator(g) && g.matcher().matches(refname)
            })?;
            let pattern = grant.matcher().find_match(refname).map(str::to_string);
            trace!(pattern = ?pattern, via_group = ?via_group, "Matched collaborator pattern");
            Some(Resolution::new(
                Tier::Collaborator,
                AccessSource::BranchPattern {
                    pattern,
                    via_group: via_group.map(str::to_string),
                },
            ))
        }
    }
}
