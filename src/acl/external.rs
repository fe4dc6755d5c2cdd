//! External committer override policy
//!
//! Instance configuration can grant `commit` on projects to every member of
//! selected groups, whether or not those groups hold a grant. Each group
//! may narrow the projects it applies to:
//!
//! ```toml
//! [external_committers.packagers]
//! restrict = ["rpms/kernel"]   # only these projects (empty = all)
//! exclude = ["rpms/secret"]    # never these projects
//! ```

use crate::config::ExternalCommitterConfig;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::trace;

/// Compiled external committer rules
#[derive(Debug, Clone, Default)]
pub struct ExternalOverridePolicy {
    groups: BTreeMap<String, OverrideRule>,
}

#[derive(Debug, Clone, Default)]
struct OverrideRule {
    restrict: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl OverrideRule {
    fn applies_to(&self, project: &str) -> bool {
        if self.exclude.contains(project) {
            return false;
        }
        self.restrict.is_empty() || self.restrict.contains(project)
    }
}

impl ExternalOverridePolicy {
    /// Create a policy from configuration
    pub fn new(config: &HashMap<String, ExternalCommitterConfig>) -> Self {
        let groups = config
            .iter()
            .map(|(group, rule)| {
                (
                    group.clone(),
                    OverrideRule {
                        restrict: rule.restrict.iter().cloned().collect(),
                        exclude: rule.exclude.iter().cloned().collect(),
                    },
                )
            })
            .collect();

        Self { groups }
    }

    /// Create an empty policy (grants nothing)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Whether the group is configured as an external committer group at all
    pub fn is_override_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Check whether membership in one of `groups` grants commit on `project`
    ///
    /// Returns the first granting group in lexical order. Groups are
    /// evaluated independently: one group's `restrict` list does not stop
    /// another group from granting.
    pub fn evaluate<'a, I>(&self, groups: I, project: &str) -> Option<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut candidates: Vec<&str> = groups
            .into_iter()
            .filter(|g| self.groups.contains_key(*g))
            .collect();
        candidates.sort_unstable();

        let granting = candidates.into_iter().find(|group| {
            let applies = self.groups[*group].applies_to(project);
            trace!(group, project, applies, "Evaluated external committer group");
            applies
        })?;

        Some(granting.to_string())
    }
}
