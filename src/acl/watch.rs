//! Watch level resolution
//!
//! A user's notification subscription on a project has three states:
//!
//! - no record: the implicit default derived from the user's involvement
//! - a record with at least one category: an explicit subscription
//! - a record with both categories off: an explicit opt-out
//!
//! Implicit defaults come from the same access graph the permission
//! resolver uses. Owners and direct grantees (admin, commit or ticket)
//! watch issues and commits; users involved only through a group watch
//! issues and must opt in to commits.

use crate::acl::graph::AccessGraph;
use crate::acl::types::{Principal, Tier};
use crate::error::{ResolveError, WatchError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

/// Notification categories a user watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatchLevel {
    pub issues: bool,
    pub commits: bool,
}

impl WatchLevel {
    pub const NONE: WatchLevel = WatchLevel {
        issues: false,
        commits: false,
    };
    pub const ISSUES: WatchLevel = WatchLevel {
        issues: true,
        commits: false,
    };
    pub const COMMITS: WatchLevel = WatchLevel {
        issues: false,
        commits: true,
    };
    pub const ALL: WatchLevel = WatchLevel {
        issues: true,
        commits: true,
    };

    pub const fn is_watching(&self) -> bool {
        self.issues || self.commits
    }

    pub const fn union(self, other: WatchLevel) -> WatchLevel {
        WatchLevel {
            issues: self.issues || other.issues,
            commits: self.commits || other.commits,
        }
    }

    /// Category names, as shown to users
    pub fn categories(&self) -> Vec<&'static str> {
        let mut categories = Vec::with_capacity(2);
        if self.issues {
            categories.push("issues");
        }
        if self.commits {
            categories.push("commits");
        }
        categories
    }
}

impl fmt::Display for WatchLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_watching() {
            write!(f, "{}", self.categories().join(", "))
        } else {
            write!(f, "not watching")
        }
    }
}

/// Explicit subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatcherRecord {
    pub watch_issues: bool,
    pub watch_commits: bool,
}

impl WatcherRecord {
    pub const fn is_opt_out(&self) -> bool {
        !self.watch_issues && !self.watch_commits
    }

    pub const fn level(&self) -> WatchLevel {
        WatchLevel {
            issues: self.watch_issues,
            commits: self.watch_commits,
        }
    }
}

/// Watch-status update request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    /// Delete the explicit record and fall back to the implicit default
    Reset,
    /// Opt out of everything
    Unwatch,
    /// Issues and pull requests
    Issues,
    Commits,
    /// Issues, pull requests and commits
    All,
}

impl WatchStatus {
    pub const fn code(&self) -> i8 {
        match self {
            WatchStatus::Reset => -1,
            WatchStatus::Unwatch => 0,
            WatchStatus::Issues => 1,
            WatchStatus::Commits => 2,
            WatchStatus::All => 3,
        }
    }

    /// The record this status stores, `None` for a reset
    pub const fn record(&self) -> Option<WatcherRecord> {
        let (watch_issues, watch_commits) = match self {
            WatchStatus::Reset => return None,
            WatchStatus::Unwatch => (false, false),
            WatchStatus::Issues => (true, false),
            WatchStatus::Commits => (false, true),
            WatchStatus::All => (true, true),
        };
        Some(WatcherRecord {
            watch_issues,
            watch_commits,
        })
    }
}

impl TryFrom<i64> for WatchStatus {
    type Error = WatchError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(WatchStatus::Reset),
            0 => Ok(WatchStatus::Unwatch),
            1 => Ok(WatchStatus::Issues),
            2 => Ok(WatchStatus::Commits),
            3 => Ok(WatchStatus::All),
            other => Err(WatchError::InvalidStatus {
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for WatchStatus {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "-1" => Ok(WatchStatus::Reset),
            "0" => Ok(WatchStatus::Unwatch),
            "1" => Ok(WatchStatus::Issues),
            "2" => Ok(WatchStatus::Commits),
            "3" => Ok(WatchStatus::All),
            other => Err(WatchError::InvalidStatus {
                value: other.to_string(),
            }),
        }
    }
}

/// Explicit records of one project, keyed by user name
pub type WatcherRecords = BTreeMap<String, WatcherRecord>;

/// Resolved watch set of a project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchSet {
    /// Watching principals; groups appear as `@group` and are not expanded
    pub entries: BTreeMap<String, WatchLevel>,
    /// Users who explicitly opted out, to subtract when `@group` entries are
    /// expanded downstream
    pub opted_out: BTreeSet<String>,
}

impl WatchSet {
    pub fn get(&self, principal: &str) -> Option<WatchLevel> {
        self.entries.get(principal).copied()
    }

    pub fn contains(&self, principal: &str) -> bool {
        self.entries.contains_key(principal)
    }
}

/// Resolves watch levels from an access graph and explicit records
pub struct WatchLevelResolver;

impl WatchLevelResolver {
    /// Implicit default for a user with no explicit record
    ///
    /// A direct grant always takes precedence over group membership, so a
    /// direct `ticket` grantee who is also in a `commit` group watches both
    /// categories.
    pub fn implicit(graph: &AccessGraph, user: &str) -> WatchLevel {
        if graph.is_owner(user) {
            return WatchLevel::ALL;
        }

        let principal = Principal::user(user);
        if graph
            .grants_of(&principal)
            .iter()
            .any(|g| g.tier.is_watch_eligible())
        {
            return WatchLevel::ALL;
        }

        let via_group = graph.groups_of(user).any(|group| {
            graph
                .grants_of(&Principal::group(group))
                .iter()
                .any(|g| g.tier.is_watch_eligible())
        });
        if via_group {
            return WatchLevel::ISSUES;
        }

        WatchLevel::NONE
    }

    /// Resolve one user's watch level
    ///
    /// An opt-out record removes the user regardless of tier. Any other
    /// record confirms the subscription: the result is the level implied by
    /// the user's involvement plus whatever the record adds, so an explicit
    /// subscription never yields less than the tier's level.
    pub fn resolve(
        graph: &AccessGraph,
        records: &WatcherRecords,
        user: &str,
    ) -> Result<WatchLevel, ResolveError> {
        if !graph.has_user(user) {
            return Err(ResolveError::unknown_user(user));
        }

        let level = match records.get(user) {
            Some(record) if record.is_opt_out() => {
                trace!(user, "Explicit opt-out");
                WatchLevel::NONE
            }
            Some(record) => {
                trace!(user, "Explicit subscription");
                Self::implicit(graph, user).union(record.level())
            }
            None => Self::implicit(graph, user),
        };

        Ok(level)
    }

    /// Resolve the project's whole watch set
    pub fn watch_set(graph: &AccessGraph, records: &WatcherRecords) -> WatchSet {
        let mut set = WatchSet::default();

        set.entries.insert(graph.owner().to_string(), WatchLevel::ALL);

        for tier in [Tier::Admin, Tier::Commit, Tier::Ticket] {
            for user in graph.users_with(tier) {
                set.entries.insert(user.to_string(), WatchLevel::ALL);
            }
            for group in graph.groups_with(tier) {
                set.entries
                    .entry(format!("@{}", group))
                    .or_insert(WatchLevel::ISSUES);
            }
        }

        for (user, record) in records {
            if record.is_opt_out() {
                set.entries.remove(user);
                set.opted_out.insert(user.clone());
            } else {
                let level = Self::implicit(graph, user).union(record.level());
                set.entries.insert(user.clone(), level);
            }
        }

        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::graph::ProjectInfo;

    fn graph() -> AccessGraph {
        AccessGraph::builder(ProjectInfo::new("test"), "pingou")
            .group("committers", ["alice", "bob"])
            .group("viewers", ["carol"])
            .grant(Principal::user("baz"), Tier::Admin, None)
            .grant(Principal::user("kevin"), Tier::Collaborator, Some("f*"))
            .grant(Principal::group("committers"), Tier::Commit, None)
            .user("stranger")
            .build()
    }

    #[test]
    fn test_parse_status() {
        assert_eq!("-1".parse::<WatchStatus>().unwrap(), WatchStatus::Reset);
        assert_eq!("0".parse::<WatchStatus>().unwrap(), WatchStatus::Unwatch);
        assert_eq!("3".parse::<WatchStatus>().unwrap(), WatchStatus::All);
        assert!("4".parse::<WatchStatus>().is_err());
        assert!("-2".parse::<WatchStatus>().is_err());
        assert!("watch".parse::<WatchStatus>().is_err());
        assert!("".parse::<WatchStatus>().is_err());
        // Only the exact spellings are accepted
        for loose in ["+1", " 1 ", "01", "3\n"] {
            assert!(loose.parse::<WatchStatus>().is_err(), "{:?}", loose);
        }
    }

    #[test]
    fn test_status_records() {
        assert_eq!(WatchStatus::Reset.record(), None);
        assert!(WatchStatus::Unwatch.record().unwrap().is_opt_out());
        assert_eq!(
            WatchStatus::Commits.record().unwrap().level(),
            WatchLevel::COMMITS
        );
        for code in -1..=3 {
            assert_eq!(WatchStatus::try_from(code).unwrap().code() as i64, code);
        }
    }

    #[test]
    fn test_implicit_defaults() {
        let graph = graph();
        assert_eq!(WatchLevelResolver::implicit(&graph, "pingou"), WatchLevel::ALL);
        assert_eq!(WatchLevelResolver::implicit(&graph, "baz"), WatchLevel::ALL);
        assert_eq!(WatchLevelResolver::implicit(&graph, "alice"), WatchLevel::ISSUES);
        // viewers holds no grant on this project
        assert_eq!(WatchLevelResolver::implicit(&graph, "carol"), WatchLevel::NONE);
        // collaborator is below ticket
        assert_eq!(WatchLevelResolver::implicit(&graph, "kevin"), WatchLevel::NONE);
        assert_eq!(WatchLevelResolver::implicit(&graph, "stranger"), WatchLevel::NONE);
    }

    #[test]
    fn test_opt_out_beats_admin() {
        let graph = graph();
        let mut records = WatcherRecords::new();
        records.insert("baz".into(), WatchStatus::Unwatch.record().unwrap());

        let level = WatchLevelResolver::resolve(&graph, &records, "baz").unwrap();
        assert_eq!(level, WatchLevel::NONE);

        let set = WatchLevelResolver::watch_set(&graph, &records);
        assert!(!set.contains("baz"));
        assert!(set.opted_out.contains("baz"));
    }

    #[test]
    fn test_group_member_opts_into_commits() {
        let graph = graph();
        let mut records = WatcherRecords::new();
        records.insert("alice".into(), WatchStatus::Commits.record().unwrap());

        let level = WatchLevelResolver::resolve(&graph, &records, "alice").unwrap();
        assert_eq!(level, WatchLevel::ALL);
    }

    #[test]
    fn test_outsider_explicit_subscription() {
        let graph = graph();
        let mut records = WatcherRecords::new();
        records.insert("stranger".into(), WatchStatus::Issues.record().unwrap());

        let level = WatchLevelResolver::resolve(&graph, &records, "stranger").unwrap();
        assert_eq!(level, WatchLevel::ISSUES);
    }

    #[test]
    fn test_watch_set_reports_groups_unexpanded() {
        let graph = graph();
        let set = WatchLevelResolver::watch_set(&graph, &WatcherRecords::new());

        assert_eq!(set.get("pingou"), Some(WatchLevel::ALL));
        assert_eq!(set.get("baz"), Some(WatchLevel::ALL));
        assert_eq!(set.get("@committers"), Some(WatchLevel::ISSUES));
        assert!(!set.contains("alice"));
        assert!(!set.contains("kevin"));
    }

    #[test]
    fn test_unknown_user() {
        let graph = graph();
        assert!(WatchLevelResolver::resolve(&graph, &WatcherRecords::new(), "ghost").is_err());
    }

    #[test]
    fn test_level_display() {
        assert_eq!(WatchLevel::ALL.to_string(), "issues, commits");
        assert_eq!(WatchLevel::NONE.to_string(), "not watching");
    }
}
