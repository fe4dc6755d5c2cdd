//! Access control types
//!
//! Core value types shared by the resolvers and the compiler.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static PRINCIPAL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("Invalid principal name regex")
});

/// Whether a user or group name is safe to hand to the git backend
pub fn is_valid_name(name: &str) -> bool {
    PRINCIPAL_NAME.is_match(name)
}

/// Project-scoped permission tier
///
/// Ordered for display aggregation only: `admin > commit > ticket >
/// collaborator > none`. Resolution precedence is defined by rule order in
/// the resolver, not by this ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// No access
    #[default]
    None,
    /// Branch-scoped write access (only when a pattern matched)
    Collaborator,
    /// Issue tracker access
    Ticket,
    /// Project-wide write access
    Commit,
    /// Full control of the project
    Admin,
}

impl Tier {
    /// Get the tier name as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Tier::None => "none",
            Tier::Collaborator => "collaborator",
            Tier::Ticket => "ticket",
            Tier::Commit => "commit",
            Tier::Admin => "admin",
        }
    }

    /// Try to parse a tier from a string
    pub fn try_parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Tier::None),
            "collaborator" => Some(Tier::Collaborator),
            "ticket" => Some(Tier::Ticket),
            "commit" => Some(Tier::Commit),
            "admin" => Some(Tier::Admin),
            _ => None,
        }
    }

    /// Tiers that can be stored as a grant
    pub fn grantable() -> &'static [Tier] {
        &[Tier::Admin, Tier::Commit, Tier::Ticket, Tier::Collaborator]
    }

    /// Whether this tier may carry a branch pattern
    pub const fn is_branch_scoped(&self) -> bool {
        matches!(self, Tier::Collaborator)
    }

    /// Tiers that count as project involvement for watch defaults
    pub const fn is_watch_eligible(&self) -> bool {
        matches!(self, Tier::Admin | Tier::Commit | Tier::Ticket)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Access level understood by the external git-access backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

impl AccessLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::Admin => "admin",
        }
    }

    /// Permission string in gitolite syntax
    pub const fn gitolite_perm(&self) -> &'static str {
        match self {
            AccessLevel::Read => "R",
            AccessLevel::Write | AccessLevel::Admin => "RW+",
        }
    }

    pub const fn can_write(&self) -> bool {
        !matches!(self, AccessLevel::Read)
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user or a group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum Principal {
    User(String),
    Group(String),
}

impl Principal {
    pub fn user(name: impl Into<String>) -> Self {
        Principal::User(name.into())
    }

    pub fn group(name: impl Into<String>) -> Self {
        Principal::Group(name.into())
    }

    /// Parse the `@group` / `user` spelling
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix('@') {
            Some(group) => Principal::Group(group.to_string()),
            None => Principal::User(s.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Principal::User(name) | Principal::Group(name) => name,
        }
    }

    pub const fn is_group(&self) -> bool {
        matches!(self, Principal::Group(_))
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Principal::User(_) => "user",
            Principal::Group(_) => "group",
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::User(name) => write!(f, "{}", name),
            Principal::Group(name) => write!(f, "@{}", name),
        }
    }
}

/// Which rule produced a resolved tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum AccessSource {
    /// Instance-wide administrator
    SiteAdmin,
    /// Project owner
    Owner,
    /// Direct grant, either on the principal or on one of its groups
    Grant { tier: Tier, via_group: Option<String> },
    /// Instance-configured external committer group
    ExternalOverride { group: String },
    /// Collaborator grant; `pattern` is `None` for read intent (no ref)
    BranchPattern {
        pattern: Option<String>,
        via_group: Option<String>,
    },
    /// Nothing matched
    NoMatch,
}

impl fmt::Display for AccessSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessSource::SiteAdmin => write!(f, "site admin"),
            AccessSource::Owner => write!(f, "project owner"),
            AccessSource::Grant {
                tier,
                via_group: None,
            } => write!(f, "direct {} grant", tier),
            AccessSource::Grant {
                tier,
                via_group: Some(group),
            } => write!(f, "{} grant via @{}", tier, group),
            AccessSource::ExternalOverride { group } => {
                write!(f, "external committer group @{}", group)
            }
            AccessSource::BranchPattern { pattern: None, .. } => {
                write!(f, "collaborator grant (read intent)")
            }
            AccessSource::BranchPattern {
                pattern: Some(pattern),
                via_group,
            } => match via_group {
                Some(group) => write!(f, "collaborator pattern '{}' via @{}", pattern, group),
                None => write!(f, "collaborator pattern '{}'", pattern),
            },
            AccessSource::NoMatch => write!(f, "no matching rule"),
        }
    }
}
