//! Error types for forge-acl
//!
//! This module defines the error hierarchy used throughout the crate.
//! Resolvers never fail for "no access" (that is a normal `Tier::None`
//! result); errors here are reserved for malformed inputs, rejected
//! mutations and compiler/publisher failures.

use thiserror::Error;

/// Top-level application error
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Grant error: {0}")]
    Grant(#[from] GrantError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Compilation error: {0}")]
    Compile(#[from] CompileError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Invalid glob pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the permission and watch resolvers
///
/// Only malformed inputs end up here: a principal handed to the resolver
/// that the snapshot does not know about.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Unknown {kind} '{name}'")]
    UnknownPrincipal { kind: &'static str, name: String },
}

impl ResolveError {
    pub fn unknown_user(name: impl Into<String>) -> Self {
        Self::UnknownPrincipal {
            kind: "user",
            name: name.into(),
        }
    }

    pub fn unknown_group(name: impl Into<String>) -> Self {
        Self::UnknownPrincipal {
            kind: "group",
            name: name.into(),
        }
    }
}

/// Errors raised by grant-mutating and project-deleting operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GrantError {
    #[error("Unknown {kind} '{name}'")]
    UnknownPrincipal { kind: &'static str, name: String },

    #[error("Unknown project '{project}'")]
    UnknownProject { project: String },

    #[error("Invalid grant: {reason}")]
    InvalidGrant { reason: String },

    #[error("Project '{project}' is read-only: {reason}")]
    ConflictingMutation { project: String, reason: String },

    #[error("'{principal}' already has {tier} access on '{project}'")]
    AlreadyGranted {
        project: String,
        principal: String,
        tier: String,
    },

    #[error("'{principal}' does not have any access on '{project}'")]
    NoSuchGrant { project: String, principal: String },

    #[error("'{user}' must be in one of the following groups to be added to '{project}': {groups}")]
    RequiredGroup {
        project: String,
        user: String,
        groups: String,
    },

    #[error("'{actor}' is not allowed to add a group to '{project}'")]
    NotAllowed { project: String, actor: String },
}

impl GrantError {
    /// The mutation was rejected because an ACL regeneration is in progress
    pub fn acl_regeneration(project: impl Into<String>) -> Self {
        Self::ConflictingMutation {
            project: project.into(),
            reason: "ACL regeneration in progress, try again shortly".into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidGrant {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, GrantError::ConflictingMutation { .. })
    }
}

impl From<ResolveError> for GrantError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::UnknownPrincipal { kind, name } => {
                GrantError::UnknownPrincipal { kind, name }
            }
        }
    }
}

/// Errors raised by the watch-status update interface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("The watch value of \"{value}\" is invalid")]
    InvalidStatus { value: String },

    #[error("Unknown user '{0}'")]
    UnknownUser(String),

    #[error("Unknown project '{0}'")]
    UnknownProject(String),
}

/// Errors raised while handing an artifact to the external ACL backend
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publish timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    #[error("Backend rejected the artifact: {0}")]
    Rejected(String),
}

impl PublishError {
    /// Whether the compiler should retry this publish
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Io(_) | PublishError::Timeout { .. })
    }
}

/// Errors raised by the ACL compiler
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("ACL compilation failed for '{project}': {reason}")]
    CompilationFailure { project: String, reason: String },

    #[error("Compilation of '{project}' was superseded by a newer request")]
    Superseded { project: String },

    #[error("Unknown project '{0}'")]
    UnknownProject(String),

    #[error("Compile task aborted: {0}")]
    Aborted(String),
}

impl CompileError {
    pub fn failure(project: impl Into<String>, reason: impl ToString) -> Self {
        Self::CompilationFailure {
            project: project.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised while loading a forge state file
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read state file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse state file: {0}")]
    Parse(String),

    #[error("Invalid state: {0}")]
    Grant(#[from] GrantError),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AppError>;

/// Result type alias for grant mutations
pub type GrantResult<T> = std::result::Result<T, GrantError>;

/// Result type alias for compiler operations
pub type CompileResult<T> = std::result::Result<T, CompileError>;
