//! Configuration types for forge-acl
//!
//! This module defines the configuration structure that can be loaded from
//! TOML files and/or environment variables.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Instance administrators
    pub site_admins: SiteAdminConfig,

    /// Groups whose members get commit access across projects
    pub external_committers: HashMap<String, ExternalCommitterConfig>,

    /// Project fullname glob -> groups a grantee must belong to
    pub required_groups: HashMap<String, Vec<String>>,

    /// ACL compilation and publishing
    pub acl: AclConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Instance administrators, by user name and by group
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SiteAdminConfig {
    pub users: Vec<String>,
    pub groups: Vec<String>,
}

/// One external committer group
///
/// An empty `restrict` list means every project; `exclude` always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExternalCommitterConfig {
    /// Only these project fullnames (empty = all)
    pub restrict: Vec<String>,

    /// Never these project fullnames
    pub exclude: Vec<String>,
}

/// ACL compiler settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    /// Where compiled artifacts are published
    pub backend: AclBackend,

    /// Output directory for file backends
    pub output_dir: PathBuf,

    /// Timeout for a single publish attempt
    pub publish_timeout_secs: u64,

    /// Maximum retries for failed publishes
    pub max_retries: u32,

    /// Require pull requests for pushes to non-fork main repositories
    pub pr_only: bool,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            backend: AclBackend::Json,
            output_dir: PathBuf::from("acls"),
            publish_timeout_secs: 30,
            max_retries: 3,
            pr_only: false,
        }
    }
}

/// Artifact publishing backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclBackend {
    /// One JSON document per project
    #[default]
    Json,
    /// One gitolite-style rule file per project
    Gitolite,
    /// Keep artifacts in memory (testing, dry runs)
    Memory,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON structured output
    Json,
}
