//! Configuration loader with layered sources
//!
//! Loads configuration from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (FORGE_ACL_*)
//! 2. Configuration file (TOML)
//! 3. Default values

use crate::acl::is_valid_name;
use crate::config::types::AppConfig;
use crate::error::ConfigError;
use config::{Config, Environment, File, FileFormat};
use std::path::Path;

/// Default configuration file paths to check (in order)
const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "forge-acl.toml",
    ".forge-acl.toml",
    "~/.config/forge-acl/config.toml",
    "/etc/forge-acl/config.toml",
];

/// Load configuration from a TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::from_str(toml_str, FileFormat::Toml))
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let app_config: AppConfig = config
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    validate_config(&app_config)?;

    Ok(app_config)
}

/// Load configuration from files and environment
pub fn load_config(config_path: Option<&str>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    // 1. Start with defaults (handled by serde defaults on AppConfig)

    // 2. Add configuration file
    if let Some(path) = config_path {
        let expanded = shellexpand::tilde(path);
        if !Path::new(expanded.as_ref()).exists() {
            return Err(ConfigError::Load(format!(
                "Configuration file not found: {}",
                path
            )));
        }
        builder = builder.add_source(File::new(&expanded, FileFormat::Toml));
    } else {
        // Try default paths (first existing one wins)
        for path in DEFAULT_CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                builder = builder.add_source(File::new(&expanded, FileFormat::Toml));
                break;
            }
        }
    }

    // 3. Environment variables, e.g. FORGE_ACL__ACL__BACKEND
    // Double underscore (__) maps to nested keys (acl.backend)
    builder = builder.add_source(
        Environment::with_prefix("FORGE_ACL")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let app_config: AppConfig = config
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    validate_config(&app_config)?;

    Ok(app_config)
}

/// Validate configuration values
/// Upper bound on `acl.max_retries`; the backoff doubles per retry
const MAX_PUBLISH_RETRIES: u32 = 10;

pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.acl.publish_timeout_secs == 0 {
        return Err(ConfigError::Invalid {
            message: "acl.publish_timeout_secs must be greater than 0".to_string(),
        });
    }

    if config.acl.max_retries > MAX_PUBLISH_RETRIES {
        return Err(ConfigError::Invalid {
            message: format!("acl.max_retries must be at most {}", MAX_PUBLISH_RETRIES),
        });
    }

    validate_names(&config.site_admins.users, "site_admins.users")?;
    validate_names(&config.site_admins.groups, "site_admins.groups")?;

    for (group, rule) in &config.external_committers {
        if !is_valid_name(group) {
            return Err(ConfigError::Invalid {
                message: format!("external_committers: invalid group name '{}'", group),
            });
        }
        if let Some(project) = rule.restrict.iter().find(|p| rule.exclude.contains(p)) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "external_committers.{}: '{}' is in both restrict and exclude",
                    group, project
                ),
            });
        }
    }

    for (pattern, groups) in &config.required_groups {
        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                reason: format!("in required_groups: {}", e),
            });
        }
        if groups.is_empty() {
            return Err(ConfigError::Invalid {
                message: format!("required_groups.\"{}\" lists no groups", pattern),
            });
        }
        validate_names(groups, &format!("required_groups.\"{}\"", pattern))?;
    }

    Ok(())
}

fn validate_names(names: &[String], field_path: &str) -> Result<(), ConfigError> {
    match names.iter().find(|name| !is_valid_name(name)) {
        Some(name) => Err(ConfigError::Invalid {
            message: format!("{}: invalid name '{}'", field_path, name),
        }),
        None => Ok(()),
    }
}
