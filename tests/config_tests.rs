//! Configuration loading tests

use forge_acl::acl::InstancePolicy;
use forge_acl::config::{AclBackend, LogFormat, load_config, load_config_from_str};
use forge_acl::error::ConfigError;
use std::path::Path;

const MINIMAL_CONFIG: &str = r#"
[site_admins]
users = ["root"]
"#;

const FULL_CONFIG: &str = r#"
[site_admins]
users = ["root"]
groups = ["sysadmin-main"]

[external_committers.packagers]
restrict = ["test", "rpms/kernel"]

[external_committers.provenpackager]
exclude = ["rpms/secret"]

[required_groups]
"rpms/*" = ["packager", "provenpackager"]

[acl]
backend = "gitolite"
output_dir = "/srv/gitolite/conf/acls"
publish_timeout_secs = 10
max_retries = 5
pr_only = true

[logging]
level = "debug"
format = "json"
"#;

#[test]
fn test_minimal_config() {
    let config = load_config_from_str(MINIMAL_CONFIG).unwrap();

    assert_eq!(config.site_admins.users, vec!["root"]);
    assert!(config.site_admins.groups.is_empty());
    assert!(config.external_committers.is_empty());
    assert!(config.required_groups.is_empty());
    assert_eq!(config.acl.backend, AclBackend::Json);
    assert_eq!(config.acl.output_dir, Path::new("acls"));
    assert_eq!(config.acl.publish_timeout_secs, 30);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_full_config() {
    let config = load_config_from_str(FULL_CONFIG).unwrap();

    assert_eq!(config.site_admins.groups, vec!["sysadmin-main"]);
    assert_eq!(
        config.external_committers["packagers"].restrict,
        vec!["test", "rpms/kernel"]
    );
    assert_eq!(
        config.external_committers["provenpackager"].exclude,
        vec!["rpms/secret"]
    );
    assert_eq!(
        config.required_groups["rpms/*"],
        vec!["packager", "provenpackager"]
    );
    assert_eq!(config.acl.backend, AclBackend::Gitolite);
    assert_eq!(config.acl.max_retries, 5);
    assert!(config.acl.pr_only);
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_policy_from_full_config() {
    let config = load_config_from_str(FULL_CONFIG).unwrap();
    let policy = InstancePolicy::from_config(&config).unwrap();

    assert!(policy.site_admins.is_admin_user("root"));
    assert!(policy.site_admins.is_admin_group("sysadmin-main"));
    assert!(policy.external.is_override_group("packagers"));
    assert!(policy.pr_only);
    assert!(
        policy
            .required_groups
            .check("rpms/kernel", ["provenpackager"])
            .is_ok()
    );
    assert_eq!(
        policy.required_groups.check("rpms/kernel", ["qa"]),
        Err(vec!["packager".to_string(), "provenpackager".to_string()])
    );
    assert!(policy.required_groups.check("test", ["qa"]).is_ok());
}

#[test]
fn test_invalid_backend() {
    let toml = r#"
[acl]
backend = "ldap"
"#;
    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::Load(_))
    ));
}

#[test]
fn test_required_groups_without_groups() {
    let toml = r#"
[required_groups]
"rpms/*" = []
"#;
    let err = load_config_from_str(toml).unwrap_err();
    assert!(err.to_string().contains("lists no groups"));
}

#[test]
fn test_max_retries_bounded() {
    let toml = r#"
[acl]
max_retries = 64
"#;
    let err = load_config_from_str(toml).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }));
    assert!(err.to_string().contains("acl.max_retries"));

    let config = load_config_from_str("[acl]\nmax_retries = 10\n").unwrap();
    assert_eq!(config.acl.max_retries, 10);
}

#[test]
fn test_missing_config_file() {
    let result = load_config(Some("/nonexistent/forge-acl.toml"));
    assert!(matches!(result, Err(ConfigError::Load(msg)) if msg.contains("not found")));
}

#[test]
#[serial_test::serial]
fn test_load_config_from_file() {
    use std::fs;
    use tempfile::tempdir;

    let dir = tempdir().unwrap();
    let config_path = dir.path().join("forge-acl.toml");
    fs::write(&config_path, FULL_CONFIG).unwrap();

    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    assert_eq!(config.acl.backend, AclBackend::Gitolite);
    assert_eq!(config.site_admins.users, vec!["root"]);
}

#[test]
#[serial_test::serial]
fn test_env_var_overrides_file() {
    use std::env;
    use std::fs;
    use tempfile::tempdir;

    let dir = tempdir().unwrap();
    let config_path = dir.path().join("forge-acl.toml");
    fs::write(&config_path, FULL_CONFIG).unwrap();

    unsafe {
        env::set_var("FORGE_ACL__ACL__BACKEND", "memory");
        env::set_var("FORGE_ACL__ACL__MAX_RETRIES", "1");
    }

    let config = load_config(Some(config_path.to_str().unwrap()));

    unsafe {
        env::remove_var("FORGE_ACL__ACL__BACKEND");
        env::remove_var("FORGE_ACL__ACL__MAX_RETRIES");
    }

    let config = config.unwrap();
    assert_eq!(config.acl.backend, AclBackend::Memory);
    assert_eq!(config.acl.max_retries, 1);
    // Untouched keys still come from the file
    assert_eq!(config.acl.publish_timeout_secs, 10);
}

#[test]
#[serial_test::serial]
fn test_env_var_invalid_value_rejected() {
    use std::env;
    use std::fs;
    use tempfile::tempdir;

    let dir = tempdir().unwrap();
    let config_path = dir.path().join("forge-acl.toml");
    fs::write(&config_path, MINIMAL_CONFIG).unwrap();

    unsafe {
        env::set_var("FORGE_ACL__ACL__PUBLISH_TIMEOUT_SECS", "0");
    }

    let result = load_config(Some(config_path.to_str().unwrap()));

    unsafe {
        env::remove_var("FORGE_ACL__ACL__PUBLISH_TIMEOUT_SECS");
    }

    assert!(matches!(result, Err(ConfigError::Invalid { .. })));
}
