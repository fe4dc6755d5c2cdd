//! ACL compiler tests
//!
//! Runs the two-phase compile against a live store: the read-only gate,
//! ticket supersession, publisher failures and the rendered artifacts.

use async_trait::async_trait;
use forge_acl::acl::{
    AccessArtifact, AccessLevel, AclCompiler, AclPublisher, CompileOptions, FileFormat,
    FilePublisher, InstancePolicy, MemoryPublisher, PolicyHandle, Principal, Tier,
};
use forge_acl::error::{CompileError, GrantError, PublishError};
use forge_acl::store::{ForgeStore, NewProject};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// =============================================================================
// Fixtures
// =============================================================================

/// Store with `test` owned by pingou and one grantee per tier, writable
fn store() -> Arc<ForgeStore> {
    let store = ForgeStore::new();
    for user in ["pingou", "baz", "kevin", "foo"] {
        store.add_user(user).unwrap();
    }
    store.add_group("packagers", ["foo"]).unwrap();
    store.create_project(NewProject::new("test", "pingou")).unwrap();

    let policy = InstancePolicy::empty();
    store
        .add_user_to_project(&policy, "test", "baz", "pingou", Tier::Commit, None)
        .unwrap();
    store.set_read_only("test", false).unwrap();
    store
        .add_user_to_project(&policy, "test", "kevin", "pingou", Tier::Collaborator, Some("f*"))
        .unwrap();
    store.set_read_only("test", false).unwrap();
    store
        .add_group_to_project(&policy, "test", "packagers", "pingou", Tier::Ticket, None)
        .unwrap();
    store.set_read_only("test", false).unwrap();
    store.add_deploy_key("test", "ci", true).unwrap();
    store.set_read_only("test", false).unwrap();

    Arc::new(store)
}

fn compiler(store: Arc<ForgeStore>, publisher: Arc<dyn AclPublisher>) -> Arc<AclCompiler> {
    let options = CompileOptions {
        publish_timeout: Duration::from_secs(5),
        max_retries: 2,
    };
    Arc::new(AclCompiler::new(
        store,
        Arc::new(PolicyHandle::new(InstancePolicy::empty())),
        publisher,
        options,
    ))
}

/// Publisher that fails a fixed number of times before delegating
struct FlakyPublisher {
    failures: usize,
    retryable: bool,
    attempts: AtomicUsize,
    inner: MemoryPublisher,
}

impl FlakyPublisher {
    fn new(failures: usize, retryable: bool) -> Self {
        Self {
            failures,
            retryable,
            attempts: AtomicUsize::new(0),
            inner: MemoryPublisher::new(),
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AclPublisher for FlakyPublisher {
    async fn publish(&self, artifact: &AccessArtifact) -> Result<(), PublishError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(if self.retryable {
                PublishError::Io(std::io::Error::other("backend unavailable"))
            } else {
                PublishError::Rejected("invalid rule set".to_string())
            });
        }
        self.inner.publish(artifact).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// Publisher with a bug
struct PanickingPublisher;

#[async_trait]
impl AclPublisher for PanickingPublisher {
    async fn publish(&self, _artifact: &AccessArtifact) -> Result<(), PublishError> {
        panic!("publisher bug");
    }

    fn backend_name(&self) -> &'static str {
        "panicking"
    }
}

// =============================================================================
// Read-only gate
// =============================================================================

mod read_only_gate {
    use super::*;

    #[tokio::test]
    async fn test_successful_compile_clears_read_only() {
        let store = store();
        let publisher = Arc::new(MemoryPublisher::new());
        let compiler = compiler(store.clone(), publisher.clone());

        let handle = compiler.begin_compile("test").unwrap();
        assert_eq!(store.is_read_only("test"), Some(true));

        let artifact = compiler.await_compile(handle).await.unwrap();
        assert_eq!(store.is_read_only("test"), Some(false));
        assert_eq!(publisher.get("test"), Some(artifact.clone()));
        assert_eq!(store.last_artifact("test"), Some(artifact));
        assert!(store.last_compile_failure("test").is_none());
    }

    #[tokio::test]
    async fn test_mutations_rejected_until_compile_finishes() {
        let store = store();
        let compiler = compiler(store.clone(), Arc::new(MemoryPublisher::new()));
        let policy = InstancePolicy::empty();
        let before = store.grant_of("test", &Principal::user("foo"));

        let handle = compiler.begin_compile("test").unwrap();
        let err = store
            .add_user_to_project(&policy, "test", "foo", "pingou", Tier::Commit, None)
            .unwrap_err();
        assert!(matches!(err, GrantError::ConflictingMutation { .. }));
        assert_eq!(store.grant_of("test", &Principal::user("foo")), before);

        compiler.await_compile(handle).await.unwrap();
        store
            .add_user_to_project(&policy, "test", "foo", "pingou", Tier::Commit, None)
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_publish_keeps_read_only() {
        let store = store();
        let publisher = Arc::new(FlakyPublisher::new(usize::MAX, false));
        let compiler = compiler(store.clone(), publisher.clone());

        let err = compiler.regenerate("test").await.unwrap_err();
        assert!(matches!(err, CompileError::CompilationFailure { .. }));
        // Rejections are not retried
        assert_eq!(publisher.attempts(), 1);

        assert_eq!(store.is_read_only("test"), Some(true));
        let failure = store.last_compile_failure("test").unwrap();
        assert!(failure.contains("invalid rule set"), "{}", failure);
        assert!(store.last_artifact("test").is_none());
    }

    #[tokio::test]
    async fn test_transient_publish_failures_are_retried() {
        let store = store();
        let publisher = Arc::new(FlakyPublisher::new(2, true));
        let compiler = compiler(store.clone(), publisher.clone());

        compiler.regenerate("test").await.unwrap();
        assert_eq!(publisher.attempts(), 3);
        assert_eq!(store.is_read_only("test"), Some(false));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let store = store();
        let publisher = Arc::new(FlakyPublisher::new(usize::MAX, true));
        let compiler = compiler(store.clone(), publisher.clone());

        assert!(compiler.regenerate("test").await.is_err());
        assert_eq!(publisher.attempts(), 3);
        assert_eq!(store.is_read_only("test"), Some(true));
    }

    #[tokio::test]
    async fn test_operator_recovery_after_failure() {
        let store = store();
        let failing = compiler(store.clone(), Arc::new(FlakyPublisher::new(usize::MAX, false)));
        assert!(failing.regenerate("test").await.is_err());

        store.set_read_only("test", false).unwrap();
        let summary = store.project("test").unwrap();
        assert!(!summary.read_only);
        assert!(summary.last_compile_failure.is_some());

        let working = compiler(store.clone(), Arc::new(MemoryPublisher::new()));
        working.regenerate("test").await.unwrap();
        assert!(store.last_compile_failure("test").is_none());
    }

    #[tokio::test]
    async fn test_panicking_compile_is_recorded() {
        let store = store();
        let compiler = compiler(store.clone(), Arc::new(PanickingPublisher));

        let err = compiler.regenerate("test").await.unwrap_err();
        assert!(matches!(err, CompileError::Aborted(_)));
        assert_eq!(store.is_read_only("test"), Some(true));
        let failure = store.last_compile_failure("test").unwrap();
        assert!(failure.contains("compile task aborted"), "{}", failure);
    }

    #[tokio::test]
    async fn test_panicking_compile_recorded_without_awaiting() {
        let store = store();
        let failing = compiler(store.clone(), Arc::new(PanickingPublisher));

        let handle = failing.begin_compile("test").unwrap();
        let ticket = handle.ticket();
        drop(handle);

        let recorded = tokio::time::timeout(Duration::from_secs(5), async {
            while store.last_compile_failure("test").is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(recorded.is_ok(), "failure was never recorded");
        assert_eq!(store.is_read_only("test"), Some(true));
        assert!(!store.is_current_compile("test", ticket));

        let working = compiler(store.clone(), Arc::new(MemoryPublisher::new()));
        working.regenerate("test").await.unwrap();
        assert_eq!(store.is_read_only("test"), Some(false));
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let compiler = compiler(store(), Arc::new(MemoryPublisher::new()));
        assert!(matches!(
            compiler.begin_compile("nope"),
            Err(CompileError::UnknownProject(_))
        ));
    }
}

// =============================================================================
// Supersession
// =============================================================================

mod supersession {
    use super::*;

    #[tokio::test]
    async fn test_newer_request_supersedes_older() {
        let store = store();
        let publisher = Arc::new(MemoryPublisher::new());
        let compiler = compiler(store.clone(), publisher.clone());

        let first = compiler.begin_compile("test").unwrap();
        let second = compiler.begin_compile("test").unwrap();
        assert!(second.ticket() > first.ticket());

        let err = compiler.await_compile(first).await.unwrap_err();
        assert!(matches!(err, CompileError::Superseded { .. }));

        compiler.await_compile(second).await.unwrap();
        assert_eq!(store.is_read_only("test"), Some(false));
        assert_eq!(publisher.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_regenerate_all() {
        let store = store();
        store
            .create_project(NewProject::new("other", "kevin").with_namespace("rpms"))
            .unwrap();
        let publisher = Arc::new(MemoryPublisher::new());
        let compiler = compiler(store.clone(), publisher.clone());

        let outcomes = compiler.regenerate_all().await;
        let names: Vec<&str> = outcomes.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(names, vec!["rpms/other", "test"]);
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
        assert!(publisher.get("rpms/other").is_some());
        assert_eq!(store.is_read_only("rpms/other"), Some(false));
    }
}

// =============================================================================
// Artifacts
// =============================================================================

mod artifacts {
    use super::*;

    #[tokio::test]
    async fn test_recompile_is_byte_identical() {
        let store = store();
        let compiler = compiler(store.clone(), Arc::new(MemoryPublisher::new()));

        let first = compiler.regenerate("test").await.unwrap();
        let second = compiler.regenerate("test").await.unwrap();
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[tokio::test]
    async fn test_artifact_records() {
        let store = store();
        let compiler = compiler(store, Arc::new(MemoryPublisher::new()));
        let artifact = compiler.regenerate("test").await.unwrap();

        let summary: Vec<(&str, bool, &str, AccessLevel)> = artifact
            .records
            .iter()
            .map(|r| (r.principal.as_str(), r.is_group, r.ref_pattern.as_str(), r.level))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("baz", false, "*", AccessLevel::Write),
                ("deploykey_test_ci", false, "*", AccessLevel::Write),
                ("kevin", false, "*", AccessLevel::Read),
                ("kevin", false, "refs/heads/f*", AccessLevel::Write),
                ("packagers", true, "*", AccessLevel::Read),
                ("pingou", false, "*", AccessLevel::Admin),
            ]
        );
    }

    #[tokio::test]
    async fn test_render_gitolite() {
        let store = store();
        let compiler = compiler(store, Arc::new(MemoryPublisher::new()));
        let artifact = compiler.regenerate("test").await.unwrap();

        insta::assert_snapshot!(artifact.render_gitolite(), @r"
        @packagers = foo

        repo test
          RW+ = baz
          RW+ = deploykey_test_ci
          R = kevin
          RW+ refs/heads/f.*$ = kevin
          R = @packagers
          RW+ = pingou
        ");
    }

    #[tokio::test]
    async fn test_file_publisher_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let publisher = Arc::new(FilePublisher::new(dir.path(), FileFormat::Json));
        let compiler = compiler(store, publisher.clone());

        let artifact = compiler.regenerate("test").await.unwrap();

        let written = std::fs::read_to_string(publisher.path_for("test")).unwrap();
        let parsed: AccessArtifact = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed, artifact);
    }
}
