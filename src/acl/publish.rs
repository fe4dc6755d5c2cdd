//! ACL publishers
//!
//! A publisher hands a compiled [`AccessArtifact`] to the external
//! git-access backend. The backend's wire format is its own concern; the
//! publishers here cover a JSON document per project, a gitolite-style rule
//! file per project, and an in-memory sink for tests and dry runs.

use crate::acl::compiler::AccessArtifact;
use crate::config::{AclBackend, AclConfig};
use crate::error::PublishError;
// async_trait required for dyn-compatibility with Arc<dyn AclPublisher>
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Backend sink for compiled artifacts
#[async_trait]
pub trait AclPublisher: Send + Sync {
    /// Publish one project's artifact, replacing whatever was there
    async fn publish(&self, artifact: &AccessArtifact) -> Result<(), PublishError>;

    /// Backend name (for logging)
    fn backend_name(&self) -> &'static str;
}

/// On-disk artifact format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Gitolite,
}

impl FileFormat {
    fn extension(&self) -> &'static str {
        match self {
            FileFormat::Json => "json",
            FileFormat::Gitolite => "conf",
        }
    }
}

/// Writes one file per project under a directory
///
/// Files are written to a temporary name and renamed into place, so the
/// backend never reads a half-written artifact.
#[derive(Debug, Clone)]
pub struct FilePublisher {
    dir: PathBuf,
    format: FileFormat,
}

impl FilePublisher {
    pub fn new(dir: impl Into<PathBuf>, format: FileFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    /// Path the artifact of `project` is written to
    pub fn path_for(&self, project: &str) -> PathBuf {
        let stem = project.replace('/', "__");
        self.dir.join(format!("{}.{}", stem, self.format.extension()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn render(&self, artifact: &AccessArtifact) -> Result<String, PublishError> {
        Ok(match self.format {
            FileFormat::Json => artifact.to_json()?,
            FileFormat::Gitolite => artifact.render_gitolite(),
        })
    }
}

#[async_trait]
impl AclPublisher for FilePublisher {
    async fn publish(&self, artifact: &AccessArtifact) -> Result<(), PublishError> {
        let content = self.render(artifact)?;
        let target = self.path_for(&artifact.project);
        let staging = target.with_extension("tmp");

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&staging, content.as_bytes()).await?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            warn!(path = %staging.display(), error = %e, "Failed to move artifact into place");
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        debug!(project = %artifact.project, path = %target.display(), "Artifact written");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        match self.format {
            FileFormat::Json => "json",
            FileFormat::Gitolite => "gitolite",
        }
    }
}

/// Keeps the latest artifact of every project in memory
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    published: Mutex<BTreeMap<String, AccessArtifact>>,
    count: Mutex<usize>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest artifact published for `project`
    pub fn get(&self, project: &str) -> Option<AccessArtifact> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(project)
            .cloned()
    }

    /// Number of successful publishes so far
    pub fn publish_count(&self) -> usize {
        *self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AclPublisher for MemoryPublisher {
    async fn publish(&self, artifact: &AccessArtifact) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| {
                warn!("publisher lock poisoned, recovering");
                poisoned.into_inner()
            })
            .insert(artifact.project.clone(), artifact.clone());
        *self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Build the publisher selected in configuration
pub fn create_publisher(config: &AclConfig) -> Arc<dyn AclPublisher> {
    let dir = shellexpand::tilde(&config.output_dir.to_string_lossy()).into_owned();
    match config.backend {
        AclBackend::Json => Arc::new(FilePublisher::new(dir, FileFormat::Json)),
        AclBackend::Gitolite => Arc::new(FilePublisher::new(dir, FileFormat::Gitolite)),
        AclBackend::Memory => Arc::new(MemoryPublisher::new()),
    }
}
