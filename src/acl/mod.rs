//! Access control module
//!
//! Resolves a principal's tier on a project and compiles every principal's
//! tier into an artifact for the git-access backend.
//!
//! ## Resolution Model
//!
//! Rules are evaluated in order and the first match wins:
//!
//! 1. **Site administrator** - instance-wide user or group list
//! 2. **Project owner**
//! 3. **Direct `admin` grant** - on the user or any of its groups
//! 4. **Direct `commit` grant**
//! 5. **External committer group** - instance configuration, with per-group
//!    `restrict` / `exclude` project lists
//! 6. **Collaborator grant** - branch globs matched against the full ref
//! 7. **Direct `ticket` grant**
//! 8. **No access**
//!
//! ## Example Configuration
//!
//! ```toml
//! [site_admins]
//! groups = ["sysadmin-main"]
//!
//! [external_committers.packagers]
//! restrict = ["rpms/kernel"]
//!
//! [required_groups]
//! "rpms/*" = ["packager"]
//! ```

pub mod compiler;
pub mod external;
pub mod graph;
pub mod patterns;
pub mod policy;
pub mod publish;
pub mod push;
pub mod resolver;
pub mod types;
pub mod watch;

pub use compiler::{AccessArtifact, AclCompiler, AclRecord, CompileHandle, CompileOptions};
pub use external::ExternalOverridePolicy;
pub use graph::{AccessGraph, ProjectInfo};
pub use patterns::BranchPatternMatcher;
pub use policy::{InstancePolicy, PolicyHandle};
pub use publish::{AclPublisher, FileFormat, FilePublisher, MemoryPublisher, create_publisher};
pub use push::{PushDecision, PushRequest, RepoType, check_push};
pub use resolver::{PermissionResolver, Resolution, ResolutionContext};
pub use types::{AccessLevel, AccessSource, Principal, Tier, is_valid_name};
pub use watch::{WatchLevel, WatchLevelResolver, WatchSet, WatchStatus, WatcherRecord};
