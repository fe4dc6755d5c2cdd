//! Forge ACL
//!
//! Project access-tier resolution and ACL/watch-level compilation for a git
//! forge.
//!
//! ## Features
//!
//! - **Ordered permission rules** over an immutable per-project snapshot:
//!   site admins, owner, direct grants, group grants, external committer
//!   groups and branch-scoped collaborator grants
//! - **Watch levels** with implicit defaults, explicit subscriptions and
//!   explicit opt-outs
//! - **ACL compilation** into a stable artifact, published as JSON or
//!   gitolite rules, behind a per-project read-only gate
//! - **Flexible configuration** via TOML files and environment variables
//!
//! ## Resolution Model
//!
//! ```text
//! site admin → owner → admin grant → commit grant → external committer
//!     → collaborator pattern → ticket grant → none
//! ```
//!
//! ## Example Configuration
//!
//! ```toml
//! [site_admins]
//! users = ["root"]
//!
//! [external_committers.packagers]
//! restrict = ["test"]
//!
//! [acl]
//! backend = "gitolite"
//! output_dir = "/srv/gitolite/conf/acls"
//! ```

pub mod acl;
pub mod config;
pub mod error;
pub mod store;

// Re-export main types
pub use acl::{AccessGraph, AclCompiler, InstancePolicy, PolicyHandle, Principal, Tier};
pub use config::{AppConfig, load_config};
pub use error::{AppError, Result};
pub use store::{ForgeSeed, ForgeStore};
