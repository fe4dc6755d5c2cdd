//! forge-acl command line
//!
//! Resolves access, watch levels and push decisions against a forge state
//! file, and compiles/publishes project ACLs.

use clap::{Parser, Subcommand};
use forge_acl::{
    acl::{
        AclCompiler, CompileOptions, InstancePolicy, PolicyHandle, Principal, PushRequest,
        RepoType, ResolutionContext, WatchLevelResolver, check_push, create_publisher,
    },
    config::{LogFormat, LoggingConfig, load_config},
    store::{ForgeSeed, ForgeStore},
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Forge ACL - access-tier resolution and ACL compilation
#[derive(Parser, Debug)]
#[command(name = "forge-acl")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FORGE_ACL_CONFIG")]
    config: Option<String>,

    /// Path to the forge state file (TOML or JSON)
    #[arg(short, long, env = "FORGE_ACL_STATE", default_value = "forge-state.toml")]
    state: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FORGE_ACL_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a principal's tier on a project and the rule that produced it
    Access {
        project: String,
        /// User name, or `@group`
        principal: String,
        /// Treat the principal as a group name
        #[arg(long)]
        group: bool,
        /// Fully qualified ref, e.g. refs/heads/main
        #[arg(long = "ref")]
        refname: Option<String>,
    },
    /// Print a project's watch set, or one user's watch level
    Watchers {
        project: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// Compile and publish a project's ACL, then print the artifact
    Compile { project: String },
    /// Check whether a push is allowed
    CheckPush {
        project: String,
        user: String,
        refname: String,
        #[arg(long)]
        pull_request: bool,
        #[arg(long, default_value = "main")]
        repo_type: RepoType,
        #[arg(long)]
        internal: bool,
    },
    /// Compile and publish every project
    RefreshAll,
}

fn init_logging(level: Option<&str>, logging: Option<&LoggingConfig>) {
    let level = level
        .or(logging.map(|l| l.level.as_str()))
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let json = logging.is_some_and(|l| l.format == LogFormat::Json);
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

fn load_store(path: &str) -> anyhow::Result<Arc<ForgeStore>> {
    let expanded = shellexpand::tilde(path).into_owned();
    let store = ForgeSeed::from_path(&expanded)
        .and_then(ForgeSeed::into_store)
        .inspect_err(|e| error!(error = %e, path, "Failed to load forge state"))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref());
    init_logging(args.log_level.as_deref(), config.as_ref().ok().map(|c| &c.logging));
    let config = config.inspect_err(|e| error!(error = %e, "Failed to load configuration"))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting forge-acl");

    let policy = Arc::new(PolicyHandle::new(
        InstancePolicy::from_config(&config)
            .inspect_err(|e| error!(error = %e, "Invalid instance policy"))?,
    ));
    let store = load_store(&args.state)?;

    match args.command {
        Command::Access {
            project,
            principal,
            group,
            refname,
        } => {
            let principal = if group {
                Principal::group(principal.trim_start_matches('@'))
            } else {
                Principal::parse(&principal)
            };
            let graph = store.access_graph(&project)?;
            let current = policy.current();
            let ctx = ResolutionContext::new(&graph, &current);
            let resolution = ctx.resolve(&principal, refname.as_deref())?;

            let level = resolution
                .level()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "none".to_string());
            println!(
                "{} on {}: {} ({}), backend level: {}",
                principal, project, resolution.tier, resolution.source, level
            );
        }
        Command::Watchers { project, user } => match user {
            Some(user) => {
                let graph = store.access_graph(&project)?;
                let records = store.watcher_records(&project)?;
                let level = WatchLevelResolver::resolve(&graph, &records, &user)?;
                println!("{} on {}: {}", user, project, level);
            }
            None => {
                let set = store.watch_set(&project)?;
                for (principal, level) in &set.entries {
                    println!("{}: {}", principal, level);
                }
            }
        },
        Command::Compile { project } => {
            let compiler = build_compiler(&config, store, policy);
            let artifact = compiler
                .regenerate(&project)
                .await
                .inspect_err(|e| error!(error = %e, project = %project, "Compile failed"))?;
            println!("{}", artifact.to_json()?);
        }
        Command::CheckPush {
            project,
            user,
            refname,
            pull_request,
            repo_type,
            internal,
        } => {
            let graph = store.access_graph(&project)?;
            let current = policy.current();
            let ctx = ResolutionContext::new(&graph, &current).with_actor(Principal::user(&user));
            let request = PushRequest {
                user: Some(user),
                refname,
                repo_type,
                pull_request,
                internal,
            };
            let decision = check_push(&ctx, &request)?;
            for message in &decision.messages {
                println!("{}", message);
            }
            if !decision.allowed {
                anyhow::bail!("push refused");
            }
        }
        Command::RefreshAll => {
            let compiler = build_compiler(&config, store, policy);
            let outcomes = compiler.regenerate_all().await;
            let failed = outcomes.iter().filter(|(_, r)| r.is_err()).count();
            for (project, outcome) in &outcomes {
                match outcome {
                    Ok(artifact) => println!("{}: {} records", project, artifact.records.len()),
                    Err(e) => println!("{}: {}", project, e),
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} projects failed to compile", failed, outcomes.len());
            }
        }
    }

    Ok(())
}

fn build_compiler(
    config: &forge_acl::AppConfig,
    store: Arc<ForgeStore>,
    policy: Arc<PolicyHandle>,
) -> Arc<AclCompiler> {
    let publisher = create_publisher(&config.acl);
    info!(backend = publisher.backend_name(), "Using ACL publisher");
    Arc::new(AclCompiler::new(
        store,
        policy,
        publisher,
        CompileOptions::from(&config.acl),
    ))
}
