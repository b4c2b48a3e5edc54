//! Claude-optimized agent sessions.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use faize::artifacts::ArtifactManager;
use faize::config::{parse_duration, Config};
use faize::mount::MountValidator;
use faize::network::Policy;
use faize::session::SessionStore;
use faize::vm::VmConfig;

use crate::cli::{GlobalFlags, SessionFlags};
use crate::commands::common::{
    log_policy, parse_and_validate_mounts, resolve_project_dir, run_session,
};

#[derive(Subcommand, Debug)]
pub enum ClaudeCommand {
    /// Start a new agent session and attach to it
    Start(StartArgs),
    /// Reattach to a running agent session
    Attach(AttachArgs),
    /// Rebuild the agent rootfs (picks up extra_deps changes)
    Rebuild,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    #[command(flatten)]
    pub session: SessionFlags,

    /// Persist agent credentials across sessions
    #[arg(long)]
    pub persist_credentials: bool,

    /// Disable automatic .git mounting from the enclosing repo root
    #[arg(long)]
    pub no_git_context: bool,
}

#[derive(Args, Debug)]
pub struct AttachArgs {
    /// Session ID
    pub id: String,
}

pub async fn execute(cmd: ClaudeCommand, global: &GlobalFlags) -> Result<()> {
    match cmd {
        ClaudeCommand::Start(args) => start(args, global).await,
        ClaudeCommand::Attach(args) => attach(args).await,
        ClaudeCommand::Rebuild => rebuild().await,
    }
}

async fn start(args: StartArgs, global: &GlobalFlags) -> Result<()> {
    let cfg = Config::load().context("failed to load config")?;

    let home = dirs::home_dir().ok_or_else(|| anyhow!("failed to get home directory"))?;
    let claude_dir = home.join(".claude");
    if !claude_dir.exists() {
        return Err(anyhow!(
            "~/.claude directory not found - please ensure Claude Code is installed"
        ));
    }

    let artifacts = ArtifactManager::new()?;
    let toolchain_dir = artifacts.toolchain_dir();
    std::fs::create_dir_all(&toolchain_dir).context("failed to create toolchain directory")?;

    let persist = cfg.claude.should_persist_credentials() || args.persist_credentials;
    let credentials_dir = if persist {
        Some(artifacts.credentials_dir())
    } else {
        None
    };

    let project_dir = resolve_project_dir(args.session.project.as_deref())?;

    let cpus = args.session.cpus.unwrap_or(cfg.defaults.cpus);
    let memory = args
        .session
        .memory
        .clone()
        .unwrap_or_else(|| cfg.defaults.memory.clone());
    let timeout_spec = args
        .session
        .timeout
        .clone()
        .unwrap_or_else(|| cfg.defaults.timeout.clone());
    let timeout = parse_duration(&timeout_spec)
        .with_context(|| format!("invalid timeout format '{timeout_spec}'"))?;

    let networks = if cfg.networks.is_empty() {
        vec!["anthropic".into(), "npm".into(), "github".into(), "bun".into()]
    } else {
        cfg.networks.clone()
    };
    let policy = Policy::parse(&networks);
    log_policy(&policy);

    let validator = MountValidator::new(&cfg.blocked_paths)?;

    let mut specs = vec![
        format!("{}:rw", project_dir.display()),
        format!("{}:/mnt/host-claude:ro", claude_dir.display()),
        format!("{}:/opt/toolchain:rw", toolchain_dir.display()),
    ];
    specs.extend(cfg.claude.auto_mounts.iter().cloned());
    specs.extend(args.session.mounts.iter().cloned());

    // Monorepo support: mount the enclosing repo's .git read-only when the
    // project sits below the repository root.
    if !args.no_git_context && cfg.claude.should_mount_git_context() {
        if let Some(git_root) = faize::git::find_root(&project_dir) {
            if git_root != project_dir {
                let git_dir = git_root.join(".git");
                if git_dir.is_dir() {
                    tracing::debug!(root = %git_root.display(), "git root detected, mounting .git read-only");
                    specs.push(format!("{}:{}:ro", git_dir.display(), git_dir.display()));
                }
            }
        }
    }

    let mounts = parse_and_validate_mounts(&specs, &validator, Some(&claude_dir))?;

    let vm_config = VmConfig {
        project_dir,
        mounts,
        network: networks,
        policy,
        cpus,
        memory,
        timeout: Some(timeout),
        timeout_spec: Some(timeout_spec),
        claude_mode: true,
        host_claude_dir: Some(claude_dir),
        toolchain_dir: Some(toolchain_dir),
        credentials_dir,
        extra_deps: cfg.claude.extra_deps.clone(),
        debug: global.debug,
    };

    let manager = faize::new_manager()?;
    let store = SessionStore::new()?;
    run_session(manager.as_ref(), &store, vm_config).await
}

async fn attach(args: AttachArgs) -> Result<()> {
    let manager = faize::new_manager()?;

    println!("Attaching to session {}... (~. to detach)", args.id);
    let guard = crate::terminal::RawModeGuard::new();
    if let Err(e) = &guard {
        eprintln!("Warning: failed to enable raw mode: {e}");
    }

    let result = manager.attach(&args.id).await;
    drop(guard);

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_user_detach() => {
            println!("\nDetached. Session {} keeps running.", args.id);
            Ok(())
        }
        Err(e) => Err(anyhow!(e).context("console error")),
    }
}

async fn rebuild() -> Result<()> {
    let cfg = Config::load().context("failed to load config")?;
    let artifacts = ArtifactManager::new()?;

    println!("Rebuilding agent rootfs...");
    artifacts
        .build_claude_rootfs(&cfg.claude.extra_deps)
        .await?;
    println!("Agent rootfs rebuilt.");
    Ok(())
}
