//! Shared session assembly and the attach/timeout run loop.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use faize::changeset::{self, MountChanges, SessionChangeset};
use faize::config::{parse_duration, Config};
use faize::mount::{self, MountValidator};
use faize::network::Policy;
use faize::session::{ExitReason, SessionStore, VmMount};
use faize::vm::{SessionManager, VmConfig};
use faize::FaizeError;

use crate::cli::SessionFlags;
use crate::terminal::RawModeGuard;

/// Turn mount specs into validated `VmMount`s, tagged by position.
pub fn parse_and_validate_mounts(
    specs: &[String],
    validator: &MountValidator,
    exempt: Option<&Path>,
) -> Result<Vec<VmMount>> {
    let mut mounts = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        let m = mount::parse(spec).with_context(|| format!("invalid mount '{spec}'"))?;

        // The agent config dir is explicitly allowed in agent mode.
        if exempt != Some(m.source.as_path()) {
            validator.validate(&m).context("mount validation failed")?;
        }

        mounts.push(VmMount {
            source: m.source,
            target: m.target.to_string_lossy().into_owned(),
            read_only: m.read_only,
            tag: format!("mount{i}"),
        });
    }
    Ok(mounts)
}

/// Resolve the project directory: flag value or the current directory.
pub fn resolve_project_dir(flag: Option<&str>) -> Result<PathBuf> {
    match flag {
        Some(dir) => Ok(mount::parse(dir)?.source),
        None => std::env::current_dir().context("failed to get current directory"),
    }
}

/// Build the session configuration for a plain shell session.
pub fn build_shell_config(
    flags: &SessionFlags,
    networks: &[String],
    cfg: &Config,
    debug: bool,
) -> Result<VmConfig> {
    let project_dir = resolve_project_dir(flags.project.as_deref())?;

    let cpus = flags.cpus.unwrap_or(cfg.defaults.cpus);
    let memory = flags
        .memory
        .clone()
        .unwrap_or_else(|| cfg.defaults.memory.clone());
    let timeout_spec = flags
        .timeout
        .clone()
        .unwrap_or_else(|| cfg.defaults.timeout.clone());
    let timeout = parse_duration(&timeout_spec)
        .with_context(|| format!("invalid timeout format '{timeout_spec}'"))?;

    let validator = MountValidator::new(&cfg.blocked_paths)?;

    let mut specs = vec![format!("{}:rw", project_dir.display())];
    specs.extend(flags.mounts.iter().cloned());
    let mounts = parse_and_validate_mounts(&specs, &validator, None)?;

    let networks = networks.to_vec();
    let policy = Policy::parse(&networks);
    log_policy(&policy);

    Ok(VmConfig {
        project_dir,
        mounts,
        network: networks,
        policy,
        cpus,
        memory,
        timeout: Some(timeout),
        timeout_spec: Some(timeout_spec),
        claude_mode: false,
        host_claude_dir: None,
        toolchain_dir: None,
        credentials_dir: None,
        extra_deps: vec![],
        debug,
    })
}

pub fn log_policy(policy: &Policy) {
    match policy {
        Policy::AllowAll => tracing::debug!("network policy: allow all traffic"),
        Policy::BlockAll => tracing::debug!("network policy: no network access"),
        Policy::Allowlist { domains, wildcards } => {
            tracing::debug!(?domains, ?wildcards, "network policy: allowlist")
        }
    }
}

/// Create, start, attach, and stop one session; collect its changeset.
pub async fn run_session(
    manager: &dyn SessionManager,
    store: &SessionStore,
    cfg: VmConfig,
) -> Result<()> {
    let session = manager.create(&cfg).await?;
    let id = session.id.clone();

    // Pre-session snapshots of the writable mounts; the post-session diff
    // is the host's only view into what the agent touched.
    let snapshots = take_mount_snapshots(store, &id, &cfg.mounts);

    let mut session = session;
    if let Err(e) = manager.start(&mut session).await {
        let _ = manager.stop(&id, ExitReason::Killed).await;
        return Err(e.into());
    }

    let project_name = cfg
        .project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cfg.project_dir.display().to_string());
    let timeout_label = cfg.timeout_spec.as_deref().unwrap_or("none");
    println!(
        "\nSession {id} | {project_name} | {} CPUs, {} | {timeout_label} timeout",
        cfg.cpus, cfg.memory
    );
    println!("Attaching to console... (~. to detach)");

    let reason = attach_until_done(manager, &id, cfg.timeout).await?;

    println!("\nStopping session {id}...");
    if let Err(e) = manager.stop(&id, reason).await {
        tracing::debug!(error = %e, "failed to stop session");
    }

    collect_changeset(store, &id, &cfg.mounts, snapshots);
    Ok(())
}

/// Attach under a raw-mode guard, racing the session timeout. Maps the
/// outcome to the exit reason recorded on the session.
async fn attach_until_done(
    manager: &dyn SessionManager,
    id: &str,
    timeout: Option<std::time::Duration>,
) -> Result<ExitReason> {
    let guard = RawModeGuard::new();
    if let Err(e) = &guard {
        eprintln!("Warning: failed to enable raw mode: {e}");
    }

    let timeout_sleep = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };

    let result = tokio::select! {
        res = manager.attach(id) => match res {
            Ok(()) => Ok(ExitReason::Normal),
            Err(FaizeError::UserDetach) => Ok(ExitReason::Detach),
            Err(e) => Err(anyhow!(e).context("console error")),
        },
        _ = timeout_sleep => {
            Ok(ExitReason::Timeout)
        }
    };

    drop(guard);
    if matches!(result, Ok(ExitReason::Timeout)) {
        println!("\nSession timeout reached.");
    }
    result
}

fn snapshots_dir(store: &SessionStore, id: &str) -> PathBuf {
    store.session_dir(id).join("snapshots")
}

/// Snapshot every writable mount source. Failures degrade to a debug log;
/// change reporting must never block a session.
fn take_mount_snapshots(
    store: &SessionStore,
    id: &str,
    mounts: &[VmMount],
) -> Vec<(usize, changeset::Snapshot)> {
    let dir = snapshots_dir(store, id);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::debug!(error = %e, "failed to create snapshots directory");
        return Vec::new();
    }

    let mut snapshots = Vec::new();
    for (i, mount) in mounts.iter().enumerate() {
        if mount.read_only {
            continue;
        }
        match changeset::take(&mount.source) {
            Ok(snap) => {
                let _ = changeset::save_snapshot(&dir.join(format!("pre-{i}.json")), &snap);
                snapshots.push((i, snap));
            }
            Err(e) => {
                tracing::debug!(source = %mount.source.display(), error = %e, "snapshot failed")
            }
        }
    }
    snapshots
}

/// Diff the writable mounts, merge in the guest's own reports, and save
/// the session changeset.
fn collect_changeset(
    store: &SessionStore,
    id: &str,
    mounts: &[VmMount],
    pre: Vec<(usize, changeset::Snapshot)>,
) {
    let bootstrap = faize::bootstrap::BootstrapDir::open(store.session_dir(id).join("bootstrap"));

    let mut mount_changes = Vec::new();
    let mut total = 0usize;
    for (i, before) in pre {
        let mount = &mounts[i];
        let after = match changeset::take(&mount.source) {
            Ok(after) => after,
            Err(e) => {
                tracing::debug!(source = %mount.source.display(), error = %e, "post-snapshot failed");
                continue;
            }
        };
        let changes =
            changeset::filter_noise(changeset::diff(&before, &after), &before, &after);
        total += changes.len();
        mount_changes.push(MountChanges {
            source: mount.source.clone(),
            target: mount.target.clone(),
            changes,
        });
    }

    let guest_changes = bootstrap.read_guest_changes().unwrap_or_default();
    let network_events =
        changeset::parse_network_log(&bootstrap.network_log_path()).unwrap_or_default();

    let cs = SessionChangeset {
        session_id: id.to_string(),
        mount_changes,
        guest_changes,
        network_events,
    };
    let path = store.session_dir(id).join("changeset.json");
    if let Err(e) = changeset::save_changeset(&path, &cs) {
        tracing::debug!(error = %e, "failed to save changeset");
        return;
    }

    if total > 0 {
        println!("{total} file change(s) recorded. See `faize diff {id}`.");
    }
}
