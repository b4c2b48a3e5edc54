//! Platform-neutral session preparation.
//!
//! Everything `create` does before touching the virtualization framework
//! lives here: ID allocation, the session directory and bootstrap files,
//! the init script, and the full mount composition. The macOS manager
//! builds its device graph from the result; the stub never gets this far.

use std::io::IsTerminal;
use std::path::PathBuf;

use chrono::Utc;

use crate::bootstrap::{BootstrapDir, GUEST_MOUNT_POINT, MOUNT_TAG};
use crate::errors::FaizeResult;
use crate::guest::{render_agent_init, render_shell_init, InitScriptParams};
use crate::session::{Session, SessionStatus, SessionStore, VmMount};
use crate::vm::VmConfig;

/// A session with its on-disk resources allocated, ready for device
/// assembly.
#[derive(Debug)]
pub struct PreparedSession {
    pub session: Session,
    pub session_dir: PathBuf,
    pub bootstrap: BootstrapDir,
    /// Complete mount list: bootstrap first, then caller mounts, then
    /// mode-specific shares.
    pub mounts: Vec<VmMount>,
}

/// Mint an 8-hex-char session ID.
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Allocate the session directory, write the bootstrap files and init
/// script, and compose the final mount list.
pub fn prepare_session(store: &SessionStore, cfg: &VmConfig) -> FaizeResult<PreparedSession> {
    let id = generate_session_id();
    tracing::debug!(id = %id, "preparing session");

    let session_dir = store.session_dir(&id);
    let bootstrap = BootstrapDir::create(&session_dir)?;

    let mounts = compose_mounts(&bootstrap, cfg);
    let project_dir = cfg.project_dir.to_string_lossy();

    let init_script = if cfg.claude_mode {
        render_agent_init(&InitScriptParams {
            mounts: &mounts,
            project_dir: &project_dir,
            policy: &cfg.policy,
            persist_credentials: cfg.credentials_dir.is_some(),
            extra_deps: &cfg.extra_deps,
        })
    } else {
        render_shell_init(&mounts, &project_dir, &cfg.policy)
    };

    bootstrap.write_init_script(&init_script)?;
    bootstrap.write_host_time(Utc::now().timestamp())?;

    if std::io::stdout().is_terminal() {
        if let Some((cols, rows)) = term_size::dimensions() {
            if cols > 0 && rows > 0 {
                bootstrap.write_term_size(cols as u16, rows as u16)?;
            }
        }
    }

    if cfg.debug {
        bootstrap.write_debug_flag()?;
    }

    let session = Session {
        id,
        project_dir: cfg.project_dir.clone(),
        mounts: cfg.mounts.clone(),
        network: cfg.network.clone(),
        cpus: cfg.cpus,
        memory: cfg.memory.clone(),
        status: SessionStatus::Created,
        started_at: Utc::now(),
        claude_mode: cfg.claude_mode,
        timeout: cfg.timeout_spec.clone(),
        stopped_at: None,
        exit_reason: None,
    };

    Ok(PreparedSession {
        session,
        session_dir,
        bootstrap,
        mounts,
    })
}

/// Bootstrap share first, then caller mounts, then agent-mode shares.
fn compose_mounts(bootstrap: &BootstrapDir, cfg: &VmConfig) -> Vec<VmMount> {
    let mut mounts = Vec::with_capacity(cfg.mounts.len() + 4);

    mounts.push(VmMount {
        source: bootstrap.path().to_path_buf(),
        target: GUEST_MOUNT_POINT.into(),
        read_only: false,
        tag: MOUNT_TAG.into(),
    });

    mounts.extend(cfg.mounts.iter().cloned());

    if cfg.claude_mode {
        if let Some(claude_dir) = &cfg.host_claude_dir {
            mounts.push(VmMount {
                source: claude_dir.clone(),
                target: "/mnt/host-claude".into(),
                read_only: true,
                tag: "host-claude".into(),
            });
        }
        if let Some(toolchain_dir) = &cfg.toolchain_dir {
            mounts.push(VmMount {
                source: toolchain_dir.clone(),
                target: "/opt/toolchain".into(),
                read_only: false,
                tag: "toolchain".into(),
            });
        }
        if let Some(credentials_dir) = &cfg.credentials_dir {
            mounts.push(VmMount {
                source: credentials_dir.clone(),
                target: "/mnt/host-credentials".into(),
                read_only: false,
                tag: "credentials".into(),
            });
        }
    }

    mounts
}
