//! Virtualization.framework session manager (macOS only).
//!
//! Owns the ID-keyed runtime map (machine handle, console broker, detach
//! handle, relay cancellation) next to the persistent session store. The
//! map is guarded by one reader-writer lock; no per-session lock exists
//! because the broker serializes its own reader state and client slot.

mod machine;

pub use machine::{MachineSpec, MachineState, VzMachine};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactManager;
use crate::console::{create_console, ConsoleBroker, ConsoleClient, ConsoleHandle};
use crate::errors::{FaizeError, FaizeResult};
use crate::relay::spawn_open_url_watcher;
use crate::session::{ExitReason, Session, SessionStatus, SessionStore};
use crate::vm::{
    parse_memory, prepare_session, validate_kernel_image, validate_rootfs_ext4, SessionManager,
    VmConfig,
};

/// Tolerated on stop: the framework races our stop against the guest's own
/// poweroff and reports this when it loses.
const INVALID_TRANSITION: &str = "Invalid virtual machine state transition";

struct SessionRuntime {
    machine: Arc<VzMachine>,
    broker: Arc<ConsoleBroker>,
    console: ConsoleHandle,
    relay_done: CancellationToken,
}

pub struct VzSessionManager {
    sessions: SessionStore,
    artifacts: ArtifactManager,
    runtimes: RwLock<HashMap<String, SessionRuntime>>,
}

impl VzSessionManager {
    pub fn new() -> FaizeResult<Self> {
        Ok(Self {
            sessions: SessionStore::new()?,
            artifacts: ArtifactManager::new()?,
            runtimes: RwLock::new(HashMap::new()),
        })
    }

    fn rootfs_path_for(&self, claude_mode: bool) -> PathBuf {
        if claude_mode {
            self.artifacts.claude_rootfs_path()
        } else {
            self.artifacts.rootfs_path()
        }
    }

    fn runtime_parts(
        &self,
        id: &str,
    ) -> Option<(Arc<VzMachine>, Arc<ConsoleBroker>, ConsoleHandle)> {
        let runtimes = self.runtimes.read().expect("runtime map lock");
        runtimes
            .get(id)
            .map(|rt| (rt.machine.clone(), rt.broker.clone(), rt.console.clone()))
    }
}

#[async_trait]
impl SessionManager for VzSessionManager {
    async fn create(&self, cfg: &VmConfig) -> FaizeResult<Session> {
        // Artifacts first; everything else depends on them.
        if cfg.claude_mode {
            self.artifacts.ensure_claude_rootfs().await?;
            self.artifacts.ensure_toolchain_dir()?;
            if cfg.credentials_dir.is_some() {
                self.artifacts.ensure_credentials_dir()?;
            }
        } else {
            self.artifacts.ensure_artifacts().await?;
        }

        let prepared = prepare_session(&self.sessions, cfg)?;
        let session = prepared.session;
        let id = session.id.clone();

        let mut command_line = String::from("console=hvc0 root=/dev/vda ro rootwait init=/init");
        if !cfg.debug {
            command_line.push_str(" quiet loglevel=0");
        }

        let (pipes, guest_console, console) = create_console()?;

        let machine = VzMachine::build(MachineSpec {
            kernel_path: self.artifacts.kernel_path(),
            command_line,
            cpus: cfg.cpus,
            memory_bytes: parse_memory(&cfg.memory),
            rootfs_path: self.rootfs_path_for(cfg.claude_mode),
            console: guest_console,
            mounts: prepared.mounts,
        })
        .map_err(|e| FaizeError::Vm(format!("failed to create virtual machine: {e}")))?;
        let machine = Arc::new(machine);

        // Auto-detach the console on any terminal state so a blocked
        // attach unwinds when the guest powers off or the VM errors.
        let mut state_rx = machine.state_stream();
        let watch_console = console.clone();
        let watch_id = id.clone();
        tokio::spawn(async move {
            loop {
                let state = *state_rx.borrow_and_update();
                tracing::debug!(id = %watch_id, ?state, "VM state");
                if state.is_terminal() {
                    if state == MachineState::Error {
                        capture_vz_logs().await;
                    }
                    watch_console.detach();
                    return;
                }
                if state_rx.changed().await.is_err() {
                    watch_console.detach();
                    return;
                }
            }
        });

        let broker = ConsoleBroker::start(&self.sessions.socket_path(&id), pipes, console.clone())?;
        tracing::debug!(id = %id, socket = %broker.socket_path().display(), "console broker started");

        let relay_done = CancellationToken::new();
        spawn_open_url_watcher(relay_done.clone(), prepared.bootstrap.clone());

        self.sessions.save(&session)?;

        let mut runtimes = self.runtimes.write().expect("runtime map lock");
        runtimes.insert(
            id,
            SessionRuntime {
                machine,
                broker: Arc::new(broker),
                console,
                relay_done,
            },
        );

        Ok(session)
    }

    async fn start(&self, session: &mut Session) -> FaizeResult<()> {
        let Some((machine, _, _)) = self.runtime_parts(&session.id) else {
            return Err(FaizeError::SessionNotFound(session.id.clone()));
        };

        validate_kernel_image(&self.artifacts.kernel_path())
            .map_err(|e| FaizeError::Artifact(format!("kernel validation failed: {e}")))?;
        validate_rootfs_ext4(&self.rootfs_path_for(session.claude_mode))
            .map_err(|e| FaizeError::Artifact(format!("rootfs validation failed: {e}")))?;

        if let Err(e) = machine.start().await {
            capture_vz_logs().await;
            return Err(e);
        }
        tracing::debug!(id = %session.id, "VM started");

        session.status = SessionStatus::Running;
        self.sessions.save(session)?;
        Ok(())
    }

    async fn stop(&self, id: &str, reason: ExitReason) -> FaizeResult<()> {
        let runtime = {
            let mut runtimes = self.runtimes.write().expect("runtime map lock");
            runtimes.remove(id)
        };

        let Some(runtime) = runtime else {
            // Not ours (or already stopped); just settle the record.
            let mut session = self.sessions.load(id)?;
            session.mark_stopped(reason);
            return self.sessions.save(&session);
        };

        runtime.relay_done.cancel();
        runtime.broker.stop().await;
        runtime.console.detach();

        if !runtime.machine.state().is_terminal() {
            if let Err(e) = runtime.machine.request_stop().await {
                tracing::debug!(id, error = %e, "graceful stop failed, forcing");
                if let Err(e) = runtime.machine.force_stop().await {
                    if !e.to_string().contains(INVALID_TRANSITION) {
                        return Err(FaizeError::Vm(format!("failed to stop VM: {e}")));
                    }
                }
            }
        }

        if let Ok(mut session) = self.sessions.load(id) {
            session.mark_stopped(reason);
            self.sessions.save(&session)?;
        }

        Ok(())
    }

    async fn list(&self) -> FaizeResult<Vec<Session>> {
        self.sessions.list()
    }

    async fn attach(&self, id: &str) -> FaizeResult<()> {
        let socket_path = self.sessions.socket_path(id);

        // A fresh create may still be binding the socket.
        for _ in 0..10 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !socket_path.exists() {
            return Err(FaizeError::Console(format!(
                "console not found for session: {id} (VM may have stopped)"
            )));
        }

        let mut client = match ConsoleClient::connect(&socket_path).await {
            Ok(client) => client,
            Err(_) => {
                // Stale socket from a crashed process; clean it up.
                let _ = std::fs::remove_file(&socket_path);
                if let Ok(mut session) = self.sessions.load(id) {
                    session.mark_stopped(ExitReason::Killed);
                    let _ = self.sessions.save(&session);
                }
                return Err(FaizeError::Session(format!(
                    "session {id} is no longer running (cleaned up stale socket)"
                )));
            }
        };

        let bootstrap_dir = self.sessions.session_dir(id).join("bootstrap");
        let termsize_path = bootstrap_dir.join(crate::bootstrap::filenames::TERM_SIZE);

        // Reattach may come from a different-sized terminal.
        if std::io::IsTerminal::is_terminal(&std::io::stdout()) {
            if let Some((cols, rows)) = term_size::dimensions() {
                if cols > 0 && rows > 0 {
                    let _ =
                        crate::bootstrap::write_term_size_at(&termsize_path, cols as u16, rows as u16);
                }
            }
        }

        client.set_termsize_path(termsize_path);
        client.set_clipboard_dir(bootstrap_dir.join(crate::bootstrap::filenames::CLIPBOARD_DIR));

        client.attach().await
    }

    async fn wait_for_stop(&self, id: &str) -> FaizeResult<()> {
        let Some((machine, _, _)) = self.runtime_parts(id) else {
            return Ok(()); // nothing running, already terminal
        };

        let mut state_rx = machine.state_stream();
        loop {
            if state_rx.borrow_and_update().is_terminal() {
                return Ok(());
            }
            if state_rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Capture recent Virtualization.framework logs for diagnostics.
async fn capture_vz_logs() {
    let output = tokio::process::Command::new("log")
        .args([
            "show",
            "--predicate",
            "subsystem == 'com.apple.Virtualization'",
            "--last",
            "30s",
            "--style",
            "compact",
        ])
        .output()
        .await;

    match output {
        Ok(output) if !output.stdout.is_empty() => {
            tracing::debug!(
                logs = %String::from_utf8_lossy(&output.stdout),
                "Virtualization.framework logs"
            );
        }
        Ok(_) => tracing::debug!("no Virtualization.framework logs in the last 30s"),
        Err(e) => tracing::debug!(error = %e, "failed to capture Virtualization.framework logs"),
    }
}
