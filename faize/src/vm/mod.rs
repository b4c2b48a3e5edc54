//! Session lifecycle management.
//!
//! [`SessionManager`] is the capability surface the CLI drives. The one
//! concrete implementation binds to Apple's Virtualization.framework
//! (`vz`, macOS only); every other platform gets [`StubManager`], which
//! validates configuration but refuses VM operations with the
//! unsupported-platform error.

mod prepare;
mod stub;
mod validate;
#[cfg(target_os = "macos")]
mod vz;

pub use prepare::{prepare_session, PreparedSession};
pub use stub::StubManager;
pub use validate::{validate_kernel_image, validate_rootfs_ext4};
#[cfg(target_os = "macos")]
pub use vz::VzSessionManager;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::FaizeResult;
use crate::network::Policy;
use crate::session::{ExitReason, Session, VmMount};

/// Everything needed to create one session.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Guest-visible project directory (mounted at its host path).
    pub project_dir: PathBuf,
    /// Caller-supplied mounts; the bootstrap mount is prepended later.
    pub mounts: Vec<VmMount>,
    /// Raw network specs, recorded on the session.
    pub network: Vec<String>,
    pub policy: Policy,
    pub cpus: u32,
    /// Human-readable memory size, e.g. `"4GB"`.
    pub memory: String,
    pub timeout: Option<Duration>,
    /// The raw timeout spec (e.g. `"2h"`), recorded on the session.
    pub timeout_spec: Option<String>,
    pub claude_mode: bool,
    /// Host `~/.claude`, shared read-only in agent mode.
    pub host_claude_dir: Option<PathBuf>,
    /// Host toolchain dir, shared read-write in agent mode.
    pub toolchain_dir: Option<PathBuf>,
    /// Credentials dir; presence enables credential persistence.
    pub credentials_dir: Option<PathBuf>,
    pub extra_deps: Vec<String>,
    pub debug: bool,
}

/// VM session operations.
///
/// One implementation per platform: the Virtualization.framework manager
/// on macOS, the stub elsewhere.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Allocate session resources, build the VM, start the console broker,
    /// and persist the session record in `created` state.
    async fn create(&self, cfg: &VmConfig) -> FaizeResult<Session>;

    /// Validate artifacts and boot the VM; the session becomes `running`.
    async fn start(&self, session: &mut Session) -> FaizeResult<()>;

    /// Stop the VM (gracefully, then by force), tear down the broker, and
    /// persist the final record with the given exit reason.
    async fn stop(&self, id: &str, reason: ExitReason) -> FaizeResult<()>;

    async fn list(&self) -> FaizeResult<Vec<Session>>;

    /// Attach the calling terminal to the session console. Returns
    /// `UserDetach` when the operator leaves with `~.`.
    async fn attach(&self, id: &str) -> FaizeResult<()>;

    /// Resolve when the VM reaches a terminal state.
    async fn wait_for_stop(&self, id: &str) -> FaizeResult<()>;
}

/// Build the platform's session manager: Virtualization.framework on
/// macOS, the stub elsewhere.
pub fn new_manager() -> FaizeResult<Arc<dyn SessionManager>> {
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(VzSessionManager::new()?))
    }
    #[cfg(not(target_os = "macos"))]
    {
        Ok(Arc::new(StubManager::new()?))
    }
}

/// Parse a memory string like `4GB` into bytes. Unknown forms fall back
/// to 4 GiB.
pub fn parse_memory(memory: &str) -> u64 {
    const DEFAULT: u64 = 4 * 1024 * 1024 * 1024;

    let trimmed = memory.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let Ok(size) = trimmed[..digits_end].parse::<u64>() else {
        return DEFAULT;
    };

    match trimmed[digits_end..].trim().to_ascii_uppercase().as_str() {
        "GB" | "G" => size * 1024 * 1024 * 1024,
        "MB" | "M" => size * 1024 * 1024,
        _ => DEFAULT,
    }
}
