//! Session and mount record types persisted to the session store.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A VirtioFS mount between host and guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMount {
    /// Host path (absolute, symlink-resolved).
    pub source: PathBuf,
    /// Guest path (absolute).
    pub target: String,
    pub read_only: bool,
    /// VirtioFS label the guest mounts by.
    pub tag: String,
}

/// Lifecycle status of a session. Transitions are monotone:
/// `created → running → stopped`, with no resurrection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Created => write!(f, "created"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitReason {
    /// The guest agent exited on its own.
    Normal,
    /// The host-side session timer fired.
    Timeout,
    /// The operator detached with `~.`.
    Detach,
    /// The session was forcibly stopped.
    Killed,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Timeout => write!(f, "timeout"),
            ExitReason::Detach => write!(f, "detach"),
            ExitReason::Killed => write!(f, "killed"),
        }
    }
}

/// One VM session, persisted as a single JSON document keyed by ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque 8-hex-char identifier, unique within a host install.
    pub id: String,
    pub project_dir: PathBuf,
    /// Caller-supplied mounts (the bootstrap mount is not recorded here).
    pub mounts: Vec<VmMount>,
    /// Raw network specs, kept for the record.
    pub network: Vec<String>,
    pub cpus: u32,
    /// Human-readable memory size, e.g. `"4GB"`.
    pub memory: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub claude_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
}

impl Session {
    /// Mark the session stopped with the given reason. Idempotent for an
    /// already-stopped session: the first recorded reason wins.
    pub fn mark_stopped(&mut self, reason: ExitReason) {
        if self.status == SessionStatus::Stopped {
            return;
        }
        self.status = SessionStatus::Stopped;
        self.stopped_at = Some(Utc::now());
        self.exit_reason = Some(reason);
    }
}
