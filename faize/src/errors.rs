//! Error types for the faize library.
//!
//! Every fallible operation returns [`FaizeResult`]. Variants map to the
//! failure families surfaced to operators: configuration, mounts, network
//! specs, artifacts, sessions, console I/O, and the virtualization framework.
//! [`FaizeError::UserDetach`] is a sentinel, not a failure: it signals that
//! the operator ended an attach with the `~.` escape.

use std::path::PathBuf;

pub type FaizeResult<T> = Result<T, FaizeError>;

#[derive(Debug, thiserror::Error)]
pub enum FaizeError {
    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed mount specification.
    #[error("invalid mount: {0}")]
    Mount(String),

    /// Mount source falls under a protected path.
    #[error("mount blocked: {0}")]
    BlockedMount(String),

    /// Invalid network spec token.
    #[error("invalid network spec: {0}")]
    NetworkSpec(String),

    /// Kernel/rootfs artifact missing or malformed.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// No session record exists for the given ID.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session store or lifecycle failure.
    #[error("session error: {0}")]
    Session(String),

    /// Console broker or client failure.
    #[error("console error: {0}")]
    Console(String),

    /// Virtualization framework failure, wrapped with operation context.
    #[error("{0}")]
    Vm(String),

    /// VM operations require macOS and Virtualization.framework.
    #[error("virtual machine support requires macOS (Virtualization.framework)")]
    Unsupported,

    /// The operator requested detach with `~.`. Not a failure.
    #[error("user requested detach")]
    UserDetach,

    /// A required file is missing.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FaizeError {
    /// True when this error is the intentional-detach sentinel. Callers
    /// treat it as a clean exit rather than a failure.
    pub fn is_user_detach(&self) -> bool {
        matches!(self, FaizeError::UserDetach)
    }
}
