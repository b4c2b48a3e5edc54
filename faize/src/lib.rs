//! Faize — single-tenant VM sandboxes for AI coding agents.
//!
//! Faize boots short-lived Linux VMs on macOS (Virtualization.framework)
//! and runs a coding agent against a developer's source tree under strict
//! isolation: a read-only rootfs with an ephemeral in-guest overlay, a
//! VirtioFS bootstrap channel, a domain-granular outbound firewall
//! enforced in the guest, and a mount allowlist that keeps credentials on
//! the host.
//!
//! # Architecture
//!
//! ```text
//! faize-cli
//!     └► SessionManager (vm/)            lifecycle, device graph, timers
//!            ├► ConsoleBroker (console/)  single-reader Unix-socket proxy
//!            ├► BootstrapDir (bootstrap/) host↔guest file message bus
//!            ├► init script (guest/)      mounts, firewall, agent launch
//!            └► relays (relay/)           open-url watcher, OAuth, clipboard
//! ```
//!
//! Everything except `vm::VzSessionManager` is platform-neutral; other
//! platforms get `vm::StubManager`, which refuses VM operations.

pub mod artifacts;
pub mod bootstrap;
pub mod changeset;
pub mod config;
pub mod console;
pub mod errors;
pub mod git;
pub mod guest;
pub mod mount;
pub mod network;
pub mod relay;
pub mod session;
pub mod vm;

pub use errors::{FaizeError, FaizeResult};
pub use network::Policy;
pub use session::{ExitReason, Session, SessionStatus, SessionStore, VmMount};
pub use vm::{new_manager, SessionManager, VmConfig};
