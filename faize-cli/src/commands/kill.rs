//! Remove sessions.

use anyhow::{Context, Result};
use clap::Args;
use faize::session::{ExitReason, SessionStatus, SessionStore};

#[derive(Args, Debug)]
pub struct KillArgs {
    /// Also stop and remove running sessions
    #[arg(short = 'f', long)]
    pub force: bool,
}

/// Removes sessions with status `created` by default; `--force` also stops
/// and removes running ones. Stopped sessions belong to `prune`.
pub async fn execute(args: KillArgs) -> Result<()> {
    let store = SessionStore::new().context("failed to access session store")?;
    let sessions = store.list().context("failed to list sessions")?;
    let manager = faize::new_manager()?;

    let mut removed = 0usize;
    let mut skipped_running = 0usize;

    for session in sessions {
        match session.status {
            SessionStatus::Created => {
                if let Err(e) = store.delete(&session.id) {
                    eprintln!("Warning: failed to delete session {}: {e}", session.id);
                } else {
                    println!("Removed session: {} (created)", session.id);
                    removed += 1;
                }
            }
            SessionStatus::Running => {
                if !args.force {
                    skipped_running += 1;
                    continue;
                }
                if let Err(e) = manager.stop(&session.id, ExitReason::Killed).await {
                    if !matches!(e, faize::FaizeError::Unsupported) {
                        eprintln!("Warning: failed to stop session {}: {e}", session.id);
                    }
                    // Still remove the record below.
                }
                if let Err(e) = store.delete(&session.id) {
                    eprintln!("Warning: failed to delete session {}: {e}", session.id);
                } else {
                    println!("Stopped and removed session: {} (running)", session.id);
                    removed += 1;
                }
            }
            SessionStatus::Stopped => {}
        }
    }

    if skipped_running > 0 {
        println!("Skipped {skipped_running} running session(s). Use --force to remove them.");
    }
    if removed == 0 {
        println!("No sessions to remove.");
    } else {
        println!("Removed {removed} session(s).");
    }
    Ok(())
}
