//! Clean up stopped sessions and caches.

use anyhow::{Context, Result};
use clap::Args;
use faize::artifacts::ArtifactManager;
use faize::session::{SessionStatus, SessionStore};

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Remove all sessions, including running ones
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Also remove downloaded artifacts (kernel, rootfs)
    #[arg(long)]
    pub artifacts: bool,
}

pub async fn execute(args: PruneArgs) -> Result<()> {
    println!("Cleaning up sessions and caches...");

    let store = SessionStore::new().context("failed to access session store")?;
    let sessions = store.list().context("failed to list sessions")?;

    let mut removed = 0usize;
    for session in sessions {
        if args.all || session.status == SessionStatus::Stopped {
            if let Err(e) = store.delete(&session.id) {
                eprintln!("Warning: failed to delete session {}: {e}", session.id);
                continue;
            }
            // The session's working directory (bootstrap, snapshots) goes
            // with the record.
            let _ = std::fs::remove_dir_all(store.session_dir(&session.id));
            println!("Removed session: {}", session.id);
            removed += 1;
        }
    }

    if removed == 0 {
        println!("No sessions to remove.");
    } else {
        println!("Removed {removed} session(s).");
    }

    if args.artifacts {
        println!("\nCleaning up artifacts...");
        let artifacts = ArtifactManager::new().context("failed to access artifact manager")?;
        artifacts.clean().context("failed to clean artifacts")?;
        println!("Artifacts removed.");
    }

    Ok(())
}
