//! Stop a running session.

use anyhow::{Context, Result};
use clap::Args;
use faize::session::ExitReason;

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Session ID
    pub id: String,
}

pub async fn execute(args: StopArgs) -> Result<()> {
    let manager = faize::new_manager()?;

    manager
        .stop(&args.id, ExitReason::Killed)
        .await
        .with_context(|| format!("failed to stop session {}", args.id))?;

    println!("Session {} stopped.", args.id);
    Ok(())
}
