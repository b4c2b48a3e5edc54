//! Show what a session changed.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use faize::changeset::{self, ChangeType};
use faize::session::SessionStore;

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Session ID
    pub id: String,
}

pub async fn execute(args: DiffArgs) -> Result<()> {
    let store = SessionStore::new()?;
    let path = store.session_dir(&args.id).join("changeset.json");
    if !path.exists() {
        return Err(anyhow!(
            "no changeset recorded for session {} (still running, or removed?)",
            args.id
        ));
    }

    let cs = changeset::load_changeset(&path)
        .with_context(|| format!("failed to load changeset for {}", args.id))?;

    let mut any = false;
    for mount in &cs.mount_changes {
        let changes = changeset::filter_paths(mount.changes.clone());
        if changes.is_empty() {
            continue;
        }
        any = true;

        println!("{} ({} change(s)):", mount.source.display(), changes.len());
        for change in &changes {
            let marker = match change.change_type {
                ChangeType::Created => "+",
                ChangeType::Modified => "~",
                ChangeType::Deleted => "-",
            };
            match (change.old_size, change.new_size) {
                (Some(old), Some(new)) => {
                    println!("  {marker} {} ({old} -> {new} bytes)", change.path)
                }
                (_, Some(new)) => println!("  {marker} {} ({new} bytes)", change.path),
                (Some(old), _) => println!("  {marker} {} (was {old} bytes)", change.path),
                _ => println!("  {marker} {}", change.path),
            }
        }
        println!();
    }

    if !cs.guest_changes.is_empty() {
        any = true;
        println!("Guest filesystem ({} path(s)):", cs.guest_changes.len());
        for path in &cs.guest_changes {
            println!("  {path}");
        }
        println!();
    }

    if !cs.network_events.is_empty() {
        any = true;
        let denied = cs
            .network_events
            .iter()
            .filter(|e| e.action == "DENY")
            .count();
        println!(
            "Network: {} connection event(s), {denied} denied",
            cs.network_events.len()
        );
        for event in &cs.network_events {
            println!(
                "  {} {} {}:{}",
                event.action, event.proto, event.dst_ip, event.dst_port
            );
        }
    }

    if !any {
        println!("Session {} made no recorded changes.", args.id);
    }
    Ok(())
}
