//! URL-open watcher.
//!
//! The guest's `xdg-open` shim publishes a URL through the bootstrap
//! directory; this watcher polls for it, validates the scheme, launches
//! the host browser, and removes the file as the acknowledgment the shim
//! waits on. OAuth URLs with a localhost redirect additionally spawn the
//! callback relay.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrapDir;
use crate::relay::oauth::{parse_oauth_redirect, start_oauth_relay};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Only https URLs may reach the host browser. Everything else
/// (`file://`, `javascript:`, plain `http://`) is refused.
pub fn is_url_allowed(url: &str) -> bool {
    url.starts_with("https://")
}

/// Spawn the watcher task for one session. Runs until `done` is cancelled.
pub fn spawn_open_url_watcher(
    done: CancellationToken,
    bootstrap: BootstrapDir,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(watch_open_url(done, bootstrap))
}

async fn watch_open_url(done: CancellationToken, bootstrap: BootstrapDir) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let url = match bootstrap.take_open_url() {
            Ok(Some(url)) => url,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "open-url poll failed");
                continue;
            }
        };

        if !is_url_allowed(&url) {
            tracing::warn!(url = %url, "blocked URL open request (not https)");
            continue;
        }

        tracing::debug!(url = %url, "opening URL in host browser");

        // An OAuth flow with a localhost redirect needs the callback relay
        // listening before the browser gets the URL.
        if let Some(port) = parse_oauth_redirect(&url) {
            tracing::debug!(port = %port, "detected OAuth flow, starting callback relay");
            match start_oauth_relay(done.clone(), bootstrap.clone(), &port).await {
                Ok(_task) => {}
                Err(e) => {
                    tracing::warn!(port = %port, error = %e, "OAuth relay failed to start");
                    continue;
                }
            }
        }

        open_in_browser(&url);
    }
}

#[cfg(target_os = "macos")]
fn open_in_browser(url: &str) {
    match std::process::Command::new("open").arg(url).spawn() {
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "failed to launch browser"),
    }
}

#[cfg(not(target_os = "macos"))]
fn open_in_browser(url: &str) {
    tracing::debug!(url = %url, "no host browser integration on this platform");
}
