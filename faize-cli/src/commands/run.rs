//! Plain sandboxed shell session.

use anyhow::{Context, Result};
use clap::Args;
use faize::config::Config;
use faize::session::SessionStore;

use crate::cli::{GlobalFlags, SessionFlags};
use crate::commands::common::{build_shell_config, run_session};

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub session: SessionFlags,

    /// Network access policies (e.g. npm, pypi, github, all, none)
    #[arg(short = 'n', long = "network")]
    pub networks: Vec<String>,

    /// Minimal test mode: 1 CPU, 512MB RAM, no mounts, no network
    #[arg(long)]
    pub minimal_test: bool,
}

pub async fn execute(mut args: RunArgs, global: &GlobalFlags) -> Result<()> {
    let cfg = Config::load().context("failed to load config")?;

    if args.minimal_test {
        println!("Running in minimal test mode...");
        args.session.cpus = Some(1);
        args.session.memory = Some("512MB".into());
        args.session.timeout = Some("5m".into());
        args.session.mounts.clear();
        args.networks = vec!["none".into()];
    }

    let networks = if args.networks.is_empty() {
        cfg.networks.clone()
    } else {
        args.networks.clone()
    };

    let vm_config = build_shell_config(&args.session, &networks, &cfg, global.debug)?;

    let manager = faize::new_manager()?;
    let store = SessionStore::new()?;
    run_session(manager.as_ref(), &store, vm_config).await
}
