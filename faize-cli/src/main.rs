mod cli;
mod commands;
mod terminal;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let default_filter = if args.global.debug { "faize=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Run(run_args) => commands::run::execute(run_args, &args.global).await,
        Command::Claude(claude_cmd) => commands::claude::execute(claude_cmd, &args.global).await,
        Command::Ps => commands::ps::execute().await,
        Command::Stop(stop_args) => commands::stop::execute(stop_args).await,
        Command::Kill(kill_args) => commands::kill::execute(kill_args).await,
        Command::Prune(prune_args) => commands::prune::execute(prune_args).await,
        Command::Diff(diff_args) => commands::diff::execute(diff_args).await,
    }
}
