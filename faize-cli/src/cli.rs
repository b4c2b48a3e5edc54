//! Command-line surface.

use clap::{Args, Parser, Subcommand};

/// Faize: isolated, reproducible VM sandboxes for AI coding agents.
#[derive(Parser, Debug)]
#[command(name = "faize", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Enable debug logging (host and guest)
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a sandboxed shell session and attach to it
    Run(crate::commands::run::RunArgs),

    /// Claude-optimized agent sessions
    #[command(subcommand)]
    Claude(crate::commands::claude::ClaudeCommand),

    /// List sessions
    Ps,

    /// Stop a running session
    Stop(crate::commands::stop::StopArgs),

    /// Remove sessions
    Kill(crate::commands::kill::KillArgs),

    /// Clean up stopped sessions and caches
    Prune(crate::commands::prune::PruneArgs),

    /// Show what a session changed
    Diff(crate::commands::diff::DiffArgs),
}

/// Session resource flags shared by `run` and `claude start`.
#[derive(Args, Debug, Clone)]
pub struct SessionFlags {
    /// Project directory to mount (default: current directory)
    #[arg(short = 'p', long = "project")]
    pub project: Option<String>,

    /// Additional mount paths (repeatable)
    #[arg(short = 'm', long = "mount")]
    pub mounts: Vec<String>,

    /// Number of CPUs (default from config)
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Memory limit, e.g. 4GB (default from config)
    #[arg(long)]
    pub memory: Option<String>,

    /// Session timeout, e.g. 2h (default from config)
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<String>,
}
