use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "cloudmirror",
    about = "Mirror a hosted-storage account into a local directory",
    version
)]
pub struct Cli {
    /// Log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one mirror pass (or keep running with --watch-interval)
    Sync(SyncArgs),

    /// Show manifest counts and the last run times
    Status(StatusArgs),

    /// Check mirrored files against the manifest
    Verify(VerifyArgs),

    /// Reset failed entries to pending, then sync
    RetryFailed(SyncArgs),

    /// Forget all sync progress so the next run re-walks everything
    ResetState(ResetStateArgs),
}

#[derive(Args, Debug)]
pub struct StateArgs {
    /// Directory holding the manifest database and lock files
    #[arg(long, default_value = "~/.cloudmirror")]
    pub state_directory: String,

    /// Sync root name; keys the manifest, cursor, and lock
    #[arg(long, default_value = "main")]
    pub root: String,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// Local directory to mirror into
    #[arg(short = 'd', long)]
    pub directory: String,

    /// Base URL of the storage provider API
    #[arg(long)]
    pub endpoint: String,

    /// API bearer token.
    /// WARNING: flags are visible in process listings; prefer the
    /// CLOUDMIRROR_TOKEN environment variable.
    #[arg(long, env = "CLOUDMIRROR_TOKEN")]
    pub token: Option<String>,

    /// Concurrent transfers
    #[arg(long, default_value_t = 4)]
    pub concurrency: u16,

    /// Attempts per entry before it is marked failed
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// Base retry delay in seconds
    #[arg(long, default_value_t = 5)]
    pub retry_delay: u64,

    /// Retry delay ceiling in seconds
    #[arg(long, default_value_t = 60)]
    pub max_retry_delay: u64,

    /// Exit nonzero when any entry ends the run in failed status
    #[arg(long)]
    pub strict: bool,

    /// Plan and report without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Disable the progress display
    #[arg(long)]
    pub no_progress_bar: bool,

    /// Keep running, waiting N seconds between passes
    #[arg(long)]
    pub watch_interval: Option<u64>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// List failed entries with their last error
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// Local directory the mirror was written into
    #[arg(short = 'd', long)]
    pub directory: String,

    /// Re-hash file contents (slow) instead of checking existence only
    #[arg(long)]
    pub checksums: bool,
}

#[derive(Args, Debug)]
pub struct ResetStateArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}
