//! Run configuration, assembled once from the CLI before a pass starts.
//! The engine never re-reads it mid-run.

use std::path::PathBuf;

use crate::retry::RetryPolicy;

pub struct Config {
    pub root: String,
    pub endpoint: String,
    pub token: String,
    pub destination: PathBuf,
    pub state_directory: PathBuf,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub policy: RetryPolicy,
    pub strict: bool,
    pub dry_run: bool,
    pub no_progress_bar: bool,
    pub watch_interval: Option<u64>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("root", &self.root)
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("destination", &self.destination)
            .field("state_directory", &self.state_directory)
            .field("concurrency", &self.concurrency)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Validate and assemble; invalid configuration is a fatal-run error
    /// before anything touches the manifest.
    pub fn from_sync_args(args: crate::cli::SyncArgs) -> anyhow::Result<Self> {
        if args.directory.trim().is_empty() {
            anyhow::bail!("--directory must not be empty");
        }
        if !args.endpoint.starts_with("http://") && !args.endpoint.starts_with("https://") {
            anyhow::bail!("--endpoint must be an http(s) URL, got '{}'", args.endpoint);
        }
        let token = args.token.ok_or_else(|| {
            anyhow::anyhow!("no API token; pass --token or set CLOUDMIRROR_TOKEN")
        })?;
        if args.concurrency == 0 {
            anyhow::bail!("--concurrency must be at least 1");
        }
        if args.max_attempts == 0 {
            anyhow::bail!("--max-attempts must be at least 1");
        }

        Ok(Self {
            root: args.state.root,
            endpoint: args.endpoint,
            token,
            destination: expand_tilde(&args.directory),
            state_directory: expand_tilde(&args.state.state_directory),
            concurrency: args.concurrency as usize,
            max_attempts: args.max_attempts,
            policy: RetryPolicy {
                max_retries: args.max_attempts - 1,
                base_delay_secs: args.retry_delay,
                max_delay_secs: args.max_retry_delay,
            },
            strict: args.strict,
            dry_run: args.dry_run,
            no_progress_bar: args.no_progress_bar,
            watch_interval: args.watch_interval,
        })
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Make a root name safe to embed in state filenames.
pub fn sanitize_root(root: &str) -> String {
    root.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Manifest database path for a sync root.
pub fn manifest_path(state_directory: &std::path::Path, root: &str) -> PathBuf {
    state_directory.join(format!("{}.db", sanitize_root(root)))
}
