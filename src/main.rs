//! cloudmirror — one-way mirror of a hosted-storage account.
//!
//! Reconciles the provider's change catalog against a local SQLite manifest
//! and streams missing or changed content into place with checksum
//! verification, bounded concurrency, and exponential-backoff retries. Runs
//! are idempotent and resumable: the manifest and the persisted catalog
//! cursor are the only state, so an interrupted run picks up exactly where
//! it stopped.

#![warn(clippy::all)]

mod cli;
mod config;
mod engine;
mod fingerprint;
mod lock;
mod manifest;
mod progress;
mod remote;
pub mod retry;
mod shutdown;
mod types;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::Config;
use engine::events::ProgressSink;
use engine::{Engine, EngineConfig, RunSummary};
use manifest::{EntryStatus, ManifestStore, SqliteManifest};
use remote::http::HttpRemote;
use remote::RemoteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Sync(args) => run_sync(args, false).await,
        Command::RetryFailed(args) => run_sync(args, true).await,
        Command::Status(args) => run_status(args).await,
        Command::Verify(args) => run_verify(args).await,
        Command::ResetState(args) => run_reset_state(args).await,
    }
}

async fn run_sync(args: cli::SyncArgs, retry_failed: bool) -> anyhow::Result<()> {
    let config = Config::from_sync_args(args)?;
    tracing::info!(
        root = %config.root,
        destination = %config.destination.display(),
        concurrency = config.concurrency,
        "starting cloudmirror"
    );

    let _lock = lock::InstanceLock::acquire(&config.state_directory, &config.root)?;

    let store: Arc<dyn ManifestStore> = Arc::new(
        SqliteManifest::open(&config::manifest_path(&config.state_directory, &config.root))
            .await?,
    );

    if retry_failed {
        let count = store.reset_failed().await?;
        if count > 0 {
            tracing::info!(count, "reset failed entries to pending");
        } else {
            tracing::info!("no failed entries to retry");
        }
    }

    let remote: Arc<dyn RemoteStore> =
        Arc::new(HttpRemote::new(&config.endpoint, &config.token, &config.root)?);
    let sink: Arc<dyn ProgressSink> = Arc::new(progress::ConsoleProgress::new(
        config.no_progress_bar || config.dry_run,
    ));
    let shutdown = shutdown::install();

    let engine = Engine::new(
        store,
        remote,
        sink,
        shutdown.clone(),
        EngineConfig {
            root: config.root.clone(),
            destination: config.destination.clone(),
            concurrency: config.concurrency,
            max_attempts: config.max_attempts,
            policy: config.policy,
            dry_run: config.dry_run,
        },
    );

    loop {
        let summary = engine.run().await?;
        report_summary(&summary);

        if config.strict && summary.failed > 0 {
            anyhow::bail!("{} entries failed permanently (strict mode)", summary.failed);
        }

        match config.watch_interval {
            Some(secs) if !shutdown.is_cancelled() => {
                tracing::info!("waiting {}s before the next pass...", secs);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    _ = shutdown.cancelled() => {
                        tracing::info!("stop requested during wait, exiting");
                        break;
                    }
                }
            }
            _ => break,
        }
    }

    Ok(())
}

fn report_summary(summary: &RunSummary) {
    if summary.dry_run {
        tracing::info!("── Dry Run Summary ──");
        tracing::info!(
            "  {} would be fetched, {} would be deleted, {} already current",
            summary.fetched,
            summary.deleted,
            summary.skipped
        );
        return;
    }

    tracing::info!("── Summary ──");
    tracing::info!(
        "  {} fetched, {} deleted, {} failed, {} skipped",
        summary.fetched,
        summary.deleted,
        summary.failed,
        summary.skipped
    );
    if summary.interrupted {
        tracing::warn!("  run interrupted before completion; next run resumes");
    }
    for entry in &summary.failed_entries {
        tracing::error!("  failed: {} — {}", entry.path, entry.error);
    }
}

async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let state_dir = config::expand_tilde(&args.state.state_directory);
    let db_path = config::manifest_path(&state_dir, &args.state.root);

    if !db_path.exists() {
        println!("No manifest found at {}", db_path.display());
        println!("Run a sync first to create it.");
        return Ok(());
    }

    let store = SqliteManifest::open(&db_path).await?;
    let summary = store.summary().await?;

    println!("Manifest: {}", db_path.display());
    println!();
    println!("Entries:");
    println!("  Total:    {}", summary.total);
    println!("  Verified: {}", summary.verified);
    println!("  Pending:  {}", summary.pending);
    println!("  Failed:   {}", summary.failed);
    println!("  Deleted:  {}", summary.deleted);
    println!();

    if let Some(started) = &summary.last_run_started {
        println!("Last run started:   {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(completed) = &summary.last_run_completed {
        println!("Last run completed: {}", completed.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(state) = store.load_cursor(&args.state.root).await? {
        if state.cursor.is_some() {
            println!("A catalog walk is in progress; the next sync resumes it.");
        }
    }

    if args.failed && summary.failed > 0 {
        println!();
        println!("Failed entries:");
        for entry in store.list_by_status(EntryStatus::Failed).await? {
            println!(
                "  {} ({}) - {}",
                entry.path,
                entry.remote_id,
                entry.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

async fn run_verify(args: cli::VerifyArgs) -> anyhow::Result<()> {
    let state_dir = config::expand_tilde(&args.state.state_directory);
    let db_path = config::manifest_path(&state_dir, &args.state.root);

    if !db_path.exists() {
        println!("No manifest found at {}", db_path.display());
        println!("Run a sync first to create it.");
        return Ok(());
    }

    let destination = config::expand_tilde(&args.directory);
    let store = SqliteManifest::open(&db_path).await?;
    let verified = store.list_by_status(EntryStatus::Verified).await?;

    println!("Verifying {} mirrored files...", verified.len());
    println!();

    let mut ok = 0u64;
    let mut missing = 0u64;
    let mut corrupted = 0u64;

    for entry in &verified {
        let path = match engine::scheduler::resolve_target(&destination, &entry.path) {
            Ok(path) => path,
            Err(_) => {
                println!("BAD PATH: {}", entry.path);
                missing += 1;
                continue;
            }
        };

        if !path.exists() {
            println!("MISSING: {} ({})", path.display(), entry.remote_id);
            missing += 1;
            continue;
        }

        if args.checksums {
            let expected = entry.fingerprint.clone();
            let hash_path = path.clone();
            let matches = tokio::task::spawn_blocking(move || {
                fingerprint::fingerprint_file(&hash_path).map(|actual| actual == expected)
            })
            .await?;
            match matches {
                Ok(true) => ok += 1,
                Ok(false) => {
                    println!("CORRUPTED: {} ({})", path.display(), entry.remote_id);
                    corrupted += 1;
                }
                Err(e) => {
                    println!("ERROR: {} - {}", path.display(), e);
                    corrupted += 1;
                }
            }
        } else {
            ok += 1;
        }
    }

    println!();
    println!("Results:");
    println!("  OK:      {}", ok);
    println!("  Missing: {}", missing);
    if args.checksums {
        println!("  Corrupted: {}", corrupted);
    }

    if missing > 0 || corrupted > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_reset_state(args: cli::ResetStateArgs) -> anyhow::Result<()> {
    let state_dir = config::expand_tilde(&args.state.state_directory);
    let db_path = config::manifest_path(&state_dir, &args.state.root);

    if !db_path.exists() {
        println!("No manifest found at {}", db_path.display());
        return Ok(());
    }

    if !args.yes {
        println!("This resets all sync progress for root '{}':", args.state.root);
        println!("  every entry goes back to pending and the catalog cursor is cleared,");
        println!("  so the next sync re-walks and re-verifies the entire tree.");
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let store = SqliteManifest::open(&db_path).await?;
    let reset = store.reset_all(&args.state.root).await?;
    println!("Reset {} entries to pending; next sync starts a full walk.", reset);

    Ok(())
}
