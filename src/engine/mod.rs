//! Synchronization engine.
//!
//! One [`Engine::run`] pass: recover interrupted entries, re-derive backlog
//! work from the manifest, walk the remote catalog page by page (each
//! page's manifest transaction commits before its cursor is persisted, and
//! the cursor is persisted before the next page is requested), sweep
//! deletions after a completed full walk, then drain the fetch queue. All
//! durable state lives in the manifest, so a run interrupted at any point
//! resumes instead of restarting.

pub mod events;
pub mod reconcile;
pub mod scheduler;
pub mod walker;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::fingerprint;
use crate::manifest::{EntryStatus, ManifestError, ManifestStore, RunStats};
use crate::remote::{RemoteError, RemoteStore};
use crate::retry::RetryPolicy;
use events::{ProgressSink, SyncEvent};
use scheduler::{FetchScheduler, SchedulerConfig};
use walker::CatalogWalker;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sync root name; keys the cursor row.
    pub root: String,
    /// Local mirror directory.
    pub destination: PathBuf,
    pub concurrency: usize,
    /// Attempts per entry before it settles on `failed`.
    pub max_attempts: u32,
    pub policy: RetryPolicy,
    pub dry_run: bool,
}

/// Outcome of one engine pass.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub fetched: u64,
    pub deleted: u64,
    pub failed: u64,
    pub skipped: u64,
    pub interrupted: bool,
    pub dry_run: bool,
    /// Entries currently in `failed` status, with their last error.
    pub failed_entries: Vec<FailedEntry>,
}

#[derive(Debug, Clone)]
pub struct FailedEntry {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("manifest failure: {0}")]
    Manifest(#[from] ManifestError),

    /// Catalog listing failed past its retry budget, or fatally. The stored
    /// cursor is untouched; the next run resumes from it.
    #[error("catalog walk failed: {0}")]
    Walk(#[source] RemoteError),

    #[error("worker pool crashed: {0}")]
    Pool(String),
}

pub struct Engine {
    store: Arc<dyn ManifestStore>,
    remote: Arc<dyn RemoteStore>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ManifestStore>,
        remote: Arc<dyn RemoteStore>,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            remote,
            sink,
            cancel,
            config,
        }
    }

    pub async fn run(&self) -> Result<RunSummary, EngineError> {
        if self.config.dry_run {
            return self.dry_run().await;
        }

        let run_id = self.store.start_run().await?;
        self.recover_interrupted().await?;

        let scheduler = FetchScheduler::spawn(
            self.store.clone(),
            self.remote.clone(),
            self.sink.clone(),
            self.cancel.clone(),
            SchedulerConfig {
                concurrency: self.config.concurrency,
                max_attempts: self.config.max_attempts,
                policy: self.config.policy,
                destination: self.config.destination.clone(),
            },
        );

        // Work left behind by an earlier interrupted run; pages the resumed
        // walk will not re-list.
        let backlog = self.store.list_by_status(EntryStatus::Pending).await?;
        if !backlog.is_empty() {
            tracing::info!("re-deriving {} interrupted fetches", backlog.len());
            for entry in &backlog {
                scheduler.submit(reconcile::refetch_item(entry));
            }
        }

        let walker = CatalogWalker::new(self.remote.clone(), self.config.policy);
        let (walk_id, mut cursor) = self.store.begin_walk(&self.config.root).await?;
        if cursor.is_some() {
            tracing::info!(walk_id, "resuming interrupted catalog walk");
        }

        let mut plan_skipped: u64 = 0;
        let mut walk_complete = false;
        let walk_result: Result<(), EngineError> = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }
            let page = match walker.next_page(cursor.as_deref()).await {
                Ok(page) => page,
                Err(e) => break Err(EngineError::Walk(e)),
            };

            let ids: Vec<String> = page.entries.iter().map(|e| e.remote_id.clone()).collect();
            let snapshot = self.store.snapshot(&ids).await?;
            let items = reconcile::plan_page(&page.entries, &snapshot);
            plan_skipped += (page.entries.len() - items.len()) as u64;

            // Page transaction first, cursor second: after a crash the
            // worst case is replanning one already-recorded page, never a
            // skipped one.
            self.store.record_page(&page.entries, walk_id).await?;
            self.store
                .advance_cursor(&self.config.root, &page.cursor)
                .await?;

            tracing::debug!(
                entries = page.entries.len(),
                planned = items.len(),
                "page reconciled"
            );
            for item in items {
                scheduler.submit(item);
            }

            cursor = Some(page.cursor);
            if !page.has_more {
                walk_complete = true;
                break Ok(());
            }
        };

        if walk_complete && !self.cancel.is_cancelled() {
            let unseen = self.store.list_unseen_since(walk_id).await?;
            if !unseen.is_empty() {
                tracing::info!("{} entries vanished from the catalog", unseen.len());
            }
            for item in reconcile::plan_deletions(&unseen) {
                scheduler.submit(item);
            }
        }

        let pool = scheduler
            .drain()
            .await
            .map_err(|e| EngineError::Pool(e.to_string()))?;

        // Safe-state invariant: nothing may stay claimed after a drain.
        let stuck = self.store.list_by_status(EntryStatus::Fetching).await?;
        if !stuck.is_empty() {
            tracing::error!(
                "{} entries left in fetching state after drain; they will be re-verified next run",
                stuck.len()
            );
        }

        let interrupted = self.cancel.is_cancelled()
            || pool.interrupted > 0
            || walk_result.is_err()
            || !walk_complete
            || !stuck.is_empty();

        if walk_complete && !interrupted {
            self.store.complete_walk(&self.config.root).await?;
        }

        let stats = RunStats {
            fetched: pool.fetched,
            deleted: pool.deleted,
            failed: pool.failed,
            skipped: pool.skipped + plan_skipped,
            interrupted,
        };
        self.store.complete_run(run_id, &stats).await?;
        self.sink.emit(&SyncEvent::RunFinished(stats));

        walk_result?;

        let failed_entries = self
            .store
            .list_by_status(EntryStatus::Failed)
            .await?
            .into_iter()
            .map(|entry| FailedEntry {
                path: entry.path,
                error: entry.last_error.unwrap_or_else(|| "unknown error".into()),
            })
            .collect();

        Ok(RunSummary {
            fetched: stats.fetched,
            deleted: stats.deleted,
            failed: stats.failed,
            skipped: stats.skipped,
            interrupted,
            dry_run: false,
            failed_entries,
        })
    }

    /// Resolve entries stranded in `fetching` by a crash: accept the local
    /// file when it already hashes to the expected fingerprint, otherwise
    /// put the entry back in the queue-derivable `pending` state.
    async fn recover_interrupted(&self) -> Result<(), EngineError> {
        let stuck = self.store.list_by_status(EntryStatus::Fetching).await?;
        for entry in stuck {
            let verified = match scheduler::resolve_target(&self.config.destination, &entry.path) {
                Ok(path) => {
                    let expected = entry.fingerprint.clone();
                    tokio::task::spawn_blocking(move || {
                        fingerprint::fingerprint_file(&path)
                            .map(|actual| actual == expected)
                            .unwrap_or(false)
                    })
                    .await
                    .unwrap_or(false)
                }
                Err(_) => false,
            };

            if verified
                && self
                    .store
                    .mark_verified(&entry.remote_id, &entry.fingerprint)
                    .await?
            {
                tracing::info!("recovered verified file {}", entry.path);
            } else {
                tracing::info!("re-queuing interrupted fetch of {}", entry.path);
                self.store.requeue(&entry.remote_id).await?;
            }
        }
        Ok(())
    }

    /// Plan-only pass: walks the catalog read-only and reports what a real
    /// run would do. Touches neither the manifest nor the local tree.
    async fn dry_run(&self) -> Result<RunSummary, EngineError> {
        let walker = CatalogWalker::new(self.remote.clone(), self.config.policy);
        let state = self.store.load_cursor(&self.config.root).await?;
        let mut cursor = state.and_then(|s| s.cursor);
        let resuming = cursor.is_some();

        let backlog = self.store.list_by_status(EntryStatus::Pending).await?;
        let mut would_fetch = backlog.len() as u64;
        let mut skipped: u64 = 0;
        let mut seen: HashSet<String> = HashSet::new();
        let mut walk_complete = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let page = match walker.next_page(cursor.as_deref()).await {
                Ok(page) => page,
                Err(e) => return Err(EngineError::Walk(e)),
            };

            let ids: Vec<String> = page.entries.iter().map(|e| e.remote_id.clone()).collect();
            let snapshot = self.store.snapshot(&ids).await?;
            let items = reconcile::plan_page(&page.entries, &snapshot);
            skipped += (page.entries.len() - items.len()) as u64;
            for item in &items {
                // Backlog entries were already counted.
                let already_pending = snapshot
                    .get(&item.remote_id)
                    .is_some_and(|m| m.status == EntryStatus::Pending);
                if !already_pending {
                    would_fetch += 1;
                    tracing::info!("[dry run] would fetch {}", item.target_path);
                }
            }
            seen.extend(ids);

            cursor = Some(page.cursor);
            if !page.has_more {
                walk_complete = true;
                break;
            }
        }

        let mut would_delete: u64 = 0;
        // Deletions are only decidable after a full walk from the start.
        if walk_complete && !resuming {
            for status in [
                EntryStatus::Verified,
                EntryStatus::Pending,
                EntryStatus::Failed,
                EntryStatus::Fetching,
            ] {
                for entry in self.store.list_by_status(status).await? {
                    if !seen.contains(&entry.remote_id) {
                        tracing::info!("[dry run] would delete {}", entry.path);
                        would_delete += 1;
                    }
                }
            }
        }

        Ok(RunSummary {
            fetched: would_fetch,
            deleted: would_delete,
            failed: 0,
            skipped,
            interrupted: self.cancel.is_cancelled(),
            dry_run: true,
            failed_entries: Vec::new(),
        })
    }
}
