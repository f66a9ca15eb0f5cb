//! Fetch scheduler: a fixed-size worker pool draining one shared queue.
//!
//! Fetches stream into a hidden `.part` file next to the destination while
//! being fingerprinted incrementally, then move into place with a single
//! rename — a reader never observes a partially-written file at the final
//! path. Transient failures release the manifest claim, persist the attempt
//! counter, and re-enqueue the item after a computed backoff delay, so a
//! stop signal can interrupt between attempts and a restart can re-derive
//! the remaining work from the manifest alone.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{stream, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::events::{ProgressSink, SyncEvent};
use super::reconcile::{refetch_item, WorkItem, WorkKind};
use crate::fingerprint::BlockHasher;
use crate::manifest::{EntryStatus, ManifestStore};
use crate::remote::{RemoteError, RemoteStore};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    /// Total attempts per entry before it settles on `failed`.
    pub max_attempts: u32,
    pub policy: RetryPolicy,
    pub destination: PathBuf,
}

/// Terminal counts for one drained queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub fetched: u64,
    pub deleted: u64,
    pub failed: u64,
    pub skipped: u64,
    pub interrupted: u64,
}

enum ItemOutcome {
    Fetched,
    Deleted,
    Skipped,
    Failed,
    Interrupted,
    /// Re-enqueued for another attempt; not terminal.
    Requeued,
}

/// Per-fetch error, classified for the retry policy.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    /// Downloaded bytes don't hash to the catalog fingerprint — typically a
    /// truncated transfer; retried like any other transient failure.
    #[error("fingerprint mismatch for {path}")]
    FingerprintMismatch { path: String },

    #[error("refusing unsafe path {0:?}")]
    UnsafePath(String),
}

impl FetchError {
    /// Permanent for this entry: skip the retry budget and mark `failed`.
    fn is_permanent(&self) -> bool {
        match self {
            Self::Remote(e) => !e.is_retryable(),
            Self::Disk(_) => true,
            Self::FingerprintMismatch { .. } => false,
            Self::UnsafePath(_) => true,
        }
    }
}

struct Shared {
    store: Arc<dyn ManifestStore>,
    remote: Arc<dyn RemoteStore>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    config: SchedulerConfig,
    /// Submitted items not yet terminal; the drain barrier.
    outstanding: AtomicI64,
    done_tx: watch::Sender<()>,
    /// Sender used for backoff re-enqueues; cleared when draining closes
    /// the queue.
    requeue_tx: StdMutex<Option<mpsc::UnboundedSender<WorkItem>>>,
}

impl Shared {
    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done_tx.send_replace(());
        }
    }

    fn resubmit(&self, item: WorkItem) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let tx = self.requeue_tx.lock().expect("requeue slot").clone();
        match tx {
            Some(tx) if tx.send(item).is_ok() => {}
            _ => self.finish_one(),
        }
    }
}

pub struct FetchScheduler {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<WorkItem>,
    done_rx: watch::Receiver<()>,
    pool: tokio::task::JoinHandle<PoolStats>,
}

impl FetchScheduler {
    pub fn spawn(
        store: Arc<dyn ManifestStore>,
        remote: Arc<dyn RemoteStore>,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
        config: SchedulerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(());

        let shared = Arc::new(Shared {
            store,
            remote,
            sink,
            cancel,
            config,
            outstanding: AtomicI64::new(0),
            done_tx,
            requeue_tx: StdMutex::new(Some(tx.clone())),
        });

        let pool = tokio::spawn(run_pool(shared.clone(), rx));

        Self {
            shared,
            tx,
            done_rx,
            pool,
        }
    }

    /// Enqueue one work item. Cheap and non-blocking.
    pub fn submit(&self, item: WorkItem) {
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(item).is_err() {
            self.shared.finish_one();
        }
    }

    /// Wait until every submitted item reached a terminal state, then close
    /// the queue and collect the pool's counters.
    pub async fn drain(self) -> Result<PoolStats, tokio::task::JoinError> {
        let mut done = self.done_rx.clone();
        while self.shared.outstanding.load(Ordering::Acquire) > 0 {
            if done.changed().await.is_err() {
                break;
            }
        }

        // All senders drop here; the worker stream ends once the queue is
        // empty.
        self.shared.requeue_tx.lock().expect("requeue slot").take();
        drop(self.tx);

        self.pool.await
    }
}

async fn run_pool(shared: Arc<Shared>, rx: mpsc::UnboundedReceiver<WorkItem>) -> PoolStats {
    let concurrency = shared.config.concurrency.max(1);

    let items = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) });

    items
        .map(|item| {
            let shared = shared.clone();
            async move { execute(shared, item).await }
        })
        .buffer_unordered(concurrency)
        .fold(PoolStats::default(), |mut stats, outcome| async move {
            match outcome {
                ItemOutcome::Fetched => stats.fetched += 1,
                ItemOutcome::Deleted => stats.deleted += 1,
                ItemOutcome::Skipped => stats.skipped += 1,
                ItemOutcome::Failed => stats.failed += 1,
                ItemOutcome::Interrupted => stats.interrupted += 1,
                ItemOutcome::Requeued => {}
            }
            stats
        })
        .await
}

async fn execute(shared: Arc<Shared>, item: WorkItem) -> ItemOutcome {
    let outcome = match item.kind {
        WorkKind::Fetch => execute_fetch(&shared, item).await,
        WorkKind::Delete => execute_delete(&shared, item).await,
    };
    if !matches!(outcome, ItemOutcome::Requeued) {
        shared.finish_one();
    }
    outcome
}

async fn execute_fetch(shared: &Arc<Shared>, item: WorkItem) -> ItemOutcome {
    if shared.cancel.is_cancelled() {
        return ItemOutcome::Interrupted;
    }

    // Compare-and-set pending/failed -> fetching; losing means another
    // worker owns the entry or it is already satisfied.
    match shared.store.claim_fetching(&item.remote_id).await {
        Ok(true) => {}
        Ok(false) => return ItemOutcome::Skipped,
        Err(e) => {
            tracing::error!("claim failed for {}: {}", item.remote_id, e);
            return ItemOutcome::Failed;
        }
    }

    shared.sink.emit(&SyncEvent::EntryStarted {
        path: item.target_path.clone(),
        kind: WorkKind::Fetch,
    });

    match fetch_and_commit(shared, &item).await {
        Ok(bytes) => match shared
            .store
            .mark_verified(&item.remote_id, &item.fingerprint)
            .await
        {
            Ok(true) => {
                shared.sink.emit(&SyncEvent::EntryCompleted {
                    path: item.target_path.clone(),
                    kind: WorkKind::Fetch,
                    bytes,
                });
                ItemOutcome::Fetched
            }
            Ok(false) => {
                // The entry changed while we fetched; what we wrote is
                // stale. Release the claim and chase the fresh revision.
                if let Err(e) = shared.store.requeue(&item.remote_id).await {
                    tracing::error!("requeue of {} failed: {}", item.remote_id, e);
                    return ItemOutcome::Failed;
                }
                if let Ok(Some(entry)) = shared.store.get(&item.remote_id).await {
                    if entry.status == EntryStatus::Pending {
                        tracing::debug!(
                            "{} changed mid-fetch, chasing revision {}",
                            item.remote_id,
                            entry.fingerprint
                        );
                        shared.resubmit(refetch_item(&entry));
                    }
                }
                ItemOutcome::Skipped
            }
            Err(e) => {
                tracing::error!("verify commit of {} failed: {}", item.remote_id, e);
                ItemOutcome::Failed
            }
        },
        Err(err) if err.is_permanent() => {
            if let Err(e) = shared
                .store
                .mark_failed(&item.remote_id, &err.to_string())
                .await
            {
                tracing::error!("mark_failed of {} failed: {}", item.remote_id, e);
            }
            if let FetchError::Remote(remote_err) = &err {
                if remote_err.is_fatal() {
                    // Auth died under us; stop feeding the pool and let the
                    // run end as interrupted.
                    tracing::error!("fatal remote error, stopping: {}", remote_err);
                    shared.cancel.cancel();
                }
            }
            shared.sink.emit(&SyncEvent::EntryFailed {
                path: item.target_path.clone(),
                error: err.to_string(),
            });
            ItemOutcome::Failed
        }
        Err(err) => {
            let recorded = shared
                .store
                .record_attempt_failure(
                    &item.remote_id,
                    &err.to_string(),
                    shared.config.max_attempts,
                )
                .await;
            match recorded {
                Ok((EntryStatus::Pending, attempts)) => {
                    let delay = shared.config.policy.delay_for_attempt(attempts.saturating_sub(1));
                    tracing::warn!(
                        "fetch of {} failed (attempt {}/{}), retrying in {}s: {}",
                        item.target_path,
                        attempts,
                        shared.config.max_attempts,
                        delay.as_secs(),
                        err
                    );
                    requeue_later(shared, item, delay);
                    ItemOutcome::Requeued
                }
                Ok((EntryStatus::Failed, attempts)) => {
                    tracing::error!(
                        "fetch of {} failed permanently after {} attempts: {}",
                        item.target_path,
                        attempts,
                        err
                    );
                    shared.sink.emit(&SyncEvent::EntryFailed {
                        path: item.target_path.clone(),
                        error: err.to_string(),
                    });
                    ItemOutcome::Failed
                }
                // Lost the row to a collision or sweep mid-attempt.
                Ok((_, _)) => ItemOutcome::Skipped,
                Err(e) => {
                    tracing::error!("attempt bookkeeping for {} failed: {}", item.remote_id, e);
                    ItemOutcome::Failed
                }
            }
        }
    }
}

/// Park the item for `delay`, then put it back on the queue. The pending
/// status is already persisted, so a stop signal during the pause simply
/// short-circuits the sleep and the worker settles the item as interrupted.
fn requeue_later(shared: &Arc<Shared>, item: WorkItem, delay: Duration) {
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.cancel.cancelled() => {}
        }
        let tx = shared.requeue_tx.lock().expect("requeue slot").clone();
        match tx {
            Some(tx) if tx.send(item).is_ok() => {}
            _ => shared.finish_one(),
        }
    });
}

async fn execute_delete(shared: &Arc<Shared>, item: WorkItem) -> ItemOutcome {
    if shared.cancel.is_cancelled() {
        return ItemOutcome::Interrupted;
    }

    shared.sink.emit(&SyncEvent::EntryStarted {
        path: item.target_path.clone(),
        kind: WorkKind::Delete,
    });

    let target = match resolve_target(&shared.config.destination, &item.target_path) {
        Ok(path) => path,
        Err(e) => {
            let _ = shared.store.mark_failed(&item.remote_id, &e.to_string()).await;
            return ItemOutcome::Failed;
        }
    };

    match tokio::fs::remove_file(&target).await {
        Ok(()) => tracing::debug!("deleted {}", target.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("already absent: {}", target.display());
        }
        Err(e) => {
            let error = format!("cannot delete {}: {}", target.display(), e);
            if let Err(e) = shared.store.mark_failed(&item.remote_id, &error).await {
                tracing::error!("mark_failed of {} failed: {}", item.remote_id, e);
            }
            shared.sink.emit(&SyncEvent::EntryFailed {
                path: item.target_path.clone(),
                error,
            });
            return ItemOutcome::Failed;
        }
    }

    if let Some(parent) = target.parent() {
        prune_empty_dirs(&shared.config.destination, parent);
    }

    match shared.store.mark_deleted(&item.remote_id).await {
        Ok(()) => {
            shared.sink.emit(&SyncEvent::EntryCompleted {
                path: item.target_path.clone(),
                kind: WorkKind::Delete,
                bytes: 0,
            });
            ItemOutcome::Deleted
        }
        Err(e) => {
            tracing::error!("mark_deleted of {} failed: {}", item.remote_id, e);
            ItemOutcome::Failed
        }
    }
}

/// Stream one entry into a temp file, fingerprint it, and move it into
/// place. Returns the byte count written.
async fn fetch_and_commit(shared: &Arc<Shared>, item: &WorkItem) -> Result<u64, FetchError> {
    let target = resolve_target(&shared.config.destination, &item.target_path)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let part = part_path(&target, &item.remote_id);
    // Always start from scratch so the fingerprint covers exactly what we
    // wrote this attempt.
    let _ = tokio::fs::remove_file(&part).await;

    let mut stream = shared.remote.fetch_content(&item.remote_id).await?;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&part)
        .await?;

    let mut hasher = BlockHasher::new();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    let actual = hasher.finalize();
    if actual != item.fingerprint {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(FetchError::FingerprintMismatch {
            path: item.target_path.clone(),
        });
    }

    // Stamp the remote mtime on the temp file so the finished file never
    // shows a transient timestamp.
    let mtime_path = part.clone();
    let secs = item.modified_at.timestamp();
    match tokio::task::spawn_blocking(move || set_file_mtime(&mtime_path, secs)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("could not set mtime on {}: {}", part.display(), e),
        Err(e) => tracing::warn!("mtime task failed: {}", e),
    }

    // Single rename: any prior file at the target is replaced whole.
    tokio::fs::rename(&part, &target).await?;

    if let Some(displaced) = &item.displaced_path {
        remove_displaced(shared, displaced).await;
    }

    Ok(written)
}

/// Remove the file left behind by a moved entry, unless some live entry now
/// owns that path.
async fn remove_displaced(shared: &Arc<Shared>, displaced: &str) {
    match shared.store.live_at_path(displaced).await {
        Ok(None) => {}
        Ok(Some(_)) => return,
        Err(e) => {
            tracing::warn!("could not check displaced path {}: {}", displaced, e);
            return;
        }
    }
    let Ok(path) = resolve_target(&shared.config.destination, displaced) else {
        return;
    };
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            tracing::debug!("removed displaced file {}", path.display());
            if let Some(parent) = path.parent() {
                prune_empty_dirs(&shared.config.destination, parent);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("could not remove displaced {}: {}", path.display(), e),
    }
}

/// Join a catalog path onto the destination root, rejecting anything that
/// would escape it.
pub(crate) fn resolve_target(root: &Path, relative: &str) -> Result<PathBuf, FetchError> {
    let trimmed = relative.trim_start_matches('/');
    let mut out = root.to_path_buf();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(FetchError::UnsafePath(relative.to_string())),
        }
    }
    if out == root {
        return Err(FetchError::UnsafePath(relative.to_string()));
    }
    Ok(out)
}

/// Hidden temp-file path next to the target, deterministic per remote id so
/// concurrent fetches never collide and stale parts get reused as scratch.
fn part_path(target: &Path, remote_id: &str) -> PathBuf {
    let token: String = remote_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    target
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{}.part", token))
}

/// Remove now-empty directories from `from` up to (never including) `root`.
fn prune_empty_dirs(root: &Path, from: &Path) {
    let mut dir = from.to_path_buf();
    while dir != *root && dir.starts_with(root) {
        let empty = match std::fs::read_dir(&dir) {
            Ok(mut iter) => iter.next().is_none(),
            Err(_) => break,
        };
        if !empty {
            break;
        }
        match std::fs::remove_dir(&dir) {
            Ok(()) => tracing::debug!("pruned empty directory {}", dir.display()),
            Err(_) => break,
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
}

/// Set modification and access times, clamping pre-epoch values.
fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(timestamp.unsigned_abs()))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    let times = std::fs::FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::engine::events::NoopSink;
    use crate::engine::reconcile::plan_page;
    use crate::fingerprint;
    use crate::manifest::SqliteManifest;
    use crate::remote::mock::MockRemote;
    use crate::remote::RemoteEntry;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("cloudmirror_scheduler_tests")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn no_delay() -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            base_delay_secs: 0,
            max_delay_secs: 0,
        }
    }

    fn spawn_scheduler(
        store: &Arc<SqliteManifest>,
        remote: &Arc<MockRemote>,
        destination: PathBuf,
        max_attempts: u32,
        cancel: CancellationToken,
    ) -> FetchScheduler {
        FetchScheduler::spawn(
            store.clone() as Arc<dyn ManifestStore>,
            remote.clone() as Arc<dyn RemoteStore>,
            Arc::new(NoopSink),
            cancel,
            SchedulerConfig {
                concurrency: 4,
                max_attempts,
                policy: no_delay(),
                destination,
            },
        )
    }

    async fn seed(
        remote: &Arc<MockRemote>,
        store: &Arc<SqliteManifest>,
    ) -> Vec<WorkItem> {
        let page = remote.list_changes(None).await.unwrap();
        let items = plan_page(&page.entries, &HashMap::new());
        store.record_page(&page.entries, 1).await.unwrap();
        items
    }

    #[tokio::test]
    async fn fetch_commits_file_and_marks_verified() {
        let dir = scratch("fetch_commit");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file("id:a", "docs/a.txt", b"hello mirror");
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());
        let items = seed(&remote, &store).await;

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 3, CancellationToken::new());
        for item in items {
            scheduler.submit(item);
        }
        let stats = scheduler.drain().await.unwrap();

        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.failed, 0);
        let written = std::fs::read(dir.join("docs/a.txt")).unwrap();
        assert_eq!(written, b"hello mirror");
        let entry = store.get("id:a").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Verified);
        // No temp leftovers.
        assert!(std::fs::read_dir(dir.join("docs"))
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".part")));
    }

    #[tokio::test]
    async fn fetch_sets_remote_mtime() {
        let dir = scratch("fetch_mtime");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file_at("id:a", "a.txt", b"content", 1_600_000_000);
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());
        let items = seed(&remote, &store).await;

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 3, CancellationToken::new());
        for item in items {
            scheduler.submit(item);
        }
        scheduler.drain().await.unwrap();

        let mtime = std::fs::metadata(dir.join("a.txt"))
            .unwrap()
            .modified()
            .unwrap();
        let expected = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
        assert_eq!(mtime, expected);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let dir = scratch("transient_retry");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file("id:a", "a.txt", b"eventually");
        remote.fail_fetch("id:a", 1);
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());
        let items = seed(&remote, &store).await;

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 3, CancellationToken::new());
        for item in items {
            scheduler.submit(item);
        }
        let stats = scheduler.drain().await.unwrap();

        assert_eq!(stats.fetched, 1);
        assert_eq!(remote.fetch_count("id:a"), 2);
        let entry = store.get("id:a").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Verified);
        assert_eq!(entry.attempt_count, 1);
    }

    #[tokio::test]
    async fn retry_ceiling_settles_on_failed() {
        let dir = scratch("retry_ceiling");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file("id:a", "a.txt", b"never");
        remote.fail_fetch("id:a", 100);
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());
        let items = seed(&remote, &store).await;

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 2, CancellationToken::new());
        for item in items {
            scheduler.submit(item);
        }
        let stats = scheduler.drain().await.unwrap();

        assert_eq!(stats.fetched, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(remote.fetch_count("id:a"), 2);
        let entry = store.get("id:a").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.attempt_count, 2);
        assert!(entry.last_error.is_some());
        assert!(!dir.join("a.txt").exists());
    }

    #[tokio::test]
    async fn fingerprint_mismatch_is_transient_and_leaves_no_file() {
        let dir = scratch("mismatch");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file("id:a", "a.txt", b"actual content");
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());

        // Manifest expects different content than the remote serves.
        let bogus = RemoteEntry {
            remote_id: "id:a".into(),
            path: "a.txt".into(),
            fingerprint: fingerprint::fingerprint_bytes(b"expected content"),
            size_bytes: 16,
            modified_at: chrono::Utc::now(),
        };
        store.record_page(std::slice::from_ref(&bogus), 1).await.unwrap();
        let items = plan_page(std::slice::from_ref(&bogus), &HashMap::new());

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 2, CancellationToken::new());
        for item in items {
            scheduler.submit(item);
        }
        let stats = scheduler.drain().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(remote.fetch_count("id:a"), 2);
        assert!(!dir.join("a.txt").exists());
        assert!(std::fs::read_dir(&dir)
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".part")));
        let entry = store.get("id:a").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert!(entry.last_error.unwrap().contains("fingerprint mismatch"));
    }

    #[tokio::test]
    async fn vanished_entry_fails_without_retry() {
        let dir = scratch("vanished");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file("id:a", "a.txt", b"soon gone");
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());
        let items = seed(&remote, &store).await;
        remote.vanish_content("id:a");

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 5, CancellationToken::new());
        for item in items {
            scheduler.submit(item);
        }
        let stats = scheduler.drain().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(remote.fetch_count("id:a"), 1);
        let entry = store.get("id:a").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_submission_is_deduplicated_by_claim() {
        let dir = scratch("dup_claim");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file("id:a", "a.txt", b"once");
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());
        let items = seed(&remote, &store).await;

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 3, CancellationToken::new());
        scheduler.submit(items[0].clone());
        scheduler.submit(items[0].clone());
        let stats = scheduler.drain().await.unwrap();

        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(remote.fetch_count("id:a"), 1);
    }

    #[tokio::test]
    async fn delete_removes_file_and_prunes_empty_dirs() {
        let dir = scratch("delete_prune");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file("id:a", "sub/deep/a.txt", b"bye");
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());
        let items = seed(&remote, &store).await;

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 3, CancellationToken::new());
        for item in items {
            scheduler.submit(item);
        }
        scheduler.drain().await.unwrap();
        assert!(dir.join("sub/deep/a.txt").exists());

        let entry = store.get("id:a").await.unwrap().unwrap();
        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 3, CancellationToken::new());
        scheduler.submit(WorkItem {
            remote_id: entry.remote_id.clone(),
            kind: WorkKind::Delete,
            target_path: entry.path.clone(),
            fingerprint: entry.fingerprint.clone(),
            size_bytes: entry.size_bytes,
            modified_at: entry.modified_at,
            displaced_path: None,
        });
        let stats = scheduler.drain().await.unwrap();

        assert_eq!(stats.deleted, 1);
        assert!(!dir.join("sub/deep/a.txt").exists());
        assert!(!dir.join("sub/deep").exists());
        assert!(!dir.join("sub").exists());
        assert!(dir.exists());
        let entry = store.get("id:a").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Deleted);
    }

    #[tokio::test]
    async fn delete_tolerates_missing_file() {
        let dir = scratch("delete_absent");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file("id:a", "a.txt", b"never fetched");
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());
        seed(&remote, &store).await;

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 3, CancellationToken::new());
        scheduler.submit(WorkItem {
            remote_id: "id:a".into(),
            kind: WorkKind::Delete,
            target_path: "a.txt".into(),
            fingerprint: "f".into(),
            size_bytes: 0,
            modified_at: chrono::Utc::now(),
            displaced_path: None,
        });
        let stats = scheduler.drain().await.unwrap();

        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn cancelled_queue_leaves_entries_pending() {
        let dir = scratch("cancelled");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file("id:a", "a.txt", b"aa");
        remote.set_file("id:b", "b.txt", b"bb");
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());
        let items = seed(&remote, &store).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let scheduler = spawn_scheduler(&store, &remote, dir.clone(), 3, cancel);
        for item in items {
            scheduler.submit(item);
        }
        let stats = scheduler.drain().await.unwrap();

        assert_eq!(stats.interrupted, 2);
        assert_eq!(remote.total_fetches(), 0);
        assert!(store
            .list_by_status(EntryStatus::Fetching)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.list_by_status(EntryStatus::Pending).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn unsafe_path_is_rejected_permanently() {
        let dir = scratch("unsafe_path");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file("id:evil", "../evil.txt", b"nope");
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());
        let items = seed(&remote, &store).await;

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 5, CancellationToken::new());
        for item in items {
            scheduler.submit(item);
        }
        let stats = scheduler.drain().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert!(!dir.parent().unwrap().join("evil.txt").exists());
        let entry = store.get("id:evil").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn moved_entry_cleans_up_displaced_file() {
        let dir = scratch("displaced");
        let remote = Arc::new(MockRemote::new(100));
        remote.set_file("id:a", "old/a.txt", b"same bytes");
        let store = Arc::new(SqliteManifest::open_in_memory().unwrap());
        let items = seed(&remote, &store).await;

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 3, CancellationToken::new());
        for item in items {
            scheduler.submit(item);
        }
        scheduler.drain().await.unwrap();
        assert!(dir.join("old/a.txt").exists());

        // The entry moves; plan against the old snapshot produces the
        // displaced cleanup.
        let old_snapshot = store.snapshot(&["id:a".to_string()]).await.unwrap();
        remote.set_file("id:a", "new/a.txt", b"same bytes");
        let page = remote.list_changes(None).await.unwrap();
        let items = plan_page(&page.entries, &old_snapshot);
        store.record_page(&page.entries, 2).await.unwrap();

        let scheduler =
            spawn_scheduler(&store, &remote, dir.clone(), 3, CancellationToken::new());
        for item in items {
            scheduler.submit(item);
        }
        let stats = scheduler.drain().await.unwrap();

        assert_eq!(stats.fetched, 1);
        assert!(dir.join("new/a.txt").exists());
        assert!(!dir.join("old/a.txt").exists());
        assert!(!dir.join("old").exists());
    }

    #[test]
    fn resolve_target_joins_and_rejects_escapes() {
        let root = Path::new("/mirror");
        assert_eq!(
            resolve_target(root, "/docs/a.txt").unwrap(),
            PathBuf::from("/mirror/docs/a.txt")
        );
        assert_eq!(
            resolve_target(root, "docs/./a.txt").unwrap(),
            PathBuf::from("/mirror/docs/a.txt")
        );
        assert!(resolve_target(root, "../escape.txt").is_err());
        assert!(resolve_target(root, "docs/../../escape.txt").is_err());
        assert!(resolve_target(root, "").is_err());
    }

    #[test]
    fn part_path_is_hidden_and_sanitized() {
        let part = part_path(Path::new("/mirror/docs/a.txt"), "id:ab/3");
        assert_eq!(part, PathBuf::from("/mirror/docs/.id-ab-3.part"));
    }

    #[test]
    fn prune_stops_at_root_and_nonempty_dirs() {
        let dir = scratch("prune_unit");
        let nested = dir.join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.join("a/keep.txt"), b"x").unwrap();

        prune_empty_dirs(&dir, &nested);
        assert!(!dir.join("a/b").exists());
        assert!(dir.join("a").exists());
        assert!(dir.exists());
    }
}
