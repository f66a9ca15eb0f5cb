//! Reconciliation: diff a catalog page against a manifest snapshot and emit
//! the work items that close the gap.
//!
//! Pure planning — no I/O. Work items are never persisted; they can always
//! be re-derived from the manifest and the last committed cursor, which is
//! what makes a crash mid-fetch recoverable.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::manifest::{EntryStatus, ManifestEntry};
use crate::remote::RemoteEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Fetch,
    Delete,
}

/// One planned operation against the local tree.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub remote_id: String,
    pub kind: WorkKind,
    /// Path relative to the destination root.
    pub target_path: String,
    /// Fingerprint the fetched content must hash to. For deletes, the last
    /// known fingerprint (informational).
    pub fingerprint: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    /// Previous path of the same entry when it moved; the stale file there
    /// is removed after the fetch commits, unless another live entry has
    /// claimed the path meanwhile.
    pub displaced_path: Option<String>,
}

/// Plan one catalog page against a pre-update manifest snapshot.
///
/// No manifest row -> fetch. Fingerprint or path changed -> fetch
/// (overwrite; remote wins). Fingerprint and path unchanged: `verified`
/// needs nothing (the dedup path that skips redundant transfer), `pending`
/// is re-derived work from an interrupted run, `fetching` is already owned
/// by a worker, and `failed` stays parked until content changes or the
/// operator runs `retry-failed`.
pub fn plan_page(
    entries: &[RemoteEntry],
    snapshot: &HashMap<String, ManifestEntry>,
) -> Vec<WorkItem> {
    let mut items: Vec<WorkItem> = Vec::new();

    for entry in entries {
        // A page can list the same id twice; the later revision wins.
        items.retain(|i| i.remote_id != entry.remote_id);

        let item = match snapshot.get(&entry.remote_id) {
            None => Some(fetch_item(entry, None)),
            Some(known) => {
                if known.status == EntryStatus::Deleted {
                    Some(fetch_item(entry, None))
                } else if known.fingerprint != entry.fingerprint || known.path != entry.path {
                    let displaced = (known.path != entry.path).then(|| known.path.clone());
                    Some(fetch_item(entry, displaced))
                } else {
                    match known.status {
                        EntryStatus::Pending => Some(fetch_item(entry, None)),
                        EntryStatus::Verified
                        | EntryStatus::Fetching
                        | EntryStatus::Failed
                        | EntryStatus::Deleted => None,
                    }
                }
            }
        };
        items.extend(item);
    }

    items
}

/// Turn the entries a completed full walk never observed into delete items.
pub fn plan_deletions(unseen: &[ManifestEntry]) -> Vec<WorkItem> {
    unseen
        .iter()
        .map(|entry| WorkItem {
            remote_id: entry.remote_id.clone(),
            kind: WorkKind::Delete,
            target_path: entry.path.clone(),
            fingerprint: entry.fingerprint.clone(),
            size_bytes: entry.size_bytes,
            modified_at: entry.modified_at,
            displaced_path: None,
        })
        .collect()
}

/// Re-derive a fetch for a manifest row (interrupted-run backlog).
pub fn refetch_item(entry: &ManifestEntry) -> WorkItem {
    WorkItem {
        remote_id: entry.remote_id.clone(),
        kind: WorkKind::Fetch,
        target_path: entry.path.clone(),
        fingerprint: entry.fingerprint.clone(),
        size_bytes: entry.size_bytes,
        modified_at: entry.modified_at,
        displaced_path: None,
    }
}

fn fetch_item(entry: &RemoteEntry, displaced_path: Option<String>) -> WorkItem {
    WorkItem {
        remote_id: entry.remote_id.clone(),
        kind: WorkKind::Fetch,
        target_path: entry.path.clone(),
        fingerprint: entry.fingerprint.clone(),
        size_bytes: entry.size_bytes,
        modified_at: entry.modified_at,
        displaced_path,
    }
}
