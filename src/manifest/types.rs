//! Manifest row types.

use chrono::{DateTime, Utc};

/// Lifecycle of one mirrored entry.
///
/// `pending -> fetching -> verified` on the happy path; `fetching` is held
/// by at most one worker at a time (compare-and-set in the store). `deleted`
/// is a tombstone that frees the path for reuse without forgetting the
/// `remote_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Fetching,
    Verified,
    Deleted,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Verified => "verified",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "fetching" => Some(Self::Fetching),
            "verified" => Some(Self::Verified),
            "deleted" => Some(Self::Deleted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row of the `entries` table.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    /// Stable provider identifier, primary key.
    pub remote_id: String,
    /// Current path relative to the destination root. Unique among rows not
    /// in `deleted` status.
    pub path: String,
    /// Provider content fingerprint the local copy must hash to.
    pub fingerprint: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    pub status: EntryStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Catalog walk that last observed this entry; drives the deletion sweep.
    pub last_seen_walk: i64,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Pagination position for one sync root.
#[derive(Debug, Clone)]
pub struct CursorState {
    /// `None` between completed walks, `Some` while a walk is in flight.
    pub cursor: Option<String>,
    pub walk_id: i64,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Counts for one finished engine pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub fetched: u64,
    pub deleted: u64,
    pub failed: u64,
    pub skipped: u64,
    pub interrupted: bool,
}

/// Aggregate view for the `status` subcommand.
#[derive(Debug, Clone)]
pub struct MirrorSummary {
    pub total: u64,
    pub verified: u64,
    pub pending: u64,
    pub failed: u64,
    pub deleted: u64,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_completed: Option<DateTime<Utc>>,
}
