//! Manifest store trait and SQLite implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::ManifestError;
use super::schema;
use super::types::{CursorState, EntryStatus, ManifestEntry, MirrorSummary, RunStats};
use crate::remote::RemoteEntry;

/// Durable manifest operations.
///
/// Object-safe so the scheduler's workers can share an
/// `Arc<dyn ManifestStore>`. All mutations are transactional; per-entry
/// write exclusivity is enforced by [`claim_fetching`]'s compare-and-set,
/// so cross-worker coordination never relies on in-memory state.
///
/// [`claim_fetching`]: ManifestStore::claim_fetching
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Record one catalog page in a single transaction.
    ///
    /// New ids insert as `pending`. Existing ids keep their status when
    /// neither fingerprint nor path changed; any change (or a `deleted`
    /// tombstone being re-listed) resets the row to `pending` with a fresh
    /// attempt budget. A live row held by a *different* id at one of the
    /// page's paths is tombstoned first, so no two live rows ever share a
    /// path. Rows in `fetching` only get their metadata refreshed — the
    /// in-flight worker resolves the status via the fingerprint guard on
    /// [`mark_verified`](ManifestStore::mark_verified).
    async fn record_page(&self, entries: &[RemoteEntry], walk_id: i64)
        -> Result<(), ManifestError>;

    async fn get(&self, remote_id: &str) -> Result<Option<ManifestEntry>, ManifestError>;

    /// Read a snapshot of the given ids for reconciliation.
    async fn snapshot(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ManifestEntry>, ManifestError>;

    /// The live (non-deleted) entry at a path, if any.
    async fn live_at_path(&self, path: &str) -> Result<Option<ManifestEntry>, ManifestError>;

    async fn list_by_status(&self, status: EntryStatus) -> Result<Vec<ManifestEntry>, ManifestError>;

    /// Live entries not observed by walk `walk_id` — deletion-sweep
    /// candidates after a completed full walk.
    async fn list_unseen_since(&self, walk_id: i64) -> Result<Vec<ManifestEntry>, ManifestError>;

    /// Compare-and-set `pending`/`failed` -> `fetching`. Returns whether
    /// this caller won the claim; at most one worker holds `fetching` for a
    /// given id.
    async fn claim_fetching(&self, remote_id: &str) -> Result<bool, ManifestError>;

    /// Commit a verified fetch: `fetching` -> `verified`, guarded on the
    /// fingerprint still being the one that was fetched. Returns false when
    /// the entry changed mid-flight (or lost its claim), in which case the
    /// written file is stale and the entry must be re-planned.
    async fn mark_verified(&self, remote_id: &str, fingerprint: &str)
        -> Result<bool, ManifestError>;

    /// Release a claim without consuming an attempt: `fetching` -> `pending`.
    async fn requeue(&self, remote_id: &str) -> Result<(), ManifestError>;

    /// Record a transient attempt failure: increments `attempt_count`,
    /// releases to `pending` while attempts remain, otherwise settles on
    /// `failed`. Returns the resulting status and attempt count.
    async fn record_attempt_failure(
        &self,
        remote_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> Result<(EntryStatus, u32), ManifestError>;

    /// Permanent per-entry failure; no retry.
    async fn mark_failed(&self, remote_id: &str, error: &str) -> Result<(), ManifestError>;

    async fn mark_deleted(&self, remote_id: &str) -> Result<(), ManifestError>;

    /// `failed` -> `pending` with a fresh attempt budget. Returns rows reset.
    async fn reset_failed(&self) -> Result<u64, ManifestError>;

    /// Full resync: every live row back to `pending`, cursor cleared.
    async fn reset_all(&self, root: &str) -> Result<u64, ManifestError>;

    async fn summary(&self) -> Result<MirrorSummary, ManifestError>;

    async fn load_cursor(&self, root: &str) -> Result<Option<CursorState>, ManifestError>;

    /// Start or resume a catalog walk. With no stored cursor a fresh walk
    /// begins (walk id increments); otherwise the interrupted walk resumes
    /// under its original id so the deletion sweep stays sound.
    async fn begin_walk(&self, root: &str) -> Result<(i64, Option<String>), ManifestError>;

    /// Persist the cursor returned by a page. Called only after that page's
    /// manifest transaction committed.
    async fn advance_cursor(&self, root: &str, cursor: &str) -> Result<(), ManifestError>;

    /// Mark the in-flight walk finished: cursor cleared, success time set.
    async fn complete_walk(&self, root: &str) -> Result<(), ManifestError>;

    async fn start_run(&self) -> Result<i64, ManifestError>;

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), ManifestError>;
}

/// SQLite-backed manifest.
pub struct SqliteManifest {
    /// rusqlite::Connection is not Sync; guard dropped before any await.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteManifest")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

const ENTRY_COLUMNS: &str = "remote_id, path, fingerprint, size_bytes, modified_at, status, \
                             attempt_count, last_error, last_seen_walk, verified_at";

impl SqliteManifest {
    pub async fn open(path: &Path) -> Result<Self, ManifestError> {
        let path = path.to_path_buf();
        let open_path = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&open_path).map_err(|e| ManifestError::Open {
                path: open_path.clone(),
                source: e,
            })?;
            // WAL keeps status reads cheap while workers commit.
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(ManifestError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(ManifestError::Migration)?;
            schema::migrate(&conn)?;
            Ok::<_, ManifestError>(conn)
        })
        .await
        .map_err(|e| ManifestError::Query(e.to_string()))??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, ManifestError> {
        let conn = Connection::open_in_memory().map_err(|e| ManifestError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ManifestError> {
        self.conn
            .lock()
            .map_err(|e| ManifestError::Query(e.to_string()))
    }
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManifestEntry> {
    let status: String = row.get(5)?;
    let modified_at: i64 = row.get(4)?;
    let verified_at: Option<i64> = row.get(9)?;
    Ok(ManifestEntry {
        remote_id: row.get(0)?,
        path: row.get(1)?,
        fingerprint: row.get(2)?,
        size_bytes: row.get::<_, i64>(3)? as u64,
        modified_at: timestamp(modified_at),
        status: EntryStatus::from_str(&status).unwrap_or(EntryStatus::Pending),
        attempt_count: row.get::<_, i64>(6)? as u32,
        last_error: row.get(7)?,
        last_seen_walk: row.get(8)?,
        verified_at: verified_at.map(timestamp),
    })
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[async_trait]
impl ManifestStore for SqliteManifest {
    async fn record_page(
        &self,
        entries: &[RemoteEntry],
        walk_id: i64,
    ) -> Result<(), ManifestError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(ManifestError::query)?;

        for entry in entries {
            // A different id holding this path loses it (remote wins).
            let displaced = tx
                .execute(
                    "UPDATE entries SET status = 'deleted'
                     WHERE path = ?1 AND remote_id != ?2 AND status != 'deleted'",
                    rusqlite::params![entry.path, entry.remote_id],
                )
                .map_err(ManifestError::query)?;
            if displaced > 0 {
                tracing::debug!(path = %entry.path, "path reassigned to {}", entry.remote_id);
            }

            let existing: Option<(String, String, String)> = tx
                .query_row(
                    "SELECT status, fingerprint, path FROM entries WHERE remote_id = ?1",
                    [&entry.remote_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(ManifestError::query)?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO entries
                         (remote_id, path, fingerprint, size_bytes, modified_at, status,
                          attempt_count, last_error, last_seen_walk)
                         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, NULL, ?6)",
                        rusqlite::params![
                            entry.remote_id,
                            entry.path,
                            entry.fingerprint,
                            entry.size_bytes as i64,
                            entry.modified_at.timestamp(),
                            walk_id,
                        ],
                    )
                    .map_err(ManifestError::query)?;
                }
                Some((status, fingerprint, path)) => {
                    let status = EntryStatus::from_str(&status).unwrap_or(EntryStatus::Pending);
                    let unchanged = fingerprint == entry.fingerprint && path == entry.path;

                    if status == EntryStatus::Fetching {
                        // Leave the claim alone; the worker's fingerprint
                        // guard settles who wins.
                        tx.execute(
                            "UPDATE entries SET path = ?2, fingerprint = ?3, size_bytes = ?4,
                                 modified_at = ?5, last_seen_walk = ?6
                             WHERE remote_id = ?1",
                            rusqlite::params![
                                entry.remote_id,
                                entry.path,
                                entry.fingerprint,
                                entry.size_bytes as i64,
                                entry.modified_at.timestamp(),
                                walk_id,
                            ],
                        )
                        .map_err(ManifestError::query)?;
                    } else if unchanged && status != EntryStatus::Deleted {
                        tx.execute(
                            "UPDATE entries SET size_bytes = ?2, modified_at = ?3,
                                 last_seen_walk = ?4
                             WHERE remote_id = ?1",
                            rusqlite::params![
                                entry.remote_id,
                                entry.size_bytes as i64,
                                entry.modified_at.timestamp(),
                                walk_id,
                            ],
                        )
                        .map_err(ManifestError::query)?;
                    } else {
                        // Content changed, moved, or a tombstone came back.
                        tx.execute(
                            "UPDATE entries SET path = ?2, fingerprint = ?3, size_bytes = ?4,
                                 modified_at = ?5, last_seen_walk = ?6, status = 'pending',
                                 attempt_count = 0, last_error = NULL
                             WHERE remote_id = ?1",
                            rusqlite::params![
                                entry.remote_id,
                                entry.path,
                                entry.fingerprint,
                                entry.size_bytes as i64,
                                entry.modified_at.timestamp(),
                                walk_id,
                            ],
                        )
                        .map_err(ManifestError::query)?;
                    }
                }
            }
        }

        tx.commit().map_err(ManifestError::query)
    }

    async fn get(&self, remote_id: &str) -> Result<Option<ManifestEntry>, ManifestError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE remote_id = ?1"),
            [remote_id],
            entry_from_row,
        )
        .optional()
        .map_err(ManifestError::query)
    }

    async fn snapshot(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ManifestEntry>, ManifestError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries WHERE remote_id = ?1"
            ))
            .map_err(ManifestError::query)?;

        let mut map = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = stmt
                .query_row([id], entry_from_row)
                .optional()
                .map_err(ManifestError::query)?
            {
                map.insert(id.clone(), entry);
            }
        }
        Ok(map)
    }

    async fn live_at_path(&self, path: &str) -> Result<Option<ManifestEntry>, ManifestError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM entries WHERE path = ?1 AND status != 'deleted'"
            ),
            [path],
            entry_from_row,
        )
        .optional()
        .map_err(ManifestError::query)
    }

    async fn list_by_status(
        &self,
        status: EntryStatus,
    ) -> Result<Vec<ManifestEntry>, ManifestError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries WHERE status = ?1 ORDER BY path"
            ))
            .map_err(ManifestError::query)?;
        let rows = stmt
            .query_map([status.as_str()], entry_from_row)
            .map_err(ManifestError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(ManifestError::query)?;
        Ok(rows)
    }

    async fn list_unseen_since(&self, walk_id: i64) -> Result<Vec<ManifestEntry>, ManifestError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries
                 WHERE last_seen_walk < ?1 AND status != 'deleted' ORDER BY path"
            ))
            .map_err(ManifestError::query)?;
        let rows = stmt
            .query_map([walk_id], entry_from_row)
            .map_err(ManifestError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(ManifestError::query)?;
        Ok(rows)
    }

    async fn claim_fetching(&self, remote_id: &str) -> Result<bool, ManifestError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE entries SET status = 'fetching'
                 WHERE remote_id = ?1 AND status IN ('pending', 'failed')",
                [remote_id],
            )
            .map_err(ManifestError::query)?;
        Ok(rows == 1)
    }

    async fn mark_verified(
        &self,
        remote_id: &str,
        fingerprint: &str,
    ) -> Result<bool, ManifestError> {
        let verified_at = Utc::now().timestamp();
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE entries SET status = 'verified', verified_at = ?1, last_error = NULL
                 WHERE remote_id = ?2 AND status = 'fetching' AND fingerprint = ?3",
                rusqlite::params![verified_at, remote_id, fingerprint],
            )
            .map_err(ManifestError::query)?;
        Ok(rows == 1)
    }

    async fn requeue(&self, remote_id: &str) -> Result<(), ManifestError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE entries SET status = 'pending'
             WHERE remote_id = ?1 AND status = 'fetching'",
            [remote_id],
        )
        .map_err(ManifestError::query)?;
        Ok(())
    }

    async fn record_attempt_failure(
        &self,
        remote_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> Result<(EntryStatus, u32), ManifestError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(ManifestError::query)?;

        let row: Option<(String, i64)> = tx
            .query_row(
                "SELECT status, attempt_count FROM entries WHERE remote_id = ?1",
                [remote_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(ManifestError::query)?;

        let (status, attempts) = match row {
            Some((status, attempts)) => (
                EntryStatus::from_str(&status).unwrap_or(EntryStatus::Pending),
                attempts as u32,
            ),
            None => return Err(ManifestError::Query(format!("unknown entry {remote_id}"))),
        };

        if status != EntryStatus::Fetching {
            // Lost the claim mid-attempt (e.g. tombstoned by a collision);
            // nothing to record.
            tx.commit().map_err(ManifestError::query)?;
            return Ok((status, attempts));
        }

        let next = attempts + 1;
        let new_status = if next >= max_attempts {
            EntryStatus::Failed
        } else {
            EntryStatus::Pending
        };
        tx.execute(
            "UPDATE entries SET status = ?1, attempt_count = ?2, last_error = ?3
             WHERE remote_id = ?4",
            rusqlite::params![new_status.as_str(), next as i64, error, remote_id],
        )
        .map_err(ManifestError::query)?;
        tx.commit().map_err(ManifestError::query)?;

        Ok((new_status, next))
    }

    async fn mark_failed(&self, remote_id: &str, error: &str) -> Result<(), ManifestError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE entries SET status = 'failed', attempt_count = attempt_count + 1,
                 last_error = ?1
             WHERE remote_id = ?2",
            rusqlite::params![error, remote_id],
        )
        .map_err(ManifestError::query)?;
        Ok(())
    }

    async fn mark_deleted(&self, remote_id: &str) -> Result<(), ManifestError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE entries SET status = 'deleted', last_error = NULL WHERE remote_id = ?1",
            [remote_id],
        )
        .map_err(ManifestError::query)?;
        Ok(())
    }

    async fn reset_failed(&self) -> Result<u64, ManifestError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE entries SET status = 'pending', attempt_count = 0, last_error = NULL
                 WHERE status = 'failed'",
                [],
            )
            .map_err(ManifestError::query)?;
        Ok(rows as u64)
    }

    async fn reset_all(&self, root: &str) -> Result<u64, ManifestError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(ManifestError::query)?;
        let rows = tx
            .execute(
                "UPDATE entries SET status = 'pending', attempt_count = 0, last_error = NULL,
                     verified_at = NULL
                 WHERE status != 'deleted'",
                [],
            )
            .map_err(ManifestError::query)?;
        tx.execute(
            "UPDATE cursor_state SET cursor = NULL WHERE root = ?1",
            [root],
        )
        .map_err(ManifestError::query)?;
        tx.commit().map_err(ManifestError::query)?;
        Ok(rows as u64)
    }

    async fn summary(&self) -> Result<MirrorSummary, ManifestError> {
        let conn = self.lock()?;

        let count = |status: &str| -> Result<u64, ManifestError> {
            conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE status = ?1",
                [status],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(ManifestError::query)
        };

        let total: u64 = conn
            .query_row("SELECT COUNT(*) FROM entries", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(ManifestError::query)? as u64;

        let last_run: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(ManifestError::query)?;
        let (started, completed) = last_run.unwrap_or((None, None));

        Ok(MirrorSummary {
            total,
            verified: count("verified")?,
            pending: count("pending")? + count("fetching")?,
            failed: count("failed")?,
            deleted: count("deleted")?,
            last_run_started: started.map(timestamp),
            last_run_completed: completed.map(timestamp),
        })
    }

    async fn load_cursor(&self, root: &str) -> Result<Option<CursorState>, ManifestError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT cursor, walk_id, last_success_at FROM cursor_state WHERE root = ?1",
            [root],
            |row| {
                let last: Option<i64> = row.get(2)?;
                Ok(CursorState {
                    cursor: row.get(0)?,
                    walk_id: row.get(1)?,
                    last_success_at: last.map(timestamp),
                })
            },
        )
        .optional()
        .map_err(ManifestError::query)
    }

    async fn begin_walk(&self, root: &str) -> Result<(i64, Option<String>), ManifestError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(ManifestError::query)?;

        tx.execute(
            "INSERT OR IGNORE INTO cursor_state (root, cursor, walk_id) VALUES (?1, NULL, 0)",
            [root],
        )
        .map_err(ManifestError::query)?;

        let (cursor, walk_id): (Option<String>, i64) = tx
            .query_row(
                "SELECT cursor, walk_id FROM cursor_state WHERE root = ?1",
                [root],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(ManifestError::query)?;

        let result = match cursor {
            Some(cursor) => (walk_id, Some(cursor)),
            None => {
                tx.execute(
                    "UPDATE cursor_state SET walk_id = walk_id + 1 WHERE root = ?1",
                    [root],
                )
                .map_err(ManifestError::query)?;
                (walk_id + 1, None)
            }
        };

        tx.commit().map_err(ManifestError::query)?;
        Ok(result)
    }

    async fn advance_cursor(&self, root: &str, cursor: &str) -> Result<(), ManifestError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE cursor_state SET cursor = ?1 WHERE root = ?2",
            rusqlite::params![cursor, root],
        )
        .map_err(ManifestError::query)?;
        Ok(())
    }

    async fn complete_walk(&self, root: &str) -> Result<(), ManifestError> {
        let now = Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "UPDATE cursor_state SET cursor = NULL, last_success_at = ?1 WHERE root = ?2",
            rusqlite::params![now, root],
        )
        .map_err(ManifestError::query)?;
        Ok(())
    }

    async fn start_run(&self) -> Result<i64, ManifestError> {
        let started_at = Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (started_at) VALUES (?1)",
            [started_at],
        )
        .map_err(ManifestError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), ManifestError> {
        let completed_at = Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, fetched = ?2, deleted = ?3, failed = ?4,
                 skipped = ?5, interrupted = ?6
             WHERE id = ?7",
            rusqlite::params![
                completed_at,
                stats.fetched as i64,
                stats.deleted as i64,
                stats.failed as i64,
                stats.skipped as i64,
                stats.interrupted as i64,
                run_id,
            ],
        )
        .map_err(ManifestError::query)?;
        Ok(())
    }
}
