//! Schema DDL and migrations.

use rusqlite::Connection;

use super::error::ManifestError;

/// Current schema version, tracked in the `user_version` pragma.
pub const SCHEMA_VERSION: i32 = 1;

// Path uniqueness is enforced only among live rows: tombstones may pile up
// on a path that was reused by a different remote_id.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    remote_id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    modified_at INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_seen_walk INTEGER NOT NULL DEFAULT 0,
    verified_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_entries_status ON entries(status);
CREATE INDEX IF NOT EXISTS idx_entries_last_seen_walk ON entries(last_seen_walk);
CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_live_path
    ON entries(path) WHERE status != 'deleted';

CREATE TABLE IF NOT EXISTS cursor_state (
    root TEXT PRIMARY KEY,
    cursor TEXT,
    walk_id INTEGER NOT NULL DEFAULT 0,
    last_success_at INTEGER
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    fetched INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    interrupted INTEGER NOT NULL DEFAULT 0
);
"#;

pub(crate) fn schema_version(conn: &Connection) -> Result<i32, ManifestError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), ManifestError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initialize or migrate. Idempotent; refuses databases written by a newer
/// cloudmirror.
pub(crate) fn migrate(conn: &Connection) -> Result<(), ManifestError> {
    let current = schema_version(conn)?;

    if current > SCHEMA_VERSION {
        return Err(ManifestError::UnsupportedSchemaVersion {
            found: current,
            expected: SCHEMA_VERSION,
        });
    }

    if current == 0 {
        conn.execute_batch(SCHEMA_V1)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("initialized manifest schema at version {}", SCHEMA_VERSION);
    } else if current < SCHEMA_VERSION {
        for version in (current + 1)..=SCHEMA_VERSION {
            migrate_to(conn, version)?;
        }
    }

    Ok(())
}

fn migrate_to(conn: &Connection, version: i32) -> Result<(), ManifestError> {
    // Incremental migrations land here as the schema evolves past v1.
    conn.execute_batch(SCHEMA_V1)?;
    set_schema_version(conn, version)?;
    tracing::info!("migrated manifest to schema version {}", version);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_migrates_to_current() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn migration_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(
            migrate(&conn),
            Err(ManifestError::UnsupportedSchemaVersion { .. })
        ));
    }

    #[test]
    fn tables_exist_after_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        for table in ["entries", "cursor_state", "sync_runs"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn live_path_index_allows_tombstone_reuse() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO entries (remote_id, path, fingerprint, size_bytes, modified_at, status)
             VALUES ('a', 'x.txt', 'f1', 1, 0, 'deleted')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO entries (remote_id, path, fingerprint, size_bytes, modified_at, status)
             VALUES ('b', 'x.txt', 'f2', 1, 0, 'deleted')",
            [],
        )
        .unwrap();
        // A single live row on the same path is fine...
        conn.execute(
            "INSERT INTO entries (remote_id, path, fingerprint, size_bytes, modified_at, status)
             VALUES ('c', 'x.txt', 'f3', 1, 0, 'verified')",
            [],
        )
        .unwrap();
        // ...a second live row is not.
        assert!(conn
            .execute(
                "INSERT INTO entries (remote_id, path, fingerprint, size_bytes, modified_at, status)
                 VALUES ('d', 'x.txt', 'f4', 1, 0, 'pending')",
                [],
            )
            .is_err());
    }
}
