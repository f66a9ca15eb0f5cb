//! Persistent manifest: what the local mirror believes about each remote
//! entry, plus the catalog cursor and run history. Backed by SQLite; the
//! single source of truth that makes interrupted runs resumable.

pub mod error;
pub mod schema;
pub mod store;
pub mod types;

pub use error::ManifestError;
pub use store::{ManifestStore, SqliteManifest};
pub use types::{CursorState, EntryStatus, ManifestEntry, MirrorSummary, RunStats};
