//! Remote hosted-storage capability.
//!
//! The engine only depends on [`RemoteStore`]: an incremental catalog
//! listing behind an opaque cursor, and content fetch by stable identifier.
//! Authentication and transport live entirely behind the trait;
//! [`http::HttpRemote`] is the production implementation.

pub mod error;
pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

pub use error::RemoteError;

/// Streamed file content.
pub type ContentStream = BoxStream<'static, Result<Bytes, RemoteError>>;

/// One live entry in the remote catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Stable provider identifier; survives renames.
    pub remote_id: String,
    /// Path relative to the sync root.
    pub path: String,
    /// Provider-supplied content revision/hash (see [`crate::fingerprint`]).
    pub fingerprint: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// One page of the incremental catalog listing.
#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub entries: Vec<RemoteEntry>,
    /// Cursor to persist before requesting the next page.
    pub cursor: String,
    pub has_more: bool,
}

/// Capability contract for the hosted-storage provider.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List the next page of catalog entries. `None` starts a fresh walk
    /// from the beginning of the tree; cursors are strictly sequential and
    /// must not be requested speculatively.
    async fn list_changes(&self, cursor: Option<&str>) -> Result<CatalogPage, RemoteError>;

    /// Open a content stream for one entry.
    async fn fetch_content(&self, remote_id: &str) -> Result<ContentStream, RemoteError>;
}
