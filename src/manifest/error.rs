//! Manifest error type.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to open manifest at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Manifest migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("Manifest query failed: {0}")]
    Query(String),

    #[error("Manifest schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl ManifestError {
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
