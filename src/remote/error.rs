//! Remote error taxonomy.

use thiserror::Error;

/// Errors surfaced by a [`super::RemoteStore`].
///
/// Classification drives the whole failure policy: `is_retryable` feeds the
/// backoff loops, `is_fatal` aborts the run without touching the stored
/// cursor, and everything else is permanent for the affected entry only.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Credentials rejected. Fatal for the run.
    #[error("remote rejected credentials: {0}")]
    Auth(String),

    /// The remote no longer recognizes our pagination cursor. Fatal for the
    /// run; recovery is an explicit full resync.
    #[error("catalog cursor no longer valid: {0}")]
    InvalidCursor(String),

    /// The entry disappeared between listing and fetch. Permanent for the
    /// entry; the next walk will reconcile it away.
    #[error("entry {0} no longer exists on the remote")]
    Vanished(String),

    /// Unexpected HTTP status. Rate limits and server errors are transient.
    #[error("HTTP status {status} during {context}")]
    Status { status: u16, context: String },

    /// Connection-level failure (DNS, timeout, reset mid-body). Transient.
    #[error("transport failure during {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    /// Response did not match the wire contract.
    #[error("malformed response during {context}: {detail}")]
    Protocol { context: String, detail: String },
}

impl RemoteError {
    /// Worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Transport { .. } => true,
            Self::Auth(_) | Self::InvalidCursor(_) | Self::Vanished(_) | Self::Protocol { .. } => {
                false
            }
        }
    }

    /// Aborts the whole run rather than one entry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::InvalidCursor(_))
    }
}
