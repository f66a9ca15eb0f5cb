//! Catalog walker: strictly sequential page retrieval with backoff.
//!
//! Pages are never requested speculatively — the remote's cursor semantics
//! are sequential, and the coordinator persists each page's cursor before
//! asking for the next one, so an interrupted walk resumes exactly where it
//! stopped. The walker itself never touches the stored cursor: exhausting
//! retries (or a fatal error) surfaces to the coordinator, which aborts the
//! run with the last known-good cursor intact.

use std::sync::Arc;

use crate::remote::{CatalogPage, RemoteError, RemoteStore};
use crate::retry::{retry_with_backoff, RetryAction, RetryPolicy};

pub struct CatalogWalker {
    remote: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
}

impl CatalogWalker {
    pub fn new(remote: Arc<dyn RemoteStore>, policy: RetryPolicy) -> Self {
        Self { remote, policy }
    }

    /// Fetch the page after `cursor`, retrying transient failures in place.
    pub async fn next_page(&self, cursor: Option<&str>) -> Result<CatalogPage, RemoteError> {
        let page = retry_with_backoff(
            &self.policy,
            |e: &RemoteError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || self.remote.list_changes(cursor),
        )
        .await?;

        tracing::debug!(
            entries = page.entries.len(),
            has_more = page.has_more,
            "catalog page received"
        );
        Ok(page)
    }
}
