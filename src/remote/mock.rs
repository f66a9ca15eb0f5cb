//! In-memory [`RemoteStore`] used by engine tests.
//!
//! Serves a scripted catalog in fixed-size pages with offset-based cursors
//! and supports failure injection per page and per fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream;

use super::{CatalogPage, ContentStream, RemoteError, RemoteEntry, RemoteStore};
use crate::fingerprint;

pub const DEFAULT_MTIME: i64 = 1_700_000_000;

#[derive(Default)]
struct State {
    entries: Vec<RemoteEntry>,
    contents: HashMap<String, Vec<u8>>,
    page_failures: HashMap<usize, u32>,
    fatal_pages: HashMap<usize, u32>,
    fetch_failures: HashMap<String, u32>,
    cursors_seen: Vec<Option<String>>,
    fetch_counts: HashMap<String, u64>,
}

pub struct MockRemote {
    page_size: usize,
    state: Mutex<State>,
    total_fetches: AtomicU64,
}

impl MockRemote {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            state: Mutex::new(State::default()),
            total_fetches: AtomicU64::new(0),
        }
    }

    /// Add or replace a file; the fingerprint is derived from the content.
    pub fn set_file(&self, id: &str, path: &str, content: &[u8]) {
        self.set_file_at(id, path, content, DEFAULT_MTIME);
    }

    pub fn set_file_at(&self, id: &str, path: &str, content: &[u8], mtime: i64) {
        let entry = RemoteEntry {
            remote_id: id.to_string(),
            path: path.to_string(),
            fingerprint: fingerprint::fingerprint_bytes(content),
            size_bytes: content.len() as u64,
            modified_at: ts(mtime),
        };
        let mut state = self.state.lock().unwrap();
        state.contents.insert(id.to_string(), content.to_vec());
        match state.entries.iter_mut().find(|e| e.remote_id == id) {
            Some(existing) => *existing = entry,
            None => state.entries.push(entry),
        }
    }

    /// Drop a file from the catalog entirely (it stops being listed).
    pub fn remove_file(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|e| e.remote_id != id);
        state.contents.remove(id);
    }

    /// Keep the catalog entry but make content fetches answer "vanished".
    pub fn vanish_content(&self, id: &str) {
        self.state.lock().unwrap().contents.remove(id);
    }

    /// Inject `times` transient failures before page `page` serves.
    pub fn fail_page(&self, page: usize, times: u32) {
        self.state.lock().unwrap().page_failures.insert(page, times);
    }

    /// Inject `times` fatal (auth) failures before page `page` serves.
    pub fn fail_page_fatal(&self, page: usize, times: u32) {
        self.state.lock().unwrap().fatal_pages.insert(page, times);
    }

    /// Inject `times` transient failures before fetches of `id` succeed.
    pub fn fail_fetch(&self, id: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .fetch_failures
            .insert(id.to_string(), times);
    }

    pub fn cursors_seen(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().cursors_seen.clone()
    }

    pub fn fetch_count(&self, id: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .fetch_counts
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u64 {
        self.total_fetches.load(Ordering::SeqCst)
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

fn transient(context: &str) -> RemoteError {
    RemoteError::Status {
        status: 503,
        context: context.to_string(),
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn list_changes(&self, cursor: Option<&str>) -> Result<CatalogPage, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.cursors_seen.push(cursor.map(str::to_string));

        let offset: usize = match cursor {
            None => 0,
            Some(c) => c
                .parse()
                .map_err(|_| RemoteError::InvalidCursor(c.to_string()))?,
        };
        let page = offset / self.page_size.max(1);

        if let Some(left) = state.fatal_pages.get_mut(&page) {
            if *left > 0 {
                *left -= 1;
                return Err(RemoteError::Auth("token expired".into()));
            }
        }
        if let Some(left) = state.page_failures.get_mut(&page) {
            if *left > 0 {
                *left -= 1;
                return Err(transient("catalog listing"));
            }
        }

        let end = (offset + self.page_size).min(state.entries.len());
        let entries = state
            .entries
            .get(offset..end)
            .unwrap_or_default()
            .to_vec();
        Ok(CatalogPage {
            entries,
            cursor: end.to_string(),
            has_more: end < state.entries.len(),
        })
    }

    async fn fetch_content(&self, remote_id: &str) -> Result<ContentStream, RemoteError> {
        self.total_fetches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        *state
            .fetch_counts
            .entry(remote_id.to_string())
            .or_insert(0) += 1;

        if let Some(left) = state.fetch_failures.get_mut(remote_id) {
            if *left > 0 {
                *left -= 1;
                return Err(transient("content fetch"));
            }
        }

        let content = state
            .contents
            .get(remote_id)
            .cloned()
            .ok_or_else(|| RemoteError::Vanished(remote_id.to_string()))?;

        // Split into two chunks so the incremental hashing path is exercised.
        let mid = content.len() / 2;
        let chunks: Vec<Result<Bytes, RemoteError>> = vec![
            Ok(Bytes::copy_from_slice(&content[..mid])),
            Ok(Bytes::copy_from_slice(&content[mid..])),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }
}
