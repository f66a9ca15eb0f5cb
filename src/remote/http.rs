//! reqwest-backed [`RemoteStore`] implementation.
//!
//! Wire contract: `POST {endpoint}/changes` with `{root, cursor}` returns a
//! JSON page `{entries, cursor, has_more}`; `GET {endpoint}/content?id=...`
//! streams the raw bytes. Authentication is a bearer token established out
//! of band.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::{CatalogPage, ContentStream, RemoteError, RemoteEntry, RemoteStore};

pub struct HttpRemote {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    root: String,
}

#[derive(Debug, Serialize)]
struct ChangesRequest<'a> {
    root: &'a str,
    cursor: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    entries: Vec<WireEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct WireEntry {
    id: String,
    path: String,
    fingerprint: String,
    size: u64,
    modified_at: DateTime<Utc>,
}

impl From<WireEntry> for RemoteEntry {
    fn from(w: WireEntry) -> Self {
        Self {
            remote_id: w.id,
            path: w.path,
            fingerprint: w.fingerprint,
            size_bytes: w.size,
            modified_at: w.modified_at,
        }
    }
}

impl HttpRemote {
    pub fn new(endpoint: &str, token: &str, root: &str) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("cloudmirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Protocol {
                context: "client setup".into(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
            root: root.to_string(),
        })
    }

    fn transport(context: &str) -> impl FnOnce(reqwest::Error) -> RemoteError + '_ {
        move |source| RemoteError::Transport {
            context: context.to_string(),
            source,
        }
    }
}

/// Map a non-success status to the error taxonomy. `entry_id` refines 404
/// into a per-entry "vanished" during content fetch; during listing a 404
/// endpoint is a protocol-level misconfiguration.
fn classify_status(status: u16, context: &str, entry_id: Option<&str>) -> RemoteError {
    match status {
        401 | 403 => RemoteError::Auth(format!("status {status} during {context}")),
        404 => match entry_id {
            Some(id) => RemoteError::Vanished(id.to_string()),
            None => RemoteError::Protocol {
                context: context.to_string(),
                detail: "endpoint not found".into(),
            },
        },
        // The listing endpoint answers 409 when the supplied cursor has
        // expired and the walk must restart from scratch.
        409 | 410 => RemoteError::InvalidCursor(format!("status {status} during {context}")),
        other => RemoteError::Status {
            status: other,
            context: context.to_string(),
        },
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn list_changes(&self, cursor: Option<&str>) -> Result<CatalogPage, RemoteError> {
        let context = "catalog listing";
        let response = self
            .client
            .post(format!("{}/changes", self.endpoint))
            .bearer_auth(&self.token)
            .json(&ChangesRequest {
                root: &self.root,
                cursor,
            })
            .send()
            .await
            .map_err(Self::transport(context))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), context, None));
        }

        let page: ChangesResponse =
            response
                .json()
                .await
                .map_err(|e| RemoteError::Protocol {
                    context: context.to_string(),
                    detail: e.to_string(),
                })?;

        Ok(CatalogPage {
            entries: page.entries.into_iter().map(RemoteEntry::from).collect(),
            cursor: page.cursor,
            has_more: page.has_more,
        })
    }

    async fn fetch_content(&self, remote_id: &str) -> Result<ContentStream, RemoteError> {
        let context = "content fetch";
        let response = self
            .client
            .get(format!("{}/content", self.endpoint))
            .query(&[("id", remote_id)])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::transport(context))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), context, Some(remote_id)));
        }

        let id = remote_id.to_string();
        Ok(response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|source| RemoteError::Transport {
                    context: format!("content body for {id}"),
                    source,
                })
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_auth_statuses() {
        assert!(matches!(
            classify_status(401, "catalog listing", None),
            RemoteError::Auth(_)
        ));
        assert!(matches!(
            classify_status(403, "content fetch", Some("id:1")),
            RemoteError::Auth(_)
        ));
    }

    #[test]
    fn classify_missing_entry_vs_missing_endpoint() {
        assert!(matches!(
            classify_status(404, "content fetch", Some("id:9")),
            RemoteError::Vanished(id) if id == "id:9"
        ));
        assert!(matches!(
            classify_status(404, "catalog listing", None),
            RemoteError::Protocol { .. }
        ));
    }

    #[test]
    fn classify_cursor_reset() {
        assert!(matches!(
            classify_status(409, "catalog listing", None),
            RemoteError::InvalidCursor(_)
        ));
    }

    #[test]
    fn classify_passthrough_status() {
        assert!(matches!(
            classify_status(503, "catalog listing", None),
            RemoteError::Status { status: 503, .. }
        ));
    }

    #[test]
    fn changes_response_parses() {
        let json = r#"{
            "entries": [
                {"id": "id:abc", "path": "docs/a.txt", "fingerprint": "ff00",
                 "size": 42, "modified_at": "2026-03-01T12:00:00Z"}
            ],
            "cursor": "c-2",
            "has_more": true
        }"#;
        let page: ChangesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert!(page.has_more);
        let entry = RemoteEntry::from(
            page.entries.into_iter().next().unwrap(),
        );
        assert_eq!(entry.remote_id, "id:abc");
        assert_eq!(entry.path, "docs/a.txt");
        assert_eq!(entry.size_bytes, 42);
    }

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let remote = HttpRemote::new("https://api.example.com/v1/", "t", "main").unwrap();
        assert_eq!(remote.endpoint, "https://api.example.com/v1");
    }
}
