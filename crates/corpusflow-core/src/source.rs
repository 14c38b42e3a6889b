use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::document::{Document, DocumentFilter, DocumentMetadata};
use crate::error::SourceError;
use crate::watch::EventSink;

/// Credential input for [`DocumentSource::connect`].
///
/// Keys and values are interpreted by each source; sources that need no
/// credentials accept an empty map.
pub type Credentials = HashMap<String, serde_json::Value>;

/// Read a string credential, if present.
pub fn credential_str<'a>(credentials: &'a Credentials, key: &str) -> Option<&'a str> {
    credentials
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// Capability contract implemented once per backing repository.
///
/// Each implementation owns its metadata cache and its watch mechanism
/// (native event stream or periodic poll-and-diff).
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Source label stamped on every document's `source` field.
    fn name(&self) -> &str;

    /// Establish access and reconcile the cache with ground truth.
    ///
    /// Returns `Ok(false)` when the repository itself is absent, and
    /// [`SourceError::Connection`] on authorization or network failure.
    async fn connect(&self, credentials: &Credentials) -> Result<bool, SourceError>;

    /// Release held connection handles. Idempotent.
    async fn disconnect(&self) -> Result<bool, SourceError>;

    /// Current cache contents, optionally filtered. Never calls the remote.
    async fn list_documents(
        &self,
        filter: Option<&DocumentFilter>,
    ) -> Result<Vec<DocumentMetadata>, SourceError>;

    /// Fetch a document's content, resolving unknown ids with a live lookup.
    async fn get_document(&self, doc_id: &str) -> Result<Document, SourceError>;

    /// Provider-defined search. Observed metadata is written to the cache.
    async fn search_documents(&self, query: &str) -> Result<Vec<DocumentMetadata>, SourceError>;

    /// Start the background watch task, pushing classified changes onto
    /// `sink`. `None` selects the native mechanism (or the source's default
    /// interval if it can only poll). Calling again while running is a no-op
    /// returning `Ok(true)`.
    async fn watch_documents(
        &self,
        sink: EventSink,
        interval: Option<Duration>,
    ) -> Result<bool, SourceError>;

    /// Stop the watch task and wait (bounded) for it to exit. Idempotent.
    async fn stop_watching(&self) -> Result<bool, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_credential_str() {
        let mut creds = Credentials::new();
        creds.insert("access_token".to_string(), json!("abc"));
        creds.insert("empty".to_string(), json!(""));
        creds.insert("number".to_string(), json!(3));

        assert_eq!(credential_str(&creds, "access_token"), Some("abc"));
        assert_eq!(credential_str(&creds, "empty"), None);
        assert_eq!(credential_str(&creds, "number"), None);
        assert_eq!(credential_str(&creds, "missing"), None);
    }
}
