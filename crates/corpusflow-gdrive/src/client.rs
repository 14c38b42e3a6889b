//! Google Drive API v3 client wrapper.
//!
//! Stateless with respect to auth: the bearer token is passed per call by the
//! caller, which resolves it through its `TokenProvider`.

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

/// Public Drive v3 endpoint.
pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/drive/v3";

/// Fields requested for every file.
const FILE_FIELDS: &str =
    "id, name, mimeType, createdTime, modifiedTime, size, owners, shared, starred, trashed";

/// File resource as returned by Drive.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    /// Decimal byte count; absent for native Google documents
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub owners: Vec<DriveOwner>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub trashed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveOwner {
    #[serde(default)]
    pub email_address: Option<String>,
}

/// One page of a `files.list` call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Google Drive API client.
#[derive(Debug, Clone)]
pub struct DriveClient {
    http: Client,
    base_url: String,
    page_size: u32,
}

impl DriveClient {
    pub fn new(base_url: impl Into<String>, page_size: u32) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size,
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Fetch one page of files matching `query`.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn list_files(
        &self,
        token: &str,
        query: Option<&str>,
        page_token: Option<&str>,
    ) -> anyhow::Result<FileList> {
        let url = format!("{}/files", self.base_url);
        let fields = format!("nextPageToken, files({})", FILE_FIELDS);
        let page_size = self.page_size.to_string();

        let mut params: Vec<(&str, &str)> =
            vec![("fields", fields.as_str()), ("pageSize", page_size.as_str())];
        if let Some(q) = query {
            params.push(("q", q));
        }
        if let Some(page) = page_token {
            params.push(("pageToken", page));
        }

        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&params)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Google Drive API error {}: {}", status, body);
        }

        let page: FileList = resp.json().await?;
        debug!("Listed {} files", page.files.len());
        Ok(page)
    }

    /// Fetch every page of files matching `query`.
    pub async fn list_all_files(
        &self,
        token: &str,
        query: Option<&str>,
    ) -> anyhow::Result<Vec<DriveFile>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .list_files(token, query, page_token.as_deref())
                .await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        Ok(files)
    }

    /// Get file metadata. Returns `None` if the file does not exist.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn get_file(&self, token: &str, file_id: &str) -> anyhow::Result<Option<DriveFile>> {
        let url = format!("{}/files/{}", self.base_url, file_id);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Google Drive API error {}: {}", status, body);
        }

        let file: DriveFile = resp.json().await?;
        debug!("Got metadata for file {}: {:?}", file_id, file);
        Ok(Some(file))
    }

    /// Download file content in its stored format.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn download_file(
        &self,
        token: &str,
        file_id: &str,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let url = format!("{}/files/{}", self.base_url, file_id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await?;

        self.read_content(resp, file_id, "download").await
    }

    /// Export a native Google document to `mime_type`.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn export_file(
        &self,
        token: &str,
        file_id: &str,
        mime_type: &str,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let url = format!("{}/files/{}/export", self.base_url, file_id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("mimeType", mime_type)])
            .send()
            .await?;

        self.read_content(resp, file_id, "export").await
    }

    async fn read_content(
        &self,
        resp: reqwest::Response,
        file_id: &str,
        operation: &str,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Google Drive {} error {}: {}", operation, status, body);
        }

        let bytes = resp.bytes().await?;
        debug!("{} returned {} bytes for file {}", operation, bytes.len(), file_id);
        Ok(Some(bytes.to_vec()))
    }
}

/// Quote a value for use inside a Drive query string literal.
pub fn quote_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
