use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use corpusflow_core::{
    credential_str, spawn_poll_loop, Credentials, DiffEngine, Document, DocumentFilter,
    DocumentMetadata, DocumentSource, EventSink, Observation, PollCycle, PollSettings,
    SourceError, WatchEvent, WatchSlot,
};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::client::{quote_query_value, DriveClient, DriveFile};
use crate::config::DriveSourceConfig;
use crate::convert::{cached_mime_type, export_mime_for, to_metadata};
use crate::token::TokenProvider;

/// Credential key holding a static bearer token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Credential key holding the path of an authorized-user credentials file.
pub const CREDENTIALS_FILE_KEY: &str = "credentials_file";

fn provider_error(context: &str, e: anyhow::Error) -> SourceError {
    SourceError::Provider(format!("{}: {}", context, e))
}

/// Convert listed files, skipping types without a mapping.
fn convert_listing(files: &[DriveFile], source: &str) -> Vec<DocumentMetadata> {
    files
        .iter()
        .filter_map(|file| match to_metadata(file, source) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                debug!("Skipping {} ({}): {}", file.name, file.id, e);
                None
            }
        })
        .collect()
}

/// Google Drive document source.
///
/// Document ids are Drive file ids. Changes are detected by polling for files
/// modified after a watermark; trashed files are reported as deleted.
pub struct GoogleDriveSource {
    config: DriveSourceConfig,
    client: DriveClient,
    engine: DiffEngine,
    tokens: RwLock<Option<Arc<TokenProvider>>>,
    watch: WatchSlot,
}

impl GoogleDriveSource {
    /// Open the source's metadata cache. The Drive API is not contacted until
    /// `connect`.
    pub async fn open(config: DriveSourceConfig) -> Result<Self, SourceError> {
        let cache = config.cache.open().await?;
        let engine = DiffEngine::new(cache, config.modified_policy);
        let client = DriveClient::new(config.base_url.clone(), config.page_size);
        Ok(Self {
            config,
            client,
            engine,
            tokens: RwLock::new(None),
            watch: WatchSlot::new(),
        })
    }

    pub fn config(&self) -> &DriveSourceConfig {
        &self.config
    }

    async fn provider(&self) -> Result<Arc<TokenProvider>, SourceError> {
        self.tokens
            .read()
            .await
            .clone()
            .ok_or_else(|| SourceError::NotConnected(self.config.name.clone()))
    }

    async fn token(&self) -> Result<String, SourceError> {
        self.provider()
            .await?
            .access_token()
            .await
            .map_err(|e| provider_error("Token error", e))
    }

    async fn provider_from(credentials: &Credentials) -> Result<TokenProvider, SourceError> {
        if let Some(token) = credential_str(credentials, ACCESS_TOKEN_KEY) {
            return Ok(TokenProvider::fixed(token));
        }
        if let Some(path) = credential_str(credentials, CREDENTIALS_FILE_KEY) {
            return TokenProvider::from_credentials_file(path)
                .await
                .map_err(|e| SourceError::connection("Cannot load Google credentials", e));
        }
        Err(SourceError::connection_msg(format!(
            "Google Drive requires `{}` or `{}` credentials",
            ACCESS_TOKEN_KEY, CREDENTIALS_FILE_KEY
        )))
    }
}

#[async_trait]
impl DocumentSource for GoogleDriveSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self, credentials))]
    async fn connect(&self, credentials: &Credentials) -> Result<bool, SourceError> {
        let provider = Arc::new(Self::provider_from(credentials).await?);
        let token = provider
            .access_token()
            .await
            .map_err(|e| SourceError::connection("Failed to obtain Google access token", e))?;

        let files = self
            .client
            .list_all_files(&token, Some("trashed = false"))
            .await
            .map_err(|e| SourceError::connection("Failed to list Google Drive files", e))?;

        let snapshot = convert_listing(&files, &self.config.name);
        let indexed = snapshot.len();
        self.engine.reconcile_snapshot(snapshot, None).await?;

        *self.tokens.write().await = Some(provider);
        info!("Indexed {} of {} Drive files", indexed, files.len());
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool, SourceError> {
        self.watch.stop().await;
        self.tokens.write().await.take();
        debug!("Disconnected Drive source {}", self.config.name);
        Ok(true)
    }

    async fn list_documents(
        &self,
        filter: Option<&DocumentFilter>,
    ) -> Result<Vec<DocumentMetadata>, SourceError> {
        let docs = self.engine.cache().list().await?;
        Ok(DocumentFilter::apply(filter, docs))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_document(&self, doc_id: &str) -> Result<Document, SourceError> {
        let token = self.token().await?;

        let metadata = match self.engine.cache().get(doc_id).await? {
            Some(metadata) => metadata,
            None => {
                let file = self
                    .client
                    .get_file(&token, doc_id)
                    .await
                    .map_err(|e| provider_error("Google Drive API error", e))?
                    .filter(|f| !f.trashed)
                    .ok_or_else(|| SourceError::DocumentNotFound(doc_id.to_string()))?;
                let metadata = to_metadata(&file, &self.config.name)?;
                self.engine.cache().upsert(&metadata).await?;
                metadata
            }
        };

        let content = match cached_mime_type(&metadata).and_then(export_mime_for) {
            Some(export_mime) => {
                debug!("Exporting {} as {}", doc_id, export_mime);
                self.client.export_file(&token, doc_id, export_mime).await
            }
            None => self.client.download_file(&token, doc_id).await,
        }
        .map_err(|e| provider_error("Google Drive content error", e))?
        .ok_or_else(|| SourceError::DocumentNotFound(doc_id.to_string()))?;

        Ok(Document::new(metadata, content))
    }

    #[instrument(skip(self), level = "debug")]
    async fn search_documents(&self, query: &str) -> Result<Vec<DocumentMetadata>, SourceError> {
        let token = self.token().await?;
        let q = format!(
            "name contains '{}' and trashed = false",
            quote_query_value(query)
        );
        let files = self
            .client
            .list_all_files(&token, Some(&q))
            .await
            .map_err(|e| provider_error("Google Drive search error", e))?;

        let found = convert_listing(&files, &self.config.name);
        for metadata in &found {
            self.engine.cache().upsert(metadata).await?;
        }
        Ok(found)
    }

    #[instrument(skip(self, sink))]
    async fn watch_documents(
        &self,
        sink: EventSink,
        interval: Option<Duration>,
    ) -> Result<bool, SourceError> {
        let tokens = self.provider().await?;
        let cycle = Arc::new(DrivePoll {
            client: self.client.clone(),
            tokens,
            engine: self.engine.clone(),
            source: self.config.name.clone(),
        });
        let settings = PollSettings {
            label: format!("gdrive:{}", self.config.name),
            interval: interval.unwrap_or(self.config.poll_interval),
            error_policy: self.config.error_policy,
        };

        self.watch
            .start_with(move || Ok(spawn_poll_loop(cycle, settings, sink)))
            .await
    }

    async fn stop_watching(&self) -> Result<bool, SourceError> {
        Ok(self.watch.stop().await)
    }
}

/// One watermark query against Drive.
struct DrivePoll {
    client: DriveClient,
    tokens: Arc<TokenProvider>,
    engine: DiffEngine,
    source: String,
}

#[async_trait]
impl PollCycle for DrivePoll {
    async fn poll(&self, since: DateTime<Utc>) -> Result<Vec<WatchEvent>, SourceError> {
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| provider_error("Token error", e))?;

        let query = format!(
            "modifiedTime > '{}'",
            since.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        let files = self
            .client
            .list_all_files(&token, Some(&query))
            .await
            .map_err(|e| provider_error("Google Drive API error", e))?;

        let mut observations = Vec::with_capacity(files.len());
        for file in files {
            if file.trashed {
                observations.push(Observation::Removed { doc_id: file.id });
                continue;
            }
            match to_metadata(&file, &self.source) {
                Ok(metadata) => observations.push(Observation::Present(metadata)),
                Err(e) => debug!("Skipping {} ({}): {}", file.name, file.id, e),
            }
        }

        Ok(self.engine.apply_all(observations).await?)
    }
}
