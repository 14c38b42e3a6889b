use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corpusflow_core::{
    credential_str, spawn_poll_loop, Credentials, DiffEngine, Document, DocumentFilter,
    DocumentMetadata, DocumentSource, DocumentType, EventSink, MetadataValue, PollCycle,
    PollSettings, SourceError, WatchEvent, WatchSlot,
};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::{S3SourceConfig, DEFAULT_REGION};
use crate::s3::{S3ObjectStore, S3Settings};
use crate::store::{ObjectInfo, ObjectStore, StoreError};

pub const ACCESS_KEY_ID_KEY: &str = "access_key_id";
pub const SECRET_ACCESS_KEY_KEY: &str = "secret_access_key";
pub const SESSION_TOKEN_KEY: &str = "session_token";
pub const REGION_KEY: &str = "region";
pub const ENDPOINT_URL_KEY: &str = "endpoint_url";

fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Build document metadata for a listed object.
///
/// Folder markers and keys without a known extension yield `None`. S3 keeps
/// no creation time, so both timestamps carry the last modification.
pub(crate) fn object_metadata(
    object: &ObjectInfo,
    bucket: &str,
    source: &str,
) -> Option<DocumentMetadata> {
    if object.key.ends_with('/') {
        return None;
    }
    let name = file_name(&object.key);
    let doc_type = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(DocumentType::from_extension)?;

    let mut additional_metadata = BTreeMap::new();
    additional_metadata.insert(
        "bucket".to_string(),
        MetadataValue::Text(bucket.to_string()),
    );
    if let Some(e_tag) = &object.e_tag {
        additional_metadata.insert(
            "etag".to_string(),
            MetadataValue::Text(e_tag.trim_matches('"').to_string()),
        );
    }

    Some(DocumentMetadata {
        doc_id: object.key.clone(),
        name: name.to_string(),
        doc_type,
        created_at: object.last_modified,
        modified_at: object.last_modified,
        source: source.to_string(),
        size: object.size,
        additional_metadata,
    })
}

fn convert_listing(objects: &[ObjectInfo], bucket: &str, source: &str) -> Vec<DocumentMetadata> {
    objects
        .iter()
        .filter_map(|object| object_metadata(object, bucket, source))
        .collect()
}

fn store_failure(e: StoreError) -> SourceError {
    match e {
        StoreError::BucketNotFound(bucket) => {
            SourceError::Unavailable(format!("bucket {}", bucket))
        }
        other => SourceError::Provider(other.to_string()),
    }
}

/// S3-compatible object store source.
///
/// Document ids are object keys. Changes are detected by listing the prefix
/// on every poll and reconciling the listing against the cache.
pub struct S3Source {
    config: S3SourceConfig,
    engine: DiffEngine,
    injected: Option<Arc<dyn ObjectStore>>,
    store: RwLock<Option<Arc<dyn ObjectStore>>>,
    watch: WatchSlot,
}

impl S3Source {
    /// Open the source's metadata cache. The object store client is built at
    /// `connect` from the supplied credentials.
    pub async fn open(config: S3SourceConfig) -> Result<Self, SourceError> {
        let cache = config.cache.open().await?;
        let engine = DiffEngine::new(cache, config.modified_policy);
        Ok(Self {
            config,
            engine,
            injected: None,
            store: RwLock::new(None),
            watch: WatchSlot::new(),
        })
    }

    /// Open a source that reads through `store` instead of building an S3
    /// client; credentials passed to `connect` are then ignored.
    pub async fn with_store(
        config: S3SourceConfig,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, SourceError> {
        let mut source = Self::open(config).await?;
        source.injected = Some(store);
        Ok(source)
    }

    pub fn config(&self) -> &S3SourceConfig {
        &self.config
    }

    async fn store(&self) -> Result<Arc<dyn ObjectStore>, SourceError> {
        self.store
            .read()
            .await
            .clone()
            .ok_or_else(|| SourceError::NotConnected(self.config.name.clone()))
    }

    async fn build_store(&self, credentials: &Credentials) -> Arc<dyn ObjectStore> {
        if let Some(store) = &self.injected {
            return store.clone();
        }
        let settings = S3Settings {
            bucket: self.config.bucket.clone(),
            region: credential_str(credentials, REGION_KEY)
                .unwrap_or(DEFAULT_REGION)
                .to_string(),
            endpoint_url: credential_str(credentials, ENDPOINT_URL_KEY).map(String::from),
            access_key_id: credential_str(credentials, ACCESS_KEY_ID_KEY).map(String::from),
            secret_access_key: credential_str(credentials, SECRET_ACCESS_KEY_KEY)
                .map(String::from),
            session_token: credential_str(credentials, SESSION_TOKEN_KEY).map(String::from),
        };
        Arc::new(S3ObjectStore::connect(&settings).await)
    }

    fn in_prefix(&self, key: &str) -> bool {
        key.starts_with(&self.config.prefix)
    }
}

#[async_trait]
impl DocumentSource for S3Source {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self, credentials), fields(bucket = %self.config.bucket))]
    async fn connect(&self, credentials: &Credentials) -> Result<bool, SourceError> {
        let store = self.build_store(credentials).await;
        let bucket = store.bucket().to_string();

        match store.bucket_exists().await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Bucket {} does not exist", bucket);
                return Ok(false);
            }
            Err(e) => {
                return Err(SourceError::connection(
                    format!("Cannot reach bucket {}", bucket),
                    e,
                ))
            }
        }

        let objects = match store.list_objects(&self.config.prefix).await {
            Ok(objects) => objects,
            Err(StoreError::BucketNotFound(_)) => {
                warn!("Bucket {} disappeared while listing", bucket);
                return Ok(false);
            }
            Err(e) => {
                return Err(SourceError::connection(
                    format!("Failed to list bucket {}", bucket),
                    e,
                ))
            }
        };

        let snapshot = convert_listing(&objects, &bucket, &self.config.name);
        let indexed = snapshot.len();
        self.engine.reconcile_snapshot(snapshot, None).await?;

        *self.store.write().await = Some(store);
        info!(
            "Indexed {} of {} objects in s3://{}/{}",
            indexed,
            objects.len(),
            bucket,
            self.config.prefix
        );
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool, SourceError> {
        self.watch.stop().await;
        self.store.write().await.take();
        debug!("Disconnected S3 source {}", self.config.name);
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
        let store = self.store().await?;
        if !self.in_prefix(doc_id) {
            return Err(SourceError::DocumentNotFound(doc_id.to_string()));
        }

        let metadata = match self.engine.cache().get(doc_id).await? {
            Some(metadata) => metadata,
            None => {
                let object = store
                    .head_object(doc_id)
                    .await
                    .map_err(store_failure)?
                    .ok_or_else(|| SourceError::DocumentNotFound(doc_id.to_string()))?;
                let metadata = object_metadata(&object, store.bucket(), &self.config.name)
                    .ok_or_else(|| {
                        let name = file_name(doc_id);
                        SourceError::UnsupportedType(
                            name.rsplit_once('.')
                                .map(|(_, ext)| ext)
                                .unwrap_or(name)
                                .to_string(),
                        )
                    })?;
                self.engine.cache().upsert(&metadata).await?;
                metadata
            }
        };

        let content = store
            .get_object(doc_id)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| SourceError::DocumentNotFound(doc_id.to_string()))?;

        Ok(Document::new(metadata, content))
    }

    #[instrument(skip(self), level = "debug")]
    async fn search_documents(&self, query: &str) -> Result<Vec<DocumentMetadata>, SourceError> {
        let store = self.store().await?;
        let objects = store
            .list_objects(&self.config.prefix)
            .await
            .map_err(store_failure)?;

        let needle = query.to_lowercase();
        let found: Vec<DocumentMetadata> = convert_listing(&objects, store.bucket(), &self.config.name)
            .into_iter()
            .filter(|m| m.name.to_lowercase().contains(&needle))
            .collect();
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
        let store = self.store().await?;
        let cycle = Arc::new(ListingPoll {
            store,
            engine: self.engine.clone(),
            prefix: self.config.prefix.clone(),
            source: self.config.name.clone(),
        });
        let settings = PollSettings {
            label: format!("s3:{}", self.config.name),
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

/// One full listing of the prefix, reconciled against the cache.
struct ListingPoll {
    store: Arc<dyn ObjectStore>,
    engine: DiffEngine,
    prefix: String,
    source: String,
}

#[async_trait]
impl PollCycle for ListingPoll {
    async fn poll(&self, since: DateTime<Utc>) -> Result<Vec<WatchEvent>, SourceError> {
        let objects = self
            .store
            .list_objects(&self.prefix)
            .await
            .map_err(store_failure)?;
        let snapshot = convert_listing(&objects, self.store.bucket(), &self.source);

        // Listing timestamps are truncated to the second.
        let watermark = since - chrono::Duration::seconds(1);
        Ok(self
            .engine
            .reconcile_snapshot(snapshot, Some(watermark))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn object(key: &str, e_tag: Option<&str>) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size: 42,
            last_modified: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            e_tag: e_tag.map(String::from),
        }
    }

    #[test]
    fn test_object_metadata_uses_key_and_basename() {
        let meta = object_metadata(&object("reports/2024/Q1.PDF", Some("\"abc\"")), "corpus", "s3")
            .unwrap();
        assert_eq!(meta.doc_id, "reports/2024/Q1.PDF");
        assert_eq!(meta.name, "Q1.PDF");
        assert_eq!(meta.doc_type, DocumentType::Pdf);
        assert_eq!(meta.created_at, meta.modified_at);
        assert_eq!(meta.size, 42);
        assert_eq!(
            meta.additional_metadata.get("etag"),
            Some(&MetadataValue::Text("abc".to_string()))
        );
        assert_eq!(
            meta.additional_metadata.get("bucket"),
            Some(&MetadataValue::Text("corpus".to_string()))
        );
    }

    #[test]
    fn test_object_metadata_skips_folders_and_unknown_types() {
        assert!(object_metadata(&object("reports/", None), "b", "s3").is_none());
        assert!(object_metadata(&object("photo.png", None), "b", "s3").is_none());
        assert!(object_metadata(&object("README", None), "b", "s3").is_none());
    }

    #[test]
    fn test_store_failure_mapping() {
        assert!(matches!(
            store_failure(StoreError::BucketNotFound("b".to_string())),
            SourceError::Unavailable(_)
        ));
        assert!(matches!(
            store_failure(StoreError::Backend("boom".to_string())),
            SourceError::Provider(_)
        ));
    }
}
