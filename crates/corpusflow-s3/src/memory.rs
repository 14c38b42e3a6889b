//! In-process object store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::store::{ObjectInfo, ObjectStore, StoreError};

#[derive(Debug, Clone)]
struct StoredObject {
    content: Vec<u8>,
    last_modified: DateTime<Utc>,
    version: u64,
}

/// Object store kept in memory; a stand-in bucket for local runs and tests.
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    exists: bool,
    objects: DashMap<String, StoredObject>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            exists: true,
            objects: DashMap::new(),
        }
    }

    /// A store whose bucket does not exist.
    pub fn absent(bucket: impl Into<String>) -> Self {
        Self {
            exists: false,
            ..Self::new(bucket)
        }
    }

    /// Create or overwrite an object, stamping it with the current time.
    pub fn put(&self, key: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.put_at(key, content, Utc::now());
    }

    /// Create or overwrite an object with an explicit modification time.
    pub fn put_at(&self, key: impl Into<String>, content: impl Into<Vec<u8>>, at: DateTime<Utc>) {
        let key = key.into();
        let version = self.objects.get(&key).map(|o| o.version + 1).unwrap_or(1);
        self.objects.insert(
            key,
            StoredObject {
                content: content.into(),
                last_modified: at,
                version,
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.objects.remove(key).is_some()
    }

    fn info(key: &str, object: &StoredObject) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size: object.content.len() as u64,
            last_modified: object.last_modified,
            e_tag: Some(format!("\"v{}\"", object.version)),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn bucket_exists(&self) -> Result<bool, StoreError> {
        Ok(self.exists)
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        if !self.exists {
            return Err(StoreError::BucketNotFound(self.bucket.clone()));
        }
        let mut listed: Vec<ObjectInfo> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| Self::info(e.key(), e.value()))
            .collect();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        Ok(self.objects.get(key).map(|o| Self::info(key, o.value())))
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.objects.get(key).map(|o| o.content.clone()))
    }
}
