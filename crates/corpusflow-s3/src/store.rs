//! Object store abstraction the S3 source reads through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Listing entry for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub e_tag: Option<String>,
}

/// Errors raised by an object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Object store error: {0}")]
    Backend(String),
}

/// Read access to one bucket of an S3-compatible object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket the store reads from.
    fn bucket(&self) -> &str;

    /// Whether the bucket exists and is reachable.
    async fn bucket_exists(&self) -> Result<bool, StoreError>;

    /// List every object under `prefix`, following pagination.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError>;

    /// Metadata of one object, `None` if it does not exist.
    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError>;

    /// Content of one object, `None` if it does not exist.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}
