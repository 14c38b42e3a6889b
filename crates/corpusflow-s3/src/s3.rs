//! `ObjectStore` backed by aws-sdk-s3 (AWS S3, R2, MinIO).

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::store::{ObjectInfo, ObjectStore, StoreError};

/// Maximum number of retry attempts for transient S3 errors.
const MAX_RETRIES: u32 = 5;

/// Base delay for exponential backoff (doubles each retry).
const BASE_DELAY_MS: u64 = 200;

/// Connection settings for [`S3ObjectStore::connect`].
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores; enables path-style addressing
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

/// Sleep with exponential backoff + jitter.
async fn backoff_sleep(attempt: u32) {
    let delay = BASE_DELAY_MS * 2u64.pow(attempt);
    let jitter = delay / 4;
    let actual = delay + (rand_jitter() % (jitter + 1));
    tokio::time::sleep(Duration::from_millis(actual)).await;
}

fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64
        % 50
}

fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
    match err {
        SdkError::ServiceError(e) => Some(e.raw().status().as_u16()),
        SdkError::ResponseError(e) => Some(e.raw().status().as_u16()),
        _ => None,
    }
}

/// Throttling, server errors and transport failures are worth retrying.
fn is_retryable<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
        _ => matches!(status_of(err), Some(429) | Some(500..=599)),
    }
}

async fn with_retry<T, E, F, Fut>(operation: &str, target: &str, mut call: F) -> Result<T, SdkError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SdkError<E>>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) && attempt < MAX_RETRIES => {
                warn!(attempt, target, "S3 {} retryable error, retrying", operation);
                backoff_sleep(attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn store_error<E>(operation: &str, bucket: &str, err: SdkError<E>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match status_of(&err) {
        Some(403) => StoreError::AccessDenied(format!("{} on bucket {}", operation, bucket)),
        _ => StoreError::Backend(format!(
            "S3 {} failed: {}",
            operation,
            DisplayErrorContext(&err)
        )),
    }
}

fn to_chrono(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    dt.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// S3 object store for one bucket.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from explicit keys, or from the default AWS provider
    /// chain when no keys are given.
    pub async fn connect(settings: &S3Settings) -> Self {
        let region = Region::new(settings.region.clone());
        let mut builder = match (&settings.access_key_id, &settings.secret_access_key) {
            (Some(key), Some(secret)) => {
                let credentials = Credentials::new(
                    key,
                    secret,
                    settings.session_token.clone(),
                    None,
                    "corpusflow",
                );
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(region)
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };
        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        debug!(
            bucket = %settings.bucket,
            endpoint = ?settings.endpoint_url,
            "Built S3 client"
        );
        Self::new(S3Client::from_conf(builder.build()), settings.bucket.clone())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self), fields(bucket = %self.bucket), level = "debug")]
    async fn bucket_exists(&self) -> Result<bool, StoreError> {
        let result = with_retry("head_bucket", &self.bucket, || {
            self.client.head_bucket().bucket(&self.bucket).send()
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if status_of(&e) == Some(404) => Ok(false),
            Err(e) => Err(store_error("head_bucket", &self.bucket, e)),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket), level = "debug")]
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let token = continuation_token.clone();
            let result = with_retry("list_objects", prefix, || {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix);
                if let Some(token) = &token {
                    request = request.continuation_token(token);
                }
                request.send()
            })
            .await;

            let output = match result {
                Ok(output) => output,
                Err(e) if status_of(&e) == Some(404) => {
                    return Err(StoreError::BucketNotFound(self.bucket.clone()))
                }
                Err(e) => return Err(store_error("list_objects", &self.bucket, e)),
            };

            for object in output.contents.unwrap_or_default() {
                let Some(key) = object.key else { continue };
                objects.push(ObjectInfo {
                    key,
                    size: object.size.unwrap_or(0).max(0) as u64,
                    last_modified: to_chrono(object.last_modified.as_ref()),
                    e_tag: object.e_tag,
                });
            }

            if output.is_truncated.unwrap_or(false) {
                continuation_token = output.next_continuation_token;
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        debug!("Listed {} objects under '{}'", objects.len(), prefix);
        Ok(objects)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket), level = "debug")]
    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        let result = with_retry("head_object", key, || {
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
        })
        .await;

        match result {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length.unwrap_or(0).max(0) as u64,
                last_modified: to_chrono(output.last_modified.as_ref()),
                e_tag: output.e_tag,
            })),
            Err(e) if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) => {
                Ok(None)
            }
            Err(e) => Err(store_error("head_object", &self.bucket, e)),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket), level = "debug")]
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let result = with_retry("get_object", key, || {
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
        })
        .await;

        let output = match result {
            Ok(output) => output,
            Err(e) if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) => {
                return Ok(None)
            }
            Err(e) => return Err(store_error("get_object", &self.bucket, e)),
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to read body of {}: {}", key, e)))?
            .into_bytes();
        Ok(Some(bytes.to_vec()))
    }
}
