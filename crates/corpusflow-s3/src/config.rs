use std::time::Duration;

use corpusflow_core::{CacheConfig, LoopErrorPolicy, ModifiedPolicy};

/// Default source name stamped on S3 documents.
pub const DEFAULT_SOURCE_NAME: &str = "s3";

/// Region used when the credentials do not name one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Polling interval used when the watch is started without one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for an [`S3Source`](crate::S3Source).
#[derive(Debug, Clone)]
pub struct S3SourceConfig {
    pub name: String,
    pub bucket: String,
    /// Only keys under this prefix are indexed
    pub prefix: String,
    pub cache: CacheConfig,
    pub poll_interval: Duration,
    /// Listings carry second-resolution timestamps, so re-examined objects
    /// are compared by ETag before a modification is reported.
    pub modified_policy: ModifiedPolicy,
    pub error_policy: LoopErrorPolicy,
}

impl S3SourceConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            name: DEFAULT_SOURCE_NAME.to_string(),
            bucket: bucket.into(),
            prefix: String::new(),
            cache: CacheConfig::fresh_for(DEFAULT_SOURCE_NAME),
            poll_interval: DEFAULT_POLL_INTERVAL,
            modified_policy: ModifiedPolicy::OnChange,
            error_policy: LoopErrorPolicy::default(),
        }
    }

    /// Rename the source. A default fresh cache follows the new name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if self.cache == CacheConfig::fresh_for(&self.name) {
            self.cache = CacheConfig::fresh_for(&name);
        }
        self.name = name;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_modified_policy(mut self, policy: ModifiedPolicy) -> Self {
        self.modified_policy = policy;
        self
    }

    pub fn with_error_policy(mut self, policy: LoopErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}
