use std::time::Duration;

use corpusflow_core::{CacheConfig, LoopErrorPolicy, ModifiedPolicy};

use crate::client::DEFAULT_BASE_URL;

/// Default source name stamped on Drive documents.
pub const DEFAULT_SOURCE_NAME: &str = "gdocs";

/// Polling interval used when the watch is started without one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for a [`GoogleDriveSource`](crate::GoogleDriveSource).
#[derive(Debug, Clone)]
pub struct DriveSourceConfig {
    pub name: String,
    pub cache: CacheConfig,
    /// Drive v3 API root
    pub base_url: String,
    pub page_size: u32,
    pub poll_interval: Duration,
    pub modified_policy: ModifiedPolicy,
    pub error_policy: LoopErrorPolicy,
}

impl Default for DriveSourceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SOURCE_NAME.to_string(),
            cache: CacheConfig::fresh_for(DEFAULT_SOURCE_NAME),
            base_url: DEFAULT_BASE_URL.to_string(),
            page_size: 100,
            poll_interval: DEFAULT_POLL_INTERVAL,
            modified_policy: ModifiedPolicy::default(),
            error_policy: LoopErrorPolicy::default(),
        }
    }
}

impl DriveSourceConfig {
    /// Rename the source. A default fresh cache follows the new name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if self.cache == CacheConfig::fresh_for(&self.name) {
            self.cache = CacheConfig::fresh_for(&name);
        }
        self.name = name;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
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
