use std::path::PathBuf;

use corpusflow_core::{CacheConfig, LoopErrorPolicy, ModifiedPolicy};

/// Default source name stamped on local documents.
pub const DEFAULT_SOURCE_NAME: &str = "local";

/// Configuration for a [`LocalFileSystemSource`](crate::LocalFileSystemSource).
#[derive(Debug, Clone)]
pub struct LocalSourceConfig {
    /// Directory tree to index and watch
    pub root: PathBuf,
    pub name: String,
    pub cache: CacheConfig,
    pub modified_policy: ModifiedPolicy,
    /// Applies to poll-mode cycles and native watcher errors
    pub error_policy: LoopErrorPolicy,
}

impl LocalSourceConfig {
    /// Configuration with a fresh temp-dir cache and default policies.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            name: DEFAULT_SOURCE_NAME.to_string(),
            cache: CacheConfig::fresh_for(DEFAULT_SOURCE_NAME),
            modified_policy: ModifiedPolicy::default(),
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

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renamed_source_gets_its_own_fresh_cache() {
        let config = LocalSourceConfig::new("/srv/docs").with_name("archive");
        assert_eq!(config.cache, CacheConfig::fresh_for("archive"));

        let config = LocalSourceConfig::new("/srv/docs")
            .with_cache(CacheConfig::Memory)
            .with_name("archive");
        assert_eq!(config.cache, CacheConfig::Memory);
    }
}
