use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use corpusflow_core::{CacheConfig, ModifiedPolicy};

/// Configuration for the corpusflow-watch binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "corpusflow-watch")]
#[command(about = "Index document repositories and log every change until interrupted")]
pub struct Config {
    /// Local directory to index and watch
    #[arg(long, env = "CORPUSFLOW_LOCAL_ROOT")]
    pub local_root: Option<PathBuf>,

    /// Poll the local directory every N seconds instead of using filesystem events
    #[arg(long, env = "CORPUSFLOW_LOCAL_POLL_SECS")]
    pub local_poll_secs: Option<u64>,

    /// Static Google Drive bearer token
    #[arg(long, env = "GOOGLE_ACCESS_TOKEN", hide_env_values = true)]
    pub gdrive_access_token: Option<String>,

    /// Google authorized-user credentials file (refreshed in place)
    #[arg(long, env = "GOOGLE_CREDENTIALS_FILE")]
    pub gdrive_credentials_file: Option<PathBuf>,

    /// Google Drive polling interval in seconds
    #[arg(long, default_value = "60", env = "CORPUSFLOW_GDRIVE_POLL_SECS")]
    pub gdrive_poll_secs: u64,

    /// S3 bucket to index and watch
    #[arg(long, env = "CORPUSFLOW_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Only keys under this prefix are indexed
    #[arg(long, default_value = "", env = "CORPUSFLOW_S3_PREFIX")]
    pub s3_prefix: String,

    #[arg(long, default_value = "us-east-1", env = "AWS_REGION")]
    pub s3_region: String,

    /// Endpoint of an S3-compatible store (MinIO, R2)
    #[arg(long, env = "CORPUSFLOW_S3_ENDPOINT_URL")]
    pub s3_endpoint_url: Option<String>,

    /// Falls back to the default AWS provider chain when unset
    #[arg(long, env = "AWS_ACCESS_KEY_ID")]
    pub s3_access_key_id: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub s3_secret_access_key: Option<String>,

    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    pub s3_session_token: Option<String>,

    /// S3 polling interval in seconds
    #[arg(long, default_value = "60", env = "CORPUSFLOW_S3_POLL_SECS")]
    pub s3_poll_secs: u64,

    /// Directory for persistent metadata caches; caches are rebuilt from
    /// scratch in the temp dir when unset
    #[arg(long, env = "CORPUSFLOW_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Report a modification only when a document's metadata changed
    #[arg(long, env = "CORPUSFLOW_ONLY_CHANGED")]
    pub only_changed: bool,

    /// Fetch the content of every created or modified document
    #[arg(long)]
    pub fetch: bool,
}

impl Config {
    pub fn has_gdrive(&self) -> bool {
        self.gdrive_access_token.is_some() || self.gdrive_credentials_file.is_some()
    }

    pub fn has_sources(&self) -> bool {
        self.local_root.is_some() || self.has_gdrive() || self.s3_bucket.is_some()
    }

    /// Cache location for the named source.
    pub fn cache_for(&self, source: &str) -> CacheConfig {
        match &self.cache_dir {
            Some(dir) => CacheConfig::Persistent(dir.join(format!("{}.db", source))),
            None => CacheConfig::fresh_for(source),
        }
    }

    pub fn modified_policy(&self) -> ModifiedPolicy {
        if self.only_changed {
            ModifiedPolicy::OnChange
        } else {
            ModifiedPolicy::Always
        }
    }

    /// `None` selects native filesystem events.
    pub fn local_interval(&self) -> Option<Duration> {
        self.local_poll_secs.map(Duration::from_secs)
    }
}
