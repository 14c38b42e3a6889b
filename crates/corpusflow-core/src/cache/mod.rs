//! Metadata cache: durable mapping from `doc_id` to last-known metadata.
//!
//! One logical cache per source. Every operation is individually atomic and
//! safe to call concurrently with the source's own watch task; there are no
//! multi-key transactions.

mod memory;
mod sqlite;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::document::DocumentMetadata;
use crate::error::CacheError;

pub use memory::MemoryMetadataCache;
pub use sqlite::SqliteMetadataCache;

/// Key-value store of document metadata keyed by `doc_id`.
#[async_trait]
pub trait MetadataCache: Send + Sync {
    /// Get the cached metadata for a document.
    async fn get(&self, doc_id: &str) -> Result<Option<DocumentMetadata>, CacheError>;

    /// Insert or replace the record for `metadata.doc_id`.
    async fn upsert(&self, metadata: &DocumentMetadata) -> Result<(), CacheError>;

    /// Remove a record. Returns whether a record existed.
    async fn remove(&self, doc_id: &str) -> Result<bool, CacheError>;

    /// List every cached record.
    async fn list(&self) -> Result<Vec<DocumentMetadata>, CacheError>;

    /// Release underlying resources.
    async fn close(&self) {}
}

/// Where a source keeps its cache and whether it survives restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheConfig {
    /// SQLite file reused across runs.
    Persistent(PathBuf),
    /// SQLite file deleted when the cache is opened, then rebuilt on connect.
    Fresh(PathBuf),
    /// Process-lifetime map.
    Memory,
}

impl CacheConfig {
    /// Fresh cache at a fixed per-source path in the system temp dir. Each
    /// run clears and reuses the same file.
    pub fn fresh_for(source_name: &str) -> Self {
        let file = format!("corpusflow-{}.db", sanitize(source_name));
        CacheConfig::Fresh(std::env::temp_dir().join(file))
    }

    /// Open the cache described by this configuration.
    pub async fn open(&self) -> Result<Arc<dyn MetadataCache>, CacheError> {
        match self {
            CacheConfig::Persistent(path) => {
                debug!("Opening persistent metadata cache at {}", path.display());
                Ok(Arc::new(SqliteMetadataCache::open(path).await?))
            }
            CacheConfig::Fresh(path) => {
                remove_database_files(path)?;
                debug!("Opening fresh metadata cache at {}", path.display());
                Ok(Arc::new(SqliteMetadataCache::open(path).await?))
            }
            CacheConfig::Memory => Ok(Arc::new(MemoryMetadataCache::new())),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Delete a SQLite database together with its WAL side files.
fn remove_database_files(path: &Path) -> Result<(), CacheError> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        candidates.push(PathBuf::from(side));
    }

    for file in candidates {
        match std::fs::remove_file(&file) {
            Ok(()) => debug!("Removed stale cache file {}", file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::Io(e)),
        }
    }
    Ok(())
}
