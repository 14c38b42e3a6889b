use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use tracing::{debug, instrument};

use super::MetadataCache;
use crate::document::{DocumentMetadata, DocumentType, MetadataValue};
use crate::error::CacheError;

/// SQLite-backed metadata cache.
///
/// One row per document in `document_metadata`. Timestamps are stored as
/// integer epoch seconds, `additional_metadata` as JSON text (NULL when
/// empty). The connection pool provides the synchronization between the
/// caller and the source's watch task.
pub struct SqliteMetadataCache {
    pool: SqlitePool,
}

impl SqliteMetadataCache {
    /// Open (creating if missing) the cache database at `path`.
    pub async fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let cache = Self { pool };
        cache.init_schema().await?;
        Ok(cache)
    }

    async fn init_schema(&self) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS document_metadata (
                doc_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                source TEXT NOT NULL,
                size INTEGER NOT NULL,
                additional_metadata TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_metadata(row: &SqliteRow) -> Result<DocumentMetadata, CacheError> {
        let doc_id: String = row.try_get("doc_id")?;

        let invalid = |reason: String| CacheError::InvalidRecord {
            doc_id: doc_id.clone(),
            reason,
        };

        let doc_type_tag: String = row.try_get("doc_type")?;
        let doc_type = doc_type_tag
            .parse::<DocumentType>()
            .map_err(|_| invalid(format!("unknown doc_type '{}'", doc_type_tag)))?;

        let created_at = timestamp(row.try_get("created_at")?)
            .ok_or_else(|| invalid("created_at out of range".to_string()))?;
        let modified_at = timestamp(row.try_get("modified_at")?)
            .ok_or_else(|| invalid("modified_at out of range".to_string()))?;

        let size: i64 = row.try_get("size")?;
        let size = u64::try_from(size).map_err(|_| invalid(format!("negative size {}", size)))?;

        let additional_metadata = match row.try_get::<Option<String>, _>("additional_metadata")? {
            Some(json) if !json.is_empty() => {
                serde_json::from_str::<BTreeMap<String, MetadataValue>>(&json)?
            }
            _ => BTreeMap::new(),
        };

        Ok(DocumentMetadata {
            doc_id: doc_id.clone(),
            name: row.try_get("name")?,
            doc_type,
            created_at,
            modified_at,
            source: row.try_get("source")?,
            size,
            additional_metadata,
        })
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[async_trait]
impl MetadataCache for SqliteMetadataCache {
    #[instrument(skip(self), level = "trace")]
    async fn get(&self, doc_id: &str) -> Result<Option<DocumentMetadata>, CacheError> {
        let row = sqlx::query("SELECT * FROM document_metadata WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_metadata).transpose()
    }

    #[instrument(skip(self, metadata), level = "trace", fields(doc_id = %metadata.doc_id))]
    async fn upsert(&self, metadata: &DocumentMetadata) -> Result<(), CacheError> {
        let additional_metadata = if metadata.additional_metadata.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&metadata.additional_metadata)?)
        };

        sqlx::query(
            r#"
            INSERT INTO document_metadata
                (doc_id, name, doc_type, created_at, modified_at, source, size, additional_metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(doc_id) DO UPDATE SET
                name = excluded.name,
                doc_type = excluded.doc_type,
                created_at = excluded.created_at,
                modified_at = excluded.modified_at,
                source = excluded.source,
                size = excluded.size,
                additional_metadata = excluded.additional_metadata
            "#,
        )
        .bind(&metadata.doc_id)
        .bind(&metadata.name)
        .bind(metadata.doc_type.as_str())
        .bind(metadata.created_at.timestamp())
        .bind(metadata.modified_at.timestamp())
        .bind(&metadata.source)
        .bind(i64::try_from(metadata.size).unwrap_or(i64::MAX))
        .bind(additional_metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn remove(&self, doc_id: &str) -> Result<bool, CacheError> {
        let result = sqlx::query("DELETE FROM document_metadata WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<DocumentMetadata>, CacheError> {
        let rows = sqlx::query("SELECT * FROM document_metadata ORDER BY doc_id")
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .iter()
            .map(Self::row_to_metadata)
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Listed {} cached records", records.len());
        Ok(records)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
