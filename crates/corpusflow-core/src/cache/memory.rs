use async_trait::async_trait;
use dashmap::DashMap;

use super::MetadataCache;
use crate::document::DocumentMetadata;
use crate::error::CacheError;

/// In-memory cache for sources that rebuild their state on every connect.
#[derive(Debug, Default)]
pub struct MemoryMetadataCache {
    records: DashMap<String, DocumentMetadata>,
}

impl MemoryMetadataCache {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

#[async_trait]
impl MetadataCache for MemoryMetadataCache {
    async fn get(&self, doc_id: &str) -> Result<Option<DocumentMetadata>, CacheError> {
        Ok(self.records.get(doc_id).map(|r| r.value().clone()))
    }

    async fn upsert(&self, metadata: &DocumentMetadata) -> Result<(), CacheError> {
        self.records
            .insert(metadata.doc_id.clone(), metadata.clone());
        Ok(())
    }

    async fn remove(&self, doc_id: &str) -> Result<bool, CacheError> {
        Ok(self.records.remove(doc_id).is_some())
    }

    async fn list(&self) -> Result<Vec<DocumentMetadata>, CacheError> {
        let mut records: Vec<DocumentMetadata> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        Ok(records)
    }
}
