//! Diff engine: classifies observations against the metadata cache.
//!
//! [`classify`] is the pure three-way decision. [`DiffEngine`] applies the
//! decision to a source's cache and yields the [`WatchEvent`]s to emit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cache::MetadataCache;
use crate::document::DocumentMetadata;
use crate::error::CacheError;
use crate::watch::{WatchAction, WatchEvent};

/// One item as seen by a source during a sync, poll or native event.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// The item exists, with freshly observed metadata.
    Present(DocumentMetadata),
    /// The provider reports the item removed or trashed.
    Removed { doc_id: String },
}

impl Observation {
    pub fn doc_id(&self) -> &str {
        match self {
            Observation::Present(m) => &m.doc_id,
            Observation::Removed { doc_id } => doc_id,
        }
    }
}

/// When a present, already-cached item produces a `modified` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifiedPolicy {
    /// Every observation of a cached item emits `modified`.
    Always,
    /// Only observations whose descriptive fields differ emit `modified`.
    OnChange,
}

impl Default for ModifiedPolicy {
    fn default() -> Self {
        Self::Always
    }
}

/// Outcome of classifying one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Upsert and emit `created`.
    Create,
    /// Upsert and emit `modified`.
    Modify,
    /// Upsert without emitting.
    Refresh,
    /// Emit `deleted` with the prior metadata and drop the record.
    Delete(DocumentMetadata),
    /// Nothing observable happened.
    Ignore,
}

/// Classify an observation against the prior cached record.
pub fn classify(
    prior: Option<&DocumentMetadata>,
    observation: &Observation,
    policy: ModifiedPolicy,
) -> Decision {
    match (observation, prior) {
        (Observation::Removed { .. }, Some(prior)) => Decision::Delete(prior.clone()),
        (Observation::Removed { .. }, None) => Decision::Ignore,
        (Observation::Present(_), None) => Decision::Create,
        (Observation::Present(current), Some(prior)) => match policy {
            ModifiedPolicy::Always => Decision::Modify,
            ModifiedPolicy::OnChange if current.differs_from(prior) => Decision::Modify,
            ModifiedPolicy::OnChange => Decision::Refresh,
        },
    }
}

/// Applies classification decisions to one source's cache.
#[derive(Clone)]
pub struct DiffEngine {
    cache: Arc<dyn MetadataCache>,
    policy: ModifiedPolicy,
}

impl DiffEngine {
    pub fn new(cache: Arc<dyn MetadataCache>, policy: ModifiedPolicy) -> Self {
        Self { cache, policy }
    }

    pub fn cache(&self) -> &Arc<dyn MetadataCache> {
        &self.cache
    }

    pub fn policy(&self) -> ModifiedPolicy {
        self.policy
    }

    /// Classify one observation, update the cache, and return the event to
    /// emit, if any.
    pub async fn apply(&self, observation: Observation) -> Result<Option<WatchEvent>, CacheError> {
        let prior = self.cache.get(observation.doc_id()).await?;
        let decision = classify(prior.as_ref(), &observation, self.policy);
        self.commit(decision, observation).await
    }

    /// Apply a batch of observations in order.
    pub async fn apply_all(
        &self,
        observations: Vec<Observation>,
    ) -> Result<Vec<WatchEvent>, CacheError> {
        let mut events = Vec::new();
        for observation in observations {
            if let Some(event) = self.apply(observation).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Reconcile a full listing of the repository against the cache.
    ///
    /// Uncached items are created. Cached items are only re-examined when
    /// they changed after `since` (all of them when `since` is `None`).
    /// Cached items missing from the listing are deleted.
    pub async fn reconcile_snapshot(
        &self,
        snapshot: Vec<DocumentMetadata>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<WatchEvent>, CacheError> {
        let mut cached: HashMap<String, DocumentMetadata> = self
            .cache
            .list()
            .await?
            .into_iter()
            .map(|m| (m.doc_id.clone(), m))
            .collect();

        let mut events = Vec::new();

        // Whatever is left in `cached` afterwards was missing from the listing.
        for current in snapshot {
            let prior = cached.remove(&current.doc_id);

            if let (Some(_), Some(watermark)) = (&prior, since) {
                if current.modified_at <= watermark {
                    continue;
                }
            }

            let observation = Observation::Present(current);
            let decision = classify(prior.as_ref(), &observation, self.policy);
            if let Some(event) = self.commit(decision, observation).await? {
                events.push(event);
            }
        }

        for (doc_id, prior) in cached {
            let observation = Observation::Removed { doc_id };
            if let Some(event) = self.commit(Decision::Delete(prior), observation).await? {
                events.push(event);
            }
        }

        debug!("Snapshot reconciliation produced {} events", events.len());
        Ok(events)
    }

    async fn commit(
        &self,
        decision: Decision,
        observation: Observation,
    ) -> Result<Option<WatchEvent>, CacheError> {
        match (decision, observation) {
            (Decision::Create, Observation::Present(metadata)) => {
                self.cache.upsert(&metadata).await?;
                Ok(Some(WatchEvent::new(WatchAction::Created, metadata)))
            }
            (Decision::Modify, Observation::Present(metadata)) => {
                self.cache.upsert(&metadata).await?;
                Ok(Some(WatchEvent::new(WatchAction::Modified, metadata)))
            }
            (Decision::Refresh, Observation::Present(metadata)) => {
                self.cache.upsert(&metadata).await?;
                Ok(None)
            }
            (Decision::Delete(prior), _) => {
                self.cache.remove(&prior.doc_id).await?;
                Ok(Some(WatchEvent::new(WatchAction::Deleted, prior)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryMetadataCache;
    use crate::document::DocumentType;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn meta(doc_id: &str, modified: i64) -> DocumentMetadata {
        DocumentMetadata {
            doc_id: doc_id.to_string(),
            name: format!("{}.txt", doc_id),
            doc_type: DocumentType::Txt,
            created_at: Utc.timestamp_opt(1_000, 0).unwrap(),
            modified_at: Utc.timestamp_opt(modified, 0).unwrap(),
            source: "test".to_string(),
            size: 1,
            additional_metadata: BTreeMap::new(),
        }
    }

    fn engine(policy: ModifiedPolicy) -> DiffEngine {
        DiffEngine::new(Arc::new(MemoryMetadataCache::new()), policy)
    }

    #[test]
    fn test_classify_table() {
        let prior = meta("a", 10);
        let same = Observation::Present(meta("a", 10));
        let newer = Observation::Present(meta("a", 20));
        let removed = Observation::Removed {
            doc_id: "a".to_string(),
        };

        assert_eq!(classify(None, &same, ModifiedPolicy::Always), Decision::Create);
        assert_eq!(classify(None, &removed, ModifiedPolicy::Always), Decision::Ignore);
        assert_eq!(
            classify(Some(&prior), &removed, ModifiedPolicy::Always),
            Decision::Delete(prior.clone())
        );
        assert_eq!(
            classify(Some(&prior), &same, ModifiedPolicy::Always),
            Decision::Modify
        );
        assert_eq!(
            classify(Some(&prior), &same, ModifiedPolicy::OnChange),
            Decision::Refresh
        );
        assert_eq!(
            classify(Some(&prior), &newer, ModifiedPolicy::OnChange),
            Decision::Modify
        );
    }

    #[tokio::test]
    async fn test_create_then_modify_then_delete() {
        let engine = engine(ModifiedPolicy::Always);

        let created = engine
            .apply(Observation::Present(meta("a", 10)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.action, WatchAction::Created);
        assert_eq!(engine.cache().list().await.unwrap(), vec![meta("a", 10)]);

        let modified = engine
            .apply(Observation::Present(meta("a", 10)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(modified.action, WatchAction::Modified);

        let deleted = engine
            .apply(Observation::Removed {
                doc_id: "a".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted.action, WatchAction::Deleted);
        assert_eq!(deleted.metadata, meta("a", 10));
        assert!(engine.cache().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_untracked_removal_is_silent() {
        let engine = engine(ModifiedPolicy::Always);
        let event = engine
            .apply(Observation::Removed {
                doc_id: "ghost".to_string(),
            })
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_on_change_policy_refreshes_silently() {
        let engine = engine(ModifiedPolicy::OnChange);
        engine
            .apply(Observation::Present(meta("a", 10)))
            .await
            .unwrap();

        let mut renamed = meta("a", 10);
        renamed.name = "renamed.txt".to_string();
        let mut resized = renamed.clone();
        resized.size = 2;

        let events = engine
            .apply_all(vec![
                Observation::Present(meta("a", 10)),
                Observation::Present(renamed.clone()),
                Observation::Present(renamed.clone()),
                Observation::Present(resized.clone()),
            ])
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].metadata, renamed);
        assert_eq!(events[1].metadata.size, 2);
        assert_eq!(engine.cache().get("a").await.unwrap(), Some(resized));
    }

    #[tokio::test]
    async fn test_snapshot_reconciliation() {
        let engine = engine(ModifiedPolicy::Always);
        engine
            .reconcile_snapshot(vec![meta("keep", 10), meta("touch", 10), meta("gone", 10)], None)
            .await
            .unwrap();

        let watermark = Utc.timestamp_opt(15, 0).unwrap();
        let events = engine
            .reconcile_snapshot(
                vec![meta("keep", 10), meta("touch", 20), meta("new", 5)],
                Some(watermark),
            )
            .await
            .unwrap();

        let mut summary: Vec<(WatchAction, String)> = events
            .into_iter()
            .map(|e| (e.action, e.metadata.doc_id))
            .collect();
        summary.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            summary,
            vec![
                (WatchAction::Deleted, "gone".to_string()),
                (WatchAction::Created, "new".to_string()),
                (WatchAction::Modified, "touch".to_string()),
            ]
        );

        let ids: Vec<String> = engine
            .cache()
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.doc_id)
            .collect();
        assert_eq!(ids, vec!["keep", "new", "touch"]);
    }

    #[tokio::test]
    async fn test_snapshot_reconciliation_is_idempotent() {
        let engine = engine(ModifiedPolicy::Always);
        let listing = vec![meta("a", 10), meta("b", 10)];

        engine.reconcile_snapshot(listing.clone(), None).await.unwrap();
        let first = engine.cache().list().await.unwrap();
        engine.reconcile_snapshot(listing, None).await.unwrap();
        let second = engine.cache().list().await.unwrap();

        assert_eq!(first, second);
    }
}
