use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corpusflow_core::{
    spawn_poll_loop, Credentials, DiffEngine, Document, DocumentFilter, DocumentMetadata,
    DocumentSource, EventSink, PollCycle, PollSettings, SourceError, WatchEvent, WatchSlot,
};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::LocalSourceConfig;
use crate::native::{self, PathObserver};
use crate::scan;

/// Document source backed by a directory tree.
///
/// Document ids are absolute file paths. Without a poll interval the watch
/// uses native filesystem notifications; with one it rescans the tree each
/// cycle and diffs the result against the cache.
pub struct LocalFileSystemSource {
    config: LocalSourceConfig,
    engine: DiffEngine,
    /// Canonical root, set by a successful connect
    root: RwLock<Option<PathBuf>>,
    watch: WatchSlot,
}

impl LocalFileSystemSource {
    /// Open the source's metadata cache. No filesystem access happens until
    /// `connect`.
    pub async fn open(config: LocalSourceConfig) -> Result<Self, SourceError> {
        let cache = config.cache.open().await?;
        let engine = DiffEngine::new(cache, config.modified_policy);
        Ok(Self {
            config,
            engine,
            root: RwLock::new(None),
            watch: WatchSlot::new(),
        })
    }

    pub fn config(&self) -> &LocalSourceConfig {
        &self.config
    }

    pub async fn is_watching(&self) -> bool {
        self.watch.is_running().await
    }

    async fn connected_root(&self) -> Result<PathBuf, SourceError> {
        self.root
            .read()
            .await
            .clone()
            .ok_or_else(|| SourceError::NotConnected(self.config.name.clone()))
    }

    fn observer(&self) -> PathObserver {
        PathObserver {
            engine: self.engine.clone(),
            source: self.config.name.clone(),
        }
    }

    /// Resolve an id that is not cached yet by stating the file.
    ///
    /// The path is canonicalized before the root check, so `..` components
    /// and symlinks cannot reach outside the root. The returned metadata
    /// carries the canonical path as its id.
    async fn lookup(&self, doc_id: &str) -> Result<DocumentMetadata, SourceError> {
        let not_found = || SourceError::DocumentNotFound(doc_id.to_string());
        if !Path::new(doc_id).is_absolute() {
            return Err(not_found());
        }

        let root = match self.root.read().await.clone() {
            Some(root) => root,
            None => tokio::fs::canonicalize(&self.config.root)
                .await
                .map_err(|_| not_found())?,
        };
        let path = match tokio::fs::canonicalize(doc_id).await {
            Ok(path) => path,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => {
                return Err(SourceError::Provider(format!("Cannot resolve {}: {}", doc_id, e)))
            }
        };
        if !path.starts_with(&root) {
            debug!("{} resolves outside {}", doc_id, root.display());
            return Err(not_found());
        }

        let stat = match tokio::fs::metadata(&path).await {
            Ok(stat) if stat.is_file() => stat,
            Ok(_) => return Err(not_found()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => {
                return Err(SourceError::Provider(format!("Cannot stat {}: {}", doc_id, e)))
            }
        };

        let metadata = scan::describe(&path, &stat, &self.config.name).ok_or_else(|| {
            let native = path
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
                .unwrap_or_else(|| doc_id.to_string());
            SourceError::UnsupportedType(native)
        })?;

        self.engine.cache().upsert(&metadata).await?;
        Ok(metadata)
    }
}

#[async_trait]
impl DocumentSource for LocalFileSystemSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self, _credentials))]
    async fn connect(&self, _credentials: &Credentials) -> Result<bool, SourceError> {
        let root = &self.config.root;
        match tokio::fs::metadata(root).await {
            Ok(stat) if stat.is_dir() => {}
            Ok(_) => {
                warn!("{} is not a directory", root.display());
                return Ok(false);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("{} does not exist", root.display());
                return Ok(false);
            }
            Err(e) => {
                return Err(SourceError::connection(
                    format!("Cannot access {}", root.display()),
                    e,
                ))
            }
        }

        let resolved = tokio::fs::canonicalize(root).await.map_err(|e| {
            SourceError::connection(format!("Cannot resolve {}", root.display()), e)
        })?;

        let snapshot =
            scan::scan_tree_blocking(resolved.clone(), self.config.name.clone()).await?;
        let indexed = snapshot.len();
        // Connect reconciles silently.
        self.engine.reconcile_snapshot(snapshot, None).await?;

        *self.root.write().await = Some(resolved);
        info!("Indexed {} documents under {}", indexed, root.display());
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool, SourceError> {
        debug!("Disconnected local source {}", self.config.name);
        Ok(true)
    }

    async fn list_documents(
        &self,
        filter: Option<&DocumentFilter>,
    ) -> Result<Vec<DocumentMetadata>, SourceError> {
        let docs = self.engine.cache().list().await?;
        Ok(DocumentFilter::apply(filter, docs))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_document(&self, doc_id: &str) -> Result<Document, SourceError> {
        let metadata = match self.engine.cache().get(doc_id).await? {
            Some(metadata) => metadata,
            None => self.lookup(doc_id).await?,
        };

        let content = match tokio::fs::read(&metadata.doc_id).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SourceError::DocumentNotFound(doc_id.to_string()))
            }
            Err(e) => return Err(SourceError::Provider(format!("Cannot read {}: {}", doc_id, e))),
        };

        Ok(Document::new(metadata, content))
    }

    async fn search_documents(&self, query: &str) -> Result<Vec<DocumentMetadata>, SourceError> {
        let needle = query.to_lowercase();
        Ok(self
            .engine
            .cache()
            .list()
            .await?
            .into_iter()
            .filter(|m| m.name.to_lowercase().contains(&needle))
            .collect())
    }

    #[instrument(skip(self, sink))]
    async fn watch_documents(
        &self,
        sink: EventSink,
        interval: Option<Duration>,
    ) -> Result<bool, SourceError> {
        let root = self.connected_root().await?;
        let observer = self.observer();
        let error_policy = self.config.error_policy;

        self.watch
            .start_with(move || match interval {
                None => native::spawn_native_watch(root, observer, error_policy, sink),
                Some(interval) => {
                    let cycle = Arc::new(RescanCycle { root, observer });
                    let settings = PollSettings {
                        label: format!("local:{}", cycle.observer.source),
                        interval,
                        error_policy,
                    };
                    Ok(spawn_poll_loop(cycle, settings, sink))
                }
            })
            .await
    }

    async fn stop_watching(&self) -> Result<bool, SourceError> {
        Ok(self.watch.stop().await)
    }
}

/// Poll-mode cycle: full rescan diffed against the cache.
struct RescanCycle {
    root: PathBuf,
    observer: PathObserver,
}

#[async_trait]
impl PollCycle for RescanCycle {
    async fn poll(&self, since: DateTime<Utc>) -> Result<Vec<WatchEvent>, SourceError> {
        let snapshot =
            scan::scan_tree_blocking(self.root.clone(), self.observer.source.clone()).await?;
        Ok(self
            .observer
            .engine
            .reconcile_snapshot(snapshot, Some(since))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corpusflow_core::{CacheConfig, DocumentType, ModifiedPolicy, WatchAction};
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn source_for(dir: &TempDir) -> LocalFileSystemSource {
        let config = LocalSourceConfig::new(dir.path()).with_cache(CacheConfig::Memory);
        LocalFileSystemSource::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_missing_root_returns_false() {
        let dir = TempDir::new().unwrap();
        let config = LocalSourceConfig::new(dir.path().join("absent")).with_cache(CacheConfig::Memory);
        let source = LocalFileSystemSource::open(config).await.unwrap();

        assert!(!source.connect(&Credentials::new()).await.unwrap());
        assert!(source.list_documents(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_indexes_supported_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::write(dir.path().join("b.docx"), b"PK").unwrap();
        fs::write(dir.path().join("c.bin"), b"\0").unwrap();

        let source = source_for(&dir).await;
        assert!(source.connect(&Credentials::new()).await.unwrap());

        let docs = source.list_documents(None).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d.source == "local"));

        let filter = DocumentFilter {
            doc_types: Some(vec![DocumentType::Docx]),
            ..Default::default()
        };
        let docx = source.list_documents(Some(&filter)).await.unwrap();
        assert_eq!(docx.len(), 1);
        assert_eq!(docx[0].name, "b.docx");
    }

    #[tokio::test]
    async fn test_reconnect_prunes_removed_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), b"k").unwrap();
        fs::write(dir.path().join("drop.txt"), b"d").unwrap();

        let source = source_for(&dir).await;
        source.connect(&Credentials::new()).await.unwrap();
        fs::remove_file(dir.path().join("drop.txt")).unwrap();
        source.connect(&Credentials::new()).await.unwrap();

        let names: Vec<String> = source
            .list_documents(None)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["keep.txt"]);
    }

    #[tokio::test]
    async fn test_get_document_errors() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("image.png"), b"png").unwrap();
        let source = source_for(&dir).await;
        source.connect(&Credentials::new()).await.unwrap();
        let root = source.connected_root().await.unwrap();

        let missing = root.join("missing.pdf");
        let err = source
            .get_document(&missing.to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::DocumentNotFound(_)));

        let unsupported = root.join("image.png");
        let err = source
            .get_document(&unsupported.to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedType(ext) if ext == "png"));

        let err = source.get_document("/etc/hostname.txt").await.unwrap_err();
        assert!(matches!(err, SourceError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn test_get_document_resolves_uncached_file() {
        let dir = TempDir::new().unwrap();
        let source = source_for(&dir).await;
        source.connect(&Credentials::new()).await.unwrap();

        let root = source.connected_root().await.unwrap();
        let late = root.join("late.txt");
        fs::write(&late, b"arrived after connect").unwrap();

        let doc = source.get_document(&late.to_string_lossy()).await.unwrap();
        assert_eq!(doc.content, b"arrived after connect");
        assert_eq!(doc.metadata.doc_type, DocumentType::Txt);
        assert_eq!(source.list_documents(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Quarterly Report.pdf"), b"%PDF").unwrap();
        fs::write(dir.path().join("notes.txt"), b"n").unwrap();
        let source = source_for(&dir).await;
        source.connect(&Credentials::new()).await.unwrap();

        let hits = source.search_documents("REPORT").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "Quarterly Report.pdf");
    }

    #[tokio::test]
    async fn test_watch_requires_connect() {
        let dir = TempDir::new().unwrap();
        let source = source_for(&dir).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = source.watch_documents(tx, None).await.unwrap_err();
        assert!(matches!(err, SourceError::NotConnected(_)));
        assert!(source.stop_watching().await.unwrap());
    }

    #[tokio::test]
    async fn test_poll_mode_detects_changes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("existing.txt"), b"e").unwrap();
        let config = LocalSourceConfig::new(dir.path())
            .with_cache(CacheConfig::Memory)
            .with_modified_policy(ModifiedPolicy::OnChange);
        let source = LocalFileSystemSource::open(config).await.unwrap();
        source.connect(&Credentials::new()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(source
            .watch_documents(tx, Some(Duration::from_millis(50)))
            .await
            .unwrap());

        fs::write(dir.path().join("fresh.pdf"), b"%PDF").unwrap();
        fs::remove_file(dir.path().join("existing.txt")).unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push((event.action, event.metadata.name));
        }
        seen.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            seen,
            vec![
                (WatchAction::Deleted, "existing.txt".to_string()),
                (WatchAction::Created, "fresh.pdf".to_string()),
            ]
        );

        assert!(source.stop_watching().await.unwrap());
        assert!(!source.is_watching().await);
    }

    #[tokio::test]
    async fn test_get_document_stays_under_root() {
        let outer = TempDir::new().unwrap();
        let root_dir = outer.path().join("root");
        fs::create_dir_all(root_dir.join("sub")).unwrap();
        fs::write(outer.path().join("secret.txt"), b"outside the root").unwrap();
        fs::write(root_dir.join("inside.txt"), b"inside").unwrap();

        let config = LocalSourceConfig::new(&root_dir).with_cache(CacheConfig::Memory);
        let source = LocalFileSystemSource::open(config).await.unwrap();
        source.connect(&Credentials::new()).await.unwrap();
        let root = source.connected_root().await.unwrap();

        let escape = format!("{}/../secret.txt", root.display());
        let err = source.get_document(&escape).await.unwrap_err();
        assert!(matches!(err, SourceError::DocumentNotFound(_)));

        // A late file reached through `..` is cached under its canonical id.
        fs::write(root.join("late.txt"), b"late").unwrap();
        let detour = format!("{}/sub/../late.txt", root.display());
        let doc = source.get_document(&detour).await.unwrap();
        assert_eq!(doc.content, b"late");
        assert_eq!(doc.metadata.doc_id, root.join("late.txt").to_string_lossy());

        let mut ids: Vec<String> = source
            .list_documents(None)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.doc_id)
            .collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                root.join("inside.txt").to_string_lossy().into_owned(),
                root.join("late.txt").to_string_lossy().into_owned(),
            ]
        );
    }
}
