//! Native filesystem notifications through `notify`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use corpusflow_core::{
    DiffEngine, EventSink, LoopErrorPolicy, Observation, SourceError, WatchEvent, WatchHandle,
};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::scan;

/// Turns filesystem paths into diff observations for one source.
#[derive(Clone)]
pub(crate) struct PathObserver {
    pub(crate) engine: DiffEngine,
    pub(crate) source: String,
}

impl PathObserver {
    /// Observe a path that was created or changed.
    ///
    /// A path that no longer exists is handled as a removal. A directory is
    /// walked for documents that are not cached yet.
    pub(crate) async fn observe(&self, path: &Path) -> Result<Vec<WatchEvent>, SourceError> {
        match tokio::fs::metadata(path).await {
            Ok(stat) if stat.is_dir() => self.appeared(path).await,
            Ok(stat) => match scan::describe(path, &stat, &self.source) {
                Some(metadata) => Ok(self
                    .engine
                    .apply(Observation::Present(metadata))
                    .await?
                    .into_iter()
                    .collect()),
                None => Ok(Vec::new()),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => self.removed(path).await,
            Err(e) => Err(SourceError::Provider(format!(
                "Cannot stat {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Observe a directory that appeared under the root, typically moved in
    /// with its contents. The platform reports no event for those contents.
    async fn appeared(&self, dir: &Path) -> Result<Vec<WatchEvent>, SourceError> {
        let found = scan::scan_tree_blocking(dir.to_path_buf(), self.source.clone()).await?;

        let mut events = Vec::new();
        for metadata in found {
            if self.engine.cache().get(&metadata.doc_id).await?.is_some() {
                continue;
            }
            if let Some(event) = self.engine.apply(Observation::Present(metadata)).await? {
                events.push(event);
            }
        }
        if !events.is_empty() {
            debug!(
                "[{}] {} documents found under {}",
                self.source,
                events.len(),
                dir.display()
            );
        }
        Ok(events)
    }

    /// Observe a removed path. Every cached document at or below it is
    /// deleted, which covers removed directories.
    pub(crate) async fn removed(&self, path: &Path) -> Result<Vec<WatchEvent>, SourceError> {
        let affected: Vec<String> = self
            .engine
            .cache()
            .list()
            .await?
            .into_iter()
            .map(|m| m.doc_id)
            .filter(|doc_id| Path::new(doc_id).starts_with(path))
            .collect();

        let mut events = Vec::with_capacity(affected.len());
        for doc_id in affected {
            if let Some(event) = self.engine.apply(Observation::Removed { doc_id }).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn handle(&self, event: Event) -> Vec<WatchEvent> {
        let mut emitted = Vec::new();
        for path in &event.paths {
            let result = match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => self.observe(path).await,
                EventKind::Remove(_) => self.removed(path).await,
                _ => continue,
            };
            match result {
                Ok(mut events) => emitted.append(&mut events),
                Err(e) => warn!("[{}] failed to process {}: {}", self.source, path.display(), e),
            }
        }
        emitted
    }
}

/// Start a recursive `notify` watcher on `root` and a task that classifies
/// its events. Dropping the task drops the watcher.
pub(crate) fn spawn_native_watch(
    root: PathBuf,
    observer: PathObserver,
    error_policy: LoopErrorPolicy,
    sink: EventSink,
) -> Result<WatchHandle, SourceError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })
    .map_err(|e| SourceError::Watch(format!("Failed to create watcher: {}", e)))?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| SourceError::Watch(format!("Failed to watch {}: {}", root.display(), e)))?;

    debug!("[{}] watching {}", observer.source, root.display());

    Ok(WatchHandle::spawn(move |mut shutdown| async move {
        let _watcher = watcher;
        let label = observer.source.clone();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = rx.recv() => match received {
                    Some(Ok(event)) => {
                        for change in observer.handle(event).await {
                            if sink.send(change).is_err() {
                                debug!("[{}] event receiver dropped, ending watch", label);
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => match error_policy {
                        LoopErrorPolicy::Continue => warn!("[{}] watcher error: {}", label, e),
                        LoopErrorPolicy::Stop => {
                            error!("[{}] watcher error, stopping watch: {}", label, e);
                            break;
                        }
                    },
                    None => break,
                },
            }
        }

        debug!("[{}] native watch stopped", label);
    }))
}
