//! Document manager: registry of named sources and fan-out of their changes.
//!
//! Each watched source pushes events on its own channel. A relay task per
//! source reads that channel and hands every event, tagged with the source
//! name, to every registered subscriber. Subscribers run on the relay task
//! of the source that produced the event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::document::{Document, DocumentFilter, DocumentMetadata};
use crate::error::SourceError;
use crate::source::{Credentials, DocumentSource};
use crate::watch::{SourceEvent, WatchAction, WatchEvent, STOP_TIMEOUT};

/// Subscriber callback: `(source_name, action, metadata)`.
pub type WatchCallback = Arc<dyn Fn(&str, WatchAction, &DocumentMetadata) + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    Callback(WatchCallback),
    Channel(mpsc::UnboundedSender<SourceEvent>),
}

/// Registry of named sources and named subscribers.
pub struct DocumentManager {
    sources: DashMap<String, Arc<dyn DocumentSource>>,
    subscribers: Arc<DashMap<String, Subscriber>>,
    relays: DashMap<String, JoinHandle<()>>,
}

impl Default for DocumentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentManager {
    pub fn new() -> Self {
        Self {
            sources: DashMap::new(),
            subscribers: Arc::new(DashMap::new()),
            relays: DashMap::new(),
        }
    }

    // =========================================================================
    // Source registry
    // =========================================================================

    /// Register a source under `name`, replacing any previous one.
    pub fn add_source(&self, name: impl Into<String>, source: Arc<dyn DocumentSource>) {
        let name = name.into();
        if self.sources.insert(name.clone(), source).is_some() {
            warn!("Replaced existing source {}", name);
        } else {
            debug!("Added source {}", name);
        }
    }

    /// Stop, disconnect and unregister a source. Unknown names are ignored.
    #[instrument(skip(self))]
    pub async fn remove_source(&self, name: &str) -> Result<(), SourceError> {
        let Some((_, source)) = self.sources.remove(name) else {
            return Ok(());
        };

        if let Err(e) = source.stop_watching().await {
            warn!("Error stopping watch for {}: {}", name, e);
        }
        source.disconnect().await?;

        if let Some((_, relay)) = self.relays.remove(name) {
            Self::join_relay(name, relay).await;
        }

        debug!("Removed source {}", name);
        Ok(())
    }

    pub fn get_source(&self, name: &str) -> Option<Arc<dyn DocumentSource>> {
        self.sources.get(name).map(|s| s.value().clone())
    }

    /// Registered source names, sorted.
    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn require_source(&self, name: &str) -> Result<Arc<dyn DocumentSource>, SourceError> {
        self.get_source(name)
            .ok_or_else(|| SourceError::SourceNotFound(name.to_string()))
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn DocumentSource>)> {
        self.sources
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    // =========================================================================
    // Delegated operations
    // =========================================================================

    #[instrument(skip(self, credentials))]
    pub async fn connect_source(
        &self,
        name: &str,
        credentials: &Credentials,
    ) -> Result<bool, SourceError> {
        let source = self.require_source(name)?;
        let connected = source.connect(credentials).await?;
        if connected {
            info!("Connected source {}", name);
        } else {
            warn!("Source {} is unavailable", name);
        }
        Ok(connected)
    }

    /// List cached documents of every source. A failing source is logged and
    /// contributes an empty list.
    pub async fn list_all_documents(
        &self,
        filter: Option<&DocumentFilter>,
    ) -> HashMap<String, Vec<DocumentMetadata>> {
        let calls = self.snapshot().into_iter().map(|(name, source)| async move {
            let docs = match source.list_documents(filter).await {
                Ok(docs) => docs,
                Err(e) => {
                    warn!("Error listing documents from {}: {}", name, e);
                    Vec::new()
                }
            };
            (name, docs)
        });
        join_all(calls).await.into_iter().collect()
    }

    /// Search every source. A failing source is logged and contributes an
    /// empty list.
    pub async fn search_all_documents(&self, query: &str) -> HashMap<String, Vec<DocumentMetadata>> {
        let calls = self.snapshot().into_iter().map(|(name, source)| async move {
            let docs = match source.search_documents(query).await {
                Ok(docs) => docs,
                Err(e) => {
                    warn!("Error searching documents from {}: {}", name, e);
                    Vec::new()
                }
            };
            (name, docs)
        });
        join_all(calls).await.into_iter().collect()
    }

    pub async fn get_document(&self, source_name: &str, doc_id: &str) -> Result<Document, SourceError> {
        self.require_source(source_name)?.get_document(doc_id).await
    }

    // =========================================================================
    // Subscribers
    // =========================================================================

    /// Register a callback invoked for every change in any watched source.
    /// A callback with the same name is replaced.
    pub fn add_watch_callback<F>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn(&str, WatchAction, &DocumentMetadata) + Send + Sync + 'static,
    {
        self.subscribers
            .insert(name.into(), Subscriber::Callback(Arc::new(callback)));
    }

    /// Register a channel subscriber. A subscriber with the same name is
    /// replaced. The subscriber is dropped once its receiver is closed.
    pub fn subscribe(&self, name: impl Into<String>) -> mpsc::UnboundedReceiver<SourceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(name.into(), Subscriber::Channel(tx));
        rx
    }

    pub fn remove_watch_callback(&self, name: &str) {
        self.subscribers.remove(name);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    // =========================================================================
    // Watch lifecycle
    // =========================================================================

    /// Start watching every registered source.
    ///
    /// `intervals` maps source names to poll intervals; a missing entry or
    /// `None` selects the source's native mechanism. All sources are started
    /// concurrently. Every start failure is logged; once all attempts are
    /// done the first failure is returned. Returns `Ok(true)` when every
    /// source is watching.
    pub async fn watch_all_sources(
        &self,
        intervals: &HashMap<String, Option<Duration>>,
    ) -> Result<bool, SourceError> {
        let attempts = self.snapshot().into_iter().map(|(name, source)| {
            let interval = intervals.get(&name).copied().flatten();
            async move {
                let (tx, rx) = mpsc::unbounded_channel();
                let result = source.watch_documents(tx, interval).await;
                (name, rx, result)
            }
        });

        let mut success = true;
        let mut first_error = None;

        for (name, rx, result) in join_all(attempts).await {
            match result {
                Ok(true) => self.spawn_relay(name, rx),
                Ok(false) => {
                    warn!("Source {} declined to start watching", name);
                    success = false;
                }
                Err(e) => {
                    error!("Error setting up watch for {}: {}", name, e);
                    success = false;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(success),
        }
    }

    /// Stop every source's watch. Failures are logged and do not prevent the
    /// remaining sources from being stopped.
    pub async fn stop_watching_all(&self) -> bool {
        let mut success = true;
        for (name, source) in self.snapshot() {
            match source.stop_watching().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Source {} did not stop cleanly", name);
                    success = false;
                }
                Err(e) => {
                    error!("Error stopping watch for {}: {}", name, e);
                    success = false;
                }
            }
        }

        let names: Vec<String> = self.relays.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, relay)) = self.relays.remove(&name) {
                Self::join_relay(&name, relay).await;
            }
        }

        success
    }

    fn spawn_relay(&self, source_name: String, mut rx: mpsc::UnboundedReceiver<WatchEvent>) {
        if let Some(existing) = self.relays.get(&source_name) {
            if !existing.is_finished() {
                debug!("Relay for {} already running", source_name);
                return;
            }
        }

        let subscribers = self.subscribers.clone();
        let name = source_name.clone();
        let relay = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                debug!(
                    "{} {} in {}",
                    event.action, event.metadata.doc_id, name
                );
                let targets: Vec<(String, Subscriber)> = subscribers
                    .iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect();

                for (subscriber_name, subscriber) in targets {
                    match subscriber {
                        Subscriber::Callback(callback) => {
                            callback(&name, event.action, &event.metadata)
                        }
                        Subscriber::Channel(tx) => {
                            let relayed = SourceEvent {
                                source: name.clone(),
                                action: event.action,
                                metadata: event.metadata.clone(),
                            };
                            if tx.send(relayed).is_err() {
                                debug!("Subscriber {} closed, removing", subscriber_name);
                                subscribers.remove_if(&subscriber_name, |_, s| {
                                    matches!(s, Subscriber::Channel(tx) if tx.is_closed())
                                });
                            }
                        }
                    }
                }
            }
            debug!("Relay for {} finished", name);
        });

        self.relays.insert(source_name, relay);
    }

    /// Wait for a relay to drain. A relay whose source is still finishing a
    /// cycle is left running; it exits once that source drops its sink.
    async fn join_relay(name: &str, mut relay: JoinHandle<()>) {
        if tokio::time::timeout(STOP_TIMEOUT, &mut relay).await.is_err() {
            warn!("Relay for {} still draining after stop, detaching", name);
        }
    }
}
