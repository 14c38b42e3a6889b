//! Watch-loop building blocks shared by every source.
//!
//! A source pushes each classified change onto an [`EventSink`]. At most one
//! background task runs per source; it is held in a [`WatchSlot`] and stopped
//! cooperatively through a shutdown channel.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::document::DocumentMetadata;
use crate::error::SourceError;

/// How long `stop` waits for a watch task before detaching from it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Kind of change detected for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchAction {
    Created,
    Modified,
    Deleted,
}

impl WatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchAction::Created => "created",
            WatchAction::Modified => "modified",
            WatchAction::Deleted => "deleted",
        }
    }
}

impl fmt::Display for WatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified change emitted by one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub metadata: DocumentMetadata,
}

impl WatchEvent {
    pub fn new(action: WatchAction, metadata: DocumentMetadata) -> Self {
        Self { action, metadata }
    }
}

/// A change relayed to subscribers, tagged with the originating source name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub source: String,
    pub action: WatchAction,
    pub metadata: DocumentMetadata,
}

/// Channel end a source pushes its events onto.
pub type EventSink = mpsc::UnboundedSender<WatchEvent>;

/// What a poll loop does when one cycle fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopErrorPolicy {
    /// Log and try again next cycle, keeping the watermark.
    Continue,
    /// Log and end the loop.
    Stop,
}

impl Default for LoopErrorPolicy {
    fn default() -> Self {
        Self::Continue
    }
}

/// Handle on a running watch task.
pub struct WatchHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Spawn a watch task. The closure receives the shutdown receiver, which
    /// flips to `true` (or closes) when the task should exit.
    pub fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run(rx));
        Self { shutdown, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Whether shutdown was already signalled.
    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Signal the task and wait up to `timeout` for it to exit. Returns
    /// whether it exited in time.
    ///
    /// A task still inside a cycle when the timeout fires is never aborted:
    /// it finishes the cycle, delivers that cycle's events and exits at the
    /// next boundary.
    pub async fn stop(&mut self, timeout: Duration) -> bool {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    "Watch task still busy after {:?}, it will exit after its current cycle",
                    timeout
                );
                false
            }
        }
    }

    /// Wait for a signalled task to exit.
    async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Watch task ended abnormally: {}", e);
        }
    }
}

/// Holder enforcing at most one watch task per source.
#[derive(Default)]
pub struct WatchSlot {
    handle: Mutex<Option<WatchHandle>>,
}

impl WatchSlot {
    pub fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    /// Start a task with `start` unless one is already running.
    ///
    /// Returns `Ok(true)` both when a task was started and when one was
    /// already running. A task that is still draining after a stop is
    /// awaited before the new one starts.
    pub async fn start_with<F>(&self, start: F) -> Result<bool, SourceError>
    where
        F: FnOnce() -> Result<WatchHandle, SourceError>,
    {
        let mut guard = self.handle.lock().await;
        if let Some(existing) = guard.take() {
            if existing.is_stopping() {
                debug!("Waiting for the previous watch task to finish its cycle");
                existing.join().await;
            } else if !existing.is_finished() {
                debug!("Watch already running, ignoring start request");
                *guard = Some(existing);
                return Ok(true);
            }
        }
        *guard = Some(start()?);
        Ok(true)
    }

    /// Stop the running task, if any. Safe to call repeatedly.
    ///
    /// Returns `false` when the task is still finishing a cycle; it stays in
    /// the slot until it exits.
    pub async fn stop(&self) -> bool {
        let mut guard = self.handle.lock().await;
        let stopped = match guard.as_mut() {
            Some(handle) if handle.is_finished() => true,
            Some(handle) => handle.stop(STOP_TIMEOUT).await,
            None => true,
        };
        if stopped {
            *guard = None;
        }
        stopped
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

/// One polling cycle of a poll-driven source.
#[async_trait]
pub trait PollCycle: Send + Sync + 'static {
    /// Observe the repository for changes after `since`, update the cache and
    /// return the events to emit.
    async fn poll(&self, since: DateTime<Utc>) -> Result<Vec<WatchEvent>, SourceError>;
}

/// Settings of a poll loop.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Label used in log lines
    pub label: String,
    pub interval: Duration,
    pub error_policy: LoopErrorPolicy,
}

/// Spawn the generic poll-and-diff loop.
///
/// The watermark starts at the spawn instant. After a successful cycle it
/// advances to the instant that cycle's query was issued, so changes landing
/// during a slow query are picked up by the next cycle. Shutdown is observed
/// between cycles only.
pub fn spawn_poll_loop<P: PollCycle>(
    cycle: Arc<P>,
    settings: PollSettings,
    sink: EventSink,
) -> WatchHandle {
    WatchHandle::spawn(move |mut shutdown| async move {
        let PollSettings {
            label,
            interval,
            error_policy,
        } = settings;
        let mut watermark = Utc::now();
        debug!("[{}] poll loop started (interval {:?})", label, interval);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let issued_at = Utc::now();
            debug!("[{}] polling for changes since {}", label, watermark.to_rfc3339());
            match cycle.poll(watermark).await {
                Ok(events) => {
                    watermark = issued_at;
                    for event in events {
                        if sink.send(event).is_err() {
                            debug!("[{}] event receiver dropped, ending poll loop", label);
                            return;
                        }
                    }
                }
                Err(e) => match error_policy {
                    LoopErrorPolicy::Continue => {
                        warn!("[{}] poll cycle failed, retrying next cycle: {}", label, e);
                    }
                    LoopErrorPolicy::Stop => {
                        error!("[{}] poll cycle failed, stopping watch: {}", label, e);
                        break;
                    }
                },
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("[{}] poll loop stopped", label);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentType;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn meta(doc_id: &str) -> DocumentMetadata {
        DocumentMetadata {
            doc_id: doc_id.to_string(),
            name: doc_id.to_string(),
            doc_type: DocumentType::Pdf,
            created_at: Utc::now(),
            modified_at: Utc::now(),
            source: "test".to_string(),
            size: 0,
            additional_metadata: BTreeMap::new(),
        }
    }

    /// Records every watermark it is asked about; fails on chosen cycles.
    struct Recorder {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
        watermarks: StdMutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait]
    impl PollCycle for Recorder {
        async fn poll(&self, since: DateTime<Utc>) -> Result<Vec<WatchEvent>, SourceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.watermarks.lock().unwrap().push(since);
            if self.fail_on.contains(&call) {
                return Err(SourceError::Provider("transient".to_string()));
            }
            Ok(vec![WatchEvent::new(
                WatchAction::Created,
                meta(&format!("doc-{}", call)),
            )])
        }
    }

    fn settings(policy: LoopErrorPolicy) -> PollSettings {
        PollSettings {
            label: "test".to_string(),
            interval: Duration::from_millis(20),
            error_policy: policy,
        }
    }

    #[tokio::test]
    async fn test_poll_loop_emits_and_stops() {
        let cycle = Arc::new(Recorder {
            calls: AtomicUsize::new(0),
            fail_on: vec![],
            watermarks: StdMutex::new(Vec::new()),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = spawn_poll_loop(cycle.clone(), settings(LoopErrorPolicy::Continue), tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.metadata.doc_id, "doc-0");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.metadata.doc_id, "doc-1");

        assert!(handle.stop(STOP_TIMEOUT).await);

        let marks = cycle.watermarks.lock().unwrap().clone();
        for pair in marks.windows(2) {
            assert!(pair[0] <= pair[1], "watermark must never move backwards");
        }
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_watermark() {
        let cycle = Arc::new(Recorder {
            calls: AtomicUsize::new(0),
            fail_on: vec![0],
            watermarks: StdMutex::new(Vec::new()),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = spawn_poll_loop(cycle.clone(), settings(LoopErrorPolicy::Continue), tx);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.metadata.doc_id, "doc-1");
        handle.stop(STOP_TIMEOUT).await;

        let marks = cycle.watermarks.lock().unwrap().clone();
        assert_eq!(marks[0], marks[1]);
    }

    #[tokio::test]
    async fn test_stop_policy_ends_loop() {
        let cycle = Arc::new(Recorder {
            calls: AtomicUsize::new(0),
            fail_on: vec![0],
            watermarks: StdMutex::new(Vec::new()),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_poll_loop(cycle.clone(), settings(LoopErrorPolicy::Stop), tx);

        // The loop drops its sink when it exits.
        assert!(rx.recv().await.is_none());
        assert_eq!(cycle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watch_slot_allows_one_task() {
        let slot = WatchSlot::new();
        let started = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let started = started.clone();
            let ok = slot
                .start_with(|| {
                    started.fetch_add(1, Ordering::SeqCst);
                    Ok(WatchHandle::spawn(|mut shutdown| async move {
                        let _ = shutdown.changed().await;
                    }))
                })
                .await
                .unwrap();
            assert!(ok);
        }

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(slot.is_running().await);
        assert!(slot.stop().await);
        assert!(!slot.is_running().await);
        assert!(slot.stop().await);
    }

    /// Takes longer than any stop timeout and reports one creation.
    struct SlowCycle {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PollCycle for SlowCycle {
        async fn poll(&self, _since: DateTime<Utc>) -> Result<Vec<WatchEvent>, SourceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(vec![WatchEvent::new(
                WatchAction::Created,
                meta(&format!("slow-{}", call)),
            )])
        }
    }

    #[tokio::test]
    async fn test_stop_timeout_lets_cycle_finish() {
        let cycle = Arc::new(SlowCycle {
            delay: Duration::from_millis(300),
            calls: AtomicUsize::new(0),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = spawn_poll_loop(cycle.clone(), settings(LoopErrorPolicy::Continue), tx);

        // Let the first cycle begin, then stop with a timeout shorter than it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.stop(Duration::from_millis(20)).await);
        assert!(handle.is_stopping());

        // The in-flight cycle still delivers its event, then the loop exits.
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.metadata.doc_id, "slow-0");
        assert!(tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .is_none());
        assert_eq!(cycle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watch_slot_waits_for_draining_task() {
        let slot = WatchSlot::new();
        let cycle = Arc::new(SlowCycle {
            delay: Duration::from_millis(2_500),
            calls: AtomicUsize::new(0),
        });

        let (tx, mut first_rx) = mpsc::unbounded_channel();
        let first = cycle.clone();
        slot.start_with(|| Ok(spawn_poll_loop(first, settings(LoopErrorPolicy::Continue), tx)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The cycle outlasts STOP_TIMEOUT, so the task is left draining.
        assert!(!slot.stop().await);
        assert!(slot.is_running().await);

        // Restarting waits for the old task; its event is not lost.
        slot.start_with(|| {
            Ok(WatchHandle::spawn(|mut shutdown| async move {
                let _ = shutdown.changed().await;
            }))
        })
        .await
        .unwrap();

        let event = first_rx.recv().await.unwrap();
        assert_eq!(event.metadata.doc_id, "slow-0");
        assert!(first_rx.recv().await.is_none());
        assert!(slot.stop().await);
    }
}
