// 🔁 Batch Processor - single-worker loop over the pending queue
// Drives queued documents through extraction and persistence one at a
// time. A failing item is marked ERROR and the loop moves on.

use crate::auth::{active_session, Session};
use crate::document::{DocType, DocumentFile, ExtractedField};
use crate::error::{BatchError, ExtractError, QueueError};
use crate::extract::Extractor;
use crate::queue::{Job, Queue};
use crate::store::DocumentStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

// ============================================================================
// CANCELLATION
// ============================================================================

/// Cooperative stop signal, checked before each item's extraction
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// EVENTS & REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Items taken out of PENDING during this run
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Completed items whose results were stored
    pub persisted: usize,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn summary(&self) -> String {
        format!(
            "Processed {} document(s): {} completed, {} failed, {} stored{}",
            self.processed,
            self.completed,
            self.failed,
            self.persisted,
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    ItemStarted { id: String },
    ItemCompleted { id: String, fields: usize },
    ItemFailed { id: String, error: String },
    /// Sent exactly once per run, last
    Completed(BatchReport),
}

// ============================================================================
// RUN GUARD
// ============================================================================

/// Message left on an item whose run was dropped mid-extraction
pub const INTERRUPTED: &str = "Processing was interrupted";

/// Releases the queue if `run` is dropped before it returns (timeout,
/// `select!`, aborted task). The in-flight item becomes ERROR so it can be
/// retried.
struct RunGuard {
    queue: Arc<Mutex<Queue>>,
    in_flight: Option<String>,
    armed: bool,
}

impl RunGuard {
    fn new(queue: Arc<Mutex<Queue>>) -> Self {
        RunGuard { queue, in_flight: None, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

fn release(queue: &mut Queue, in_flight: Option<String>) {
    if let Some(id) = in_flight {
        if let Err(e) = queue.finish(&id, Err(INTERRUPTED.to_string())) {
            debug!(%id, error = %e, "interrupted item already settled");
        }
    }
    queue.set_running(false);
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let in_flight = self.in_flight.take();
        warn!(item = ?in_flight, "batch run dropped before finishing");

        // The loop never holds the lock across an await, so this normally succeeds
        if let Ok(mut queue) = self.queue.try_lock() {
            release(&mut queue, in_flight);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = Arc::clone(&self.queue);
                handle.spawn(async move {
                    release(&mut *queue.lock().await, in_flight);
                });
            }
            Err(_) => warn!("no runtime to release the queue; it stays marked as running"),
        }
    }
}

// ============================================================================
// BATCH PROCESSOR
// ============================================================================

pub struct BatchProcessor<E, S> {
    queue: Arc<Mutex<Queue>>,
    extractor: E,
    store: S,
    events: Option<mpsc::UnboundedSender<BatchEvent>>,
}

impl<E, S> BatchProcessor<E, S>
where
    E: Extractor,
    S: DocumentStore,
{
    pub fn new(queue: Arc<Mutex<Queue>>, extractor: E, store: S) -> Self {
        BatchProcessor {
            queue,
            extractor,
            store,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<BatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Shared handle for operator edits between (and during) runs
    pub fn queue(&self) -> Arc<Mutex<Queue>> {
        Arc::clone(&self.queue)
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.events {
            // Receiver gone just means nobody is watching
            let _ = tx.send(event);
        }
    }

    /// Process every PENDING item in insertion order.
    ///
    /// Refuses to start while another run is active or while any unfinished
    /// item lacks a document type. Without a valid session items are still
    /// extracted but nothing is persisted.
    pub async fn run(&self, session: Option<&Session>, cancel: &CancelToken) -> Result<BatchReport, BatchError> {
        let ids = {
            let mut queue = self.queue.lock().await;
            if queue.is_running() {
                return Err(BatchError::AlreadyRunning);
            }
            let missing = queue.missing_doc_types();
            if !missing.is_empty() {
                return Err(BatchError::MissingDocType(missing));
            }
            queue.set_running(true);
            queue.pending_ids()
        };

        let mut guard = RunGuard::new(Arc::clone(&self.queue));

        let session = active_session(session);
        if session.is_none() {
            warn!("no valid session; extracted results will not be persisted");
        }
        info!(items = ids.len(), "batch started");

        let mut report = BatchReport::default();
        for id in ids {
            if cancel.is_cancelled() {
                info!("batch cancelled");
                report.cancelled = true;
                break;
            }

            let job = match self.queue.lock().await.begin(&id) {
                Ok(job) => job,
                // Removed or retyped by the operator since the run started
                Err(QueueError::UnknownItem(_)) | Err(QueueError::InvalidTransition { .. }) => {
                    debug!(%id, "queue item skipped");
                    continue;
                }
                Err(e) => {
                    warn!(%id, error = %e, "queue item could not start");
                    continue;
                }
            };

            guard.in_flight = Some(id.clone());
            report.processed += 1;
            self.emit(BatchEvent::ItemStarted { id: id.clone() });

            let outcome = self.process(&job, session).await;
            let event = match &outcome {
                Ok((fields, persisted)) => {
                    report.completed += 1;
                    if *persisted {
                        report.persisted += 1;
                    }
                    info!(%id, file = %job.file.name, fields = fields.len(), "document processed");
                    BatchEvent::ItemCompleted { id: id.clone(), fields: fields.len() }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(%id, file = %job.file.name, error = %e, "document failed");
                    BatchEvent::ItemFailed { id: id.clone(), error: e.item_message() }
                }
            };

            let finished = self
                .queue
                .lock()
                .await
                .finish(&id, outcome.map(|(fields, _)| fields).map_err(|e| e.item_message()));
            guard.in_flight = None;
            if let Err(e) = finished {
                warn!(%id, error = %e, "could not record item outcome");
            }
            self.emit(event);
        }

        self.queue.lock().await.set_running(false);
        guard.disarm();
        info!(summary = %report.summary(), "batch finished");
        self.emit(BatchEvent::Completed(report.clone()));
        Ok(report)
    }

    /// Extract, then persist when a session is present
    async fn process(
        &self,
        job: &Job,
        session: Option<&Session>,
    ) -> Result<(Vec<ExtractedField>, bool), ExtractError> {
        let fields = self.extract(&job.file, job.doc_type).await?;

        match session {
            Some(session) => {
                self.store
                    .save(&job.file, job.doc_type, &fields, &session.user_id)
                    .await?;
                Ok((fields, true))
            }
            None => Ok((fields, false)),
        }
    }

    async fn extract(&self, file: &DocumentFile, doc_type: DocType) -> Result<Vec<ExtractedField>, ExtractError> {
        self.extractor.extract(file, doc_type).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ItemStatus;
    use crate::store::{SqliteStore, StoredDocument};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Fails for files whose name starts with "bad"; records call order
    #[derive(Default)]
    struct ScriptedExtractor {
        calls: StdMutex<Vec<String>>,
    }

    impl ScriptedExtractor {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn extract(&self, file: &DocumentFile, _: DocType) -> Result<Vec<ExtractedField>, ExtractError> {
            self.calls.lock().unwrap().push(file.name.clone());
            if file.name.starts_with("bad") {
                return Err(ExtractError::Extraction("Document unreadable".to_string()));
            }
            Ok(vec![ExtractedField::new("Source", file.name.clone(), 0.9)])
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn save(&self, _: &DocumentFile, _: DocType, _: &[ExtractedField], _: &str) -> Result<StoredDocument, ExtractError> {
            Err(ExtractError::Persistence("bucket not found".to_string()))
        }

        async fn list_for_user(&self, _: &str) -> Result<Vec<StoredDocument>, ExtractError> {
            Ok(vec![])
        }
    }

    fn doc(name: &str) -> DocumentFile {
        DocumentFile::new(name, "image/png", vec![7; 16])
    }

    fn typed_queue(names: &[&str]) -> (Arc<Mutex<Queue>>, Vec<String>) {
        let mut queue = Queue::new();
        let ids = names
            .iter()
            .map(|n| queue.enqueue_typed(doc(n), DocType::BankStatement))
            .collect();
        (Arc::new(Mutex::new(queue)), ids)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<BatchEvent>) -> Vec<BatchEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory(dir.path()).unwrap());
        let (queue, ids) = typed_queue(&["one.png", "bad-two.png", "three.png"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let extractor = Arc::new(ScriptedExtractor::default());

        let processor = BatchProcessor::new(queue.clone(), extractor.clone(), store.clone()).with_events(tx);
        let session = Session::new("user-1");
        let report = processor.run(Some(&session), &CancelToken::new()).await.unwrap();

        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.persisted, 2);

        let q = queue.lock().await;
        assert_eq!(q.get(&ids[0]).unwrap().status(), ItemStatus::Completed);
        assert_eq!(q.get(&ids[1]).unwrap().status(), ItemStatus::Error);
        assert_eq!(q.get(&ids[1]).unwrap().error(), Some("Document unreadable"));
        assert_eq!(q.get(&ids[2]).unwrap().status(), ItemStatus::Completed);
        assert!(!q.is_running());

        // Insertion order, and the failing item is not retried automatically
        assert_eq!(extractor.calls(), vec!["one.png", "bad-two.png", "three.png"]);

        let events = drain(&mut rx);
        let completions = events.iter().filter(|e| matches!(e, BatchEvent::Completed(_))).count();
        assert_eq!(completions, 1);
        assert!(matches!(events.last(), Some(BatchEvent::Completed(_))));

        assert_eq!(store.list_for_user("user-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_reprocesses_only_failed_item() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::in_memory(dir.path()).unwrap();
        let (queue, ids) = typed_queue(&["one.png", "bad-two.png", "three.png"]);
        let extractor = Arc::new(ScriptedExtractor::default());
        let processor = BatchProcessor::new(queue.clone(), extractor.clone(), store);

        processor.run(None, &CancelToken::new()).await.unwrap();
        queue.lock().await.retry(&ids[1]).unwrap();

        let report = processor.run(None, &CancelToken::new()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(extractor.calls().len(), 4);
        assert_eq!(extractor.calls()[3], "bad-two.png");
    }

    #[tokio::test]
    async fn test_refuses_to_start_without_doc_types() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::in_memory(dir.path()).unwrap();
        let mut queue = Queue::new();
        queue.enqueue_typed(doc("typed.png"), DocType::PayStub);
        let untyped = queue.enqueue(vec![doc("untyped.png")]);
        let queue = Arc::new(Mutex::new(queue));
        let extractor = Arc::new(ScriptedExtractor::default());

        let processor = BatchProcessor::new(queue.clone(), extractor.clone(), store);
        let err = processor.run(None, &CancelToken::new()).await.unwrap_err();

        assert_eq!(err, BatchError::MissingDocType(untyped));
        assert!(extractor.calls().is_empty());
        assert!(!queue.lock().await.is_running());
    }

    #[tokio::test]
    async fn test_refuses_concurrent_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::in_memory(dir.path()).unwrap();
        let (queue, _) = typed_queue(&["one.png"]);
        queue.lock().await.set_running(true);

        let processor = BatchProcessor::new(queue, ScriptedExtractor::default(), store);
        let err = processor.run(None, &CancelToken::new()).await.unwrap_err();
        assert_eq!(err, BatchError::AlreadyRunning);
    }

    #[tokio::test]
    async fn test_persistence_failure_marks_item_error() {
        let (queue, ids) = typed_queue(&["one.png"]);
        let processor = BatchProcessor::new(queue.clone(), ScriptedExtractor::default(), BrokenStore);

        let session = Session::new("user-1");
        let report = processor.run(Some(&session), &CancelToken::new()).await.unwrap();

        assert_eq!(report.failed, 1);
        let q = queue.lock().await;
        assert_eq!(q.get(&ids[0]).unwrap().error(), Some("bucket not found"));
        assert!(q.get(&ids[0]).unwrap().result().is_none());
    }

    #[tokio::test]
    async fn test_without_session_nothing_is_persisted() {
        let (queue, ids) = typed_queue(&["one.png"]);
        let processor = BatchProcessor::new(queue.clone(), ScriptedExtractor::default(), BrokenStore);

        let report = processor.run(None, &CancelToken::new()).await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.persisted, 0);
        assert_eq!(queue.lock().await.get(&ids[0]).unwrap().status(), ItemStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_before_start_leaves_items_pending() {
        let (queue, _) = typed_queue(&["one.png", "two.png"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let processor = BatchProcessor::new(queue.clone(), ScriptedExtractor::default(), BrokenStore).with_events(tx);

        let cancel = CancelToken::new();
        cancel.cancel();
        let report = processor.run(None, &cancel).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.processed, 0);
        assert_eq!(queue.lock().await.counts().pending, 2);
        assert_eq!(drain(&mut rx), vec![BatchEvent::Completed(report)]);
    }

    #[tokio::test]
    async fn test_completed_items_are_skipped_on_rerun() {
        let (queue, _) = typed_queue(&["one.png", "two.png"]);
        let extractor = Arc::new(ScriptedExtractor::default());
        let processor = BatchProcessor::new(queue.clone(), extractor.clone(), BrokenStore);

        processor.run(None, &CancelToken::new()).await.unwrap();
        let report = processor.run(None, &CancelToken::new()).await.unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(extractor.calls().len(), 2);
    }

    struct StalledExtractor;

    #[async_trait]
    impl Extractor for StalledExtractor {
        async fn extract(&self, _: &DocumentFile, _: DocType) -> Result<Vec<ExtractedField>, ExtractError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_dropped_run_releases_queue() {
        let (queue, ids) = typed_queue(&["one.png", "two.png"]);
        let processor = BatchProcessor::new(queue.clone(), StalledExtractor, BrokenStore);

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            processor.run(None, &CancelToken::new()),
        )
        .await;
        assert!(timed_out.is_err());

        {
            let mut q = queue.lock().await;
            assert!(!q.is_running());
            assert_eq!(q.get(&ids[0]).unwrap().status(), ItemStatus::Error);
            assert_eq!(q.get(&ids[0]).unwrap().error(), Some(INTERRUPTED));
            assert_eq!(q.get(&ids[1]).unwrap().status(), ItemStatus::Pending);
            q.retry(&ids[0]).unwrap();
            assert_eq!(q.clear_completed(), Ok(0));
        }

        let extractor = Arc::new(ScriptedExtractor::default());
        let rerun = BatchProcessor::new(queue.clone(), extractor.clone(), BrokenStore);
        let report = rerun.run(None, &CancelToken::new()).await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(extractor.calls(), vec!["one.png", "two.png"]);
    }
}
