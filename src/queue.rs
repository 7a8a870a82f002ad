// 📥 Batch Queue - per-item state machine
//
//   PENDING ──start──▶ PROCESSING ──succeed──▶ COMPLETED
//      ▲                    │
//      └──────retry──── ERROR ◀──fail──┘
//
// A COMPLETED item carries its result and an ERROR item its message, so
// neither can exist without the data that goes with it.

use crate::document::{DocType, DocumentFile, ExtractedField};
use crate::error::QueueError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// ITEM STATE
// ============================================================================

/// Status tag without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemStatus::Pending => "PENDING",
            ItemStatus::Processing => "PROCESSING",
            ItemStatus::Completed => "COMPLETED",
            ItemStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemState {
    Pending,
    Processing,
    Completed(Vec<ExtractedField>),
    Failed(String),
}

impl ItemState {
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemState::Pending => ItemStatus::Pending,
            ItemState::Processing => ItemStatus::Processing,
            ItemState::Completed(_) => ItemStatus::Completed,
            ItemState::Failed(_) => ItemStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemEvent {
    Start,
    Succeed(Vec<ExtractedField>),
    Fail(String),
    Retry,
}

impl ItemEvent {
    fn target(&self) -> ItemStatus {
        match self {
            ItemEvent::Start => ItemStatus::Processing,
            ItemEvent::Succeed(_) => ItemStatus::Completed,
            ItemEvent::Fail(_) => ItemStatus::Error,
            ItemEvent::Retry => ItemStatus::Pending,
        }
    }
}

/// The transition function. Returns the target status on rejection.
pub fn transition(state: &ItemState, event: ItemEvent) -> Result<ItemState, ItemStatus> {
    match (state, event) {
        (ItemState::Pending, ItemEvent::Start) => Ok(ItemState::Processing),
        (ItemState::Processing, ItemEvent::Succeed(result)) => Ok(ItemState::Completed(result)),
        (ItemState::Processing, ItemEvent::Fail(message)) => Ok(ItemState::Failed(message)),
        (ItemState::Failed(_), ItemEvent::Retry) => Ok(ItemState::Pending),
        (_, event) => Err(event.target()),
    }
}

// ============================================================================
// QUEUE ITEM
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: String,
    pub file: Arc<DocumentFile>,
    pub doc_type: Option<DocType>,
    state: ItemState,
}

impl QueueItem {
    pub fn new(file: DocumentFile) -> Self {
        QueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            file: Arc::new(file),
            doc_type: None,
            state: ItemState::Pending,
        }
    }

    pub fn state(&self) -> &ItemState {
        &self.state
    }

    pub fn status(&self) -> ItemStatus {
        self.state.status()
    }

    pub fn result(&self) -> Option<&[ExtractedField]> {
        match &self.state {
            ItemState::Completed(result) => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            ItemState::Failed(message) => Some(message),
            _ => None,
        }
    }

    fn apply(&mut self, event: ItemEvent) -> Result<(), QueueError> {
        match transition(&self.state, event) {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(to) => Err(QueueError::InvalidTransition {
                id: self.id.clone(),
                from: self.status().to_string(),
                to: to.to_string(),
            }),
        }
    }

    pub fn summary(&self) -> QueueItemSummary {
        QueueItemSummary {
            id: self.id.clone(),
            file_name: self.file.name.clone(),
            size_bytes: self.file.size(),
            status: self.status(),
            doc_type: self.doc_type,
            error: self.error().map(str::to_string),
            field_count: self.result().map(|r| r.len()),
        }
    }
}

/// Flat, serializable view of a queue item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemSummary {
    pub id: String,
    pub file_name: String,
    pub size_bytes: usize,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<DocType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_count: Option<usize>,
}

/// What the worker needs to process one item
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub file: Arc<DocumentFile>,
    pub doc_type: DocType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

// ============================================================================
// QUEUE
// ============================================================================

#[derive(Debug, Default)]
pub struct Queue {
    items: Vec<QueueItem>,
    running: bool,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add files as PENDING items without a type; returns their ids
    pub fn enqueue<I>(&mut self, files: I) -> Vec<String>
    where
        I: IntoIterator<Item = DocumentFile>,
    {
        files
            .into_iter()
            .map(|file| {
                let item = QueueItem::new(file);
                let id = item.id.clone();
                self.items.push(item);
                id
            })
            .collect()
    }

    pub fn enqueue_typed(&mut self, file: DocumentFile, doc_type: DocType) -> String {
        let mut item = QueueItem::new(file);
        item.doc_type = Some(doc_type);
        let id = item.id.clone();
        self.items.push(item);
        id
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&QueueItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub(crate) fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    fn position(&self, id: &str) -> Result<usize, QueueError> {
        self.items
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| QueueError::UnknownItem(id.to_string()))
    }

    fn locked(item: &QueueItem) -> QueueError {
        QueueError::Locked {
            id: item.id.clone(),
            status: item.status().to_string(),
        }
    }

    /// Set the type of a PENDING or ERROR item
    pub fn assign_doc_type(&mut self, id: &str, doc_type: DocType) -> Result<(), QueueError> {
        let pos = self.position(id)?;
        let item = &mut self.items[pos];
        match item.status() {
            ItemStatus::Pending | ItemStatus::Error => {
                item.doc_type = Some(doc_type);
                Ok(())
            }
            _ => Err(Self::locked(item)),
        }
    }

    /// Type every PENDING or ERROR item; returns how many were touched
    pub fn assign_all(&mut self, doc_type: DocType) -> usize {
        let mut touched = 0;
        for item in self
            .items
            .iter_mut()
            .filter(|i| matches!(i.status(), ItemStatus::Pending | ItemStatus::Error))
        {
            item.doc_type = Some(doc_type);
            touched += 1;
        }
        touched
    }

    /// PROCESSING items are never removable; COMPLETED ones only while idle
    pub fn remove(&mut self, id: &str) -> Result<QueueItem, QueueError> {
        let pos = self.position(id)?;
        let item = &self.items[pos];
        let removable = match item.status() {
            ItemStatus::Pending | ItemStatus::Error => true,
            ItemStatus::Completed => !self.running,
            ItemStatus::Processing => false,
        };
        if !removable {
            return Err(Self::locked(item));
        }
        Ok(self.items.remove(pos))
    }

    /// ERROR -> PENDING, clearing the message
    pub fn retry(&mut self, id: &str) -> Result<(), QueueError> {
        if self.running {
            return Err(QueueError::Busy);
        }
        let pos = self.position(id)?;
        self.items[pos].apply(ItemEvent::Retry)
    }

    /// Drop every COMPLETED item; returns how many were removed
    pub fn clear_completed(&mut self) -> Result<usize, QueueError> {
        if self.running {
            return Err(QueueError::Busy);
        }
        let before = self.items.len();
        self.items.retain(|i| i.status() != ItemStatus::Completed);
        Ok(before - self.items.len())
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for item in &self.items {
            match item.status() {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::Error => counts.failed += 1,
            }
        }
        counts
    }

    pub fn summaries(&self) -> Vec<QueueItemSummary> {
        self.items.iter().map(QueueItem::summary).collect()
    }

    /// Ids of unfinished items that still have no document type
    pub fn missing_doc_types(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|i| i.status() != ItemStatus::Completed && i.doc_type.is_none())
            .map(|i| i.id.clone())
            .collect()
    }

    /// PENDING ids in insertion order
    pub fn pending_ids(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|i| i.status() == ItemStatus::Pending)
            .map(|i| i.id.clone())
            .collect()
    }

    /// PENDING -> PROCESSING; refuses if another item is already in flight
    pub fn begin(&mut self, id: &str) -> Result<Job, QueueError> {
        if self.items.iter().any(|i| i.status() == ItemStatus::Processing) {
            return Err(QueueError::Busy);
        }
        let pos = self.position(id)?;
        let item = &mut self.items[pos];
        let doc_type = item.doc_type.ok_or_else(|| Self::locked(item))?;
        item.apply(ItemEvent::Start)?;

        Ok(Job {
            id: item.id.clone(),
            file: Arc::clone(&item.file),
            doc_type,
        })
    }

    /// PROCESSING -> COMPLETED or ERROR
    pub fn finish(&mut self, id: &str, outcome: Result<Vec<ExtractedField>, String>) -> Result<(), QueueError> {
        let pos = self.position(id)?;
        let event = match outcome {
            Ok(result) => ItemEvent::Succeed(result),
            Err(message) => ItemEvent::Fail(message),
        };
        self.items[pos].apply(event)
    }
}

// ============================================================================
// TESTS
// ============================================================================
