// 🚨 Error Taxonomy
// Remote failures are caught where they happen and turned into item state;
// nothing here is fatal to the process.

use thiserror::Error;

// ============================================================================
// COLLABORATOR ERRORS
// ============================================================================

/// Failure of one of the external collaborators (extraction, persistence, auth)
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The extraction service rejected the document or returned garbage
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Storing the blob or its metadata failed
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// A collaborator is missing credentials or is misconfigured
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Persistence was attempted without a valid session
    #[error("no valid session")]
    Unauthenticated,
}

impl ExtractError {
    /// Message shown next to a failed queue item
    pub fn item_message(&self) -> String {
        match self {
            ExtractError::Extraction(msg)
            | ExtractError::Persistence(msg)
            | ExtractError::Configuration(msg) => msg.clone(),
            ExtractError::Unauthenticated => self.to_string(),
        }
    }
}

impl From<reqwest::Error> for ExtractError {
    fn from(err: reqwest::Error) -> Self {
        ExtractError::Extraction(err.to_string())
    }
}

impl From<rusqlite::Error> for ExtractError {
    fn from(err: rusqlite::Error) -> Self {
        ExtractError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for ExtractError {
    fn from(err: std::io::Error) -> Self {
        ExtractError::Persistence(err.to_string())
    }
}

// ============================================================================
// QUEUE / BATCH ERRORS
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("unknown queue item: {0}")]
    UnknownItem(String),

    /// The item's current status forbids the requested edit
    #[error("item {id} is locked while {status}")]
    Locked { id: String, status: String },

    #[error("item {id}: illegal transition {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("queue is busy processing")]
    Busy,
}

#[derive(Debug, Error, PartialEq)]
pub enum BatchError {
    #[error("batch is already running")]
    AlreadyRunning,

    /// Items that still need a document type before the batch can start
    #[error("assign a document type first: {}", .0.join(", "))]
    MissingDocType(Vec<String>),
}

// ============================================================================
// REVIEW ERRORS
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum ReviewError {
    #[error("field index {index} out of range ({len} fields)")]
    IndexOutOfRange { index: usize, len: usize },
}
