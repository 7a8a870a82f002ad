// Loan Document Extraction - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod auth;
pub mod batch;
pub mod config;
pub mod document;
pub mod error;
pub mod extract;
pub mod logging;
pub mod prompt;
pub mod queue;
pub mod review;
pub mod store;
pub mod validation;

// Re-export commonly used types
pub use auth::{session_from_bearer, Session};
pub use batch::{BatchEvent, BatchProcessor, BatchReport, CancelToken};
pub use config::AppConfig;
pub use document::{load_fields, DocType, DocumentFile, ExtractedField};
pub use error::{BatchError, ExtractError, QueueError, ReviewError};
pub use extract::{build_extractor, Extractor, MockExtractor, OpenAiExtractor};
pub use queue::{ItemState, ItemStatus, Queue, QueueCounts, QueueItem, QueueItemSummary};
pub use review::{export_fields, ExportFormat, ReanalysisPolicy, ReviewSession};
pub use store::{DocumentStore, SqliteStore, StoredDocument};
pub use validation::{
    default_rules, load_rules, validate, validate_default, RuleType, Severity, ValidationError,
    ValidationReport, ValidationRule,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
