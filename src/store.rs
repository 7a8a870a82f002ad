// 🗄️ Document Store - blobs on disk, metadata in SQLite + WAL
// Persistence collaborator for reviewed extractions

use crate::document::{DocType, DocumentFile, ExtractedField};
use crate::error::ExtractError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

// ============================================================================
// STORED DOCUMENT
// ============================================================================

/// Metadata row for one persisted document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub user_id: String,

    /// Blob location relative to the blob root: `<user_id>/<millis>.<ext>`
    pub file_path: String,

    pub doc_type: String,
    pub extracted_data: Vec<ExtractedField>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl StoredDocument {
    /// File name shown in document listings
    pub fn display_name(&self) -> &str {
        self.file_path.rsplit('/').next().unwrap_or(&self.file_path)
    }

    pub fn doc_type(&self) -> Option<DocType> {
        self.doc_type.parse().ok()
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store the blob and its metadata record
    async fn save(
        &self,
        file: &DocumentFile,
        doc_type: DocType,
        fields: &[ExtractedField],
        user_id: &str,
    ) -> Result<StoredDocument, ExtractError>;

    /// Documents owned by `user_id`, newest first
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<StoredDocument>, ExtractError>;
}

#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    async fn save(
        &self,
        file: &DocumentFile,
        doc_type: DocType,
        fields: &[ExtractedField],
        user_id: &str,
    ) -> Result<StoredDocument, ExtractError> {
        (**self).save(file, doc_type, fields, user_id).await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<StoredDocument>, ExtractError> {
        (**self).list_for_user(user_id).await
    }
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteStore {
    conn: Mutex<Connection>,
    blob_dir: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database file and blob directory
    pub fn open(db_path: &Path, blob_dir: &Path) -> Result<Self, ExtractError> {
        let conn = Connection::open(db_path)?;
        // Enable WAL mode for crash recovery
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(?db_path, %mode, "document database opened");

        Self::with_connection(conn, blob_dir)
    }

    /// Metadata kept in memory; blobs still go to `blob_dir`
    pub fn in_memory(blob_dir: &Path) -> Result<Self, ExtractError> {
        Self::with_connection(Connection::open_in_memory()?, blob_dir)
    }

    fn with_connection(conn: Connection, blob_dir: &Path) -> Result<Self, ExtractError> {
        setup_database(&conn)?;
        fs::create_dir_all(blob_dir)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            blob_dir: blob_dir.to_path_buf(),
        })
    }

    pub fn blob_dir(&self) -> &Path {
        &self.blob_dir
    }

    pub fn blob_path(&self, doc: &StoredDocument) -> PathBuf {
        self.blob_dir.join(&doc.file_path)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ExtractError> {
        self.conn
            .lock()
            .map_err(|_| ExtractError::Persistence("database lock poisoned".to_string()))
    }

    /// Write the blob under `<user_id>/<millis>.<ext>`, bumping the
    /// timestamp until the name is free
    fn write_blob(&self, file: &DocumentFile, user_id: &str, now: DateTime<Utc>) -> Result<String, ExtractError> {
        let user_dir = self.blob_dir.join(user_id);
        fs::create_dir_all(&user_dir)?;

        let mut stamp = now.timestamp_millis();
        loop {
            let name = format!("{}.{}", stamp, file.extension());
            let path = user_dir.join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(out) => {
                    fill_blob(out, &file.bytes, &path)?;
                    return Ok(format!("{}/{}", user_id, name));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => stamp += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<StoredDocument>, ExtractError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc_uuid, user_id, file_path, doc_type, extracted_data, content_hash, created_at
             FROM documents WHERE doc_uuid = ?1",
        )?;
        let doc = stmt.query_row(params![id], row_to_document).optional()?;
        Ok(doc)
    }
}

/// Write a freshly created blob; a partial file is removed on failure
fn fill_blob<W: Write>(mut out: W, bytes: &[u8], path: &Path) -> std::io::Result<()> {
    if let Err(e) = out.write_all(bytes).and_then(|_| out.flush()) {
        drop(out);
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

pub fn setup_database(conn: &Connection) -> Result<(), ExtractError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc_uuid TEXT UNIQUE NOT NULL,
            user_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            doc_type TEXT NOT NULL,
            extracted_data TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_user ON documents(user_id, created_at)",
        [],
    )?;

    Ok(())
}

fn validate_user_id(user_id: &str) -> Result<(), ExtractError> {
    let bad = user_id.trim().is_empty()
        || user_id.contains(['/', '\\'])
        || user_id == "."
        || user_id == "..";
    if bad {
        return Err(ExtractError::Persistence(format!("invalid user id: {:?}", user_id)));
    }
    Ok(())
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredDocument> {
    let data_json: String = row.get(4)?;
    let created_str: String = row.get(6)?;

    Ok(StoredDocument {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_path: row.get(2)?,
        doc_type: row.get(3)?,
        extracted_data: serde_json::from_str(&data_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?,
        content_hash: row.get(5)?,
        created_at: DateTime::parse_from_rfc3339(&created_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn save(
        &self,
        file: &DocumentFile,
        doc_type: DocType,
        fields: &[ExtractedField],
        user_id: &str,
    ) -> Result<StoredDocument, ExtractError> {
        validate_user_id(user_id)?;

        let now = Utc::now();
        let file_path = self.write_blob(file, user_id, now)?;

        let doc = StoredDocument {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            file_path,
            doc_type: doc_type.name().to_string(),
            extracted_data: fields.to_vec(),
            content_hash: file.content_hash(),
            created_at: now,
        };

        let data_json = serde_json::to_string(&doc.extracted_data)
            .map_err(|e| ExtractError::Persistence(e.to_string()))?;

        let inserted = self.lock()?.execute(
            "INSERT INTO documents (
                doc_uuid, user_id, file_path, doc_type, extracted_data, content_hash, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                doc.id,
                doc.user_id,
                doc.file_path,
                doc.doc_type,
                data_json,
                doc.content_hash,
                doc.created_at.to_rfc3339(),
            ],
        );

        if let Err(e) = inserted {
            // Metadata insert failed: drop the orphaned blob
            let _ = fs::remove_file(self.blob_dir.join(&doc.file_path));
            return Err(e.into());
        }

        info!(user_id, file_path = %doc.file_path, doc_type = %doc.doc_type, "document stored");
        Ok(doc)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<StoredDocument>, ExtractError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT doc_uuid, user_id, file_path, doc_type, extracted_data, content_hash, created_at
             FROM documents
             WHERE user_id = ?1
             ORDER BY id DESC",
        )?;

        let docs = stmt
            .query_map(params![user_id], row_to_document)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(docs)
    }
}

// ============================================================================
// TESTS
// ============================================================================
