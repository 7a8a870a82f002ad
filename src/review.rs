// 📝 Review Session - the Extraction Result Store
// Holds the field list under review. Every edit produces a new snapshot;
// validation is recomputed against whichever snapshot is current.

use crate::auth::{active_session, Session};
use crate::document::{DocType, DocumentFile, ExtractedField};
use crate::error::{ExtractError, ReviewError};
use crate::extract::Extractor;
use crate::store::{DocumentStore, StoredDocument};
use crate::validation::{validate, ValidationReport, ValidationRule};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// EXPORT FORMAT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
        }
    }

    /// Suggested download name
    pub fn file_name(&self) -> String {
        format!("extracted_data.{}", self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unknown export format: {}", other)),
        }
    }
}

/// Render a field list for download.
///
/// JSON is a flat `field -> value` object (confidence dropped). CSV wraps
/// each cell in double quotes without escaping embedded quotes or commas,
/// so values containing `"` produce rows other CSV readers may misparse.
pub fn export_fields(records: &[ExtractedField], format: ExportFormat) -> String {
    match format {
        ExportFormat::Json => {
            let mut map = Map::new();
            for record in records {
                map.insert(record.field.clone(), Value::String(record.value.clone()));
            }
            // Serializing a map of strings cannot fail
            serde_json::to_string_pretty(&Value::Object(map)).unwrap_or_else(|_| "{}".to_string())
        }
        ExportFormat::Csv => {
            let mut lines = Vec::with_capacity(records.len() + 1);
            lines.push("Field,Value,Confidence".to_string());
            for record in records {
                lines.push(format!(
                    "\"{}\",\"{}\",\"{}\"",
                    record.field, record.value, record.confidence
                ));
            }
            lines.join("\n")
        }
    }
}

// ============================================================================
// REANALYSIS POLICY
// ============================================================================

/// What happens to manual edits when a new extraction replaces the fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReanalysisPolicy {
    /// New extraction wins outright; edits are lost
    #[default]
    Discard,
    /// Edited values are carried over to new records with the same field name
    PreserveEdits,
}

// ============================================================================
// REVIEW SESSION
// ============================================================================

pub struct ReviewSession {
    file: DocumentFile,
    doc_type: DocType,
    records: Arc<Vec<ExtractedField>>,
    /// Field names the operator has edited since the last extraction
    edited: HashSet<String>,
    revision: u64,
    rules: Vec<ValidationRule>,
    policy: ReanalysisPolicy,
}

impl ReviewSession {
    pub fn new(file: DocumentFile, doc_type: DocType, records: Vec<ExtractedField>) -> Self {
        ReviewSession {
            file,
            doc_type,
            records: Arc::new(records),
            edited: HashSet::new(),
            revision: 0,
            rules: crate::validation::default_rules(),
            policy: ReanalysisPolicy::default(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<ValidationRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_policy(mut self, policy: ReanalysisPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Extract `file` and open a session on the result
    pub async fn analyze<E: Extractor + ?Sized>(
        extractor: &E,
        file: DocumentFile,
        doc_type: DocType,
    ) -> Result<Self, ExtractError> {
        let records = extractor.extract(&file, doc_type).await?;
        Ok(ReviewSession::new(file, doc_type, records))
    }

    /// Re-run extraction, possibly under a different document type.
    /// On failure the current fields are left untouched.
    pub async fn reanalyze<E: Extractor + ?Sized>(
        &mut self,
        extractor: &E,
        doc_type: DocType,
    ) -> Result<(), ExtractError> {
        let records = extractor.extract(&self.file, doc_type).await?;
        self.doc_type = doc_type;
        self.replace_all(records);
        Ok(())
    }

    pub fn file(&self) -> &DocumentFile {
        &self.file
    }

    pub fn doc_type(&self) -> DocType {
        self.doc_type
    }

    pub fn policy(&self) -> ReanalysisPolicy {
        self.policy
    }

    /// Current snapshot; stays valid and unchanged after later edits
    pub fn snapshot(&self) -> Arc<Vec<ExtractedField>> {
        Arc::clone(&self.records)
    }

    pub fn records(&self) -> &[ExtractedField] {
        &self.records
    }

    /// Bumped on every change
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_edited(&self, field: &str) -> bool {
        self.edited.contains(field)
    }

    /// Replace one value; field name and confidence are kept
    pub fn set_field(&mut self, index: usize, new_value: impl Into<String>) -> Result<(), ReviewError> {
        let len = self.records.len();
        if index >= len {
            return Err(ReviewError::IndexOutOfRange { index, len });
        }

        let mut next: Vec<ExtractedField> = self.records.as_ref().clone();
        next[index].value = new_value.into();
        self.edited.insert(next[index].field.clone());

        self.records = Arc::new(next);
        self.revision += 1;
        Ok(())
    }

    /// Swap in a fresh extraction, applying the session's reanalysis policy
    pub fn replace_all(&mut self, new_records: Vec<ExtractedField>) {
        let next = match self.policy {
            ReanalysisPolicy::Discard => {
                if !self.edited.is_empty() {
                    warn!(edits = self.edited.len(), "reanalysis discarded manual edits");
                }
                self.edited.clear();
                new_records
            }
            ReanalysisPolicy::PreserveEdits => self.carry_edits(new_records),
        };

        self.records = Arc::new(next);
        self.revision += 1;
    }

    fn carry_edits(&mut self, mut new_records: Vec<ExtractedField>) -> Vec<ExtractedField> {
        let edited_values: HashMap<&str, &str> = self
            .records
            .iter()
            .filter(|r| self.edited.contains(&r.field))
            .map(|r| (r.field.as_str(), r.value.as_str()))
            .collect();

        let mut kept = HashSet::new();
        for record in new_records.iter_mut() {
            if let Some(value) = edited_values.get(record.field.as_str()) {
                record.value = value.to_string();
                kept.insert(record.field.clone());
            }
        }

        self.edited = kept;
        new_records
    }

    /// Full recompute over the current snapshot
    pub fn validation(&self) -> ValidationReport {
        validate(&self.records, &self.rules)
    }

    pub fn export(&self, format: ExportFormat) -> String {
        export_fields(&self.records, format)
    }

    /// Write the export into `dir` under its suggested name
    pub fn export_to_dir(&self, dir: &Path, format: ExportFormat) -> std::io::Result<std::path::PathBuf> {
        let path = dir.join(format.file_name());
        fs::write(&path, self.export(format))?;
        Ok(path)
    }

    /// Persist the reviewed fields; ends the review on success
    pub async fn save<S: DocumentStore + ?Sized>(
        self,
        store: &S,
        session: Option<&Session>,
    ) -> Result<StoredDocument, ExtractError> {
        let session = active_session(session).ok_or(ExtractError::Unauthenticated)?;
        let report = self.validation();
        if !report.is_valid {
            // Advisory only; saving is never blocked
            info!(summary = %report.summary(), "saving document with open validation findings");
        }

        store
            .save(&self.file, self.doc_type, &self.records, &session.user_id)
            .await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::MockExtractor;
    use crate::store::SqliteStore;
    use async_trait::async_trait;

    fn doc() -> DocumentFile {
        DocumentFile::new("note.png", "image/png", vec![1, 2, 3])
    }

    fn session_with(records: Vec<ExtractedField>) -> ReviewSession {
        ReviewSession::new(doc(), DocType::LoanApplication, records)
    }

    struct FixedExtractor(Vec<ExtractedField>);

    #[async_trait]
    impl Extractor for FixedExtractor {
        async fn extract(&self, _: &DocumentFile, _: DocType) -> Result<Vec<ExtractedField>, ExtractError> {
            Ok(self.0.clone())
        }
    }

    struct FailingExtractor;

    #[async_trait]
    impl Extractor for FailingExtractor {
        async fn extract(&self, _: &DocumentFile, _: DocType) -> Result<Vec<ExtractedField>, ExtractError> {
            Err(ExtractError::Extraction("document unreadable".to_string()))
        }
    }

    #[test]
    fn test_json_export_single_entry() {
        let out = export_fields(&[ExtractedField::new("A", "1", 0.9)], ExportFormat::Json);
        assert_eq!(out, "{\n  \"A\": \"1\"\n}");
    }

    #[test]
    fn test_json_export_keeps_order_and_last_duplicate_wins() {
        let records = vec![
            ExtractedField::new("Loan Term", "30 Years", 0.9),
            ExtractedField::new("Borrower Name", "Jane", 0.9),
            ExtractedField::new("Loan Term", "360 Months", 0.9),
        ];
        let out = export_fields(&records, ExportFormat::Json);
        assert_eq!(out, "{\n  \"Loan Term\": \"360 Months\",\n  \"Borrower Name\": \"Jane\"\n}");
        assert_eq!(export_fields(&[], ExportFormat::Json), "{}");
    }

    #[test]
    fn test_csv_export_is_naively_quoted() {
        let records = vec![
            ExtractedField::new("Loan Amount", "$350,000.00", 0.95),
            ExtractedField::new("Note", "say \"hi\"", 1.0),
        ];
        let out = export_fields(&records, ExportFormat::Csv);
        assert_eq!(
            out,
            "Field,Value,Confidence\n\"Loan Amount\",\"$350,000.00\",\"0.95\"\n\"Note\",\"say \"hi\"\",\"1\""
        );
    }

    #[test]
    fn test_export_format_metadata() {
        assert_eq!(ExportFormat::Csv.file_name(), "extracted_data.csv");
        assert_eq!(ExportFormat::Json.mime_type(), "application/json");
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_set_field_is_copy_on_write() {
        let mut session = session_with(vec![
            ExtractedField::new("Loan Number", "", 0.7),
            ExtractedField::new("Loan Term", "30 Years", 0.99),
        ]);
        let before = session.snapshot();

        session.set_field(0, "LN-1001").unwrap();

        assert_eq!(before[0].value, "");
        assert_eq!(session.records()[0], ExtractedField::new("Loan Number", "LN-1001", 0.7));
        assert_eq!(session.records()[1], before[1]);
        assert!(!Arc::ptr_eq(&before, &session.snapshot()));
        assert_eq!(session.revision(), 1);
        assert!(session.is_edited("Loan Number"));
    }

    #[test]
    fn test_set_field_out_of_range() {
        let mut session = session_with(vec![ExtractedField::new("A", "1", 1.0)]);
        assert_eq!(
            session.set_field(3, "x"),
            Err(ReviewError::IndexOutOfRange { index: 3, len: 1 })
        );
        assert_eq!(session.revision(), 0);
    }

    #[test]
    fn test_validation_follows_edits() {
        let mut session = session_with(vec![ExtractedField::new("Loan Number", " ", 0.95)]);
        assert_eq!(session.validation().error_count(), 1);

        session.set_field(0, "LN-9").unwrap();
        assert!(session.validation().is_valid);
    }

    #[test]
    fn test_replace_all_discards_edits_by_default() {
        let mut session = session_with(vec![ExtractedField::new("Loan Amount", "$1", 0.6)]);
        session.set_field(0, "$350,000.00").unwrap();

        session.replace_all(vec![ExtractedField::new("Loan Amount", "$35,000.00", 0.9)]);

        assert_eq!(session.records(), &[ExtractedField::new("Loan Amount", "$35,000.00", 0.9)]);
        assert!(!session.is_edited("Loan Amount"));
    }

    #[test]
    fn test_replace_all_can_preserve_edits_by_field_name() {
        let mut session = session_with(vec![
            ExtractedField::new("Loan Amount", "$1", 0.6),
            ExtractedField::new("Loan Term", "30", 0.6),
        ])
        .with_policy(ReanalysisPolicy::PreserveEdits);
        session.set_field(0, "$350,000.00").unwrap();

        session.replace_all(vec![
            ExtractedField::new("Loan Term", "360 Months", 0.97),
            ExtractedField::new("Loan Amount", "$35,000.00", 0.9),
        ]);

        assert_eq!(session.records()[0], ExtractedField::new("Loan Term", "360 Months", 0.97));
        // Edited value kept, new confidence wins
        assert_eq!(session.records()[1], ExtractedField::new("Loan Amount", "$350,000.00", 0.9));
        assert!(session.is_edited("Loan Amount"));
    }

    #[tokio::test]
    async fn test_reanalyze_replaces_fields_and_type() {
        let mut session = ReviewSession::analyze(&MockExtractor::new(), doc(), DocType::Other)
            .await
            .unwrap();
        assert_eq!(session.records().len(), 8);

        let fresh = FixedExtractor(vec![ExtractedField::new("Gross Pay", "$4,000", 0.9)]);
        session.reanalyze(&fresh, DocType::PayStub).await.unwrap();

        assert_eq!(session.doc_type(), DocType::PayStub);
        assert_eq!(session.records().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reanalyze_keeps_current_fields() {
        let mut session = session_with(vec![ExtractedField::new("A", "1", 1.0)]);
        let err = session.reanalyze(&FailingExtractor, DocType::TaxReturn).await.unwrap_err();

        assert!(matches!(err, ExtractError::Extraction(_)));
        assert_eq!(session.doc_type(), DocType::LoanApplication);
        assert_eq!(session.records().len(), 1);
    }

    #[tokio::test]
    async fn test_save_requires_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::in_memory(dir.path()).unwrap();

        let err = session_with(vec![]).save(&store, None).await.unwrap_err();
        assert!(matches!(err, ExtractError::Unauthenticated));

        let user = Session::new("user-7");
        let stored = session_with(vec![ExtractedField::new("Loan Number", "", 0.2)])
            .save(&store, Some(&user))
            .await
            .unwrap();
        assert_eq!(stored.user_id, "user-7");
        assert_eq!(stored.doc_type, "Loan Application");
    }

    #[test]
    fn test_export_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with(vec![ExtractedField::new("A", "1", 0.9)]);

        let path = session.export_to_dir(dir.path(), ExportFormat::Csv).unwrap();
        assert!(path.ends_with("extracted_data.csv"));
        assert_eq!(fs::read_to_string(path).unwrap(), "Field,Value,Confidence\n\"A\",\"1\",\"0.9\"");
    }
}
