// 📄 Documents & Extracted Fields
// The file handle sent to the extraction service and the records it returns

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

// ============================================================================
// DOCUMENT TYPE
// ============================================================================

/// Classification the operator assigns before extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocType {
    #[serde(rename = "Pay Stub")]
    PayStub,
    #[serde(rename = "Bank Statement")]
    BankStatement,
    #[serde(rename = "Tax Return")]
    TaxReturn,
    #[serde(rename = "Loan Application")]
    LoanApplication,
    #[serde(rename = "Other")]
    Other,
}

impl DocType {
    pub const ALL: [DocType; 5] = [
        DocType::PayStub,
        DocType::BankStatement,
        DocType::TaxReturn,
        DocType::LoanApplication,
        DocType::Other,
    ];

    /// Human-readable label, also the wire value
    pub fn name(&self) -> &'static str {
        match self {
            DocType::PayStub => "Pay Stub",
            DocType::BankStatement => "Bank Statement",
            DocType::TaxReturn => "Tax Return",
            DocType::LoanApplication => "Loan Application",
            DocType::Other => "Other",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DocType::PayStub => "Income verification, pay period details",
            DocType::BankStatement => "Assets, transaction history, balances",
            DocType::TaxReturn => "1040, W-2, historical income data",
            DocType::LoanApplication => "1003 form, borrower declarations",
            DocType::Other => "General loan documents or correspondence",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DocType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', '_'], " ");
        DocType::ALL
            .into_iter()
            .find(|t| t.name().to_lowercase() == normalized)
            .ok_or_else(|| format!("unknown document type: {}", s))
    }
}

// ============================================================================
// DOCUMENT FILE
// ============================================================================

/// An uploaded document held in memory
#[derive(Debug, Clone)]
pub struct DocumentFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl DocumentFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        DocumentFile {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Read a document from disk, guessing the MIME type from its extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("Failed to read document: {:?}", path))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let mime_type = mime_for_name(&name);

        Ok(DocumentFile::new(name, mime_type, bytes))
    }

    /// File extension used for the stored blob
    pub fn extension(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => ext,
            _ => "bin",
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// SHA-256 of the raw bytes, hex encoded
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        format!("{:x}", hasher.finalize())
    }

    /// `data:` URL embedding the document, as the vision API expects
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, BASE64.encode(&self.bytes))
    }
}

fn mime_for_name(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

// ============================================================================
// EXTRACTED FIELD
// ============================================================================

/// One labelled value pulled out of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    #[serde(alias = "Field")]
    pub field: String,

    #[serde(alias = "Value")]
    pub value: String,

    /// Model confidence (0.0 - 1.0)
    #[serde(alias = "Confidence")]
    pub confidence: f64,
}

impl ExtractedField {
    pub fn new(field: impl Into<String>, value: impl Into<String>, confidence: f64) -> Self {
        ExtractedField {
            field: field.into(),
            value: value.into(),
            confidence,
        }
    }
}

/// Load a field list from a `.json` array or a `Field,Value,Confidence` CSV
pub fn load_fields(path: &Path) -> Result<Vec<ExtractedField>> {
    let is_csv = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    if is_csv {
        let mut rdr = csv::Reader::from_path(path).context("Failed to open CSV file")?;
        let mut fields = Vec::new();
        for result in rdr.deserialize() {
            let field: ExtractedField = result.context("Failed to deserialize field row")?;
            fields.push(field);
        }
        Ok(fields)
    } else {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read fields file: {:?}", path))?;
        serde_json::from_str(&content).context("Failed to parse fields JSON")
    }
}

// ============================================================================
// TESTS
// ============================================================================
