// 🔍 Extraction Service
// Sends a document to a vision-capable chat model and normalizes the reply
// into field records

use crate::config::ExtractionSettings;
use crate::document::{DocType, DocumentFile, ExtractedField};
use crate::error::ExtractError;
use crate::prompt;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Confidence assumed when the model omits one
const DEFAULT_CONFIDENCE: f64 = 0.5;

// ============================================================================
// EXTRACTOR TRAIT
// ============================================================================

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        file: &DocumentFile,
        doc_type: DocType,
    ) -> Result<Vec<ExtractedField>, ExtractError>;
}

#[async_trait]
impl<T: Extractor + ?Sized> Extractor for Arc<T> {
    async fn extract(
        &self,
        file: &DocumentFile,
        doc_type: DocType,
    ) -> Result<Vec<ExtractedField>, ExtractError> {
        (**self).extract(file, doc_type).await
    }
}

/// Build the extractor described by the settings.
///
/// Mock extraction must be switched on explicitly; a missing API key is a
/// configuration error otherwise.
pub fn build_extractor(settings: &ExtractionSettings) -> Result<Arc<dyn Extractor>, ExtractError> {
    if settings.use_mock_extraction {
        warn!("mock extraction enabled; documents will not be sent to the model");
        return Ok(Arc::new(MockExtractor::with_delay(Duration::from_millis(
            settings.mock_delay_ms,
        ))));
    }

    let client = OpenAiExtractor::new(settings)?;
    Ok(Arc::new(client))
}

// ============================================================================
// OPENAI-COMPATIBLE CLIENT
// ============================================================================

pub struct OpenAiExtractor {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    api_key: String,
}

impl OpenAiExtractor {
    pub fn new(settings: &ExtractionSettings) -> Result<Self, ExtractError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ExtractError::Configuration(
                    "missing API key (set OPENAI_API_KEY or enable use_mock_extraction)".to_string(),
                )
            })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ExtractError::Configuration(e.to_string()))?;

        Ok(OpenAiExtractor {
            http,
            endpoint: settings.endpoint.clone(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            api_key,
        })
    }

    fn request_body(&self, file: &DocumentFile, doc_type: DocType) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt::system_prompt(doc_type) },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": prompt::user_text(doc_type) },
                        { "type": "image_url", "image_url": { "url": file.data_url() } }
                    ]
                }
            ],
            "max_tokens": self.max_tokens,
            "response_format": { "type": "json_object" }
        })
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    async fn extract(
        &self,
        file: &DocumentFile,
        doc_type: DocType,
    ) -> Result<Vec<ExtractedField>, ExtractError> {
        info!(file = %file.name, doc_type = %doc_type, bytes = file.size(), "requesting extraction");

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(file, doc_type))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("unknown status");
            return Err(ExtractError::Extraction(format!("OpenAI API Error: {}", reason)));
        }

        let body: Value = response.json().await?;
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ExtractError::Extraction("No content received from OpenAI".to_string()))?;

        let fields = parse_completion_content(content)?;
        info!(file = %file.name, fields = fields.len(), "extraction finished");
        Ok(fields)
    }
}

// ============================================================================
// RESPONSE PARSING
// ============================================================================

/// Turn the model's JSON reply into field records.
///
/// Accepts a bare array or an object carrying the array under `data`,
/// `fields`, or `result`. Any other shape yields an empty list.
pub fn parse_completion_content(content: &str) -> Result<Vec<ExtractedField>, ExtractError> {
    let parsed: Value = serde_json::from_str(content)
        .map_err(|e| ExtractError::Extraction(format!("Invalid JSON response: {}", e)))?;

    if let Some(reasoning) = parsed.get("reasoning").and_then(Value::as_str) {
        debug!(%reasoning, "model reasoning");
    }

    let items = match &parsed {
        Value::Array(items) => items,
        Value::Object(map) => {
            let wrapped = ["data", "fields", "result"]
                .iter()
                .filter_map(|k| map.get(*k))
                .find(|v| is_truthy(v));
            match wrapped {
                Some(Value::Array(items)) => items,
                _ => {
                    warn!("unexpected JSON structure in extraction response");
                    return Ok(Vec::new());
                }
            }
        }
        _ => return Err(ExtractError::Extraction("Invalid or empty JSON response".to_string())),
    };

    Ok(items.iter().map(normalize_item).collect())
}

/// `null`, `false`, `0` and `""` do not count as a wrapper value
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn normalize_item(item: &Value) -> ExtractedField {
    let field = item
        .get("field")
        .and_then(value_as_text)
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());

    let value = item.get("value").and_then(value_as_text).unwrap_or_default();

    let confidence = item
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| *c != 0.0)
        .unwrap_or(DEFAULT_CONFIDENCE)
        .clamp(0.0, 1.0);

    ExtractedField { field, value, confidence }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ============================================================================
// MOCK EXTRACTOR
// ============================================================================

/// Canned loan data, for demos and offline development
pub struct MockExtractor {
    delay: Duration,
}

impl MockExtractor {
    pub fn new() -> Self {
        MockExtractor { delay: Duration::ZERO }
    }

    pub fn with_delay(delay: Duration) -> Self {
        MockExtractor { delay }
    }
}

impl Default for MockExtractor {
    fn default() -> Self {
        Self::new()
    }
}

pub fn sample_loan_fields() -> Vec<ExtractedField> {
    vec![
        ExtractedField::new("Borrower Name", "Johnathan Doe", 0.98),
        ExtractedField::new("Loan Amount", "$350,000.00", 0.95),
        ExtractedField::new("Interest Rate", "6.5%", 0.92),
        ExtractedField::new("Property Address", "123 Maple Avenue, Springfield, IL 62704", 0.96),
        ExtractedField::new("Loan Term", "30 Years", 0.99),
        ExtractedField::new("Application Date", "10/12/2024", 0.88),
        ExtractedField::new("Lender Name", "Apex Mortgage Corp", 0.94),
        ExtractedField::new("Monthly Income", "$8,500.00", 0.85),
    ]
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(
        &self,
        file: &DocumentFile,
        doc_type: DocType,
    ) -> Result<Vec<ExtractedField>, ExtractError> {
        debug!(file = %file.name, doc_type = %doc_type, "serving mock extraction");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(sample_loan_fields())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_key() {
        let content = r#"{"reasoning":"clear scan","data":[{"field":"Loan Number","value":"LN-77","confidence":0.91}]}"#;
        let fields = parse_completion_content(content).unwrap();
        assert_eq!(fields, vec![ExtractedField::new("Loan Number", "LN-77", 0.91)]);
    }

    #[test]
    fn test_parse_bare_array_and_alternate_keys() {
        let bare = r#"[{"field":"A","value":"1","confidence":1}]"#;
        assert_eq!(parse_completion_content(bare).unwrap().len(), 1);

        let fields = r#"{"fields":[{"field":"A","value":"1"}]}"#;
        assert_eq!(parse_completion_content(fields).unwrap().len(), 1);

        let result = r#"{"result":[]}"#;
        assert!(parse_completion_content(result).unwrap().is_empty());
    }

    #[test]
    fn test_parse_skips_null_wrapper_keys() {
        let content = r#"{"data":null,"fields":[{"field":"Employer","value":"Acme","confidence":0.9}]}"#;
        let fields = parse_completion_content(content).unwrap();
        assert_eq!(fields, vec![ExtractedField::new("Employer", "Acme", 0.9)]);

        let content = r#"{"data":"","fields":false,"result":[{"field":"A","value":"1"}]}"#;
        assert_eq!(parse_completion_content(content).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_unexpected_shape_is_empty() {
        let content = r#"{"answer":"no table here"}"#;
        assert!(parse_completion_content(content).unwrap().is_empty());
    }

    #[test]
    fn test_parse_invalid_json_is_extraction_error() {
        let err = parse_completion_content("not json").unwrap_err();
        assert!(matches!(err, ExtractError::Extraction(_)));

        let err = parse_completion_content("42").unwrap_err();
        assert!(matches!(err, ExtractError::Extraction(_)));
    }

    #[test]
    fn test_normalize_defaults() {
        let content = r#"[{"value":null,"confidence":0},{"field":"Rate","value":6.5,"confidence":1.7}]"#;
        let fields = parse_completion_content(content).unwrap();

        assert_eq!(fields[0], ExtractedField::new("Unknown", "", 0.5));
        assert_eq!(fields[1], ExtractedField::new("Rate", "6.5", 1.0));
    }

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let settings = ExtractionSettings::default();
        let err = build_extractor(&settings).err().unwrap();
        assert!(matches!(err, ExtractError::Configuration(_)));
    }

    #[test]
    fn test_request_body_shape() {
        let settings = ExtractionSettings {
            api_key: Some("sk-test".to_string()),
            ..ExtractionSettings::default()
        };
        let client = OpenAiExtractor::new(&settings).unwrap();
        let doc = DocumentFile::new("stub.png", "image/png", vec![0xff]);

        let body = client.request_body(&doc, DocType::PayStub);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 1500);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][1]["content"][1]["image_url"]["url"], "data:image/png;base64,/w==");
    }

    #[tokio::test]
    async fn test_mock_extractor_when_enabled() {
        let settings = ExtractionSettings {
            use_mock_extraction: true,
            ..ExtractionSettings::default()
        };
        let extractor = build_extractor(&settings).unwrap();
        let doc = DocumentFile::new("a.png", "image/png", vec![]);

        let fields = extractor.extract(&doc, DocType::Other).await.unwrap();
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[0].field, "Borrower Name");
    }
}
