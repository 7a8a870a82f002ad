// ✅ Validation Engine - Rules as Data
// Applies configured rules to extracted fields and annotates each field with
// errors or warnings. Recomputed from scratch on every edit.

use crate::document::ExtractedField;
use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleType {
    Required,
    Confidence,
    Format,
    Custom,
}

impl RuleType {
    pub fn name(&self) -> &str {
        match self {
            RuleType::Required => "REQUIRED",
            RuleType::Confidence => "CONFIDENCE",
            RuleType::Format => "FORMAT",
            RuleType::Custom => "CUSTOM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Rule ID for tracking
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(rename = "type")]
    pub rule_type: RuleType,

    /// Minimum confidence for CONFIDENCE rules
    #[serde(default)]
    pub threshold: Option<f64>,

    /// Field this rule is scoped to (None = every field)
    #[serde(default)]
    pub field: Option<String>,
}

impl ValidationRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, rule_type: RuleType) -> Self {
        ValidationRule {
            id: id.into(),
            name: name.into(),
            description: None,
            rule_type,
            threshold: None,
            field: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    fn applies_to(&self, field: &str) -> bool {
        self.field.as_deref().map_or(true, |scope| scope == field)
    }
}

/// Rules used when the caller supplies none
pub fn default_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule::new("min-confidence", "Minimum Confidence", RuleType::Confidence)
            .with_description("Flag fields with low confidence scores")
            .with_threshold(0.8),
        ValidationRule::new("required-fields", "Required Fields", RuleType::Required)
            .with_description("Ensure all fields have values"),
    ]
}

/// Load rules from a JSON array
pub fn load_rules<P: AsRef<Path>>(path: P) -> Result<Vec<ValidationRule>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

    serde_json::from_str(&content).context("Failed to parse rules JSON")
}

// ============================================================================
// ACTIVE RULES
// ============================================================================

/// One active rule per rule type.
///
/// The first rule of each type in list order wins; later rules of the same
/// type never run. A field-scoped first rule still holds its slot, so it
/// shadows any later global rule of that type.
#[derive(Debug, Clone, Default)]
pub struct ActiveRules {
    required: Option<ValidationRule>,
    confidence: Option<ValidationRule>,
    format: Option<ValidationRule>,
    custom: Option<ValidationRule>,
}

impl ActiveRules {
    pub fn from_rules(rules: &[ValidationRule]) -> Self {
        let mut active = ActiveRules::default();

        for rule in rules {
            let slot = active.slot_mut(rule.rule_type);
            if slot.is_some() {
                debug!(rule_id = %rule.id, rule_type = rule.rule_type.name(), "shadowed validation rule ignored");
                continue;
            }
            *slot = Some(rule.clone());
        }

        active
    }

    pub fn get(&self, rule_type: RuleType) -> Option<&ValidationRule> {
        match rule_type {
            RuleType::Required => self.required.as_ref(),
            RuleType::Confidence => self.confidence.as_ref(),
            RuleType::Format => self.format.as_ref(),
            RuleType::Custom => self.custom.as_ref(),
        }
    }

    fn slot_mut(&mut self, rule_type: RuleType) -> &mut Option<ValidationRule> {
        match rule_type {
            RuleType::Required => &mut self.required,
            RuleType::Confidence => &mut self.confidence,
            RuleType::Format => &mut self.format,
            RuleType::Custom => &mut self.custom,
        }
    }

    /// Active rule of `rule_type` if it covers `field`
    fn for_field(&self, rule_type: RuleType, field: &str) -> Option<&ValidationRule> {
        self.get(rule_type).filter(|rule| rule.applies_to(field))
    }
}

// ============================================================================
// VALIDATION RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}: {}", self.severity, self.field, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// True only when `errors` is empty. Warnings count too.
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn error_count(&self) -> usize {
        self.errors.iter().filter(|e| e.severity == Severity::Error).count()
    }

    pub fn warning_count(&self) -> usize {
        self.errors.iter().filter(|e| e.severity == Severity::Warning).count()
    }

    /// ERROR-severity entries only; warnings are cosmetic
    pub fn has_blocking_errors(&self) -> bool {
        self.error_count() > 0
    }

    /// Annotations for a single field, in emission order
    pub fn errors_for<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a ValidationError> + 'a {
        self.errors.iter().filter(move |e| e.field == field)
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} error(s), {} warning(s)",
            if self.is_valid { "Valid" } else { "Needs review" },
            self.error_count(),
            self.warning_count()
        )
    }
}

// ============================================================================
// VALIDATE
// ============================================================================

pub fn validate(records: &[ExtractedField], rules: &[ValidationRule]) -> ValidationReport {
    let active = ActiveRules::from_rules(rules);
    let mut errors = Vec::new();

    for record in records {
        if let Some(rule) = active.for_field(RuleType::Confidence, &record.field) {
            if let Some(warning) = check_confidence(rule, record) {
                errors.push(warning);
            }
        }

        if active.for_field(RuleType::Required, &record.field).is_some()
            && record.value.trim().is_empty()
        {
            errors.push(ValidationError {
                field: record.field.clone(),
                message: "Value is missing".to_string(),
                severity: Severity::Error,
            });
        }

        // FORMAT and CUSTOM are accepted in configuration but check nothing yet
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
    }
}

/// `validate` with `default_rules()`
pub fn validate_default(records: &[ExtractedField]) -> ValidationReport {
    validate(records, &default_rules())
}

fn check_confidence(rule: &ValidationRule, record: &ExtractedField) -> Option<ValidationError> {
    // A zero or missing threshold disables the check
    let threshold = rule.threshold.filter(|t| *t != 0.0)?;

    if record.confidence < threshold {
        Some(ValidationError {
            field: record.field.clone(),
            message: format!("Low confidence ({}%)", (record.confidence * 100.0).round() as i64),
            severity: Severity::Warning,
        })
    } else {
        None
    }
}

// ============================================================================
// TESTS
// ============================================================================
