// ⚙️ Application Configuration
// Loaded from a TOML file, then overridden by environment variables

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "loan-extract.toml";

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Chat-completions endpoint (OpenAI or a compatible proxy)
    pub endpoint: String,

    pub model: String,

    pub max_tokens: u32,

    /// Usually supplied through OPENAI_API_KEY instead
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Serve canned sample data instead of calling the model
    pub use_mock_extraction: bool,

    /// Artificial latency for mock extraction
    pub mock_delay_ms: u64,

    pub timeout_secs: u64,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 1500,
            api_key: None,
            use_mock_extraction: false,
            mock_delay_ms: 0,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: PathBuf,

    /// Root directory for uploaded blobs (one sub-directory per user)
    pub blob_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("documents.db"),
            blob_dir: PathBuf::from("documents"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// JSON rule file; built-in defaults when absent
    pub rules_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// User the CLI acts as. No user means no persistence.
    pub user_id: Option<String>,

    pub email: Option<String>,

    /// Server bearer tokens, token = user id. Kept out of `config` output.
    #[serde(skip_serializing)]
    pub tokens: BTreeMap<String, String>,
}

// ============================================================================
// APP CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub extraction: ExtractionSettings,
    pub storage: StorageSettings,
    pub validation: ValidationSettings,
    pub auth: AuthSettings,
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config TOML")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Explicit path, else `loan-extract.toml` if present, else defaults;
    /// environment overrides applied last
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    /// Apply OPENAI_API_KEY, LOAN_EXTRACT_MOCK and LOAN_EXTRACT_USER
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()) {
            self.extraction.api_key = Some(key);
        }
        if let Some(flag) = lookup("LOAN_EXTRACT_MOCK") {
            self.extraction.use_mock_extraction = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(user) = lookup("LOAN_EXTRACT_USER").filter(|u| !u.is_empty()) {
            self.auth.user_id = Some(user);
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.extraction.model, "gpt-4o");
        assert_eq!(config.extraction.max_tokens, 1500);
        assert!(!config.extraction.use_mock_extraction);
        assert!(config.auth.user_id.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [extraction]
            use_mock_extraction = true

            [storage]
            blob_dir = "/tmp/blobs"
            "#,
        )
        .unwrap();

        assert!(config.extraction.use_mock_extraction);
        assert_eq!(config.extraction.model, "gpt-4o");
        assert_eq!(config.storage.blob_dir, PathBuf::from("/tmp/blobs"));
        assert_eq!(config.storage.database_path, PathBuf::from("documents.db"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-test"),
            ("LOAN_EXTRACT_MOCK", "true"),
            ("LOAN_EXTRACT_USER", "user-42"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.extraction.api_key.as_deref(), Some("sk-test"));
        assert!(config.extraction.use_mock_extraction);
        assert_eq!(config.auth.user_id.as_deref(), Some("user-42"));
    }

    #[test]
    fn test_empty_api_key_ignored() {
        let mut config = AppConfig::default();
        config.apply_env(|k| (k == "OPENAI_API_KEY").then(String::new));
        assert!(config.extraction.api_key.is_none());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = AppConfig::default();
        let text = config.to_toml_string().unwrap();
        let parsed = AppConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.extraction.endpoint, config.extraction.endpoint);
    }

    #[test]
    fn test_auth_tokens_parsed_but_not_printed() {
        let config = AppConfig::from_toml_str(
            r#"
            [auth.tokens]
            "tok-alice" = "alice"
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.tokens.get("tok-alice").map(String::as_str), Some("alice"));
        assert!(!config.to_toml_string().unwrap().contains("tok-alice"));
    }
}
