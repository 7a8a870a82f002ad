// Loan Document Extraction - Web Server
// REST API over extraction, validation, export and stored documents

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use loan_extract::{
    build_extractor, default_rules, export_fields, load_rules, logging, session_from_bearer,
    validate, AppConfig, DocType, DocumentFile, DocumentStore, ExportFormat, ExtractedField, Extractor, SqliteStore,
    ValidationReport, ValidationRule,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    store: Arc<SqliteStore>,
    extractor: Arc<dyn Extractor>,
    rules: Arc<Vec<ValidationRule>>,
    /// Bearer token -> user id
    tokens: Arc<BTreeMap<String, String>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ApiResponse::<()>::err(message))).into_response()
}

#[derive(Deserialize)]
struct ValidateRequest {
    records: Vec<ExtractedField>,
    /// Falls back to the server's configured rules
    #[serde(default)]
    rules: Option<Vec<ValidationRule>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractRequest {
    file_name: String,
    mime_type: String,
    data_base64: String,
    doc_type: DocType,
}

#[derive(Serialize)]
struct ExtractResponse {
    records: Vec<ExtractedField>,
    validation: ValidationReport,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/validate - Validate a field list
async fn validate_records(
    State(state): State<AppState>,
    Json(req): Json<ValidateRequest>,
) -> impl IntoResponse {
    let report = match &req.rules {
        Some(rules) => validate(&req.records, rules),
        None => validate(&req.records, &state.rules),
    };
    Json(ApiResponse::ok(report))
}

/// POST /api/export/:format - Render fields as a JSON or CSV download
async fn export_records(
    Path(format): Path<String>,
    Json(records): Json<Vec<ExtractedField>>,
) -> Response {
    let format: ExportFormat = match format.parse() {
        Ok(f) => f,
        Err(e) => return failure(StatusCode::BAD_REQUEST, e),
    };

    let disposition = format!("attachment; filename=\"{}\"", format.file_name());
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, format.mime_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        export_fields(&records, format),
    )
        .into_response()
}

/// POST /api/extract - Run extraction on an uploaded document
async fn extract_document(
    State(state): State<AppState>,
    Json(req): Json<ExtractRequest>,
) -> Response {
    let bytes = match BASE64.decode(req.data_base64.as_bytes()) {
        Ok(b) => b,
        Err(e) => return failure(StatusCode::BAD_REQUEST, format!("invalid base64: {}", e)),
    };
    let file = DocumentFile::new(req.file_name, req.mime_type, bytes);

    match state.extractor.extract(&file, req.doc_type).await {
        Ok(records) => {
            let validation = validate(&records, &state.rules);
            (StatusCode::OK, Json(ApiResponse::ok(ExtractResponse { records, validation }))).into_response()
        }
        Err(e) => {
            warn!(file = %file.name, error = %e, "extraction request failed");
            failure(StatusCode::BAD_GATEWAY, e.item_message())
        }
    }
}

/// GET /api/documents/:user_id - Stored documents for a user, newest first.
/// Only the user named by the bearer token may list their own documents.
async fn list_documents(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let Some(session) = session_from_bearer(bearer, &state.tokens) else {
        return failure(StatusCode::UNAUTHORIZED, "missing or invalid bearer token");
    };
    if session.user_id != user_id {
        warn!(%user_id, caller = %session.user_id, "refused cross-user document listing");
        return failure(StatusCode::FORBIDDEN, "documents belong to another user");
    }

    match state.store.list_for_user(&user_id).await {
        Ok(docs) => (StatusCode::OK, Json(ApiResponse::ok(docs))).into_response(),
        Err(e) => {
            error!(%user_id, error = %e, "listing documents failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging(false);

    let config = AppConfig::load(None)?;
    let store = SqliteStore::open(&config.storage.database_path, &config.storage.blob_dir)?;
    let extractor = build_extractor(&config.extraction)?;
    let rules = match &config.validation.rules_path {
        Some(path) => load_rules(path)?,
        None => default_rules(),
    };

    if config.auth.tokens.is_empty() {
        warn!("no [auth.tokens] configured; document listing will refuse every request");
    }

    let state = AppState {
        store: Arc::new(store),
        extractor,
        rules: Arc::new(rules),
        tokens: Arc::new(config.auth.tokens),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/validate", post(validate_records))
        .route("/export/:format", post(export_records))
        .route("/extract", post(extract_document))
        .route("/documents/:user_id", get(list_documents))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = "0.0.0.0:3000";
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("server running on http://localhost:3000");

    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use loan_extract::MockExtractor;

    fn test_state(dir: &std::path::Path) -> AppState {
        AppState {
            store: Arc::new(SqliteStore::in_memory(dir).unwrap()),
            extractor: Arc::new(MockExtractor::new()),
            rules: Arc::new(default_rules()),
            tokens: Arc::new(BTreeMap::from([("tok-alice".to_string(), "alice".to_string())])),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_documents_require_bearer_token() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let response = list_documents(State(state.clone()), Path("alice".to_string()), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = list_documents(State(state), Path("alice".to_string()), bearer("tok-unknown")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_documents_of_other_user_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let response = list_documents(State(state.clone()), Path("bob".to_string()), bearer("tok-alice")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = list_documents(State(state), Path("alice".to_string()), bearer("tok-alice")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
