use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use medlens::{
    ComparisonSelector, DocumentIdentity, DocumentPayload, HistoryStore, Language, LensError,
    ResolveOutcome, SessionCoordinator, SessionSnapshot, SettingsReader, UploadedDocument,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::{
    config::ServiceConfig,
    models::{
        ChatRequest, ChatResponse, ComparisonResponse, EntryDetail, HistoryGroupResponse,
        LanguageRequest, PrepareComparisonRequest, ResolveResponse, SelectionResponse,
        UploadDocumentRequest,
    },
    openrouter::OpenRouterClient,
};

/// Request and response header carrying the id every log line of a request is tagged with.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "id": id
        })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

fn lens_error(e: LensError) -> ApiError {
    let status = match &e {
        LensError::InvalidLanguage(_) | LensError::EmptyMessage | LensError::InvalidDocument(_) => {
            StatusCode::BAD_REQUEST
        }
        LensError::EntryNotFound(id) => return not_found_error("History entry not found", &id.to_string()),
        LensError::Busy
        | LensError::DuplicateEntry { .. }
        | LensError::NotComparable(_)
        | LensError::NoActiveDocument
        | LensError::NotInitialized => StatusCode::CONFLICT,
        LensError::SourceUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LensError::AnalysisFailure(_) | LensError::ChatFailure(_) => StatusCode::BAD_GATEWAY,
        LensError::PersistenceFailure(_) | LensError::Serialization(_) => {
            error!(error = %e, "Request failed");
            return internal_error("Request failed", &e.to_string());
        }
    };
    (status, Json(json!({ "error": e.to_string() })))
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
    pub selector: Arc<Mutex<ComparisonSelector>>,
    pub default_language: Language,
}

impl AppState {
    pub fn new(coordinator: Arc<SessionCoordinator>, default_language: Language) -> Self {
        Self {
            coordinator,
            selector: Arc::new(Mutex::new(ComparisonSelector::new())),
            default_language,
        }
    }
}

pub async fn create_app(config: &ServiceConfig) -> anyhow::Result<Router> {
    let app_state = create_app_state(config).await?;
    Ok(build_router(app_state))
}

async fn create_app_state(config: &ServiceConfig) -> anyhow::Result<AppState> {
    let store = config.open_store().await?;
    let history = HistoryStore::load(store.clone(), config.history_limit).await;
    info!(entries = history.len(), limit = config.history_limit, "History loaded");

    let client = Arc::new(OpenRouterClient::from_config(config));
    info!(model = %client.model(), "Using OpenRouter model");

    let coordinator = SessionCoordinator::new(
        client.clone(),
        client,
        SettingsReader::new(store),
        history,
    );
    Ok(AppState::new(Arc::new(coordinator), config.default_language.clone()))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/documents", post(upload_document))
        .route("/session", get(get_session))
        .route("/session/language", post(switch_language))
        .route("/session/retry", post(retry))
        .route("/session/reset", post(reset))
        .route("/session/chat", post(send_message))
        .route("/history", get(list_history))
        .route("/history/{id}", get(get_history_entry).delete(delete_history_entry))
        .route("/history/{id}/report", get(history_report))
        .route("/history/{id}/load", post(load_history_entry))
        .route("/history/documents/{identity}", delete(delete_document))
        .route("/comparison", get(get_comparison).delete(clear_comparison))
        .route("/comparison/toggle/{id}", post(toggle_comparison))
        .route("/comparison/prepare", post(prepare_comparison))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(correlation_id))
        .with_state(app_state)
}

/// Keeps a usable caller-supplied correlation id or generates one, runs the
/// request inside a span tagged with it and echoes it on the response.
async fn correlation_id(mut request: Request<Body>, next: Next) -> Response {
    let supplied = request
        .headers()
        .get(CORRELATION_HEADER)
        .filter(|value| !value.is_empty() && value.len() <= 128 && value.to_str().is_ok())
        .cloned();
    let value = match supplied {
        Some(value) => value,
        None => match HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            Ok(value) => value,
            Err(_) => return next.run(request).await,
        },
    };

    let span = info_span!(
        "http_request",
        correlation_id = %value.to_str().unwrap_or_default(),
        method = %request.method(),
        path = %request.uri().path(),
    );
    request.headers_mut().insert(CORRELATION_HEADER, value.clone());

    let mut response = next.run(request).instrument(span).await;
    response.headers_mut().insert(CORRELATION_HEADER, value);
    response
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "MedLens Document Interpretation Service",
        "version": "1.0.0",
        "description": "Explains medical documents in the patient's language and answers follow-up questions",
        "endpoints": {
            "POST /documents": "Upload a document and analyze it",
            "GET /session": "Active document, analysis and conversation",
            "POST /session/language": "Show the active document in another language",
            "POST /session/retry": "Retry a failed analysis",
            "POST /session/reset": "Close the active document",
            "POST /session/chat": "Ask a question about the active document",
            "GET /history": "Past analyses grouped by document",
            "GET /history/{id}": "One past analysis with its conversation",
            "GET /history/{id}/report": "Markdown report of a past analysis",
            "POST /history/{id}/load": "Reopen a past analysis",
            "DELETE /history/{id}": "Delete one language variant",
            "DELETE /history/documents/{identity}": "Delete every variant of a document",
            "GET /comparison": "Current comparison selection",
            "POST /comparison/toggle/{id}": "Select or deselect an entry for comparison",
            "DELETE /comparison": "Clear the selection",
            "POST /comparison/prepare": "Resolve both selected entries in one language",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

fn parse_language(tag: &str) -> Result<Language, ApiError> {
    Language::parse(tag).map_err(lens_error)
}

async fn upload_document(
    State(state): State<AppState>,
    Json(request): Json<UploadDocumentRequest>,
) -> ApiResult<ResolveResponse> {
    info!(file_name = %request.file_name, mime_type = %request.mime_type, "Document upload");

    let uploaded = build_upload(&request)?;
    let language = match request.language.as_deref() {
        Some(tag) => parse_language(tag)?,
        None => state.default_language.clone(),
    };

    let outcome = state
        .coordinator
        .upload(uploaded, language)
        .await
        .map_err(lens_error)?;
    Ok(resolve_response(&state, outcome).await)
}

/// Entries evicted by the history limit leave the comparison selection too.
async fn resolve_response(state: &AppState, outcome: ResolveOutcome) -> Json<ResolveResponse> {
    if let ResolveOutcome::Ready(resolved) = &outcome {
        if !resolved.evicted.is_empty() {
            let mut selector = state.selector.lock().await;
            for id in &resolved.evicted {
                selector.forget(*id);
            }
        }
    }
    Json(outcome.into())
}

fn build_upload(request: &UploadDocumentRequest) -> Result<UploadedDocument, ApiError> {
    if request.file_name.trim().is_empty() {
        return Err(bad_request_error("File name is required"));
    }
    let bytes = STANDARD
        .decode(request.data.trim())
        .map_err(|e| bad_request_error(&format!("Document data is not valid base64: {e}")))?;
    let payload = DocumentPayload::new(bytes, request.mime_type.as_str()).map_err(lens_error)?;

    let uploaded = UploadedDocument::new(request.file_name.trim(), payload);
    Ok(match &request.preview {
        Some(preview) => uploaded.with_preview(preview.as_str()),
        None => uploaded,
    })
}

async fn get_session(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.coordinator.snapshot().await)
}

async fn switch_language(
    State(state): State<AppState>,
    Json(request): Json<LanguageRequest>,
) -> ApiResult<ResolveResponse> {
    let language = parse_language(&request.language)?;
    info!(language = %language, "Language switch");
    let outcome = state
        .coordinator
        .switch_language(language)
        .await
        .map_err(lens_error)?;
    Ok(resolve_response(&state, outcome).await)
}

async fn retry(State(state): State<AppState>) -> ApiResult<ResolveResponse> {
    let outcome = state.coordinator.retry().await.map_err(lens_error)?;
    Ok(resolve_response(&state, outcome).await)
}

async fn reset(State(state): State<AppState>) -> Json<Value> {
    state.coordinator.reset().await;
    Json(json!({ "status": "reset" }))
}

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    let outcome = state
        .coordinator
        .send_message(&request.message)
        .await
        .map_err(lens_error)?;
    Ok(Json(outcome.into()))
}

async fn list_history(State(state): State<AppState>) -> Json<Vec<HistoryGroupResponse>> {
    let groups = state.coordinator.history_groups().await;
    let selector = state.selector.lock().await;
    Json(
        groups
            .iter()
            .map(|group| HistoryGroupResponse::new(group, &selector))
            .collect(),
    )
}

async fn get_history_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<EntryDetail> {
    match state.coordinator.history_entry(id).await {
        Some(entry) => Ok(Json((&entry).into())),
        None => Err(not_found_error("History entry not found", &id.to_string())),
    }
}

async fn history_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state
        .coordinator
        .history_entry(id)
        .await
        .ok_or_else(|| not_found_error("History entry not found", &id.to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        entry.result.export_report(&entry.language),
    ))
}

async fn load_history_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ResolveResponse> {
    let resolved = state
        .coordinator
        .load_history_entry(id)
        .await
        .map_err(lens_error)?;
    Ok(Json(resolved.into()))
}

async fn delete_history_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Value> {
    let warnings = state.coordinator.delete_entry(id).await.map_err(lens_error)?;
    state.selector.lock().await.forget(id);
    Ok(Json(json!({ "deleted": [id], "warnings": warnings })))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> ApiResult<Value> {
    let identity = DocumentIdentity::from_hex(identity.as_str())
        .ok_or_else(|| bad_request_error("Document identity must be a SHA-256 hex digest"))?;

    let (removed, warnings) = state
        .coordinator
        .delete_document(&identity)
        .await
        .map_err(lens_error)?;
    if removed.is_empty() {
        return Err(not_found_error("Document not found in history", identity.as_str()));
    }

    state.selector.lock().await.forget_document(&identity);
    let ids: Vec<Uuid> = removed.iter().map(|entry| entry.id).collect();
    Ok(Json(json!({ "deleted": ids, "warnings": warnings })))
}

async fn get_comparison(State(state): State<AppState>) -> Json<SelectionResponse> {
    let selector = state.selector.lock().await;
    Json(SelectionResponse {
        outcome: None,
        selected: selector.selected(),
        valid: selector.is_valid(),
    })
}

async fn toggle_comparison(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<SelectionResponse> {
    let entry = state
        .coordinator
        .history_entry(id)
        .await
        .ok_or_else(|| not_found_error("History entry not found", &id.to_string()))?;

    let mut selector = state.selector.lock().await;
    let outcome = selector.toggle(&entry);
    Ok(Json(SelectionResponse {
        outcome: Some(outcome),
        selected: selector.selected(),
        valid: selector.is_valid(),
    }))
}

async fn clear_comparison(State(state): State<AppState>) -> Json<Value> {
    state.selector.lock().await.clear();
    Json(json!({ "status": "cleared" }))
}

async fn prepare_comparison(
    State(state): State<AppState>,
    Json(request): Json<PrepareComparisonRequest>,
) -> ApiResult<ComparisonResponse> {
    let language = match request.language.as_deref() {
        Some(tag) => parse_language(tag)?,
        None => state
            .coordinator
            .snapshot()
            .await
            .language
            .unwrap_or_else(|| state.default_language.clone()),
    };

    // Work on a copy so toggles are not blocked while variants are analyzed.
    let selector = state.selector.lock().await.clone();
    let pair = match selector.prepare_for_comparison(&state.coordinator, &language).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(language = %language, error = %e, "Comparison could not be prepared");
            if matches!(e, LensError::EntryNotFound(_)) {
                let dropped = state.selector.lock().await.prune(&state.coordinator).await;
                info!(dropped = dropped.len(), "Dropped selections missing from history");
            }
            return Err(lens_error(e));
        }
    };
    Ok(Json((&pair).into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use medlens::{
        AnalysisResult, AnalysisService, ChatService, ChatSession, Credential, InMemoryBlobStore,
    };
    use tower::ServiceExt;

    struct StubAnalysis;

    #[async_trait]
    impl AnalysisService for StubAnalysis {
        async fn analyze(
            &self,
            document: &DocumentPayload,
            language: &Language,
            _credential: &Credential,
        ) -> medlens::Result<AnalysisResult> {
            if document.bytes.as_slice() == b"FAIL" {
                return Err(LensError::AnalysisFailure("model unavailable".to_string()));
            }
            let classification = if document.bytes.starts_with(b"LIPID") {
                "Lipid panel"
            } else {
                "Complete blood count"
            };
            AnalysisResult::from_model_output(&format!(
                r#"{{"classification": "{classification}", "summary": "Summary in {language}",
                    "findings": [{{"name": "Hemoglobin", "value": "10.9", "unit": "g/dL", "status": "low"}}]}}"#
            ))
        }
    }

    struct StubChat;

    #[async_trait]
    impl ChatService for StubChat {
        async fn send(
            &self,
            session: &ChatSession,
            text: &str,
            _credential: &Credential,
        ) -> medlens::Result<String> {
            Ok(format!("({}) {text}", session.seed.language))
        }
    }

    async fn app() -> Router {
        app_with_limit(100).await
    }

    async fn app_with_limit(history_limit: usize) -> Router {
        let store = Arc::new(InMemoryBlobStore::new());
        let history = HistoryStore::load(store.clone(), history_limit).await;
        let coordinator = SessionCoordinator::new(
            Arc::new(StubAnalysis),
            Arc::new(StubChat),
            SettingsReader::new(store),
            history,
        );
        build_router(AppState::new(
            Arc::new(coordinator),
            Language::parse("en").unwrap(),
        ))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, value)
    }

    fn upload_body(bytes: &[u8], language: &str) -> Value {
        json!({
            "file_name": "labs.jpg",
            "mime_type": "image/jpeg",
            "data": STANDARD.encode(bytes),
            "language": language
        })
    }

    #[tokio::test]
    async fn health_and_root() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = call(&app, "GET", "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["endpoints"]["POST /documents"].is_string());
    }

    #[tokio::test]
    async fn upload_switch_and_list() {
        let app = app().await;

        let (status, body) = call(&app, "POST", "/documents", Some(upload_body(b"ABC", "en"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["source"], "service");
        let en_id = body["entry_id"].as_str().unwrap().to_string();

        let (_, body) = call(&app, "POST", "/session/language", Some(json!({ "language": "vi" }))).await;
        assert_eq!(body["source"], "service");
        let (_, body) = call(&app, "POST", "/session/language", Some(json!({ "language": "en" }))).await;
        assert_eq!(body["source"], "cache");
        assert_eq!(body["entry_id"], en_id.as_str());

        let (status, session) = call(&app, "GET", "/session", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["phase"]["state"], "ready");
        assert_eq!(session["cached_languages"], json!(["en", "vi"]));

        let (_, history) = call(&app, "GET", "/history", None).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["entries"].as_array().unwrap().len(), 2);
        assert_eq!(history[0]["entries"][0]["has_source"], true);
        assert!(history[0]["entries"][0].get("source").is_none());
    }

    #[tokio::test]
    async fn bad_input_is_rejected() {
        let app = app().await;

        let mut body = upload_body(b"ABC", "en");
        body["data"] = json!("not base64!");
        let (status, _) = call(&app, "POST", "/documents", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "POST", "/documents", Some(upload_body(b"ABC", "e n"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "POST", "/documents", Some(upload_body(b"", "en"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "POST", "/session/chat", Some(json!({ "message": "hi" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, "DELETE", "/history/documents/xyz", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown = "a".repeat(64);
        let (status, _) = call(&app, "DELETE", &format!("/history/documents/{unknown}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "GET", &format!("/history/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn analysis_failure_maps_to_bad_gateway_and_retry_succeeds_later() {
        let app = app().await;
        let (status, body) = call(&app, "POST", "/documents", Some(upload_body(b"FAIL", "en"))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("model unavailable"));

        let (_, session) = call(&app, "GET", "/session", None).await;
        assert_eq!(session["phase"]["state"], "failed");

        let (_, history) = call(&app, "GET", "/history", None).await;
        assert!(history.as_array().unwrap().is_empty());

        let (status, _) = call(&app, "POST", "/session/retry", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn chat_and_reload_from_history() {
        let app = app().await;
        let (_, body) = call(&app, "POST", "/documents", Some(upload_body(b"ABC", "fr"))).await;
        let id = body["entry_id"].as_str().unwrap().to_string();

        let (status, reply) = call(&app, "POST", "/session/chat", Some(json!({ "message": "Bonjour" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["status"], "replied");
        assert_eq!(reply["turn"]["text"], "(fr) Bonjour");

        let (status, _) = call(&app, "POST", "/session/chat", Some(json!({ "message": "   " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        call(&app, "POST", "/session/reset", None).await;
        let (status, loaded) = call(&app, "POST", &format!("/history/{id}/load"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(loaded["source"], "history");

        let (_, session) = call(&app, "GET", "/session", None).await;
        assert_eq!(session["transcript"].as_array().unwrap().len(), 3);

        let (_, entry) = call(&app, "GET", &format!("/history/{id}"), None).await;
        assert_eq!(entry["transcript"][2]["text"], "(fr) Bonjour");
        assert_eq!(entry["classification"], "Complete blood count");
    }

    #[tokio::test]
    async fn report_is_markdown() {
        let app = app().await;
        let (_, body) = call(&app, "POST", "/documents", Some(upload_body(b"ABC", "en"))).await;
        let id = body["entry_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/history/{id}/report"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/markdown")
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("Hemoglobin"));
    }

    #[tokio::test]
    async fn comparison_flow() {
        let app = app().await;
        let (_, first) = call(&app, "POST", "/documents", Some(upload_body(b"CBC-1", "en"))).await;
        let (_, second) = call(&app, "POST", "/documents", Some(upload_body(b"CBC-2", "vi"))).await;
        let (_, lipid) = call(&app, "POST", "/documents", Some(upload_body(b"LIPID-1", "en"))).await;
        let first = first["entry_id"].as_str().unwrap().to_string();
        let second = second["entry_id"].as_str().unwrap().to_string();
        let lipid = lipid["entry_id"].as_str().unwrap().to_string();

        call(&app, "POST", &format!("/comparison/toggle/{first}"), None).await;
        let (_, selection) = call(&app, "POST", &format!("/comparison/toggle/{lipid}"), None).await;
        assert_eq!(selection["valid"], false);
        let (status, _) = call(&app, "POST", "/comparison/prepare", Some(json!({ "language": "en" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, selection) = call(&app, "POST", &format!("/comparison/toggle/{second}"), None).await;
        assert_eq!(selection["outcome"]["outcome"], "replaced");
        assert_eq!(selection["valid"], false);

        // first was evicted; select it again so the pair is first + second
        call(&app, "POST", &format!("/comparison/toggle/{first}"), None).await;
        let (_, selection) = call(&app, "GET", "/comparison", None).await;
        assert_eq!(selection["valid"], true);

        let (status, pair) = call(&app, "POST", "/comparison/prepare", Some(json!({ "language": "en" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pair["left"]["language"], "en");
        assert_eq!(pair["right"]["language"], "en");
        assert_ne!(pair["left"]["id"], second.as_str());
        assert_eq!(pair["right"]["id"], first.as_str());

        let (status, _) = call(&app, "DELETE", &format!("/history/{second}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, selection) = call(&app, "GET", "/comparison", None).await;
        assert_eq!(selection["selected"].as_array().unwrap().len(), 1);

        let (_, cleared) = call(&app, "DELETE", "/comparison", None).await;
        assert_eq!(cleared["status"], "cleared");
    }

    #[tokio::test]
    async fn correlation_id_is_kept_or_generated_and_echoed() {
        let app = app().await;
        let request = Request::builder()
            .uri("/health")
            .header(CORRELATION_HEADER, "req-42")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.headers()[CORRELATION_HEADER], "req-42");

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let generated = response.headers()[CORRELATION_HEADER].to_str().unwrap();
        assert!(Uuid::parse_str(generated).is_ok());
    }

    #[tokio::test]
    async fn evicted_entries_leave_the_comparison_selection() {
        let app = app_with_limit(2).await;
        let (_, first) = call(&app, "POST", "/documents", Some(upload_body(b"CBC-1", "en"))).await;
        let (_, second) = call(&app, "POST", "/documents", Some(upload_body(b"CBC-2", "en"))).await;
        let first = first["entry_id"].as_str().unwrap().to_string();
        let second = second["entry_id"].as_str().unwrap().to_string();
        call(&app, "POST", &format!("/comparison/toggle/{first}"), None).await;
        call(&app, "POST", &format!("/comparison/toggle/{second}"), None).await;

        let (_, history) = call(&app, "GET", "/history", None).await;
        assert!(history.as_array().unwrap().iter().all(|g| g["entries"][0]["selected"] == true));
        assert!(history[0]["updated_at"].is_string());
        assert_eq!(history[0]["entries"][0]["document_type"], "complete_blood_count");

        let (_, third) = call(&app, "POST", "/documents", Some(upload_body(b"CBC-3", "en"))).await;
        assert_eq!(third["evicted"], json!([first.as_str()]));

        let (_, selection) = call(&app, "GET", "/comparison", None).await;
        let selected = selection["selected"].as_array().unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0]["id"], second.as_str());
    }
}
