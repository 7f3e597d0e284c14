//! HTTP API over the session manager.
//!
//! - POST   /v1/sessions                           create a session
//! - GET    /v1/sessions                           list sessions
//! - GET    /v1/sessions/{id}                      session info
//! - DELETE /v1/sessions/{id}                      destroy
//! - POST   /v1/sessions/{id}/completions          JSON or SSE (`stream: true`)
//! - POST   /v1/sessions/{id}/embeddings
//! - POST   /v1/sessions/{id}/cancel
//! - POST   /v1/sessions/{id}/snapshot/save|load  (paths relative to `snapshot.dir`)
//! - POST   /v1/sessions/{id}/chat/format
//! - GET|PUT|DELETE /v1/sessions/{id}/adapters
//! - POST   /v1/sessions/{id}/tokenize|detokenize
//! - POST   /v1/sessions/{id}/bench
//! - POST   /v1/models/info
//! - GET    /health, /metrics

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, ServerConfig, SessionConfig};
use crate::engine::{AdapterSpec, ModelMetadata, TokenId};
use crate::error::{ErrorKind, SessionError};
use crate::gateway::Gateway;
use crate::generation::{
    BenchParams, BenchResult, CharClassGrammar, ChatMessage, EmbeddingResult, FormattedChat,
    GenerationRequest, GenerationResult, Normalize, Prompt, SamplingParams,
};
use crate::server::streaming::generation_to_sse_stream;
use crate::session::{SessionInfo, SessionManager, SnapshotLoad};

/// Application state shared across handlers.
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub gateway: Gateway,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>, config: Arc<Config>) -> Self {
        Self {
            gateway: Gateway::new(manager.clone(), config.server.stream_buffer),
            manager,
            config,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs.max(1));
    Router::new()
        .route("/v1/sessions", post(create_session).get(list_sessions))
        .route("/v1/sessions/{id}", get(session_info).delete(destroy_session))
        .route("/v1/sessions/{id}/completions", post(completions))
        .route("/v1/sessions/{id}/embeddings", post(embeddings))
        .route("/v1/sessions/{id}/cancel", post(cancel))
        .route("/v1/sessions/{id}/snapshot/save", post(save_snapshot))
        .route("/v1/sessions/{id}/snapshot/load", post(load_snapshot))
        .route("/v1/sessions/{id}/chat/format", post(format_chat))
        .route(
            "/v1/sessions/{id}/adapters",
            get(list_adapters).put(apply_adapters).delete(remove_adapters),
        )
        .route("/v1/sessions/{id}/tokenize", post(tokenize))
        .route("/v1/sessions/{id}/detokenize", post(detokenize))
        .route("/v1/sessions/{id}/bench", post(bench))
        .route("/v1/models/info", post(model_info))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.server))
        .with_state(state)
}

/// CORS for the configured origins only. With none configured no CORS headers
/// are sent, so browsers refuse cross-origin calls.
fn cors_layer(server: &ServerConfig) -> CorsLayer {
    if server.cors_origins.iter().any(|o| o == "*") {
        warn!("CORS open to every origin");
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// JSON error payload.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    /// Output produced before an engine failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<GenerationResult>,
}

impl From<&SessionError> for ErrorBody {
    fn from(err: &SessionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            partial: err.partial_output().cloned(),
        }
    }
}

/// A `SessionError` rendered as an HTTP response.
pub struct ApiError(pub SessionError);

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Configuration => StatusCode::BAD_REQUEST,
        ErrorKind::Busy | ErrorKind::InvalidSession => StatusCode::CONFLICT,
        ErrorKind::Capability
        | ErrorKind::ModelLoad
        | ErrorKind::Format
        | ErrorKind::AdapterLoad => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Io | ErrorKind::Engine => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub model_path: PathBuf,
    /// Overrides for the server's default session options.
    #[serde(default)]
    pub config: Option<SessionConfig>,
}

/// Completion request body. Sampling fields sit at the top level.
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub prompt: Prompt,
    #[serde(flatten)]
    pub params: SamplingParams,
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,
    #[serde(default)]
    pub n_keep: i32,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub n_probs: usize,
    /// Restrict output to these characters.
    #[serde(default)]
    pub allowed_chars: Option<String>,
    #[serde(default)]
    pub max_chars: Option<usize>,
    #[serde(default)]
    pub stream: bool,
}

fn default_n_predict() -> i32 {
    -1
}

impl CompletionRequest {
    fn into_generation_request(self) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.prompt)
            .with_params(self.params)
            .with_n_predict(self.n_predict)
            .with_n_keep(self.n_keep)
            .with_stop(self.stop)
            .with_n_probs(self.n_probs);
        if let Some(chars) = self.allowed_chars {
            let mut grammar = CharClassGrammar::new(chars.as_bytes());
            if let Some(max) = self.max_chars {
                grammar = grammar.with_max_len(max);
            }
            request = request.with_grammar(Box::new(grammar));
        }
        request
    }
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    pub content: String,
    /// -1 = session default, 0 = off, 1 = on.
    #[serde(default = "default_normalize")]
    pub normalize: i32,
}

fn default_normalize() -> i32 {
    -1
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct SaveSnapshotRequest {
    pub path: PathBuf,
    /// `<= 0` saves the whole cache.
    #[serde(default)]
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SaveSnapshotResponse {
    pub tokens_saved: usize,
}

#[derive(Debug, Deserialize)]
pub struct LoadSnapshotRequest {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct FormatChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Template or format name overriding the session's.
    #[serde(default)]
    pub chat_template: Option<String>,
    #[serde(default = "default_add_generation_prompt")]
    pub add_generation_prompt: bool,
}

fn default_add_generation_prompt() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdaptersBody {
    pub adapters: Vec<AdapterSpec>,
}

#[derive(Debug, Deserialize)]
pub struct TokenizeRequest {
    pub content: String,
    #[serde(default)]
    pub add_special: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokensBody {
    pub tokens: Vec<TokenId>,
}

#[derive(Debug, Serialize)]
pub struct ContentBody {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfoRequest {
    pub model_path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub backend: String,
    pub sessions: usize,
    pub busy_sessions: usize,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionInfo>)> {
    let config = req.config.unwrap_or_else(|| state.config.session.clone());
    info!(model = %req.model_path.display(), n_ctx = config.context_length, "Create session request");

    let session = state.gateway.create_session(req.model_path, config).await?;
    Ok((StatusCode::CREATED, Json(session.info())))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.manager.list())
}

async fn session_info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SessionInfo>> {
    Ok(Json(state.manager.get(id)?.info()))
}

async fn destroy_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.gateway.destroy_session(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn completions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<CompletionRequest>,
) -> ApiResult<Response> {
    info!(
        session_id = %id,
        n_predict = req.n_predict,
        stream = req.stream,
        "Completion request"
    );
    let stream = req.stream;
    let request = req.into_generation_request();

    if stream {
        // Fail before opening the stream if the session does not exist.
        state.manager.get(id)?;
        let rx = state.gateway.stream(id, request);
        let stream = generation_to_sse_stream(rx);
        Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
    } else {
        let result = state.gateway.complete(id, request).await?;
        Ok(Json(result).into_response())
    }
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<EmbeddingRequest>,
) -> ApiResult<Json<EmbeddingResult>> {
    let normalize = Normalize::from_i32(req.normalize).ok_or_else(|| {
        SessionError::Configuration(format!("normalize must be -1, 0 or 1, got {}", req.normalize))
    })?;
    Ok(Json(state.gateway.embed(id, req.content, normalize).await?))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.gateway.cancel(id)?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn save_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<SaveSnapshotRequest>,
) -> ApiResult<Json<SaveSnapshotResponse>> {
    let path = state.config.snapshot.resolve(&req.path)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(SessionError::Io)?;
    }
    let max_tokens = req
        .max_tokens
        .unwrap_or(state.config.snapshot.max_tokens as i64);
    let tokens_saved = state.gateway.save_snapshot(id, path, max_tokens).await?;
    Ok(Json(SaveSnapshotResponse { tokens_saved }))
}

async fn load_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<LoadSnapshotRequest>,
) -> ApiResult<Json<SnapshotLoad>> {
    let path = state.config.snapshot.resolve(&req.path)?;
    Ok(Json(state.gateway.load_snapshot(id, path).await?))
}

async fn format_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<FormatChatRequest>,
) -> ApiResult<Json<FormattedChat>> {
    let session = state.manager.get(id)?;
    let formatted = session.format_chat(
        &req.messages,
        req.chat_template.as_deref(),
        req.add_generation_prompt,
    )?;
    Ok(Json(formatted))
}

async fn list_adapters(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AdaptersBody>> {
    let adapters = state.manager.get(id)?.adapters();
    Ok(Json(AdaptersBody { adapters }))
}

async fn apply_adapters(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<AdaptersBody>,
) -> ApiResult<Json<AdaptersBody>> {
    state.gateway.apply_adapters(id, req.adapters.clone()).await?;
    Ok(Json(req))
}

async fn remove_adapters(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.gateway.remove_adapters(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn tokenize(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<TokenizeRequest>,
) -> ApiResult<Json<TokensBody>> {
    let session = state.manager.get(id)?;
    Ok(Json(TokensBody {
        tokens: session.tokenize(&req.content, req.add_special),
    }))
}

async fn detokenize(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<TokensBody>,
) -> ApiResult<Json<ContentBody>> {
    let session = state.manager.get(id)?;
    let n_vocab = session.metadata().n_vocab;
    if let Some(bad) = req.tokens.iter().find(|t| **t < 0 || **t as usize >= n_vocab) {
        return Err(SessionError::Configuration(format!("token {bad} out of range")).into());
    }
    Ok(Json(ContentBody {
        content: session.detokenize(&req.tokens),
    }))
}

async fn bench(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(params): Json<BenchParams>,
) -> ApiResult<Json<BenchResult>> {
    Ok(Json(state.gateway.bench(id, params).await?))
}

async fn model_info(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ModelInfoRequest>,
) -> ApiResult<Json<ModelMetadata>> {
    Ok(Json(state.gateway.model_info(req.model_path).await?))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let sessions = state.manager.list();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        backend: state.manager.backend_name().to_string(),
        busy_sessions: sessions.iter().filter(|s| s.busy).count(),
        sessions: sessions.len(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, StatusCode> {
    let body = state
        .manager
        .metrics()
        .render()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
