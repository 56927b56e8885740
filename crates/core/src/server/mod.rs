use std::net::SocketAddr;
use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, State};
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::api::{
    AnimateRequest, AnimateResponse, CreateJobRequest, CreateJobResponse, GenerateRequest,
    GenerateResponse, JobResponse, RetryJobResponse, UploadPromptsResponse, ValidateCookieRequest,
    ValidateCookieResponse, DEFAULT_VIDEO_MODEL,
};
use crate::config::AppConfig;
use crate::events::EventHub;
use crate::generation::{
    decode_base64_media, encode_base64_media, spawn_destroy_context, ClientFactory,
    DefaultClientFactory, GenerationError, MediaResult, MOCK_CREDENTIAL,
};
use crate::prompt_import::extract_prompts;
use crate::rate_limit::RateLimiter;
use crate::store::JobStore;
use crate::types::{validate_references, JobEvent};
use crate::worker::{Worker, MEDIA_URL_PREFIX};

/// Uploaded prompt files and reference-laden requests can be large.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
/// Forget idle rate-limit windows once this many callers are tracked.
const RATE_LIMIT_PRUNE_THRESHOLD: usize = 1_024;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    store: JobStore,
    worker: Worker,
    events: EventHub,
    rate_limiter: RateLimiter,
    factory: Arc<dyn ClientFactory>,
    media_dir: PathBuf,
    video_timeout: Duration,
}

impl AppState {
    pub fn new(config: AppConfig, data_dir: &StdPath) -> Self {
        let factory = Arc::new(DefaultClientFactory::new(config.generation_settings()));
        Self::with_factory(config, data_dir, factory)
    }

    /// Build the state around a caller-supplied adapter factory.
    pub fn with_factory(
        config: AppConfig,
        data_dir: &StdPath,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let store = JobStore::open_in_dir(data_dir, config.store_settings());
        let events = EventHub::new();
        let media_dir = config.media_dir(data_dir);
        let worker = Worker::new(
            store.clone(),
            Arc::clone(&factory),
            events.clone(),
            media_dir.clone(),
            config.worker_settings(),
        );

        Self {
            inner: Arc::new(AppStateInner {
                rate_limiter: RateLimiter::new(config.rate_limit_settings()),
                video_timeout: config.video_timeout(),
                config,
                store,
                worker,
                events,
                factory,
                media_dir,
            }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    pub fn media_dir(&self) -> &StdPath {
        &self.inner.media_dir
    }

    /// Start the store's safety-net flush and the background worker.
    pub fn start(&self) {
        self.inner.store.start();
        self.inner.worker.start();
    }

    /// Stop the worker first so its last writes land in the final flush.
    pub async fn shutdown(&self) {
        self.inner.worker.stop().await;
        self.inner.store.stop().await;
        info!("Application state shut down");
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_jobs: usize,
    pub worker_busy: bool,
    pub failure_streak: u32,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let media = ServeDir::new(state.media_dir());

    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/validate-cookie", post(validate_cookie))
        .route("/api/generate", post(generate))
        .route("/api/animate", post(animate))
        .route("/api/upload-prompts", post(upload_prompts))
        .route("/api/jobs", post(create_job).get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/retry", post(retry_job))
        .route("/api/jobs/{id}/ws", any(job_ws))
        .route("/api/{*path}", any(api_route_not_found))
        .nest_service(MEDIA_URL_PREFIX, media)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_jobs: state.inner.store.active_job_count(),
        worker_busy: state.inner.worker.is_busy(),
        failure_streak: state.inner.worker.failure_streak(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    Json(state.inner.config.clone())
}

async fn validate_cookie(
    State(state): State<AppState>,
    Json(payload): Json<ValidateCookieRequest>,
) -> Result<Json<ValidateCookieResponse>, AppError> {
    let cookie = payload.cookie.trim();
    if cookie.is_empty() {
        return Err(AppError::BadRequest("cookie is required".to_string()));
    }

    let client = state.inner.factory.client_for(cookie)?;
    let response = match client.validate_credential().await {
        Ok(check) => ValidateCookieResponse {
            valid: check.valid,
            message: check.message,
            email: check.identity,
        },
        Err(err) => {
            debug!(error = %err, "Credential validation failed");
            ValidateCookieResponse {
                valid: false,
                message: Some(err.to_string()),
                email: None,
            }
        }
    };
    Ok(Json(response))
}

async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    let identity = caller_identity(&headers, &extensions);
    let limiter = &state.inner.rate_limiter;
    if let Err(retry_after) = limiter.check(&identity) {
        warn!(caller = %identity, "Generate request rate limited");
        return Err(AppError::TooManyRequests(format!(
            "rate limit exceeded, retry in {}s",
            retry_after.as_secs().max(1)
        )));
    }
    if limiter.tracked_identities() > RATE_LIMIT_PRUNE_THRESHOLD {
        limiter.prune_at(std::time::Instant::now());
    }

    let cookie = payload.cookie.trim();
    let prompt = payload.prompt.trim();
    if cookie.is_empty() || prompt.is_empty() {
        return Err(AppError::BadRequest(
            "missing required fields: cookie and prompt".to_string(),
        ));
    }
    validate_references(&payload.references).map_err(AppError::BadRequest)?;

    let client = state.inner.factory.client_for(cookie)?;
    let label = if cookie == MOCK_CREDENTIAL {
        "bulkgen-mock".to_string()
    } else {
        format!("bulkgen-adhoc-{}", uuid::Uuid::new_v4())
    };
    let context = client.create_context(&label, &payload.references).await?;
    let result = client
        .generate(&context, prompt, payload.aspect_ratio)
        .await;
    spawn_destroy_context(Arc::clone(&client), context);

    let media = result?;
    debug!(bytes = media.bytes.len(), seed = ?media.seed, "Generated image");
    Ok(Json(GenerateResponse {
        success: true,
        image: Some(encode_base64_media(&media.bytes)),
        prompt: Some(media.prompt),
        seed: media.seed,
        media_id: media.media_id,
        error: None,
    }))
}

async fn animate(
    State(state): State<AppState>,
    Json(payload): Json<AnimateRequest>,
) -> Result<Json<AnimateResponse>, AppError> {
    let cookie = payload.cookie.trim();
    if cookie.is_empty()
        || payload.image_base64.trim().is_empty()
        || payload.video_script.trim().is_empty()
    {
        return Err(AppError::BadRequest(
            "missing required fields: cookie, imageBase64 and videoScript".to_string(),
        ));
    }

    let bytes = decode_base64_media(&payload.image_base64)
        .map_err(|err| AppError::BadRequest(format!("invalid imageBase64: {err}")))?;
    let media = MediaResult {
        bytes,
        mime_type: "image/png".to_string(),
        prompt: payload.image_prompt.clone(),
        seed: None,
        media_id: None,
    };
    let model = payload
        .model
        .as_deref()
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .unwrap_or(DEFAULT_VIDEO_MODEL);

    let client = state.inner.factory.client_for(cookie)?;
    let timeout = state.inner.video_timeout;
    let video = tokio::time::timeout(timeout, client.animate(&media, &payload.video_script, model))
        .await
        .map_err(|_| AppError::from(GenerationError::Timeout(timeout)))??;

    Ok(Json(AnimateResponse {
        success: true,
        video: Some(encode_base64_media(&video.bytes)),
        error: None,
    }))
}

async fn upload_prompts(mut multipart: Multipart) -> Result<Json<UploadPromptsResponse>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::BadRequest(format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|err| AppError::BadRequest(format!("failed to read upload: {err}")))?;
        let content = String::from_utf8_lossy(&bytes);
        let prompts = extract_prompts(file_name.as_deref(), &content)
            .map_err(|err| AppError::BadRequest(format!("{err:#}")))?;
        if prompts.is_empty() {
            return Err(AppError::BadRequest(
                "no prompts found in uploaded file".to_string(),
            ));
        }

        info!(file = ?file_name, count = prompts.len(), "Parsed uploaded prompts");
        let count = prompts.len();
        return Ok(Json(UploadPromptsResponse {
            success: true,
            prompts,
            count,
        }));
    }

    Err(AppError::BadRequest("no file uploaded".to_string()))
}

async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    let cookie = payload.cookie.trim();
    if cookie.is_empty() {
        return Err(AppError::BadRequest("cookie is required".to_string()));
    }
    let prompts: Vec<String> = payload
        .prompts
        .iter()
        .map(|prompt| prompt.trim())
        .filter(|prompt| !prompt.is_empty())
        .map(str::to_string)
        .collect();
    if prompts.is_empty() {
        return Err(AppError::BadRequest(
            "at least one prompt is required".to_string(),
        ));
    }
    validate_references(&payload.references).map_err(AppError::BadRequest)?;

    let store = &state.inner.store;
    if !store.can_admit_new_job() {
        return Err(AppError::TooManyRequests(format!(
            "too many active jobs (max {})",
            store.settings().max_active_jobs
        )));
    }

    let job = store.create_job(
        cookie.to_string(),
        prompts,
        payload.aspect_ratio,
        payload.references,
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            id: job.id,
            status: job.status,
            total_count: job.total_count,
            created_at: job.created_at,
        }),
    ))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobResponse>> {
    let jobs = state
        .inner
        .store
        .list_jobs()
        .iter()
        .map(JobResponse::from)
        .collect();
    Json(jobs)
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let job = state
        .inner
        .store
        .get_job(&id)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))?;
    Ok(Json(JobResponse::from(&job)))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let store = &state.inner.store;
    let before = store
        .get_job(&id)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))?;
    let job = store
        .cancel_job(&id)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))?;

    if before.status.is_active() {
        info!(job_id = %id, "Job cancelled");
        state.inner.events.emit(JobEvent::finished(&job));
        state.inner.events.close(&id);
    }
    Ok(Json(JobResponse::from(&job)))
}

async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RetryJobResponse>, AppError> {
    let (job, reset) = state
        .inner
        .store
        .retry_errors(&id)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))?;
    state.inner.worker.reset_backoff();

    Ok(Json(RetryJobResponse {
        job: JobResponse::from(&job),
        reset,
    }))
}

async fn job_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (rx, replay) = open_job_stream(&state, &id)?;
    Ok(ws.on_upgrade(move |socket| handle_ws(socket, rx, replay)))
}

/// Subscribe before reading the status: a job that finishes afterwards
/// closes this channel itself, and one that already finished gets its
/// summary replayed with the stray channel dropped.
fn open_job_stream(
    state: &AppState,
    id: &str,
) -> Result<(Option<broadcast::Receiver<JobEvent>>, Option<JobEvent>), AppError> {
    let events = &state.inner.events;
    let rx = events.subscribe(id);
    let Some(job) = state.inner.store.get_job(id) else {
        events.close(id);
        return Err(AppError::NotFound(format!("job not found: {id}")));
    };

    if job.status.is_terminal() {
        events.close(id);
        return Ok((None, Some(JobEvent::finished(&job))));
    }
    Ok((Some(rx), None))
}

async fn handle_ws(
    mut socket: WebSocket,
    rx: Option<broadcast::Receiver<JobEvent>>,
    replay: Option<JobEvent>,
) {
    if let Some(event) = replay {
        if let Ok(json) = serde_json::to_string(&event) {
            let _ = socket.send(Message::Text(json.into())).await;
        }
    }
    let Some(mut rx) = rx else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(j) => j,
                            Err(_) => break,
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket receiver lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

/// First `X-Forwarded-For` hop, else the socket address.
fn caller_identity(headers: &HeaderMap, extensions: &Extensions) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty());
    if let Some(hop) = forwarded {
        return hop.to_string();
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    TooManyRequests(String),
    GatewayTimeout(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            AppError::GatewayTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        if err.is_auth() {
            return AppError::Unauthorized(format!(
                "{err}. The session cookie is invalid or expired"
            ));
        }
        match err {
            GenerationError::Timeout(_) => AppError::GatewayTimeout(err.to_string()),
            GenerationError::Http { status: 429, .. } => {
                AppError::TooManyRequests(err.to_string())
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}
