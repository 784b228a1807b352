//! HTTP Server for the Fetch Relay Daemon
//!
//! Admission, progress transports, explicit abort, passthrough streaming,
//! finished-file serving and the metrics snapshot.

use crate::bus::{pull, push};
use crate::classify::{canonicalize_url, classify_platform};
use crate::job_executor::{Admission, AdmissionError, JobExecutor};
use crate::jobs::JobRequest;
use crate::metrics::MetricsSnapshot;
use crate::slots::SlotError;
use crate::storage::{resolve_served_file, sanitize_file_name};
use crate::worker::SupervisorError;
use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),
}

/// Error returned by request handlers, rendered as `{ "error", "code" }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("unknown or finished request")]
    NotFound,

    #[error("no download slot available: {0}")]
    Slot(#[from] SlotError),

    #[error("stream failed: {0}")]
    Stream(#[from] SupervisorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Admission(AdmissionError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Admission(AdmissionError::Unsupported { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Admission(AdmissionError::Metadata(_)) => StatusCode::BAD_GATEWAY,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Slot(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Stream(_) | ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &str {
        match self {
            ApiError::Admission(e) => e.code(),
            ApiError::NotFound => "not_found",
            ApiError::Slot(_) => "unavailable",
            ApiError::Stream(_) => "stream_failed",
            ApiError::Io(_) => "io_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        let body = Json(json!({ "error": self.to_string(), "code": self.code() }));
        (status, body).into_response()
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<JobExecutor>,
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

async fn get_video(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<Json<Admission>, ApiError> {
    Ok(Json(state.executor.admit(request).await?))
}

async fn get_audio(
    State(state): State<AppState>,
    Json(mut request): Json<JobRequest>,
) -> Result<Json<Admission>, ApiError> {
    request.audio_only = true;
    Ok(Json(state.executor.admit(request).await?))
}

/// Push transport: progress over a WebSocket.
async fn progress_socket(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if !state.executor.registry().is_registered(&request_id) {
        return Err(ApiError::NotFound);
    }
    let bus = Arc::clone(state.executor.bus());
    let limit = bus.settings().read_limit_bytes;
    Ok(ws
        .max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| push::serve_socket(socket, request_id, bus)))
}

/// Pull transport: progress as Server-Sent Events.
async fn progress_events(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    if !state.executor.registry().is_registered(&request_id) {
        return Err(ApiError::NotFound);
    }
    let bus = Arc::clone(state.executor.bus());
    let keepalive = bus.settings().keepalive_interval;
    let events = pull::subscribe(bus, &request_id).map(|event| Event::default().json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(keepalive)))
}

async fn abort_job(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.executor.abort(&request_id) {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "request_id": request_id, "aborted": true })))
}

/// Relay the worker's stdout straight to the client.
///
/// Headers are only sent once the first chunk of media exists; the slot is
/// held until the body finishes or the client goes away.
async fn stream_media(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Response, ApiError> {
    let url = canonicalize_url(&params.url);
    let platform = classify_platform(&url);
    if !platform.is_supported {
        let reason = platform
            .reason
            .unwrap_or_else(|| "unsupported_platform".to_string());
        return Err(AdmissionError::Unsupported { reason }.into());
    }

    let slot = state.executor.slots().acquire().await?;
    let stream = state.executor.supervisor().spawn_passthrough(&url).await?;
    info!(url = %url, platform = %platform.platform, "passthrough stream started");

    let name = params
        .title
        .as_deref()
        .map(sanitize_file_name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "video".to_string());
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}.mp4\"", name))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static("video/mp4")),
        (header::CONTENT_DISPOSITION, disposition),
    ];
    Ok((headers, Body::from_stream(stream.into_body(Some(slot)))).into_response())
}

async fn serve_download(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    let path = resolve_served_file(&state.executor.storage().downloads_dir, &file)
        .ok_or(ApiError::NotFound)?;
    let handle = tokio::fs::File::open(&path).await?;
    let len = handle.metadata().await?.len();

    let content_type = match path.extension().and_then(|ext| ext.to_str()) {
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    };
    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
        (header::CONTENT_LENGTH, HeaderValue::from(len)),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(handle))).into_response())
}

/// Handler for GET /metrics endpoint
/// Returns the current MetricsSnapshot as JSON
async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let snapshot = state.executor.metrics().read().await.clone();
    Json(snapshot)
}

/// Route under which finished files are served, e.g. `/downloads/:file`.
fn download_route(public_prefix: &str) -> String {
    let trimmed = public_prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/:file".to_string()
    } else {
        format!("/{}/:file", trimmed)
    }
}

/// Creates the axum Router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let downloads = download_route(&state.executor.storage().public_prefix);
    Router::new()
        .route("/api/getvideo", post(get_video))
        .route("/api/getaudio", post(get_audio))
        .route("/api/ws/:request_id", get(progress_socket))
        .route("/api/events/:request_id", get(progress_events))
        .route("/api/abort/:request_id", post(abort_job))
        .route("/api/stream", get(stream_media))
        .route("/metrics", get(get_metrics))
        .route(&downloads, get(serve_download))
        .with_state(state)
}

/// Parse a configured bind address.
pub fn parse_bind(bind: &str) -> Result<SocketAddr, ServerError> {
    bind.parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))
}

/// Runs the HTTP server until it fails
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start
pub async fn run_server(addr: SocketAddr, app: Router) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
