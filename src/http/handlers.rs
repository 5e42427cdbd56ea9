//! HTTP request handlers

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::packager::ManifestKind;
use crate::session::{SessionStatus, TranscodeRequest};
use crate::state::AppState;

/// HTTP error type
#[derive(Debug)]
pub enum HttpError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    InternalError(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            HttpError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            HttpError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, body).into_response()
    }
}

impl From<PipelineError> for HttpError {
    fn from(err: PipelineError) -> Self {
        match &err {
            PipelineError::Input(msg) => HttpError::BadRequest(msg.clone()),
            PipelineError::SessionNotFound(_)
            | PipelineError::SegmentNotFound { .. }
            | PipelineError::ContentNotFound(_) => HttpError::NotFound(err.to_string()),
            _ if err.is_retryable() => HttpError::Unavailable(err.to_string()),
            _ => HttpError::InternalError(err.to_string()),
        }
    }
}

/// Playback position update body
#[derive(Debug, Deserialize)]
pub struct PositionUpdate {
    pub segment_index: usize,
    #[serde(default = "default_playing")]
    pub is_playing: bool,
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_playing() -> bool {
    true
}

fn default_speed() -> f64 {
    1.0
}

/// Start a transcode
/// POST /streams
pub async fn start_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TranscodeRequest>,
) -> Result<Response, HttpError> {
    let handle = state.start_transcode(request).await?;
    // A dedup hit comes back already completed
    let status = if handle.status == SessionStatus::Completed {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(handle)).into_response())
}

/// Stop a session
/// DELETE /streams/{id}
pub async fn stop_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, HttpError> {
    state.stop_session(session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Streaming status
/// GET /streams/{id}/status
pub async fn stream_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<crate::pipeline::StreamingStatus>, HttpError> {
    Ok(Json(state.pipeline.get_streaming_status(session_id)?))
}

/// Transcode progress
/// GET /streams/{id}/progress
pub async fn stream_progress(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<crate::pipeline::ProgressReport>, HttpError> {
    Ok(Json(state.pipeline.get_progress(session_id)?))
}

/// Playback position update
/// POST /streams/{id}/position
pub async fn update_position(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(update): Json<PositionUpdate>,
) -> Result<StatusCode, HttpError> {
    state.pipeline.update_playback_position(
        session_id,
        update.segment_index,
        update.is_playing,
        update.speed,
    )?;
    Ok(StatusCode::NO_CONTENT)
}

/// Segment bytes
/// GET /streams/{id}/segments/{index}
pub async fn get_segment(
    State(state): State<Arc<AppState>>,
    Path((session_id, index)): Path<(Uuid, usize)>,
) -> Result<Response, HttpError> {
    let bytes = state.pipeline.get_segment(session_id, index).await?;

    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", HeaderValue::from_static("video/iso.segment"));
    headers.insert(
        "Cache-Control",
        HeaderValue::from_static("public, max-age=31536000"),
    );
    Ok((headers, bytes).into_response())
}

/// Current manifest
/// GET /streams/{id}/manifest
pub async fn get_manifest(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Response, HttpError> {
    let session = state
        .session_store
        .get_session(session_id)
        .ok_or_else(|| HttpError::NotFound(format!("session not found: {}", session_id)))?;
    let kind = ManifestKind::from_container(session.request.container)
        .ok_or_else(|| HttpError::BadRequest("session has no manifest".to_string()))?;

    // Completed sessions carry the stored manifest path; live ones
    // serve from the session directory
    let path = match &session.manifest_url {
        Some(url) if session.status == SessionStatus::Completed => {
            std::path::PathBuf::from(url)
        }
        _ => session.directory.join(kind.file_name()),
    };
    let contents = tokio::fs::read(&path)
        .await
        .map_err(|_| HttpError::NotFound(format!("manifest not yet available for {}", session_id)))?;

    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", HeaderValue::from_static(kind.content_type()));
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    Ok((headers, contents).into_response())
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": state.health.overall_health(),
    }))
}

/// Version endpoint
pub async fn version_check() -> &'static str {
    concat!("transcode-server v", env!("CARGO_PKG_VERSION"))
}

/// Debug endpoint - prefetch cache statistics
pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let metrics = state.pipeline.prefetcher().metrics();
    Json(serde_json::json!({
        "prefetch": metrics,
        "alerts": state.health.recent_alerts(),
    }))
}

/// Debug endpoint - all sessions
pub async fn sessions_debug(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions: Vec<_> = state
        .session_store
        .list_sessions()
        .into_iter()
        .map(|session| {
            serde_json::json!({
                "id": session.id,
                "provider": session.provider,
                "status": session.status,
                "fingerprint": session.fingerprint,
                "progress": session.progress,
                "created_at": session.created_at,
                "error": session.error,
            })
        })
        .collect();

    Json(serde_json::json!({
        "count": sessions.len(),
        "active": state.pipeline.active_session_ids(),
        "sessions": sessions,
    }))
}
