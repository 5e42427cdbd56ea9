//! Axum router configuration

use axum::{
    http::{header, Method},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

use super::handlers::{
    cache_stats, get_manifest, get_segment, health_check, sessions_debug, start_stream,
    stop_stream, stream_progress, stream_status, update_position, version_check,
};

/// Create the Axum router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::RANGE, header::CONTENT_TYPE, header::ORIGIN])
        .max_age(Duration::from_secs(3600));

    let router = Router::new()
        // Health and version endpoints
        .route("/health", get(health_check))
        .route("/version", get(version_check))
        // Debug endpoints
        .route("/debug/cache", get(cache_stats))
        .route("/debug/sessions", get(sessions_debug))
        // Session lifecycle
        .route("/streams", post(start_stream))
        .route("/streams/{id}", delete(stop_stream))
        // Status and playback
        .route("/streams/{id}/status", get(stream_status))
        .route("/streams/{id}/progress", get(stream_progress))
        .route("/streams/{id}/position", post(update_position))
        // Media delivery
        .route("/streams/{id}/segments/{index}", get(get_segment))
        .route("/streams/{id}/manifest", get(get_manifest))
        // Middleware
        .layer(TraceLayer::new_for_http());

    let router = if state.config.cors_enabled {
        router.layer(cors)
    } else {
        router
    };

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    fn test_state(dir: &TempDir) -> Arc<AppState> {
        let mut config = ServerConfig::default();
        config.paths.data_dir = dir.path().to_path_buf();
        config.ffmpeg.ffmpeg_path = "/definitely/not/ffmpeg".to_string();
        config.ffmpeg.ffprobe_path = "/definitely/not/ffprobe".to_string();
        AppState::new(config)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_version_endpoint() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        let response = app
            .oneshot(Request::builder().uri("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        let uri = format!("/streams/{}/status", uuid::Uuid::new_v4());
        let response = app
            .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_start_request_is_400() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        // mp4 input path that does not exist
        let body = serde_json::json!({
            "input_path": "/definitely/not/a/file.mp4",
            "container": "dash",
            "resolution": {"width": 1280, "height": 720}
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/streams")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
