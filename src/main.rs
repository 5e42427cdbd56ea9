//! Streaming-first transcoding server
//!
//! Ingests a source media file, produces playable DASH/HLS segments
//! while encoding is still in progress, maintains an evolving
//! manifest, and serves repeated requests from a content-addressed
//! cache so identical work is never done twice.

#![allow(dead_code)]

mod analysis;
mod config;
mod config_file;
mod content_store;
mod encoder;
mod error;
mod events;
mod ffmpeg;
mod fingerprint;
mod health;
mod http;
mod packager;
mod pipeline;
mod planner;
mod prefetch;
mod provider;
mod session;
mod state;
mod watcher;

#[cfg(test)]
mod integration;

use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Result;
use crate::http::create_router;
use crate::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
const APP_NAME: &str = "transcode-server";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    tracing::info!("{} v{} starting", APP_NAME, VERSION);

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    if config_path == "--generate-config" {
        let target = std::env::args().nth(2).unwrap_or_else(|| "config.toml".to_string());
        config_file::generate_default_config(&target)
            .map_err(|e| error::PipelineError::Input(format!("config generation failed: {}", e)))?;
        tracing::info!("Wrote default configuration to {}", target);
        return Ok(());
    }
    let config = config_file::load_or_default(&config_path);
    tracing::info!("Configuration loaded: {:?}", config);

    // Fail fast on a broken encoder installation
    match ffmpeg::version_info(&config.ffmpeg.ffmpeg_path).await {
        Some(version) => tracing::info!("Encoder: {}", version),
        None => tracing::warn!(
            "Encoder binary {} not usable; sessions will fail until it is installed",
            config.ffmpeg.ffmpeg_path
        ),
    }

    tokio::fs::create_dir_all(config.paths.sessions_dir()).await?;
    tokio::fs::create_dir_all(config.paths.content_dir()).await?;

    // Create application state
    let state = AppState::new(config.clone());

    // Build router
    let app = create_router(state.clone());

    // Start server
    let addr: SocketAddr = config
        .socket_addr()
        .parse()
        .map_err(|e| error::PipelineError::Input(format!("invalid bind address: {}", e)))?;
    tracing::info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}

/// Initialize logging with tracing
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcode_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
