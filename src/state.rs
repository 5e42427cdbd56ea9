//! Application state
//!
//! Wires the stores, the streaming pipeline, the file provider, the
//! prefetcher, and the health monitor together, and owns the
//! background maintenance tasks (periodic health checks, stale buffer
//! cleanup, content retention purges).

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::content_store::ContentStore;
use crate::error::{PipelineError, Result};
use crate::events::EventBus;
use crate::health::HealthMonitor;
use crate::pipeline::{SegmentResolver, StreamingHandle, StreamingPipeline};
use crate::prefetch::SegmentPrefetcher;
use crate::provider::{FileProvider, Provider};
use crate::session::{Container, SessionStore, TranscodeRequest};

/// Interval of the buffer/retention maintenance task
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
/// Buffers untouched for this long are dropped
const BUFFER_MAX_AGE: Duration = Duration::from_secs(300);
/// Content retention purges run this often
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Shared application state
pub struct AppState {
    pub config: ServerConfig,
    pub session_store: Arc<SessionStore>,
    pub content_store: Arc<ContentStore>,
    pub health: Arc<HealthMonitor>,
    pub pipeline: Arc<StreamingPipeline>,
    pub file_provider: Arc<FileProvider>,
    shutdown: CancellationToken,
}

impl AppState {
    /// Build the full component graph and start background tasks.
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let session_store = Arc::new(SessionStore::new());
        let content_store = Arc::new(ContentStore::new(config.paths.content_dir()));
        let health = Arc::new(HealthMonitor::new(config.health.clone()));
        let events = EventBus::default();

        let active_outputs = Arc::new(dashmap::DashMap::new());
        let resolver = Arc::new(SegmentResolver::new(
            content_store.clone(),
            active_outputs.clone(),
        ));
        let prefetcher = SegmentPrefetcher::new(config.prefetch.clone(), resolver);

        let pipeline = StreamingPipeline::new(
            config.clone(),
            session_store.clone(),
            content_store.clone(),
            health.clone(),
            prefetcher,
            active_outputs,
            events.clone(),
        );
        let file_provider = FileProvider::new(
            config.clone(),
            session_store.clone(),
            content_store.clone(),
            health.clone(),
            events,
        );

        let shutdown = CancellationToken::new();
        health.spawn_periodic(shutdown.child_token());

        let state = Arc::new(Self {
            config,
            session_store,
            content_store,
            health,
            pipeline,
            file_provider,
            shutdown,
        });
        state.spawn_maintenance();
        state
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let state = self.clone();
        let ctx = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut cleanup = tokio::time::interval(MAINTENANCE_INTERVAL);
            let mut purge = tokio::time::interval(PURGE_INTERVAL);
            cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = cleanup.tick() => {
                        let dropped = state.pipeline.prefetcher().cleanup_stale_buffers(BUFFER_MAX_AGE);
                        if dropped > 0 {
                            tracing::debug!(dropped, "Dropped stale segment buffers");
                        }
                    }
                    _ = purge.tick() => {
                        let content_store = state.content_store.clone();
                        let purged = tokio::task::spawn_blocking(move || content_store.purge_expired())
                            .await;
                        match purged {
                            Ok(Ok(count)) if count > 0 => {
                                tracing::info!(count, "Purged expired content entries");
                            }
                            Ok(Err(e)) => tracing::warn!("Content purge failed: {}", e),
                            _ => {}
                        }
                    }
                }
            }
        });
    }

    /// The provider responsible for a container format.
    pub fn provider_for(&self, container: Container) -> Provider {
        if container.is_streaming() {
            Provider::Streaming(self.pipeline.clone())
        } else {
            Provider::File(self.file_provider.clone())
        }
    }

    /// Entry point used by the HTTP layer.
    pub async fn start_transcode(&self, request: TranscodeRequest) -> Result<StreamingHandle> {
        self.provider_for(request.container).start(request).await
    }

    /// Stop a session owned by either provider.
    pub fn stop_session(&self, session_id: Uuid) -> Result<()> {
        match self.pipeline.stop_streaming(session_id) {
            Err(PipelineError::SessionNotFound(_)) => self.file_provider.stop(session_id),
            other => other,
        }
    }

    /// Signal shutdown to background tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pipeline.prefetcher().shutdown();
    }
}
