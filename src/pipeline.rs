//! Streaming pipeline orchestrator
//!
//! Owns streaming sessions end to end: request validation, dedup via
//! the content store, encoder + watcher + packager wiring, prefetcher
//! registration, health bookkeeping, and finalization into the content
//! store. The per-session work runs in a background task; `start_streaming`
//! returns a handle as soon as the session is registered.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analysis::MediaProber;
use crate::config::ServerConfig;
use crate::content_store::{ContentMetadata, ContentStore};
use crate::encoder::StreamingEncoder;
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::ffmpeg::command::EncoderProfile;
use crate::ffmpeg::monitor::MonitorCallbacks;
use crate::fingerprint::fingerprint_request;
use crate::health::{ErrorCategory, HealthMonitor, HealthStatus, SessionHealthSnapshot};
use crate::packager::{ManifestKind, MediaParams, PackagerHooks, StreamingPackager};
use crate::planner::{plan_segments, AdaptiveSegmentPlan};
use crate::prefetch::{BufferStatus, PrefetchMetrics, SegmentPrefetcher, SegmentSource};
use crate::session::{Session, SessionStatus, SessionStore, TranscodeRequest};
use crate::watcher::{SegmentInfo, TrackKind, WatcherEvent};

/// Handle returned to the caller of `start_streaming`
#[derive(Debug, Clone, Serialize)]
pub struct StreamingHandle {
    pub session_id: Uuid,
    pub provider: String,
    pub fingerprint: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub manifest_url: Option<String>,
}

impl StreamingHandle {
    fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id,
            provider: session.provider.clone(),
            fingerprint: session.fingerprint.clone(),
            status: session.status,
            started_at: session.created_at,
            output_dir: session.directory.clone(),
            manifest_url: session.manifest_url.clone(),
        }
    }
}

/// Progress report for one session
#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub percent: f64,
    pub elapsed_secs: f64,
    pub remaining_secs: Option<f64>,
    pub current_speed: f64,
    pub average_speed: f64,
}

/// Coarse viewer-side buffer classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferHealth {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Full status view of a streaming session
#[derive(Debug, Clone, Serialize)]
pub struct StreamingStatus {
    pub status: SessionStatus,
    pub segments_ready: usize,
    /// 0 when the total is unknown (analysis unavailable)
    pub segments_total: usize,
    pub manifest_url: Option<String>,
    pub content_hash: String,
    pub is_live: bool,
    pub buffer_health: BufferHealth,
    pub startup_time_secs: Option<f64>,
    pub viewer_position: usize,
    pub buffer_position: usize,
    pub prefetch_metrics: PrefetchMetrics,
    pub buffer_status: Option<BufferStatus>,
    pub health_metrics: Option<SessionHealthSnapshot>,
    pub health_status: HealthStatus,
}

#[derive(Default)]
struct ProgressStats {
    current_speed: f64,
    speed_sum: f64,
    speed_count: u64,
}

enum SessionOutcome {
    Success,
    Failed(String),
    Cancelled,
}

struct ActiveSession {
    id: Uuid,
    fingerprint: String,
    request: TranscodeRequest,
    kind: ManifestKind,
    out_dir: PathBuf,
    started_at: Instant,
    segments_ready: AtomicUsize,
    segments_total: AtomicUsize,
    is_live: AtomicBool,
    first_segment_at: Mutex<Option<Instant>>,
    last_segment_at: Mutex<Instant>,
    /// The first fatal error wins; later errors only log
    failure: Arc<Mutex<Option<String>>>,
    progress: Mutex<ProgressStats>,
    ctx: CancellationToken,
    encoder: StreamingEncoder,
    packager: Arc<StreamingPackager>,
    finalized: AtomicBool,
}

impl ActiveSession {
    fn record_failure(&self, message: &str) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(message.to_string());
        } else {
            tracing::debug!(session_id = %self.id, "Suppressed follow-up error: {}", message);
        }
    }
}

/// Reads segment bytes for the prefetcher: from the live session
/// output while encoding, from the content store afterwards.
pub struct SegmentResolver {
    content_store: Arc<ContentStore>,
    active_outputs: Arc<dashmap::DashMap<String, PathBuf>>,
}

impl SegmentResolver {
    pub fn new(
        content_store: Arc<ContentStore>,
        active_outputs: Arc<dashmap::DashMap<String, PathBuf>>,
    ) -> Self {
        Self {
            content_store,
            active_outputs,
        }
    }

    fn content_dir(&self, fingerprint: &str) -> Option<PathBuf> {
        if let Some(dir) = self.active_outputs.get(fingerprint) {
            return Some(dir.clone());
        }
        self.content_store.get(fingerprint).ok().map(|(dir, _)| dir)
    }

    /// Locate the video segment file with the given index, whatever
    /// the profile name (`video-<profile>-<index>.m4s`).
    async fn find_segment(&self, dir: &std::path::Path, index: usize) -> Option<PathBuf> {
        let mut entries = tokio::fs::read_dir(dir.join("segments")).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".m4s") else {
                continue;
            };
            let Some((prefix, number)) = stem.rsplit_once('-') else {
                continue;
            };
            if prefix.starts_with("video-") && number.parse::<usize>() == Ok(index) {
                return Some(entry.path());
            }
        }
        None
    }
}

#[async_trait::async_trait]
impl SegmentSource for SegmentResolver {
    async fn read_segment(&self, fingerprint: &str, index: usize) -> Result<bytes::Bytes> {
        let dir = self.content_dir(fingerprint).ok_or_else(|| {
            PipelineError::ContentNotFound(fingerprint.to_string())
        })?;
        let path = self.find_segment(&dir, index).await.ok_or_else(|| {
            PipelineError::Storage(format!(
                "segment {} not found under {}",
                index,
                dir.display()
            ))
        })?;
        let bytes = tokio::fs::read(&path).await?;
        Ok(bytes::Bytes::from(bytes))
    }
}

/// The orchestrator
pub struct StreamingPipeline {
    config: ServerConfig,
    session_store: Arc<SessionStore>,
    content_store: Arc<ContentStore>,
    health: Arc<HealthMonitor>,
    prefetcher: Arc<SegmentPrefetcher>,
    events: EventBus,
    active: Mutex<HashMap<Uuid, Arc<ActiveSession>>>,
    active_outputs: Arc<dashmap::DashMap<String, PathBuf>>,
}

impl StreamingPipeline {
    pub fn new(
        config: ServerConfig,
        session_store: Arc<SessionStore>,
        content_store: Arc<ContentStore>,
        health: Arc<HealthMonitor>,
        prefetcher: Arc<SegmentPrefetcher>,
        active_outputs: Arc<dashmap::DashMap<String, PathBuf>>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            session_store,
            content_store,
            health,
            prefetcher,
            events,
            active: Mutex::new(HashMap::new()),
            active_outputs,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn prefetcher(&self) -> &Arc<SegmentPrefetcher> {
        &self.prefetcher
    }

    /// Start a streaming session. Returns quickly: encoding and
    /// packaging run in a background task.
    pub async fn start_streaming(self: &Arc<Self>, request: TranscodeRequest) -> Result<StreamingHandle> {
        let Some(kind) = ManifestKind::from_container(request.container) else {
            return Err(PipelineError::Input(format!(
                "unsupported container for streaming: {}",
                request.container
            )));
        };
        if !request.input_path.is_file() {
            return Err(PipelineError::Input(format!(
                "input not found: {}",
                request.input_path.display()
            )));
        }

        let fingerprint = fingerprint_request(&request);
        if !self.health.should_allow_request(&fingerprint) {
            return Err(PipelineError::CircuitOpen(fingerprint));
        }

        // Dedup: identical content already produced
        if self.content_store.exists(&fingerprint) {
            return self.completed_handle_from_store(&fingerprint, request);
        }

        let sessions_root = self.config.paths.sessions_dir();
        let session = self
            .session_store
            .create_session("streaming", request.clone(), &sessions_root);
        if session.status == SessionStatus::Completed {
            return Ok(StreamingHandle::from_session(&session));
        }

        let out_dir = session.directory.clone();
        let work_dir = out_dir.join("work");
        tokio::fs::create_dir_all(&out_dir).await?;

        let ctx = CancellationToken::new();
        let profiles = vec![EncoderProfile::from_request(&request)];
        let encoder = StreamingEncoder::new(
            self.config.ffmpeg.clone(),
            self.config.segment.clone(),
            work_dir,
            profiles.clone(),
            ctx.child_token(),
        );

        let failure = Arc::new(Mutex::new(None));
        let packager = StreamingPackager::new(
            kind,
            out_dir.clone(),
            MediaParams {
                video_profiles: profiles,
                video_codec: request.video_codec.clone(),
                audio_codec: request.audio_codec.clone(),
                audio_bitrate: request.audio_bitrate,
            },
            &self.config.packager,
            ctx.child_token(),
            PackagerHooks {
                on_manifest: {
                    let events = self.events.clone();
                    let session_id = session.id;
                    Arc::new(move |path| {
                        events.publish(PipelineEvent::ManifestUpdated { session_id, path });
                    })
                },
                on_error: {
                    let health = self.health.clone();
                    let session_id = session.id;
                    Arc::new(move |error| {
                        // A lost segment is failed work, not a session death
                        health.record_error(session_id, ErrorCategory::Storage, &error.to_string());
                    })
                },
            },
        );

        let active = Arc::new(ActiveSession {
            id: session.id,
            fingerprint: fingerprint.clone(),
            request: request.clone(),
            kind,
            out_dir: out_dir.clone(),
            started_at: Instant::now(),
            segments_ready: AtomicUsize::new(0),
            segments_total: AtomicUsize::new(0),
            is_live: AtomicBool::new(true),
            first_segment_at: Mutex::new(None),
            last_segment_at: Mutex::new(Instant::now()),
            failure,
            progress: Mutex::new(ProgressStats::default()),
            ctx,
            encoder,
            packager,
            finalized: AtomicBool::new(false),
        });

        self.active.lock().insert(session.id, active.clone());
        self.active_outputs.insert(fingerprint.clone(), out_dir);
        self.health.register_session(session.id, &fingerprint);
        self.session_store
            .update_status(session.id, SessionStatus::Running, None)?;

        let pipeline = self.clone();
        let task_active = active.clone();
        tokio::spawn(async move {
            // A panic inside the session task must not strand the
            // session in `running`: recover it into a fatal error
            let run = tokio::spawn({
                let pipeline = pipeline.clone();
                let active = task_active.clone();
                async move { pipeline.run_session(active).await }
            });
            if let Err(e) = run.await {
                if e.is_panic() {
                    let err = PipelineError::Transcode(format!("session task panicked: {}", e));
                    task_active.record_failure(&err.to_string());
                    pipeline
                        .finalize(&task_active, SessionOutcome::Failed(err.to_string()))
                        .await;
                }
            }
        });

        let mut handle = StreamingHandle::from_session(&session);
        handle.status = SessionStatus::Running;
        Ok(handle)
    }

    fn completed_handle_from_store(
        self: &Arc<Self>,
        fingerprint: &str,
        request: TranscodeRequest,
    ) -> Result<StreamingHandle> {
        let (dir, metadata) = self.content_store.get(fingerprint)?;
        tracing::info!(
            fingerprint = %fingerprint,
            "Request deduplicated against stored content"
        );

        let manifest_url = dir.join(&metadata.manifest_url).to_string_lossy().into_owned();
        let session = self.session_store.create_session(
            "streaming",
            request,
            &self.config.paths.sessions_dir(),
        );
        if !session.status.is_terminal() {
            self.session_store
                .update_status(session.id, SessionStatus::Running, None)?;
            self.session_store
                .complete_session(session.id, &manifest_url)?;
        }
        let mut handle = StreamingHandle::from_session(&session);
        handle.status = SessionStatus::Completed;
        handle.output_dir = dir;
        handle.manifest_url = Some(manifest_url);
        Ok(handle)
    }

    /// Background task owning one session's lifecycle.
    async fn run_session(self: Arc<Self>, active: Arc<ActiveSession>) {
        let plan = self.analyze(&active).await;
        if let Some(plan) = &plan {
            active.segments_total.store(plan.len(), Ordering::SeqCst);
        }

        // Encoder exit surfaces through the monitor callback chain
        let (exit_tx, mut exit_rx) = mpsc::channel::<i32>(4);
        self.wire_callbacks(&active, plan.as_ref(), exit_tx);

        if let Err(e) = active.encoder.start(&active.request, plan.as_ref()).await {
            active.record_failure(&format!("encoder start failed: {}", e));
            self.finalize(&active, SessionOutcome::Failed(e.to_string())).await;
            return;
        }

        let (segment_tx, mut segment_rx) = mpsc::channel::<WatcherEvent>(64);
        let watcher = active.encoder.spawn_watcher(plan.as_ref(), segment_tx);

        let outcome = loop {
            tokio::select! {
                _ = active.ctx.cancelled() => {
                    // A fatal encoder error cancels the context too;
                    // the recorded failure distinguishes the two
                    let failure = active.failure.lock().clone();
                    break match failure {
                        Some(message) => SessionOutcome::Failed(message),
                        None => SessionOutcome::Cancelled,
                    };
                }
                code = exit_rx.recv() => {
                    match code {
                        Some(0) => {
                            // Let the poller surface the trailing segments
                            self.drain_watcher(&active, &mut segment_rx).await;
                            let failure = active.failure.lock().clone();
                            match failure {
                                Some(message) => break SessionOutcome::Failed(message),
                                None => break SessionOutcome::Success,
                            }
                        }
                        Some(code) => {
                            let message = format!("encoder exited with code {}", code);
                            active.record_failure(&message);
                            break SessionOutcome::Failed(message);
                        }
                        None => break SessionOutcome::Cancelled,
                    }
                }
                event = segment_rx.recv() => {
                    match event {
                        Some(event) => self.handle_watcher_event(&active, event),
                        None => {
                            // Watcher ended without an exit signal
                            break SessionOutcome::Cancelled;
                        }
                    }
                }
            }
        };

        watcher.abort();
        self.finalize(&active, outcome).await;
    }

    /// Probe the input and build the adaptive plan, degrading to a
    /// uniform plan (or none) when analysis fails.
    async fn analyze(&self, active: &ActiveSession) -> Option<AdaptiveSegmentPlan> {
        let prober = MediaProber::new(&self.config.ffmpeg.ffprobe_path);
        let input = &active.request.input_path;

        let duration = match prober.probe_duration(input).await {
            Ok(duration) => duration,
            Err(e) => {
                tracing::debug!(session_id = %active.id, "Duration probe failed: {}", e);
                return None;
            }
        };
        let keyframes = match prober.analyze_keyframes(input).await {
            Ok(keyframes) => keyframes,
            Err(e) => {
                tracing::debug!(session_id = %active.id, "Keyframe analysis failed: {}", e);
                Vec::new()
            }
        };
        let complexity = match prober.analyze_scene_complexity(input).await {
            Ok(complexity) => complexity,
            Err(e) => {
                tracing::debug!(session_id = %active.id, "Complexity analysis failed: {}", e);
                Vec::new()
            }
        };

        let plan = plan_segments(duration, &keyframes, &complexity, &self.config.segment);
        tracing::info!(
            session_id = %active.id,
            segments = plan.len(),
            score = plan.optimization_score,
            "Segmentation plan ready"
        );
        Some(plan)
    }

    fn wire_callbacks(
        &self,
        active: &Arc<ActiveSession>,
        plan: Option<&AdaptiveSegmentPlan>,
        exit_tx: mpsc::Sender<i32>,
    ) {
        let total_duration = plan.map(|p| p.total_duration).filter(|d| *d > 0.0);

        let on_progress: Arc<dyn Fn(crate::ffmpeg::progress::FfmpegProgress) + Send + Sync> = {
            let session_store = self.session_store.clone();
            let health = self.health.clone();
            let active = active.clone();
            Arc::new(move |progress| {
                if let Some(total) = total_duration {
                    let fraction = (progress.out_time_secs / total).clamp(0.0, 1.0);
                    let _ = session_store.update_progress(active.id, fraction);
                }
                {
                    let mut stats = active.progress.lock();
                    if progress.speed > 0.0 {
                        stats.current_speed = progress.speed;
                        stats.speed_sum += progress.speed;
                        stats.speed_count += 1;
                    }
                }
                health.record_progress(active.id, &progress);
            })
        };

        let on_error: Arc<dyn Fn(crate::ffmpeg::monitor::MonitorErrorEvent) + Send + Sync> = {
            let health = self.health.clone();
            let active = active.clone();
            Arc::new(move |event| {
                health.record_error(active.id, ErrorCategory::Ffmpeg, &event.message);
                if event.fatal {
                    active.record_failure(&event.message);
                    active.ctx.cancel();
                }
            })
        };

        let on_exit: Arc<dyn Fn(i32) + Send + Sync> = Arc::new(move |code| {
            let _ = exit_tx.try_send(code);
        });

        active.encoder.set_callbacks(MonitorCallbacks {
            on_progress,
            on_error,
            on_exit,
        });
    }

    fn handle_watcher_event(&self, active: &Arc<ActiveSession>, event: WatcherEvent) {
        match event {
            WatcherEvent::Init { .. } => {
                if let Err(e) = active.packager.enqueue(event) {
                    self.health
                        .record_error(active.id, ErrorCategory::Storage, &e.to_string());
                }
            }
            WatcherEvent::Segment(info) => self.handle_segment_ready(active, info),
        }
    }

    /// Safe under concurrent invocation across tracks: counters are
    /// monotonic and the first-segment timestamp is set exactly once.
    fn handle_segment_ready(&self, active: &Arc<ActiveSession>, info: SegmentInfo) {
        let encode_time = {
            let mut last = active.last_segment_at.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let is_first = {
            let mut first = active.first_segment_at.lock();
            if first.is_none() {
                *first = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if is_first {
            tracing::info!(
                session_id = %active.id,
                startup_ms = active.started_at.elapsed().as_millis() as u64,
                "First segment ready"
            );
            // Warm the viewer-facing buffer while encoding continues
            let prefetcher = self.prefetcher.clone();
            let fingerprint = active.fingerprint.clone();
            tokio::spawn(async move {
                prefetcher.prefetch_for_startup(&fingerprint).await;
            });
        }

        let is_primary_video = info.kind == TrackKind::Video
            && active
                .encoder
                .profiles()
                .first()
                .map(|p| Some(p.name.as_str()) == info.profile.as_deref())
                .unwrap_or(false);

        if is_primary_video {
            // Monotonic ready counter
            active
                .segments_ready
                .fetch_max(info.index + 1, Ordering::SeqCst);
            self.events.publish(PipelineEvent::SegmentReady {
                session_id: active.id,
                index: info.index,
                path: info.path.clone(),
                duration_secs: info.duration_secs,
            });
        }

        self.health
            .record_segment_produced(active.id, info.index, encode_time, info.size_bytes);
        tracing::trace!(
            session_id = %active.id,
            index = info.index,
            kind = ?info.kind,
            discovery_lag_ms = info
                .produced_at
                .elapsed()
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            "Segment handed to packager"
        );

        if let Err(e) = active.packager.enqueue(WatcherEvent::Segment(info)) {
            // Queue full: the segment is lost and counted as failed
            tracing::warn!(session_id = %active.id, "Packager queue full, segment dropped");
            self.health
                .record_error(active.id, ErrorCategory::Storage, &e.to_string());
        }
    }

    /// After a clean encoder exit, give the poller time to surface the
    /// remaining size-stable segments.
    async fn drain_watcher(
        &self,
        active: &Arc<ActiveSession>,
        segment_rx: &mut mpsc::Receiver<WatcherEvent>,
    ) {
        let quiet_period = Duration::from_millis(self.config.segment.poll_interval_millis * 3);
        loop {
            match tokio::time::timeout(quiet_period, segment_rx.recv()).await {
                Ok(Some(event)) => self.handle_watcher_event(active, event),
                _ => break,
            }
        }
        // Let the packager workers land what was enqueued
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    async fn finalize(&self, active: &Arc<ActiveSession>, outcome: SessionOutcome) {
        if active.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        active.encoder.stop();
        active.is_live.store(false, Ordering::SeqCst);

        let info = active.encoder.monitor().process_info();
        tracing::debug!(
            session_id = %active.id,
            pid = ?info.pid,
            running = info.running,
            exit_code = ?info.exit_code,
            uptime_secs = info.uptime_secs,
            "Encoder wound down"
        );

        let outcome = match outcome {
            SessionOutcome::Success => match self.promote(active).await {
                Ok(manifest_url) => {
                    let _ = self
                        .session_store
                        .complete_session(active.id, &manifest_url);
                    self.events.publish(PipelineEvent::TranscodeCompleted {
                        session_id: active.id,
                        media_id: active.request.media_id.clone(),
                        content_hash: active.fingerprint.clone(),
                        manifest_url,
                        segments_total: active.packager.segment_count(),
                        duration_secs: active.started_at.elapsed().as_secs_f64(),
                    });
                    tracing::info!(session_id = %active.id, "Session completed");
                    SessionOutcome::Success
                }
                Err(e) => {
                    active.record_failure(&e.to_string());
                    SessionOutcome::Failed(e.to_string())
                }
            },
            other => other,
        };

        match &outcome {
            SessionOutcome::Success => {}
            SessionOutcome::Failed(message) => {
                let _ = self.session_store.fail_session(active.id, message);
                self.events.publish(PipelineEvent::TranscodeFailed {
                    session_id: active.id,
                    media_id: active.request.media_id.clone(),
                    error: message.clone(),
                    content_hash: active.fingerprint.clone(),
                });
                tracing::warn!(session_id = %active.id, "Session failed: {}", message);
            }
            SessionOutcome::Cancelled => {
                let _ = self.session_store.update_status(
                    active.id,
                    SessionStatus::Cancelled,
                    Some("cancelled by caller"),
                );
                // Pending prefetch work for a cancelled session is moot
                self.prefetcher.discard(&active.fingerprint);
                tracing::info!(session_id = %active.id, "Session cancelled");
            }
        }

        self.health.unregister_session(active.id);
        self.active.lock().remove(&active.id);
        if !matches!(outcome, SessionOutcome::Success) {
            self.active_outputs.remove(&active.fingerprint);
        }
    }

    /// Finalize the manifest and promote the session output into the
    /// content store. Returns the stored manifest URL.
    async fn promote(&self, active: &Arc<ActiveSession>) -> Result<String> {
        active.packager.finalize()?;

        // The encoder has exited; its raw working directory must not
        // travel into the content store
        let _ = tokio::fs::remove_dir_all(active.out_dir.join("work")).await;

        let media_id = if active.request.media_id.is_empty() {
            // Avoid metadata collisions between path-identified requests
            format!("session-{}", active.id)
        } else {
            active.request.media_id.clone()
        };
        let metadata = ContentMetadata {
            media_id,
            format: active.request.container.as_str().to_string(),
            manifest_url: active.kind.file_name().to_string(),
            retention_days: self.config.store.retention_days,
            tags: vec!["transcoded".to_string()],
            created_at: Utc::now(),
        };

        let content_store = self.content_store.clone();
        let fingerprint = active.fingerprint.clone();
        let out_dir = active.out_dir.clone();
        let stored_dir = tokio::task::spawn_blocking(move || {
            content_store.store(&fingerprint, &out_dir, &metadata)
        })
        .await
        .map_err(|e| PipelineError::Storage(format!("promote task: {}", e)))??;

        // Future reads fall through to the stored copy
        self.active_outputs.remove(&active.fingerprint);

        Ok(stored_dir
            .join(active.kind.file_name())
            .to_string_lossy()
            .into_owned())
    }

    /// Cancel a session. Idempotent, also after natural completion.
    pub fn stop_streaming(&self, session_id: Uuid) -> Result<()> {
        if let Some(active) = self.active.lock().get(&session_id) {
            active.ctx.cancel();
            return Ok(());
        }
        match self.session_store.get_session(session_id) {
            Some(_) => Ok(()),
            None => Err(PipelineError::SessionNotFound(session_id)),
        }
    }

    pub fn get_progress(&self, session_id: Uuid) -> Result<ProgressReport> {
        let session = self
            .session_store
            .get_session(session_id)
            .ok_or(PipelineError::SessionNotFound(session_id))?;

        let elapsed_secs = (Utc::now() - session.created_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let (current_speed, average_speed) = self
            .active
            .lock()
            .get(&session_id)
            .map(|active| {
                let stats = active.progress.lock();
                let average = if stats.speed_count > 0 {
                    stats.speed_sum / stats.speed_count as f64
                } else {
                    0.0
                };
                (stats.current_speed, average)
            })
            .unwrap_or((0.0, 0.0));

        let remaining_secs = if session.progress > 0.0 && session.progress < 1.0 {
            Some(elapsed_secs * (1.0 - session.progress) / session.progress)
        } else {
            None
        };

        Ok(ProgressReport {
            percent: session.progress * 100.0,
            elapsed_secs,
            remaining_secs,
            current_speed,
            average_speed,
        })
    }

    pub fn get_streaming_status(&self, session_id: Uuid) -> Result<StreamingStatus> {
        let session = self
            .session_store
            .get_session(session_id)
            .ok_or(PipelineError::SessionNotFound(session_id))?;

        let active = self.active.lock().get(&session_id).cloned();
        let buffer_status = self.prefetcher.buffer_status(&session.fingerprint);

        let (segments_ready, segments_total, is_live, startup_time_secs) = match &active {
            Some(active) => (
                active.segments_ready.load(Ordering::SeqCst),
                active.segments_total.load(Ordering::SeqCst),
                active.is_live.load(Ordering::SeqCst),
                active
                    .first_segment_at
                    .lock()
                    .map(|t| (t - active.started_at).as_secs_f64()),
            ),
            None => (0, 0, false, None),
        };

        let viewer_position = buffer_status.as_ref().map(|b| b.current_position).unwrap_or(0);
        let buffer_position = buffer_status
            .as_ref()
            .and_then(|b| b.buffered_indices.iter().max().copied())
            .unwrap_or(viewer_position);
        let buffer_health = self.classify_buffer(buffer_status.as_ref());

        Ok(StreamingStatus {
            status: session.status,
            segments_ready,
            segments_total,
            manifest_url: session.manifest_url.clone(),
            content_hash: session.fingerprint.clone(),
            is_live,
            buffer_health,
            startup_time_secs,
            viewer_position,
            buffer_position,
            prefetch_metrics: self.prefetcher.metrics(),
            buffer_status,
            health_metrics: self.health.snapshot(session_id),
            health_status: self.health.session_status(session_id),
        })
    }

    fn classify_buffer(&self, status: Option<&BufferStatus>) -> BufferHealth {
        let Some(status) = status else {
            return BufferHealth::Poor;
        };
        let distance = self.config.prefetch.prefetch_distance.max(1);
        let ahead = status
            .buffered_indices
            .iter()
            .filter(|i| {
                **i > status.current_position && **i <= status.current_position + distance
            })
            .count();
        let fraction = ahead as f64 / distance as f64;
        if fraction >= 0.8 {
            BufferHealth::Excellent
        } else if fraction >= 0.5 {
            BufferHealth::Good
        } else if fraction >= 0.25 {
            BufferHealth::Fair
        } else {
            BufferHealth::Poor
        }
    }

    pub fn update_playback_position(
        &self,
        session_id: Uuid,
        segment_index: usize,
        is_playing: bool,
        speed: f64,
    ) -> Result<()> {
        let session = self
            .session_store
            .get_session(session_id)
            .ok_or(PipelineError::SessionNotFound(session_id))?;
        self.prefetcher
            .update_playback_position(&session.fingerprint, segment_index, is_playing, speed);
        Ok(())
    }

    pub async fn get_segment(&self, session_id: Uuid, index: usize) -> Result<bytes::Bytes> {
        let session = self
            .session_store
            .get_session(session_id)
            .ok_or(PipelineError::SessionNotFound(session_id))?;
        self.prefetcher
            .get_segment(&session.fingerprint, index)
            .await
            .map_err(|_| PipelineError::SegmentNotFound { session_id, index })
    }

    /// Sessions currently running in this pipeline.
    pub fn active_session_ids(&self) -> Vec<Uuid> {
        self.active.lock().keys().copied().collect()
    }
}
