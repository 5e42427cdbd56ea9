//! Transcode providers
//!
//! Two providers share the session and content stores but very little
//! else, so they are modeled as a sum type rather than a trait
//! hierarchy: the streaming pipeline produces segmented DASH/HLS, and
//! the file provider produces a single progressive file for the
//! non-streaming containers. Both run the encoder under the same
//! process monitor and follow the same lifecycle: create session, run,
//! promote into the content store, finalize.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analysis::MediaProber;
use crate::config::ServerConfig;
use crate::content_store::{ContentMetadata, ContentStore};
use crate::error::{FfmpegError, PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::ffmpeg::command::{EncoderProfile, FfmpegCommandBuilder};
use crate::ffmpeg::monitor::{MonitorCallbacks, ProcessMonitor};
use crate::fingerprint::fingerprint_request;
use crate::health::{ErrorCategory, HealthMonitor};
use crate::pipeline::{StreamingHandle, StreamingPipeline};
use crate::session::{Session, SessionStatus, SessionStore, TranscodeRequest};

/// A transcode provider
#[derive(Clone)]
pub enum Provider {
    Streaming(Arc<StreamingPipeline>),
    File(Arc<FileProvider>),
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Streaming(_) => "streaming",
            Provider::File(_) => "file",
        }
    }

    /// Start a transcode with whichever lifecycle this provider runs.
    pub async fn start(&self, request: TranscodeRequest) -> Result<StreamingHandle> {
        match self {
            Provider::Streaming(pipeline) => pipeline.start_streaming(request).await,
            Provider::File(provider) => provider.start_transcode(request).await,
        }
    }
}

/// Non-streaming provider: one encoder invocation, one output file.
pub struct FileProvider {
    config: ServerConfig,
    session_store: Arc<SessionStore>,
    content_store: Arc<ContentStore>,
    health: Arc<HealthMonitor>,
    events: EventBus,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl FileProvider {
    pub fn new(
        config: ServerConfig,
        session_store: Arc<SessionStore>,
        content_store: Arc<ContentStore>,
        health: Arc<HealthMonitor>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            session_store,
            content_store,
            health,
            events,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub async fn start_transcode(self: &Arc<Self>, request: TranscodeRequest) -> Result<StreamingHandle> {
        if request.container.is_streaming() {
            return Err(PipelineError::Input(format!(
                "container {} belongs to the streaming provider",
                request.container
            )));
        }
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

        if self.content_store.exists(&fingerprint) {
            let (dir, metadata) = self.content_store.get(&fingerprint)?;
            let output_url = dir.join(&metadata.manifest_url).to_string_lossy().into_owned();
            let session = self.session_store.create_session(
                "file",
                request,
                &self.config.paths.sessions_dir(),
            );
            if !session.status.is_terminal() {
                self.session_store
                    .update_status(session.id, SessionStatus::Running, None)?;
                self.session_store
                    .complete_session(session.id, &output_url)?;
            }
            return Ok(StreamingHandle {
                session_id: session.id,
                provider: "file".to_string(),
                fingerprint: session.fingerprint,
                status: SessionStatus::Completed,
                started_at: session.created_at,
                output_dir: dir,
                manifest_url: Some(output_url),
            });
        }

        let session = self.session_store.create_session(
            "file",
            request,
            &self.config.paths.sessions_dir(),
        );
        if session.status == SessionStatus::Completed {
            return Ok(handle_of(&session));
        }

        tokio::fs::create_dir_all(&session.directory).await?;
        self.session_store
            .update_status(session.id, SessionStatus::Running, None)?;
        self.health.register_session(session.id, &session.fingerprint);

        let ctx = CancellationToken::new();
        self.active.lock().insert(session.id, ctx.clone());

        let provider = self.clone();
        let task_session = session.clone();
        tokio::spawn(async move {
            provider.run(task_session, ctx).await;
        });

        let mut handle = handle_of(&session);
        handle.status = SessionStatus::Running;
        Ok(handle)
    }

    /// Cancel a running file transcode. Idempotent.
    pub fn stop(&self, session_id: Uuid) -> Result<()> {
        if let Some(ctx) = self.active.lock().get(&session_id) {
            ctx.cancel();
            return Ok(());
        }
        match self.session_store.get_session(session_id) {
            Some(_) => Ok(()),
            None => Err(PipelineError::SessionNotFound(session_id)),
        }
    }

    async fn run(self: Arc<Self>, session: Session, ctx: CancellationToken) {
        let request = session.request.clone();
        let output = session
            .directory
            .join(format!("output.{}", request.container));

        let total_duration = MediaProber::new(&self.config.ffmpeg.ffprobe_path)
            .probe_duration(&request.input_path)
            .await
            .ok();

        let monitor = ProcessMonitor::new(self.config.ffmpeg.clone());
        let (exit_tx, mut exit_rx) = mpsc::channel::<i32>(4);
        let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        monitor.set_callbacks(MonitorCallbacks {
            on_progress: {
                let session_store = self.session_store.clone();
                let health = self.health.clone();
                let session_id = session.id;
                Arc::new(move |progress| {
                    if let Some(total) = total_duration {
                        let fraction = (progress.out_time_secs / total).clamp(0.0, 1.0);
                        let _ = session_store.update_progress(session_id, fraction);
                    }
                    health.record_progress(session_id, &progress);
                })
            },
            on_error: {
                let health = self.health.clone();
                let failure = failure.clone();
                let ctx = ctx.clone();
                let session_id = session.id;
                Arc::new(move |event| {
                    health.record_error(session_id, ErrorCategory::Ffmpeg, &event.message);
                    if event.fatal {
                        let mut failure = failure.lock();
                        if failure.is_none() {
                            *failure = Some(event.message.clone());
                        }
                        ctx.cancel();
                    }
                })
            },
            on_exit: Arc::new(move |code| {
                let _ = exit_tx.try_send(code);
            }),
        });

        let args = FfmpegCommandBuilder::new(&request.input_path)
            .profiles(vec![EncoderProfile::from_request(&request)])
            .video_codec(&request.video_codec)
            .audio(&request.audio_codec, request.audio_bitrate)
            .seek(request.seek_secs)
            .build_file_args(&output);

        let spawned = Command::new(&self.config.ffmpeg.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FfmpegError::Spawn(format!("{}: {}", self.config.ffmpeg.ffmpeg_path, e)));

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.finish(&session, Err(e.into())).await;
                return;
            }
        };
        monitor.start_monitoring(ctx.clone(), child);

        let result = tokio::select! {
            _ = ctx.cancelled() => {
                match failure.lock().clone() {
                    Some(message) => Err(PipelineError::Encoder(message)),
                    None => Err(PipelineError::Session("cancelled by caller".to_string())),
                }
            }
            code = exit_rx.recv() => match code {
                Some(0) => self.promote(&session, &output).await,
                Some(code) => Err(FfmpegError::Exited(code).into()),
                None => Err(PipelineError::Session("monitor ended unexpectedly".to_string())),
            },
        };

        self.finish(&session, result).await;
    }

    async fn promote(&self, session: &Session, output: &std::path::Path) -> Result<String> {
        let request = &session.request;
        let media_id = if request.media_id.is_empty() {
            format!("session-{}", session.id)
        } else {
            request.media_id.clone()
        };
        let metadata = ContentMetadata {
            media_id,
            format: request.container.as_str().to_string(),
            manifest_url: output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            retention_days: self.config.store.retention_days,
            tags: vec!["transcoded".to_string(), "file".to_string()],
            created_at: chrono::Utc::now(),
        };

        let content_store = self.content_store.clone();
        let fingerprint = session.fingerprint.clone();
        let source = session.directory.clone();
        let stored_dir = tokio::task::spawn_blocking(move || {
            content_store.store(&fingerprint, &source, &metadata)
        })
        .await
        .map_err(|e| PipelineError::Storage(format!("promote task: {}", e)))??;

        Ok(stored_dir
            .join(metadata_file_name(output))
            .to_string_lossy()
            .into_owned())
    }

    async fn finish(&self, session: &Session, result: Result<String>) {
        match result {
            Ok(output_url) => {
                let _ = self.session_store.complete_session(session.id, &output_url);
                self.events.publish(PipelineEvent::TranscodeCompleted {
                    session_id: session.id,
                    media_id: session.request.media_id.clone(),
                    content_hash: session.fingerprint.clone(),
                    manifest_url: output_url,
                    segments_total: 0,
                    duration_secs: 0.0,
                });
            }
            Err(e) => {
                let cancelled = matches!(&e, PipelineError::Session(m) if m.contains("cancelled"));
                if cancelled {
                    let _ = self.session_store.update_status(
                        session.id,
                        SessionStatus::Cancelled,
                        Some("cancelled by caller"),
                    );
                } else {
                    let _ = self.session_store.fail_session(session.id, &e.to_string());
                    self.events.publish(PipelineEvent::TranscodeFailed {
                        session_id: session.id,
                        media_id: session.request.media_id.clone(),
                        error: e.to_string(),
                        content_hash: session.fingerprint.clone(),
                    });
                }
            }
        }
        self.health.unregister_session(session.id);
        self.active.lock().remove(&session.id);
    }
}

fn handle_of(session: &Session) -> StreamingHandle {
    StreamingHandle {
        session_id: session.id,
        provider: session.provider.clone(),
        fingerprint: session.fingerprint.clone(),
        status: session.status,
        started_at: session.created_at,
        output_dir: session.directory.clone(),
        manifest_url: session.manifest_url.clone(),
    }
}

fn metadata_file_name(output: &std::path::Path) -> String {
    output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string())
}
