//! Streaming packager
//!
//! Consumes ready-segment events, copies the media files into the
//! session's public output layout, and keeps the manifest growing in
//! index order. A bounded queue feeds a small worker pool; a full
//! queue surfaces as a packaging error to the caller so the pipeline
//! can count the segment as failed.

pub mod codec;
pub mod dash;
pub mod hls;
pub mod manifest;

pub use manifest::{
    ManifestKind, ManifestMode, ManifestState, ManifestWriter, MediaParams, SegmentRef,
};

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::PackagerConfig;
use crate::error::{PipelineError, Result};
use crate::watcher::{SegmentInfo, TrackKind, WatcherEvent};

/// Hooks the orchestrator wires into the packager
#[derive(Clone)]
pub struct PackagerHooks {
    pub on_manifest: Arc<dyn Fn(PathBuf) + Send + Sync>,
    pub on_error: Arc<dyn Fn(PipelineError) + Send + Sync>,
}

impl PackagerHooks {
    pub fn noop() -> Self {
        Self {
            on_manifest: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
        }
    }
}

enum PackagerJob {
    Init {
        source: PathBuf,
        kind: TrackKind,
        profile: Option<String>,
    },
    Segment(SegmentInfo),
}

/// Packager for one streaming session
pub struct StreamingPackager {
    out_dir: PathBuf,
    writer: Arc<ManifestWriter>,
    tx: mpsc::Sender<PackagerJob>,
    hooks: PackagerHooks,
}

impl StreamingPackager {
    pub fn new(
        kind: ManifestKind,
        out_dir: PathBuf,
        params: MediaParams,
        config: &PackagerConfig,
        ctx: CancellationToken,
        hooks: PackagerHooks,
    ) -> Arc<Self> {
        let writer = Arc::new(ManifestWriter::new(ManifestState::new(kind, &out_dir, params)));
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));

        let packager = Arc::new(Self {
            out_dir,
            writer,
            tx,
            hooks,
        });

        for _ in 0..config.workers {
            let this = packager.clone();
            let rx = rx.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = ctx.cancelled() => break,
                        job = async { rx.lock().await.recv().await } => match job {
                            Some(job) => job,
                            None => break,
                        },
                    };
                    this.process(job).await;
                }
            });
        }

        packager
    }

    /// Admit a watcher event into the packaging queue.
    pub fn enqueue(&self, event: WatcherEvent) -> Result<()> {
        let job = match event {
            WatcherEvent::Init { path, kind, profile } => PackagerJob::Init {
                source: path,
                kind,
                profile,
            },
            WatcherEvent::Segment(info) => PackagerJob::Segment(info),
        };
        self.tx.try_send(job).map_err(|_| PipelineError::QueueFull)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.writer.path()
    }

    pub fn segment_count(&self) -> usize {
        self.writer.segment_count()
    }

    /// Public name of a packaged segment, relative to the output dir.
    pub fn segment_file_name(kind: TrackKind, profile: Option<&str>, index: usize) -> String {
        match kind {
            TrackKind::Video => format!(
                "segments/video-{}-{}.m4s",
                profile.unwrap_or("main"),
                index
            ),
            TrackKind::Audio => format!("segments/audio-{}.m4s", index),
        }
    }

    fn init_file_name(kind: TrackKind, profile: Option<&str>) -> String {
        match kind {
            TrackKind::Video => format!("init/video-{}.mp4", profile.unwrap_or("main")),
            TrackKind::Audio => "init/audio.mp4".to_string(),
        }
    }

    async fn process(&self, job: PackagerJob) {
        match job {
            PackagerJob::Init { source, kind, profile } => {
                let dest = self
                    .out_dir
                    .join(Self::init_file_name(kind, profile.as_deref()));
                if let Err(e) = self.copy_into_output(&source, &dest).await {
                    (self.hooks.on_error)(e);
                }
            }
            PackagerJob::Segment(info) => {
                let rel = Self::segment_file_name(info.kind, info.profile.as_deref(), info.index);
                let dest = self.out_dir.join(&rel);
                if let Err(e) = self.copy_into_output(&info.path, &dest).await {
                    (self.hooks.on_error)(e);
                    return;
                }

                let admitted = self.writer.admit(
                    info.kind,
                    info.profile.as_deref(),
                    SegmentRef {
                        index: info.index,
                        duration_secs: info.duration_secs,
                        file_name: rel,
                    },
                );
                match admitted {
                    Ok(true) => (self.hooks.on_manifest)(self.writer.path()),
                    Ok(false) => {}
                    Err(e) => {
                        // A straggler after finalization is not fatal
                        if self.writer.mode() == ManifestMode::Static {
                            tracing::debug!("Dropped late segment: {}", e);
                        } else {
                            (self.hooks.on_error)(e);
                        }
                    }
                }
            }
        }
    }

    async fn copy_into_output(&self, source: &std::path::Path, dest: &std::path::Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Packaging(format!("create output dir: {}", e)))?;
        }
        tokio::fs::copy(source, dest)
            .await
            .map_err(|e| {
                PipelineError::Packaging(format!(
                    "copy {} -> {}: {}",
                    source.display(),
                    dest.display(),
                    e
                ))
            })?;
        Ok(())
    }

    /// Finalize the manifest as static and notify. Exactly-once.
    pub fn finalize(&self) -> Result<()> {
        self.writer.finalize()?;
        (self.hooks.on_manifest)(self.writer.path());
        Ok(())
    }
}
