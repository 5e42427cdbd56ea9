//! Streaming encoder
//!
//! Drives the external encoder to emit fragmented, keyframe-aligned
//! segments into a per-session working directory, supervised by the
//! process monitor. Segment discovery runs as a separate poller (see
//! the watcher module) wired up by the orchestrator.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{FfmpegConfig, SegmentConfig};
use crate::error::{FfmpegError, Result};
use crate::ffmpeg::command::{EncoderProfile, FfmpegCommandBuilder};
use crate::ffmpeg::monitor::{MonitorCallbacks, ProcessMonitor};
use crate::planner::AdaptiveSegmentPlan;
use crate::session::TranscodeRequest;
use crate::watcher::{SegmentWatcher, TrackKind, TrackSpec, WatcherEvent};

/// Encoder for one streaming session
pub struct StreamingEncoder {
    ffmpeg_config: FfmpegConfig,
    segment_config: SegmentConfig,
    work_dir: PathBuf,
    monitor: Arc<ProcessMonitor>,
    ctx: CancellationToken,
    profiles: Vec<EncoderProfile>,
}

impl StreamingEncoder {
    /// `ctx` should be a child of the session's cancellation token so
    /// stopping the session also winds the encoder down.
    pub fn new(
        ffmpeg_config: FfmpegConfig,
        segment_config: SegmentConfig,
        work_dir: PathBuf,
        profiles: Vec<EncoderProfile>,
        ctx: CancellationToken,
    ) -> Self {
        let monitor = Arc::new(ProcessMonitor::new(ffmpeg_config.clone()));
        Self {
            ffmpeg_config,
            segment_config,
            work_dir,
            monitor,
            ctx,
            profiles,
        }
    }

    pub fn monitor(&self) -> Arc<ProcessMonitor> {
        self.monitor.clone()
    }

    pub fn profiles(&self) -> &[EncoderProfile] {
        &self.profiles
    }

    /// Install progress/error/exit callbacks. Must precede `start`.
    pub fn set_callbacks(&self, callbacks: MonitorCallbacks) {
        self.monitor.set_callbacks(callbacks);
    }

    /// Spawn the encoder process and hand it to the monitor.
    ///
    /// With a plan, segment boundaries follow its forced keyframes;
    /// without one the encoder falls back to a uniform GOP cadence.
    pub async fn start(
        &self,
        request: &TranscodeRequest,
        plan: Option<&AdaptiveSegmentPlan>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(self.work_dir.join("init")).await?;
        tokio::fs::create_dir_all(self.work_dir.join("segments")).await?;

        let mut builder = FfmpegCommandBuilder::new(&request.input_path)
            .profiles(self.profiles.clone())
            .video_codec(&request.video_codec)
            .audio(&request.audio_codec, request.audio_bitrate)
            .segment_duration(self.segment_config.base_duration_secs)
            .seek(request.seek_secs);
        if let Some(plan) = plan {
            if !plan.is_empty() {
                builder = builder.forced_keyframes(plan.boundaries());
            }
        }
        let args = builder.build_streaming_args(&self.work_dir);

        tracing::debug!(
            input = %request.input_path.display(),
            work_dir = %self.work_dir.display(),
            "Starting encoder: {} {}",
            self.ffmpeg_config.ffmpeg_path,
            args.join(" ")
        );

        let child = Command::new(&self.ffmpeg_config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FfmpegError::Spawn(format!("{}: {}", self.ffmpeg_config.ffmpeg_path, e))
            })?;

        self.monitor.start_monitoring(self.ctx.clone(), child);
        Ok(())
    }

    /// Start the segment discovery poller for this session's tracks.
    ///
    /// Video profiles occupy representation ids 0..P-1 in the muxer's
    /// file naming; audio follows at P.
    pub fn spawn_watcher(
        &self,
        plan: Option<&AdaptiveSegmentPlan>,
        tx: mpsc::Sender<WatcherEvent>,
    ) -> JoinHandle<()> {
        let mut tracks: Vec<TrackSpec> = self
            .profiles
            .iter()
            .enumerate()
            .map(|(i, profile)| TrackSpec {
                rep_id: i,
                kind: TrackKind::Video,
                profile: Some(profile.name.clone()),
            })
            .collect();
        tracks.push(TrackSpec {
            rep_id: self.profiles.len(),
            kind: TrackKind::Audio,
            profile: None,
        });

        let watcher = SegmentWatcher::new(
            self.work_dir.clone(),
            tracks,
            Duration::from_millis(self.segment_config.poll_interval_millis),
            Duration::from_millis(self.segment_config.stability_recheck_millis),
            plan.map(|p| p.durations()).unwrap_or_default(),
            self.segment_config.base_duration_secs,
        );
        watcher.spawn(self.ctx.clone(), tx)
    }

    /// Stop encoding. Idempotent: cancels the context, which gives the
    /// process a short grace period before it is killed.
    pub fn stop(&self) {
        self.ctx.cancel();
    }
}
