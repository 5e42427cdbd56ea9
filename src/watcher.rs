//! Segment discovery
//!
//! A per-session poller that watches the encoder's working directory
//! and turns finished segment files into an ordered event stream. A
//! segment is only considered ready once its size is stable across two
//! stat calls and non-zero, so a file the muxer is still writing is
//! never surfaced. Per track, events are emitted in strictly
//! increasing index order with no gaps.

use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Track a segment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// One track the encoder emits: a video profile or the audio stream
#[derive(Debug, Clone)]
pub struct TrackSpec {
    /// Representation id in the muxer's file naming (stream index)
    pub rep_id: usize,
    pub kind: TrackKind,
    /// Profile name for video tracks, e.g. "720p"
    pub profile: Option<String>,
}

/// A discovered, size-stable media segment
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// Zero-based, contiguous per track
    pub index: usize,
    pub path: PathBuf,
    pub kind: TrackKind,
    pub profile: Option<String>,
    pub size_bytes: u64,
    pub duration_secs: f64,
    pub produced_at: SystemTime,
}

/// Events emitted by the watcher
#[derive(Debug, Clone)]
pub enum WatcherEvent {
    /// A track's init file became available (emitted once per track)
    Init {
        path: PathBuf,
        kind: TrackKind,
        profile: Option<String>,
    },
    Segment(SegmentInfo),
}

struct TrackState {
    spec: TrackSpec,
    /// The dash muxer numbers media segments from 1
    next_number: u64,
    init_seen: bool,
}

/// Output directory poller
pub struct SegmentWatcher {
    work_dir: PathBuf,
    tracks: Vec<TrackState>,
    poll_interval: Duration,
    recheck_delay: Duration,
    /// Planned per-index durations; indexes beyond the plan fall back
    /// to the default
    planned_durations: Vec<f64>,
    default_duration: f64,
}

impl SegmentWatcher {
    pub fn new(
        work_dir: PathBuf,
        tracks: Vec<TrackSpec>,
        poll_interval: Duration,
        recheck_delay: Duration,
        planned_durations: Vec<f64>,
        default_duration: f64,
    ) -> Self {
        Self {
            work_dir,
            tracks: tracks
                .into_iter()
                .map(|spec| TrackState {
                    spec,
                    next_number: 1,
                    init_seen: false,
                })
                .collect(),
            poll_interval,
            recheck_delay,
            planned_durations,
            default_duration,
        }
    }

    /// Run the poller until cancelled or the receiver goes away.
    pub fn spawn(mut self, ctx: CancellationToken, tx: mpsc::Sender<WatcherEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if !self.poll_once(&tx).await {
                    break;
                }
            }
        })
    }

    /// One poll pass over all tracks. Returns false when the receiver
    /// is gone.
    async fn poll_once(&mut self, tx: &mpsc::Sender<WatcherEvent>) -> bool {
        for track in &mut self.tracks {
            if !track.init_seen {
                let init_path = self.work_dir.join("init").join(format!("{}.mp4", track.spec.rep_id));
                if let Some(size) = wait_stable(&init_path, self.recheck_delay).await {
                    if size > 0 {
                        track.init_seen = true;
                        let event = WatcherEvent::Init {
                            path: init_path,
                            kind: track.spec.kind,
                            profile: track.spec.profile.clone(),
                        };
                        if tx.send(event).await.is_err() {
                            return false;
                        }
                    }
                }
            }

            // Only the next index per track is eligible; this keeps the
            // emitted stream contiguous by construction
            loop {
                let path = self.work_dir.join("segments").join(format!(
                    "{}-{:05}.m4s",
                    track.spec.rep_id, track.next_number
                ));
                let Some(size) = wait_stable(&path, self.recheck_delay).await else {
                    break;
                };
                if size == 0 {
                    break;
                }

                let index = (track.next_number - 1) as usize;
                let duration_secs = self
                    .planned_durations
                    .get(index)
                    .copied()
                    .unwrap_or(self.default_duration);
                let info = SegmentInfo {
                    index,
                    path,
                    kind: track.spec.kind,
                    profile: track.spec.profile.clone(),
                    size_bytes: size,
                    duration_secs,
                    produced_at: SystemTime::now(),
                };
                track.next_number += 1;
                tracing::debug!(
                    rep_id = track.spec.rep_id,
                    index,
                    size,
                    "Segment ready"
                );
                if tx.send(WatcherEvent::Segment(info)).await.is_err() {
                    return false;
                }
            }
        }
        true
    }
}

/// Two-stat size-stability gate.
///
/// Returns the size iff the file exists and its size did not change
/// across `recheck_delay`. A file that grows between the two calls is
/// still being written and reports unstable.
async fn wait_stable(path: &std::path::Path, recheck_delay: Duration) -> Option<u64> {
    let first = tokio::fs::metadata(path).await.ok()?.len();
    tokio::time::sleep(recheck_delay).await;
    let second = tokio::fs::metadata(path).await.ok()?.len();
    (first == second).then_some(second)
}
