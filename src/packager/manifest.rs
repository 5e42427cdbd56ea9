//! Evolving manifest state
//!
//! The manifest is initialized dynamic at the first admitted segment,
//! grows by whole contiguous runs per track, and is rewritten static
//! exactly once at session completion. A single writer lock guards the
//! state; every write to disk is an atomic temp-file + rename so a
//! reader never observes a partial manifest.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::ffmpeg::command::EncoderProfile;
use crate::session::Container;
use crate::watcher::TrackKind;

/// Manifest flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Dash,
    Hls,
}

impl ManifestKind {
    pub fn from_container(container: Container) -> Option<Self> {
        match container {
            Container::Dash => Some(ManifestKind::Dash),
            Container::Hls => Some(ManifestKind::Hls),
            _ => None,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ManifestKind::Dash => "stream.mpd",
            ManifestKind::Hls => "stream.m3u8",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ManifestKind::Dash => "application/dash+xml",
            ManifestKind::Hls => "application/vnd.apple.mpegurl",
        }
    }
}

/// Dynamic manifests grow; static manifests are final
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestMode {
    Dynamic,
    Static,
}

/// One admitted segment reference
#[derive(Debug, Clone)]
pub struct SegmentRef {
    pub index: usize,
    pub duration_secs: f64,
    pub file_name: String,
}

/// Per-track admission state: out-of-order arrivals wait in `pending`
/// until the run from `next_index` is contiguous.
#[derive(Debug, Default)]
pub(crate) struct TrackTimeline {
    next_index: usize,
    pending: BTreeMap<usize, SegmentRef>,
    pub(crate) admitted: Vec<SegmentRef>,
}

impl TrackTimeline {
    /// Offer one segment; returns how many refs became admitted.
    fn offer(&mut self, segment: SegmentRef) -> usize {
        if segment.index < self.next_index {
            // Duplicate delivery of an already admitted segment
            return 0;
        }
        self.pending.insert(segment.index, segment);

        let mut admitted = 0;
        while let Some(segment) = self.pending.remove(&self.next_index) {
            self.admitted.push(segment);
            self.next_index += 1;
            admitted += 1;
        }
        admitted
    }

    pub(crate) fn duration_secs(&self) -> f64 {
        self.admitted.iter().map(|s| s.duration_secs).sum()
    }
}

/// Encoding parameters the manifests advertise
#[derive(Debug, Clone)]
pub struct MediaParams {
    pub video_profiles: Vec<EncoderProfile>,
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_bitrate: u32,
}

/// The manifest state proper
pub struct ManifestState {
    pub(crate) kind: ManifestKind,
    pub(crate) mode: ManifestMode,
    pub(crate) path: PathBuf,
    pub(crate) availability_start: DateTime<Utc>,
    pub(crate) params: MediaParams,
    pub(crate) tracks: BTreeMap<String, TrackTimeline>,
}

pub(crate) fn track_key(kind: TrackKind, profile: Option<&str>) -> String {
    match kind {
        TrackKind::Video => format!("video-{}", profile.unwrap_or("main")),
        TrackKind::Audio => "audio".to_string(),
    }
}

impl ManifestState {
    pub fn new(kind: ManifestKind, out_dir: &Path, params: MediaParams) -> Self {
        Self {
            kind,
            mode: ManifestMode::Dynamic,
            path: out_dir.join(kind.file_name()),
            availability_start: Utc::now(),
            params,
            tracks: BTreeMap::new(),
        }
    }

    pub(crate) fn track(&self, kind: TrackKind, profile: Option<&str>) -> Option<&TrackTimeline> {
        self.tracks.get(&track_key(kind, profile))
    }

    /// Admitted refs of the primary video profile.
    pub(crate) fn primary_video(&self) -> &[SegmentRef] {
        self.params
            .video_profiles
            .first()
            .and_then(|p| self.track(TrackKind::Video, Some(&p.name)))
            .map(|t| t.admitted.as_slice())
            .unwrap_or(&[])
    }

    /// Longest admitted timeline across tracks, in seconds.
    pub(crate) fn presentation_duration(&self) -> f64 {
        self.tracks
            .values()
            .map(|t| t.duration_secs())
            .fold(0.0, f64::max)
    }

    fn render(&self) -> std::io::Result<Vec<u8>> {
        match self.kind {
            ManifestKind::Dash => super::dash::render_mpd(self),
            ManifestKind::Hls => Ok(super::hls::render_playlist(self).into_bytes()),
        }
    }
}

/// Single-writer manifest file manager
pub struct ManifestWriter {
    state: Mutex<ManifestState>,
}

impl ManifestWriter {
    pub fn new(state: ManifestState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.state.lock().path.clone()
    }

    pub fn mode(&self) -> ManifestMode {
        self.state.lock().mode
    }

    /// Segments admitted for the primary video track.
    pub fn segment_count(&self) -> usize {
        self.state.lock().primary_video().len()
    }

    /// Offer a segment reference. When it (or a run it unblocks)
    /// extends the manifest, the file is rewritten atomically and true
    /// is returned.
    pub fn admit(
        &self,
        kind: TrackKind,
        profile: Option<&str>,
        segment: SegmentRef,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if state.mode == ManifestMode::Static {
            return Err(PipelineError::Packaging(
                "segment admitted after manifest finalization".to_string(),
            ));
        }

        let key = track_key(kind, profile);
        let admitted = state.tracks.entry(key).or_default().offer(segment);
        if admitted == 0 {
            return Ok(false);
        }
        write_atomic(&state.path, &state.render()?)?;
        write_master(&state)?;
        Ok(true)
    }

    /// Rewrite the manifest as static. Exactly-once: repeat calls are
    /// no-ops.
    pub fn finalize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.mode == ManifestMode::Static {
            return Ok(());
        }
        state.mode = ManifestMode::Static;
        write_atomic(&state.path, &state.render()?)?;
        write_master(&state)?;
        Ok(())
    }
}

/// For HLS the entry point is a master playlist describing the variant
/// streams; DASH carries the representations in the MPD itself.
fn write_master(state: &ManifestState) -> Result<()> {
    if state.kind != ManifestKind::Hls {
        return Ok(());
    }
    let path = state.path.with_file_name("master.m3u8");
    write_atomic(&path, super::hls::render_master(state).as_bytes())
}

/// Atomic file replacement: temp file in the same directory + rename.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "manifest".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    std::fs::write(&tmp, contents)
        .map_err(|e| PipelineError::Packaging(format!("write manifest temp: {}", e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| PipelineError::Packaging(format!("replace manifest: {}", e)))?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_params() -> MediaParams {
    MediaParams {
        video_profiles: vec![EncoderProfile {
            name: "720p".to_string(),
            width: 1280,
            height: 720,
            video_bitrate: 3000,
            crf: 23,
        }],
        video_codec: "libx264".to_string(),
        audio_codec: "aac".to_string(),
        audio_bitrate: 128,
    }
}

#[cfg(test)]
pub(crate) fn segment_ref(index: usize) -> SegmentRef {
    SegmentRef {
        index,
        duration_secs: 4.0,
        file_name: format!("segments/video-720p-{}.m4s", index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn writer(dir: &TempDir, kind: ManifestKind) -> ManifestWriter {
        ManifestWriter::new(ManifestState::new(kind, dir.path(), test_params()))
    }

    #[test]
    fn test_contiguous_admission() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, ManifestKind::Hls);

        assert!(writer.admit(TrackKind::Video, Some("720p"), segment_ref(0)).unwrap());
        assert_eq!(writer.segment_count(), 1);
        assert!(writer.path().is_file());
    }

    #[test]
    fn test_out_of_order_held_back() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, ManifestKind::Hls);

        // Index 1 before 0: nothing admitted, no manifest yet
        assert!(!writer.admit(TrackKind::Video, Some("720p"), segment_ref(1)).unwrap());
        assert_eq!(writer.segment_count(), 0);
        assert!(!writer.path().exists());

        // Index 0 releases both
        assert!(writer.admit(TrackKind::Video, Some("720p"), segment_ref(0)).unwrap());
        assert_eq!(writer.segment_count(), 2);
    }

    #[test]
    fn test_duplicate_ignored() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, ManifestKind::Hls);

        writer.admit(TrackKind::Video, Some("720p"), segment_ref(0)).unwrap();
        assert!(!writer.admit(TrackKind::Video, Some("720p"), segment_ref(0)).unwrap());
        assert_eq!(writer.segment_count(), 1);
    }

    #[test]
    fn test_finalize_once() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, ManifestKind::Hls);
        writer.admit(TrackKind::Video, Some("720p"), segment_ref(0)).unwrap();

        writer.finalize().unwrap();
        assert_eq!(writer.mode(), ManifestMode::Static);
        writer.finalize().unwrap();

        // Admission after finalization is a packaging error
        let err = writer.admit(TrackKind::Video, Some("720p"), segment_ref(1));
        assert!(matches!(err, Err(PipelineError::Packaging(_))));
    }

    #[test]
    fn test_hls_master_written_alongside_media_playlist() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, ManifestKind::Hls);
        writer.admit(TrackKind::Video, Some("720p"), segment_ref(0)).unwrap();

        let master = std::fs::read_to_string(dir.path().join("master.m3u8")).unwrap();
        assert!(master.contains("#EXT-X-STREAM-INF"));
        assert!(master.contains("stream.m3u8"));
    }

    #[test]
    fn test_dash_has_no_master_playlist() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, ManifestKind::Dash);
        writer.admit(TrackKind::Video, Some("720p"), segment_ref(0)).unwrap();
        assert!(!dir.path().join("master.m3u8").exists());
    }

    #[test]
    fn test_presentation_duration_is_longest_track() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, ManifestKind::Hls);
        writer.admit(TrackKind::Video, Some("720p"), segment_ref(0)).unwrap();
        writer.admit(TrackKind::Video, Some("720p"), segment_ref(1)).unwrap();
        writer
            .admit(
                TrackKind::Audio,
                None,
                SegmentRef {
                    index: 0,
                    duration_secs: 4.0,
                    file_name: "segments/audio-0.m4s".to_string(),
                },
            )
            .unwrap();

        let state = writer.state.lock();
        assert!((state.presentation_duration() - 8.0).abs() < 1e-9);
    }
}
