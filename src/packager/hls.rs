//! HLS media playlist writer
//!
//! Builds the playlist by plain string assembly. While the session is
//! live the playlist is an EVENT list without `#EXT-X-ENDLIST`;
//! finalization rewrites it as VOD and appends the end marker.

use super::manifest::{ManifestMode, ManifestState};

pub(crate) fn render_playlist(state: &ManifestState) -> String {
    let segments = state.primary_video();
    let primary = state
        .params
        .video_profiles
        .first()
        .map(|p| p.name.clone())
        .unwrap_or_else(|| "main".to_string());

    // Target duration is the ceiling of the longest segment
    let target_duration = segments
        .iter()
        .map(|s| s.duration_secs)
        .fold(0.0_f64, f64::max)
        .ceil()
        .max(1.0) as u64;

    let mut output = String::new();
    output.push_str("#EXTM3U\n");
    output.push_str("#EXT-X-VERSION:7\n");
    output.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target_duration));
    output.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    match state.mode {
        ManifestMode::Dynamic => output.push_str("#EXT-X-PLAYLIST-TYPE:EVENT\n"),
        ManifestMode::Static => output.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n"),
    }
    output.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");
    output.push_str(&format!("#EXT-X-MAP:URI=\"init/video-{}.mp4\"\n", primary));
    output.push('\n');

    for segment in segments {
        output.push_str(&format!("#EXTINF:{:.3},\n", segment.duration_secs));
        output.push_str(&segment.file_name);
        output.push('\n');
    }

    if state.mode == ManifestMode::Static {
        output.push_str("#EXT-X-ENDLIST\n");
    }

    output
}

/// Master playlist listing the variant streams.
///
/// With a single media playlist per session this is one
/// `#EXT-X-STREAM-INF` entry per video profile, all pointing at the
/// same media playlist file.
pub(crate) fn render_master(state: &ManifestState) -> String {
    let mut output = String::new();
    output.push_str("#EXTM3U\n");
    output.push_str("#EXT-X-VERSION:7\n");
    output.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");

    for profile in &state.params.video_profiles {
        let bandwidth = super::codec::variant_bandwidth(
            profile.video_bitrate,
            state.params.audio_bitrate,
        );
        let codecs = super::codec::variant_codecs(
            &state.params.video_codec,
            &state.params.audio_codec,
            profile,
        );
        output.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{},CODECS=\"{}\"\n",
            bandwidth, profile.width, profile.height, codecs
        ));
        output.push_str("stream.m3u8\n");
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packager::manifest::{segment_ref, test_params, ManifestKind, ManifestWriter};
    use crate::watcher::TrackKind;
    use tempfile::TempDir;

    fn writer(dir: &TempDir) -> ManifestWriter {
        ManifestWriter::new(ManifestState::new(ManifestKind::Hls, dir.path(), test_params()))
    }

    #[test]
    fn test_dynamic_playlist_has_no_endlist() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);
        writer.admit(TrackKind::Video, Some("720p"), segment_ref(0)).unwrap();

        let playlist = std::fs::read_to_string(writer.path()).unwrap();
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-PLAYLIST-TYPE:EVENT"));
        assert!(playlist.contains("#EXT-X-MAP:URI=\"init/video-720p.mp4\""));
        assert!(playlist.contains("#EXTINF:4.000,\nsegments/video-720p-0.m4s"));
        assert!(!playlist.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_segments_listed_in_index_order() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);
        for index in 0..3 {
            writer.admit(TrackKind::Video, Some("720p"), segment_ref(index)).unwrap();
        }

        let playlist = std::fs::read_to_string(writer.path()).unwrap();
        let pos0 = playlist.find("video-720p-0.m4s").unwrap();
        let pos1 = playlist.find("video-720p-1.m4s").unwrap();
        let pos2 = playlist.find("video-720p-2.m4s").unwrap();
        assert!(pos0 < pos1 && pos1 < pos2);
    }

    #[test]
    fn test_finalized_playlist_is_vod_with_endlist() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);
        writer.admit(TrackKind::Video, Some("720p"), segment_ref(0)).unwrap();
        writer.finalize().unwrap();

        let playlist = std::fs::read_to_string(writer.path()).unwrap();
        assert!(playlist.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
        assert!(playlist.trim_end().ends_with("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_master_playlist_variants() {
        let dir = TempDir::new().unwrap();
        let state = ManifestState::new(ManifestKind::Hls, dir.path(), test_params());
        let master = render_master(&state);

        assert!(master.starts_with("#EXTM3U\n"));
        assert!(master.contains("RESOLUTION=1280x720"));
        assert!(master.contains("CODECS=\"avc1.4d001f,mp4a.40.2\""));
        assert!(master.contains("stream.m3u8"));
        // Declared bandwidth covers video + audio with headroom
        assert!(master.contains("BANDWIDTH=5004800"));
    }

    #[test]
    fn test_target_duration_covers_longest_segment() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);
        writer.admit(TrackKind::Video, Some("720p"), segment_ref(0)).unwrap();
        writer
            .admit(
                TrackKind::Video,
                Some("720p"),
                crate::packager::manifest::SegmentRef {
                    index: 1,
                    duration_secs: 5.2,
                    file_name: "segments/video-720p-1.m4s".to_string(),
                },
            )
            .unwrap();

        let playlist = std::fs::read_to_string(writer.path()).unwrap();
        assert!(playlist.contains("#EXT-X-TARGETDURATION:6"));
    }
}
