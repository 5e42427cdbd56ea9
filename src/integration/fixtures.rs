//! Test fixtures
//!
//! Provides a fake encoder executable and a config wired to it. The
//! fake encoder honors the §6.5-style invocation contract the real
//! pipeline relies on: machine-readable progress on stdout, one init
//! file per representation, numbered media segments, and a final
//! `progress=end`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::session::{Container, Resolution, TranscodeRequest};
use crate::state::AppState;

/// Write the fake encoder script.
///
/// The script treats its last argument as the manifest output path
/// (exactly where the dash muxer would write it), derives the working
/// directory from it, and emits `segments` media segments for one
/// video representation (id 0) and one audio representation (id 1),
/// `interval_ms` apart.
pub fn write_fake_encoder(dir: &Path, segments: usize, interval_ms: u64) -> PathBuf {
    let interval = format!("{}.{:03}", interval_ms / 1000, interval_ms % 1000);
    let script = format!(
        r#"#!/bin/sh
out=""
for a in "$@"; do out="$a"; done
dir=$(dirname "$out")
mkdir -p "$dir/init" "$dir/segments"
printf 'video-init' > "$dir/init/0.mp4"
printf 'audio-init' > "$dir/init/1.mp4"
i=1
while [ $i -le {segments} ]; do
  printf 'vseg-%05d' $i > "$dir/segments/0-$(printf %05d $i).m4s"
  printf 'aseg-%05d' $i > "$dir/segments/1-$(printf %05d $i).m4s"
  echo "frame=$((i*100))"
  echo "fps=30.0"
  echo "out_time_us=$((i*4000000))"
  echo "speed=1.0x"
  echo "progress=continue"
  sleep {interval}
  i=$((i+1))
done
echo "progress=end"
exit 0
"#,
        segments = segments,
        interval = interval,
    );

    let path = dir.join("fake-ffmpeg.sh");
    std::fs::write(&path, script).expect("write fake encoder");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("make fake encoder executable");
    }
    path
}

/// Create a small file standing in for source media.
pub fn write_fake_input(dir: &Path) -> PathBuf {
    let path = dir.join("input.mp4");
    std::fs::write(&path, b"fake source media").expect("write fake input");
    path
}

/// Config tuned for fast test cycles, pointing at the fake encoder.
pub fn test_config(data_dir: &Path, encoder: &Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.paths.data_dir = data_dir.to_path_buf();
    config.ffmpeg.ffmpeg_path = encoder.to_string_lossy().into_owned();
    // No ffprobe: the planner falls back to a uniform plan
    config.ffmpeg.ffprobe_path = data_dir.join("no-ffprobe").to_string_lossy().into_owned();
    config.ffmpeg.stop_grace_millis = 100;
    config.segment.poll_interval_millis = 50;
    config.segment.stability_recheck_millis = 20;
    config.prefetch.startup_timeout_secs = 2;
    config
}

/// Full application state backed by the fake encoder.
pub fn test_state(data_dir: &Path, segments: usize, interval_ms: u64) -> Arc<AppState> {
    let encoder = write_fake_encoder(data_dir, segments, interval_ms);
    AppState::new(test_config(data_dir, &encoder))
}

/// A dash request against the fake input.
pub fn dash_request(data_dir: &Path) -> TranscodeRequest {
    TranscodeRequest {
        input_path: write_fake_input(data_dir),
        media_id: "e2e-media".to_string(),
        container: Container::Dash,
        video_codec: "libx264".to_string(),
        audio_codec: "aac".to_string(),
        resolution: Resolution {
            width: 1280,
            height: 720,
        },
        video_bitrate: 3000,
        audio_bitrate: 128,
        quality: 75,
        seek_secs: 0.0,
        prefer_hardware: false,
    }
}
