//! Keyframe and complexity analysis
//!
//! Pure analyses of an input file, both built on `ffprobe` JSON output:
//! - Keyframe extraction for alignment-aware segmentation
//! - A per-second scene complexity series in [0, 1]
//!
//! Both tolerate malformed or truncated inputs by returning an error
//! the caller can fall back from (the planner degrades to a uniform
//! plan).

pub mod complexity;
pub mod keyframes;

pub use keyframes::KeyframeInfo;

use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{FfmpegError, Result};

/// One video packet as reported by ffprobe
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawPacket {
    pub pts_time: Option<String>,
    pub pos: Option<String>,
    pub size: Option<String>,
    pub flags: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PacketsDocument {
    #[serde(default)]
    packets: Vec<RawPacket>,
}

#[derive(Debug, Deserialize)]
struct FormatDocument {
    format: Option<FormatSection>,
}

#[derive(Debug, Deserialize)]
struct FormatSection {
    duration: Option<String>,
}

/// ffprobe front-end shared by the analyses
#[derive(Debug, Clone)]
pub struct MediaProber {
    ffprobe_path: String,
    timeout: Duration,
}

impl MediaProber {
    pub fn new(ffprobe_path: &str) -> Self {
        Self {
            ffprobe_path: ffprobe_path.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| FfmpegError::Probe(format!("ffprobe timeout after {:?}", self.timeout)))?
            .map_err(|e| FfmpegError::Spawn(format!("{}: {}", self.ffprobe_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FfmpegError::Probe(stderr.trim().to_string()).into());
        }
        Ok(output.stdout)
    }

    /// Total duration of the input in seconds.
    pub async fn probe_duration(&self, input: &Path) -> Result<f64> {
        let input = input.to_string_lossy().into_owned();
        let raw = self
            .run(&[
                "-v", "error",
                "-print_format", "json",
                "-show_format",
                &input,
            ])
            .await?;

        let doc: FormatDocument = serde_json::from_slice(&raw)
            .map_err(|e| FfmpegError::ProbeParse(e.to_string()))?;
        doc.format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| *d > 0.0)
            .ok_or_else(|| FfmpegError::Probe("input has no duration".to_string()).into())
    }

    /// All packets of the first video stream, in decode order.
    pub(crate) async fn probe_video_packets(&self, input: &Path) -> Result<Vec<RawPacket>> {
        let input = input.to_string_lossy().into_owned();
        let raw = self
            .run(&[
                "-v", "error",
                "-select_streams", "v:0",
                "-show_entries", "packet=pts_time,pos,size,flags",
                "-print_format", "json",
                &input,
            ])
            .await?;

        let doc: PacketsDocument = serde_json::from_slice(&raw)
            .map_err(|e| FfmpegError::ProbeParse(e.to_string()))?;
        if doc.packets.is_empty() {
            return Err(FfmpegError::Probe("no video packets found".to_string()).into());
        }
        Ok(doc.packets)
    }

    /// Extract keyframes of the first video stream (§ keyframes module).
    pub async fn analyze_keyframes(&self, input: &Path) -> Result<Vec<KeyframeInfo>> {
        let packets = self.probe_video_packets(input).await?;
        Ok(keyframes::keyframes_from_packets(&packets))
    }

    /// Compute the per-second complexity series (§ complexity module).
    pub async fn analyze_scene_complexity(&self, input: &Path) -> Result<Vec<f64>> {
        let packets = self.probe_video_packets(input).await?;
        Ok(complexity::complexity_from_packets(&packets))
    }
}

#[cfg(test)]
pub(crate) fn packet(pts: f64, pos: u64, size: u64, key: bool) -> RawPacket {
    RawPacket {
        pts_time: Some(format!("{:.6}", pts)),
        pos: Some(pos.to_string()),
        size: Some(size.to_string()),
        flags: Some(if key { "K__".to_string() } else { "___".to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_missing_binary_is_probe_error() {
        let prober = MediaProber::new("/definitely/not/ffprobe");
        let err = prober.probe_duration(&PathBuf::from("/media/A.mp4")).await;
        assert!(err.is_err());
    }

    #[test]
    fn test_packets_document_parsing() {
        let json = r#"{
            "packets": [
                {"pts_time": "0.000000", "pos": "48", "size": "10240", "flags": "K__"},
                {"pts_time": "0.033367", "pos": "10288", "size": "512", "flags": "___"}
            ]
        }"#;
        let doc: PacketsDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.packets.len(), 2);
        assert_eq!(doc.packets[0].flags.as_deref(), Some("K__"));
    }
}
