//! FFmpeg command construction
//!
//! Builds argument vectors for the two invocation shapes the pipeline
//! uses: segmented fMP4 output for streaming sessions, and single-file
//! output for the file provider. The contract with the binary is §6.5
//! of the external interface: machine-readable progress on stdout, one
//! init file per representation, numbered media segments.

use std::path::{Path, PathBuf};

use crate::session::TranscodeRequest;

/// One encoding profile (ABR representation)
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderProfile {
    /// Short name used in file naming, e.g. "720p"
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Video bitrate in kbit/s
    pub video_bitrate: u32,
    /// CRF-like quality integer
    pub crf: u32,
}

impl EncoderProfile {
    /// Derive the single profile described by a request.
    pub fn from_request(request: &TranscodeRequest) -> Self {
        Self {
            name: format!("{}p", request.resolution.height),
            width: request.resolution.width,
            height: request.resolution.height,
            video_bitrate: request.video_bitrate,
            crf: quality_to_crf(request.quality),
        }
    }
}

/// Map a 0..100 quality knob onto the 18..40 CRF range (higher quality
/// means lower CRF).
pub fn quality_to_crf(quality: u8) -> u32 {
    let quality = quality.min(100) as f64;
    (40.0 - quality / 100.0 * 22.0).round() as u32
}

/// Builder for ffmpeg argument vectors
#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    input: PathBuf,
    seek_secs: f64,
    profiles: Vec<EncoderProfile>,
    video_codec: String,
    audio_codec: String,
    audio_bitrate: u32,
    segment_duration_secs: f64,
    fps: u32,
    forced_keyframes: Option<Vec<f64>>,
}

impl FfmpegCommandBuilder {
    pub fn new<P: Into<PathBuf>>(input: P) -> Self {
        Self {
            input: input.into(),
            seek_secs: 0.0,
            profiles: Vec::new(),
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: 128,
            segment_duration_secs: 4.0,
            fps: 30,
            forced_keyframes: None,
        }
    }

    pub fn seek(mut self, secs: f64) -> Self {
        self.seek_secs = secs;
        self
    }

    pub fn profiles(mut self, profiles: Vec<EncoderProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn video_codec(mut self, codec: &str) -> Self {
        self.video_codec = codec.to_string();
        self
    }

    pub fn audio(mut self, codec: &str, bitrate_kbps: u32) -> Self {
        self.audio_codec = codec.to_string();
        self.audio_bitrate = bitrate_kbps;
        self
    }

    pub fn segment_duration(mut self, secs: f64) -> Self {
        self.segment_duration_secs = secs;
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Force keyframes at the given timestamps, overriding the uniform
    /// GOP cadence. Used to apply an adaptive segmentation plan.
    pub fn forced_keyframes(mut self, boundaries: Vec<f64>) -> Self {
        self.forced_keyframes = Some(boundaries);
        self
    }

    fn common_prefix(&self) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
        ];
        if self.seek_secs > 0.0 {
            args.push("-ss".to_string());
            args.push(format!("{:.3}", self.seek_secs));
        }
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().into_owned());
        args
    }

    fn keyframe_args(&self) -> Vec<String> {
        let gop = (self.segment_duration_secs * self.fps as f64).round().max(1.0) as u32;
        let mut args = vec![
            "-g".to_string(),
            gop.to_string(),
            "-keyint_min".to_string(),
            gop.to_string(),
            // Uniform GOPs: scene-change keyframes would break alignment
            "-sc_threshold".to_string(),
            "0".to_string(),
        ];
        if let Some(boundaries) = &self.forced_keyframes {
            if !boundaries.is_empty() {
                let times: Vec<String> = boundaries.iter().map(|t| format!("{:.3}", t)).collect();
                args.push("-force_key_frames".to_string());
                args.push(times.join(","));
            }
        }
        args
    }

    /// Arguments for segmented fMP4 output into `work_dir`.
    ///
    /// The muxer writes `init/<rep>.mp4` per representation and
    /// `segments/<rep>-<NNNNN>.m4s` media segments, where video
    /// representations take stream indices 0..P-1 and audio is P.
    pub fn build_streaming_args(&self, work_dir: &Path) -> Vec<String> {
        let mut args = self.common_prefix();

        for _ in &self.profiles {
            args.push("-map".to_string());
            args.push("0:v:0".to_string());
        }
        args.push("-map".to_string());
        args.push("0:a:0?".to_string());

        for (i, profile) in self.profiles.iter().enumerate() {
            args.push(format!("-filter:v:{}", i));
            args.push(format!("scale={}:{}", profile.width, profile.height));
            args.push(format!("-c:v:{}", i));
            args.push(self.video_codec.clone());
            args.push(format!("-b:v:{}", i));
            args.push(format!("{}k", profile.video_bitrate));
            args.push(format!("-crf:v:{}", i));
            args.push(profile.crf.to_string());
        }

        args.push("-c:a".to_string());
        args.push(self.audio_codec.clone());
        args.push("-b:a".to_string());
        args.push(format!("{}k", self.audio_bitrate));

        args.extend(self.keyframe_args());

        args.extend([
            "-movflags".to_string(),
            "+frag_keyframe+empty_moov+default_base_moof".to_string(),
            "-use_timeline".to_string(),
            "1".to_string(),
            "-use_template".to_string(),
            "1".to_string(),
            "-seg_duration".to_string(),
            format!("{:.3}", self.segment_duration_secs),
            "-init_seg_name".to_string(),
            "init/$RepresentationID$.mp4".to_string(),
            "-media_seg_name".to_string(),
            "segments/$RepresentationID$-$Number%05d$.m4s".to_string(),
            "-f".to_string(),
            "dash".to_string(),
        ]);
        args.push(work_dir.join("manifest.mpd").to_string_lossy().into_owned());
        args
    }

    /// Arguments for single-file output (file provider path).
    pub fn build_file_args(&self, output: &Path) -> Vec<String> {
        let mut args = self.common_prefix();

        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        args.push("-map".to_string());
        args.push("0:a:0?".to_string());

        if let Some(profile) = self.profiles.first() {
            args.push("-filter:v".to_string());
            args.push(format!("scale={}:{}", profile.width, profile.height));
            args.push("-c:v".to_string());
            args.push(self.video_codec.clone());
            args.push("-b:v".to_string());
            args.push(format!("{}k", profile.video_bitrate));
            args.push("-crf".to_string());
            args.push(profile.crf.to_string());
        }

        args.push("-c:a".to_string());
        args.push(self.audio_codec.clone());
        args.push("-b:a".to_string());
        args.push(format!("{}k", self.audio_bitrate));

        // Relocate the moov atom so playback can start before the
        // download finishes
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());

        args.push(output.to_string_lossy().into_owned());
        args
    }
}
