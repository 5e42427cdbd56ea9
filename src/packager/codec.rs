//! Codec string generation
//!
//! Generates RFC 6381 codec strings for manifests from the encoder
//! settings. The encoder names come from the request (ffmpeg encoder
//! names); levels fall back to a resolution-based estimate when not
//! pinned explicitly.

use crate::ffmpeg::command::EncoderProfile;

/// Codec string for a video profile, keyed by the encoder name.
pub fn video_codec_string(encoder: &str, profile: &EncoderProfile) -> String {
    match encoder {
        "libx264" | "h264" | "h264_nvenc" | "h264_vaapi" | "h264_videotoolbox" => {
            h264_codec_string(profile.width, profile.height)
        }
        "libx265" | "hevc" | "hevc_nvenc" | "hevc_vaapi" => "hvc1.1.6.L93.B0".to_string(),
        "libvpx-vp9" | "vp9" => "vp09.00.10.08".to_string(),
        "libaom-av1" | "libsvtav1" | "av1" => "av01.0.04M.08".to_string(),
        other => other.to_string(),
    }
}

/// Codec string for the audio encoder.
pub fn audio_codec_string(encoder: &str) -> &'static str {
    match encoder {
        "aac" | "libfdk_aac" => "mp4a.40.2",
        "ac3" => "ac-3",
        "eac3" => "ec-3",
        "libopus" | "opus" => "Opus",
        "libmp3lame" | "mp3" => "mp4a.40.34",
        "flac" => "flac",
        _ => "mp4a.40.2",
    }
}

/// Combined CODECS attribute for an HLS variant.
pub fn variant_codecs(video_encoder: &str, audio_encoder: &str, profile: &EncoderProfile) -> String {
    format!(
        "{},{}",
        video_codec_string(video_encoder, profile),
        audio_codec_string(audio_encoder)
    )
}

/// H.264 avc1.PPCCLL string with profile and level estimated from the
/// output resolution.
fn h264_codec_string(width: u32, height: u32) -> String {
    let pixels = width * height;
    let profile_byte: u8 = if pixels <= 130_000 {
        0x42 // Baseline
    } else if pixels <= 921_600 {
        0x4d // Main
    } else {
        0x64 // High
    };
    // Decimal level (e.g. 31 for 3.1) maps directly onto the level byte
    let level_byte: u8 = if pixels <= 130_000 {
        21
    } else if pixels <= 414_720 {
        30
    } else if pixels <= 921_600 {
        31
    } else if pixels <= 2_073_600 {
        40
    } else {
        51
    };
    format!("avc1.{:02x}00{:02x}", profile_byte, level_byte)
}

/// Peak BANDWIDTH for an HLS variant.
///
/// The declared value must cover the peak segment bitrate, which the
/// nominal encoder bitrates underestimate, so a generous margin is
/// applied on top of video + audio.
pub fn variant_bandwidth(video_bitrate_kbps: u32, audio_bitrate_kbps: u32) -> u64 {
    let nominal = (video_bitrate_kbps as u64 + audio_bitrate_kbps as u64) * 1000;
    nominal * 160 / 100
}
