//! Content fingerprinting
//!
//! A fingerprint deterministically identifies a transcode output. It is
//! both the content-store key and the deduplication key: two requests
//! that would produce the same output hash to the same 64-hex string.

use sha2::{Digest, Sha256};

use crate::session::TranscodeRequest;

/// Compute the content fingerprint for a request.
///
/// Inputs are the media identity (media-id, or the input path when the
/// id is empty), the container, the quality level, and the resolution.
/// Codec and bitrate knobs are deliberately excluded so requests that
/// differ only in encoder tuning still deduplicate.
pub fn fingerprint_request(request: &TranscodeRequest) -> String {
    let identity = if request.media_id.is_empty() {
        request.input_path.to_string_lossy().into_owned()
    } else {
        request.media_id.clone()
    };

    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(b"\n");
    hasher.update(request.container.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(request.quality.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(request.resolution.to_string().as_bytes());

    hex::encode(hasher.finalize())
}

/// The two-character shard prefix of a fingerprint, used as the first
/// directory level of the content store.
pub fn shard_prefix(fingerprint: &str) -> &str {
    &fingerprint[..2.min(fingerprint.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{test_request, Container, Resolution};

    #[test]
    fn test_fingerprint_deterministic() {
        let a = test_request(Container::Dash);
        let b = test_request(Container::Dash);
        assert_eq!(fingerprint_request(&a), fingerprint_request(&b));
    }

    #[test]
    fn test_fingerprint_is_64_hex() {
        let fp = fingerprint_request(&test_request(Container::Dash));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_varies_with_identity_fields() {
        let base = test_request(Container::Dash);

        let mut other = base.clone();
        other.container = Container::Hls;
        assert_ne!(fingerprint_request(&base), fingerprint_request(&other));

        let mut other = base.clone();
        other.quality = 50;
        assert_ne!(fingerprint_request(&base), fingerprint_request(&other));

        let mut other = base.clone();
        other.resolution = Resolution {
            width: 1920,
            height: 1080,
        };
        assert_ne!(fingerprint_request(&base), fingerprint_request(&other));
    }

    #[test]
    fn test_fingerprint_ignores_tuning_fields() {
        let base = test_request(Container::Dash);

        let mut other = base.clone();
        other.video_bitrate = 8000;
        other.audio_bitrate = 256;
        other.video_codec = "libx265".to_string();
        other.prefer_hardware = true;
        assert_eq!(fingerprint_request(&base), fingerprint_request(&other));
    }

    #[test]
    fn test_fingerprint_input_path_fallback() {
        let mut a = test_request(Container::Dash);
        a.media_id = String::new();
        let mut b = a.clone();
        b.input_path = "/media/B.mp4".into();
        assert_ne!(fingerprint_request(&a), fingerprint_request(&b));
    }

    #[test]
    fn test_shard_prefix() {
        let fp = fingerprint_request(&test_request(Container::Dash));
        assert_eq!(shard_prefix(&fp), &fp[..2]);
    }
}
