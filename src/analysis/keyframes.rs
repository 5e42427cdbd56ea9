//! Keyframe extraction
//!
//! Turns the raw video packet list into an ordered keyframe index.
//! Timestamps are normalized so the first keyframe sits at 0, and any
//! out-of-order packet is dropped so the series is strictly increasing.

use super::RawPacket;

/// One keyframe of the input video stream
#[derive(Debug, Clone, PartialEq)]
pub struct KeyframeInfo {
    /// Ordinal of this keyframe, from 0
    pub index: usize,
    /// Presentation time in seconds, normalized to start at 0
    pub timestamp: f64,
    /// Byte offset of the packet in the file
    pub byte_offset: u64,
    /// Packet size in bytes
    pub size: u64,
}

pub(crate) fn keyframes_from_packets(packets: &[RawPacket]) -> Vec<KeyframeInfo> {
    let mut keyframes = Vec::new();
    let mut origin: Option<f64> = None;
    let mut last_ts = f64::NEG_INFINITY;

    for packet in packets {
        let is_key = packet
            .flags
            .as_deref()
            .map(|f| f.contains('K'))
            .unwrap_or(false);
        if !is_key {
            continue;
        }
        let Some(pts) = packet.pts_time.as_deref().and_then(|t| t.parse::<f64>().ok()) else {
            continue;
        };

        let origin = *origin.get_or_insert(pts);
        let timestamp = pts - origin;
        if timestamp <= last_ts && !keyframes.is_empty() {
            continue;
        }
        last_ts = timestamp;

        keyframes.push(KeyframeInfo {
            index: keyframes.len(),
            timestamp,
            byte_offset: packet.pos.as_deref().and_then(|p| p.parse().ok()).unwrap_or(0),
            size: packet.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
        });
    }

    keyframes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::packet;

    #[test]
    fn test_keyframes_extracted_in_order() {
        let packets = vec![
            packet(0.0, 48, 10_000, true),
            packet(0.033, 10_048, 500, false),
            packet(2.0, 20_000, 9_000, true),
            packet(2.033, 29_000, 400, false),
            packet(4.0, 40_000, 11_000, true),
        ];
        let keyframes = keyframes_from_packets(&packets);

        assert_eq!(keyframes.len(), 3);
        assert_eq!(keyframes[0].index, 0);
        assert_eq!(keyframes[0].timestamp, 0.0);
        assert_eq!(keyframes[1].timestamp, 2.0);
        assert_eq!(keyframes[2].timestamp, 4.0);
        assert_eq!(keyframes[2].byte_offset, 40_000);
    }

    #[test]
    fn test_timestamps_normalized_to_zero() {
        // Streams often start at a nonzero pts
        let packets = vec![packet(1.4, 0, 100, true), packet(5.4, 100, 100, true)];
        let keyframes = keyframes_from_packets(&packets);
        assert_eq!(keyframes[0].timestamp, 0.0);
        assert!((keyframes[1].timestamp - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_increasing_timestamps_dropped() {
        let packets = vec![
            packet(0.0, 0, 100, true),
            packet(2.0, 100, 100, true),
            packet(1.5, 200, 100, true),
            packet(4.0, 300, 100, true),
        ];
        let keyframes = keyframes_from_packets(&packets);
        let timestamps: Vec<f64> = keyframes.iter().map(|k| k.timestamp).collect();
        assert_eq!(timestamps, vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn test_no_keyframes() {
        let packets = vec![packet(0.0, 0, 100, false)];
        assert!(keyframes_from_packets(&packets).is_empty());
    }
}
