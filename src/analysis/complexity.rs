//! Scene complexity analysis
//!
//! Produces one complexity score per second of input, in [0, 1]. The
//! proxy is the variance of encoded packet sizes within the window
//! normalized by the squared mean: busy scenes produce uneven packet
//! sizes (large I/P frames, small B frames swinging with motion),
//! static scenes compress to a flat series.

use super::RawPacket;

pub(crate) fn complexity_from_packets(packets: &[RawPacket]) -> Vec<f64> {
    let mut samples: Vec<(f64, f64)> = Vec::with_capacity(packets.len());
    let mut origin: Option<f64> = None;

    for packet in packets {
        let Some(pts) = packet.pts_time.as_deref().and_then(|t| t.parse::<f64>().ok()) else {
            continue;
        };
        let Some(size) = packet.size.as_deref().and_then(|s| s.parse::<f64>().ok()) else {
            continue;
        };
        let origin = *origin.get_or_insert(pts);
        let t = pts - origin;
        if t >= 0.0 {
            samples.push((t, size));
        }
    }

    if samples.is_empty() {
        return Vec::new();
    }

    let windows = samples
        .iter()
        .map(|(t, _)| *t as usize)
        .max()
        .unwrap_or(0)
        + 1;
    let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); windows];
    for (t, size) in samples {
        buckets[t as usize].push(size);
    }

    buckets.iter().map(|sizes| window_score(sizes)).collect()
}

/// Variance / mean² of the window's packet sizes, clamped to [0, 1].
fn window_score(sizes: &[f64]) -> f64 {
    if sizes.len() < 2 {
        return 0.0;
    }
    let mean = sizes.iter().sum::<f64>() / sizes.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = sizes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / sizes.len() as f64;
    (variance / (mean * mean)).clamp(0.0, 1.0)
}
