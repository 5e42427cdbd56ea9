//! Adaptive segment planning
//!
//! Produces a segmentation plan for an input: segment boundaries
//! modulated by scene complexity and snapped to keyframes where one is
//! close enough. The planner is pure: it consumes the keyframe index
//! and complexity series produced by the analysis module and never
//! touches session state.

use crate::analysis::KeyframeInfo;
use crate::config::SegmentConfig;

/// One planned segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSizeDecision {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds; equals the start of the next segment
    pub end: f64,
    /// end - start
    pub duration: f64,
    /// Mean complexity over the segment, in [0, 1]
    pub complexity: f64,
    /// Complexity shifted sharply across the segment
    pub scene_change: bool,
    /// End was snapped onto a keyframe
    pub keyframe_aligned: bool,
    /// Human-readable summary of the decision
    pub reason: String,
}

/// A complete segmentation plan
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveSegmentPlan {
    pub segments: Vec<SegmentSizeDecision>,
    pub total_duration: f64,
    /// Aggregate quality of the plan, in [0, 1]
    pub optimization_score: f64,
}

impl AdaptiveSegmentPlan {
    /// Segment start times, used as forced keyframe boundaries.
    pub fn boundaries(&self) -> Vec<f64> {
        self.segments.iter().map(|s| s.start).collect()
    }

    /// Per-segment durations in plan order.
    pub fn durations(&self) -> Vec<f64> {
        self.segments.iter().map(|s| s.duration).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }
}

/// Sampled complexity at a point in time; neutral when no data covers it.
fn complexity_at(complexity: &[f64], t: f64) -> f64 {
    complexity
        .get(t.max(0.0) as usize)
        .copied()
        .unwrap_or(0.5)
}

/// Mean complexity over a time range.
fn complexity_mean(complexity: &[f64], start: f64, end: f64) -> f64 {
    let first = start.max(0.0) as usize;
    let last = (end.max(start) as usize).max(first);
    let window: Vec<f64> = (first..=last)
        .filter_map(|i| complexity.get(i).copied())
        .collect();
    if window.is_empty() {
        return 0.5;
    }
    window.iter().sum::<f64>() / window.len() as f64
}

/// Duration modulation: below the threshold segments stretch, above it
/// they shrink.
fn adaptive_duration(c: f64, cfg: &SegmentConfig) -> f64 {
    let factor = if c < cfg.complexity_threshold {
        1.0 + (cfg.complexity_threshold - c) * cfg.complexity_multiplier * 0.5
    } else {
        1.0 - (c - cfg.complexity_threshold) * cfg.complexity_multiplier
    };
    (cfg.base_duration_secs * factor).clamp(cfg.min_duration_secs, cfg.max_duration_secs)
}

/// Compute a segmentation plan.
///
/// With an empty keyframe index or complexity series the plan degrades
/// gracefully: no snapping, neutral complexity, uniform durations.
pub fn plan_segments(
    total_duration: f64,
    keyframes: &[KeyframeInfo],
    complexity: &[f64],
    cfg: &SegmentConfig,
) -> AdaptiveSegmentPlan {
    let mut segments: Vec<SegmentSizeDecision> = Vec::new();

    if total_duration <= 0.0 {
        return AdaptiveSegmentPlan {
            segments,
            total_duration: 0.0,
            optimization_score: 0.0,
        };
    }

    let mut start = 0.0;
    while start < total_duration && segments.len() < cfg.max_plan_segments {
        let c = complexity_at(complexity, start);
        let target_duration = adaptive_duration(c, cfg);
        let target_end = (start + target_duration).min(total_duration);

        // Snap to the keyframe closest to the target, but only when it
        // lies within half a base duration and keeps the segment legal
        let mut end = target_end;
        let mut aligned = false;
        if let Some(kf) = closest_keyframe(keyframes, start + target_duration) {
            let snapped_duration = kf - start;
            if (kf - (start + target_duration)).abs() <= cfg.base_duration_secs / 2.0
                && snapped_duration >= cfg.min_duration_secs
                && snapped_duration <= cfg.max_duration_secs
                && kf <= total_duration
            {
                end = kf;
                aligned = true;
            }
        }

        // Fold a sub-minimum tail into this segment instead of
        // emitting a short trailing segment
        let remaining_after = total_duration - end;
        if remaining_after > 0.0
            && remaining_after < cfg.min_duration_secs
            && (total_duration - start) <= cfg.max_duration_secs
        {
            end = total_duration;
            aligned = false;
        }

        let duration = end - start;
        let segment_complexity = complexity_mean(complexity, start, end);
        let first_second = complexity_at(complexity, start);
        let last_second = complexity_at(complexity, (end - 1.0).max(start));
        let scene_change = (first_second - last_second).abs() > cfg.scene_change_threshold;

        let mut reason = if c > cfg.complexity_threshold {
            "high complexity".to_string()
        } else if c < cfg.complexity_threshold {
            "low complexity".to_string()
        } else {
            "baseline".to_string()
        };
        if aligned {
            reason.push_str(", keyframe aligned");
        }
        if scene_change {
            reason.push_str(", scene change");
        }

        segments.push(SegmentSizeDecision {
            start,
            end,
            duration,
            complexity: segment_complexity,
            scene_change,
            keyframe_aligned: aligned,
            reason,
        });
        start = end;
    }

    let optimization_score = optimization_score(&segments, cfg);
    AdaptiveSegmentPlan {
        segments,
        total_duration,
        optimization_score,
    }
}

/// The keyframe timestamp closest to `target`, strictly after 0.
fn closest_keyframe(keyframes: &[KeyframeInfo], target: f64) -> Option<f64> {
    keyframes
        .iter()
        .filter(|kf| kf.timestamp > 0.0)
        .min_by(|a, b| {
            let da = (a.timestamp - target).abs();
            let db = (b.timestamp - target).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|kf| kf.timestamp)
}

/// Weighted plan quality:
///   0.40 keyframe alignment, 0.30 duration consistency,
///   0.20 complexity responsiveness, 0.10 scene-change bonus.
fn optimization_score(segments: &[SegmentSizeDecision], cfg: &SegmentConfig) -> f64 {
    if segments.is_empty() {
        return 0.0;
    }
    let n = segments.len() as f64;

    let aligned = segments.iter().filter(|s| s.keyframe_aligned).count() as f64 / n;

    let mean_duration = segments.iter().map(|s| s.duration).sum::<f64>() / n;
    let variance = segments
        .iter()
        .map(|s| (s.duration - mean_duration).powi(2))
        .sum::<f64>()
        / n;
    let consistency = 1.0 / (1.0 + variance);

    let responsive = segments
        .iter()
        .filter(|s| {
            if s.complexity > cfg.complexity_threshold {
                s.duration < cfg.base_duration_secs
            } else {
                s.duration >= cfg.base_duration_secs
            }
        })
        .count() as f64
        / n;

    let scene_fraction = segments.iter().filter(|s| s.scene_change).count() as f64 / n;
    let scene_bonus = 0.1 * (1.0 - scene_fraction);

    0.4 * aligned + 0.3 * consistency + 0.2 * responsive + scene_bonus
}
