//! Segment prefetcher / buffer cache
//!
//! Keeps a bounded per-fingerprint LRU buffer of segment payloads,
//! serves segment reads with low latency, and speculatively loads the
//! segments a viewer is about to need. A small worker pool drains a
//! bounded priority queue; work that does not fit in the queue is
//! dropped and retried on the next playback-position update.

pub mod buffer;
pub mod queue;

pub use buffer::{BufferedSegment, FingerprintBuffer};
pub use queue::{PrefetchQueue, PrefetchTask};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::PrefetchConfig;
use crate::error::Result;

/// Where segment bytes come from: the active session directory while
/// encoding, the content store afterwards.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn read_segment(&self, fingerprint: &str, index: usize) -> Result<Bytes>;
}

/// Aggregate prefetcher metrics
#[derive(Debug, Clone, Serialize)]
pub struct PrefetchMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub prefetched_segments: u64,
    pub prefetched_bytes: u64,
    pub buffered_segments: usize,
    pub buffered_bytes: usize,
    pub queue_len: usize,
}

/// Buffer state snapshot for one fingerprint
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub buffered_segments: usize,
    pub buffered_bytes: usize,
    pub current_position: usize,
    pub is_playing: bool,
    pub playback_speed: f64,
    pub buffered_indices: Vec<usize>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    prefetched_segments: AtomicU64,
    prefetched_bytes: AtomicU64,
}

/// The prefetcher facade shared across sessions
pub struct SegmentPrefetcher {
    config: PrefetchConfig,
    buffers: DashMap<String, Arc<Mutex<FingerprintBuffer>>>,
    queue: Arc<PrefetchQueue>,
    source: Arc<dyn SegmentSource>,
    counters: Arc<Counters>,
    ctx: CancellationToken,
}

impl SegmentPrefetcher {
    /// Create the prefetcher and spawn its worker pool.
    pub fn new(config: PrefetchConfig, source: Arc<dyn SegmentSource>) -> Arc<Self> {
        let prefetcher = Arc::new(Self {
            queue: Arc::new(PrefetchQueue::new(config.queue_capacity)),
            config,
            buffers: DashMap::new(),
            source,
            counters: Arc::new(Counters::default()),
            ctx: CancellationToken::new(),
        });

        for worker_id in 0..prefetcher.config.workers {
            let this = prefetcher.clone();
            tokio::spawn(async move {
                this.worker_loop(worker_id).await;
            });
        }
        prefetcher
    }

    async fn worker_loop(&self, worker_id: usize) {
        loop {
            let task = tokio::select! {
                _ = self.ctx.cancelled() => break,
                task = self.queue.pop() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let buffer = self.buffer_entry(&task.fingerprint);
            if buffer.lock().contains(task.index) {
                continue;
            }

            match self.source.read_segment(&task.fingerprint, task.index).await {
                Ok(bytes) => {
                    let size = bytes.len();
                    buffer.lock().insert(task.index, bytes);
                    self.counters.prefetched_segments.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .prefetched_bytes
                        .fetch_add(size as u64, Ordering::Relaxed);
                    tracing::trace!(
                        worker_id,
                        fingerprint = %task.fingerprint,
                        index = task.index,
                        size,
                        "Prefetched segment"
                    );
                }
                Err(e) => {
                    // Prefetch errors never block the queue
                    tracing::debug!(
                        fingerprint = %task.fingerprint,
                        index = task.index,
                        "Prefetch failed: {}",
                        e
                    );
                }
            }
        }
    }

    fn buffer_entry(&self, fingerprint: &str) -> Arc<Mutex<FingerprintBuffer>> {
        self.buffers
            .entry(fingerprint.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(FingerprintBuffer::new(self.config.buffer_size)))
            })
            .clone()
    }

    /// Buffer the first segments of a content before playback starts.
    ///
    /// Enqueues the initial window with strictly decreasing priority
    /// and waits (bounded) until the window is buffered. Partial
    /// progress is not an error; the call returns after the ceiling
    /// even if some segments are still missing.
    pub async fn prefetch_for_startup(&self, fingerprint: &str) {
        let initial = self.config.initial_segments;
        let buffer = self.buffer_entry(fingerprint);

        for index in 0..initial {
            let pushed = self.queue.push(PrefetchTask {
                fingerprint: fingerprint.to_string(),
                index,
                priority: 100 - index as i32,
            });
            if !pushed {
                tracing::debug!(fingerprint = %fingerprint, index, "Startup prefetch task dropped");
            }
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.startup_timeout_secs);
        loop {
            let buffered = {
                let guard = buffer.lock();
                (0..initial).filter(|i| guard.contains(*i)).count()
            };
            if buffered >= initial || Instant::now() >= deadline {
                if buffered < initial {
                    tracing::warn!(
                        fingerprint = %fingerprint,
                        buffered,
                        initial,
                        "Startup prefetch hit its ceiling with a partial buffer"
                    );
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Record a viewer position update and, if playback is ongoing and
    /// the position moved, run one adaptive prefetch step. Never
    /// blocks on segment loads.
    pub fn update_playback_position(
        &self,
        fingerprint: &str,
        index: usize,
        is_playing: bool,
        speed: f64,
    ) {
        let buffer = self.buffer_entry(fingerprint);
        let tasks = {
            let mut guard = buffer.lock();
            let moved = guard.current_position != index;
            guard.current_position = index;
            guard.is_playing = is_playing;
            guard.playback_speed = speed;
            guard.last_access = Instant::now();
            guard.mark_recent(index);

            if !(is_playing && moved) {
                Vec::new()
            } else {
                self.adaptive_tasks(fingerprint, &guard)
            }
        };

        for task in tasks {
            if !self.queue.push(task) {
                // Queue is full; the next update retries
                break;
            }
        }
    }

    /// Missing segments in the prefetch window, closest first, skipped
    /// entirely when the window is already sufficiently buffered.
    fn adaptive_tasks(&self, fingerprint: &str, buffer: &FingerprintBuffer) -> Vec<PrefetchTask> {
        let distance = self.config.prefetch_distance;
        let position = buffer.current_position;
        let buffered = buffer.buffered_ahead(position, distance);
        if distance == 0 || buffered as f64 / distance as f64 > self.config.buffer_threshold {
            return Vec::new();
        }

        (1..=distance)
            .filter_map(|offset| {
                let index = position + offset;
                if buffer.contains(index) {
                    return None;
                }
                Some(PrefetchTask {
                    fingerprint: fingerprint.to_string(),
                    index,
                    priority: 50 - offset as i32,
                })
            })
            .collect()
    }

    /// Serve one segment: buffer hit, or synchronous load-and-insert.
    pub async fn get_segment(&self, fingerprint: &str, index: usize) -> Result<Bytes> {
        let buffer = self.buffer_entry(fingerprint);
        if let Some(bytes) = buffer.lock().get(index) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(bytes);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let bytes = self.source.read_segment(fingerprint, index).await?;
        buffer.lock().insert(index, bytes.clone());
        Ok(bytes)
    }

    /// Drop buffers that nothing has touched within `max_age`.
    pub fn cleanup_stale_buffers(&self, max_age: Duration) -> usize {
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| buffer.lock().last_access.elapsed() <= max_age);
        before - self.buffers.len()
    }

    /// Discard buffered data and pending work for one fingerprint.
    pub fn discard(&self, fingerprint: &str) {
        self.queue.discard_fingerprint(fingerprint);
        self.buffers.remove(fingerprint);
    }

    /// Snapshot of one fingerprint's buffer state.
    pub fn buffer_status(&self, fingerprint: &str) -> Option<BufferStatus> {
        let buffer = self.buffers.get(fingerprint)?;
        let guard = buffer.lock();
        Some(BufferStatus {
            buffered_segments: guard.len(),
            buffered_bytes: guard.total_size,
            current_position: guard.current_position,
            is_playing: guard.is_playing,
            playback_speed: guard.playback_speed,
            buffered_indices: guard.buffered_indices(),
        })
    }

    /// Aggregate metrics across all fingerprints.
    pub fn metrics(&self) -> PrefetchMetrics {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        let mut buffered_segments = 0;
        let mut buffered_bytes = 0;
        for entry in self.buffers.iter() {
            let guard = entry.value().lock();
            buffered_segments += guard.len();
            buffered_bytes += guard.total_size;
        }

        PrefetchMetrics {
            cache_hits: hits,
            cache_misses: misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            prefetched_segments: self.counters.prefetched_segments.load(Ordering::Relaxed),
            prefetched_bytes: self.counters.prefetched_bytes.load(Ordering::Relaxed),
            buffered_segments,
            buffered_bytes,
            queue_len: self.queue.len(),
        }
    }

    /// Stop workers and release all buffers.
    pub fn shutdown(&self) {
        self.ctx.cancel();
        self.queue.close();
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapSource {
        segments: HashMap<(String, usize), Bytes>,
        loads: AtomicU64,
    }

    impl MapSource {
        fn with_segments(fingerprint: &str, count: usize) -> Self {
            let mut segments = HashMap::new();
            for index in 0..count {
                segments.insert(
                    (fingerprint.to_string(), index),
                    Bytes::from(format!("segment-{}", index)),
                );
            }
            Self {
                segments,
                loads: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl SegmentSource for MapSource {
        async fn read_segment(&self, fingerprint: &str, index: usize) -> Result<Bytes> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.segments
                .get(&(fingerprint.to_string(), index))
                .cloned()
                .ok_or_else(|| crate::error::PipelineError::Storage(format!(
                    "missing segment {} for {}",
                    index, fingerprint
                )))
        }
    }

    const FP: &str = "cafe0000000000000000000000000000000000000000000000000000000000aa";

    fn test_config() -> PrefetchConfig {
        PrefetchConfig {
            startup_timeout_secs: 2,
            ..PrefetchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_startup_prefetch_buffers_initial_window() {
        let source = Arc::new(MapSource::with_segments(FP, 10));
        let prefetcher = SegmentPrefetcher::new(test_config(), source);

        prefetcher.prefetch_for_startup(FP).await;

        let status = prefetcher.buffer_status(FP).unwrap();
        assert_eq!(status.buffered_segments, 3);
        for index in 0..3 {
            assert!(status.buffered_indices.contains(&index));
        }
    }

    #[tokio::test]
    async fn test_startup_prefetch_partial_is_not_an_error() {
        // Only segment 0 exists; the wait ends at the ceiling
        let source = Arc::new(MapSource::with_segments(FP, 1));
        let config = PrefetchConfig {
            startup_timeout_secs: 1,
            ..test_config()
        };
        let prefetcher = SegmentPrefetcher::new(config, source);

        prefetcher.prefetch_for_startup(FP).await;
        let status = prefetcher.buffer_status(FP).unwrap();
        assert_eq!(status.buffered_segments, 1);
    }

    #[tokio::test]
    async fn test_get_segment_hit_and_miss() {
        let source = Arc::new(MapSource::with_segments(FP, 10));
        let prefetcher = SegmentPrefetcher::new(test_config(), source.clone());

        let bytes = prefetcher.get_segment(FP, 0).await.unwrap();
        assert_eq!(bytes, Bytes::from("segment-0"));
        // Second read is a buffer hit; no extra load
        let loads_after_first = source.loads.load(Ordering::SeqCst);
        prefetcher.get_segment(FP, 0).await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), loads_after_first);

        let metrics = prefetcher.metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
        assert!((metrics.hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_lru_eviction_sequence() {
        let source = Arc::new(MapSource::with_segments(FP, 10));
        let config = PrefetchConfig {
            buffer_size: 3,
            workers: 0,
            ..test_config()
        };
        let prefetcher = SegmentPrefetcher::new(config, source);

        for index in 0..5 {
            prefetcher.get_segment(FP, index).await.unwrap();
        }

        let status = prefetcher.buffer_status(FP).unwrap();
        assert_eq!(status.buffered_segments, 3);
        let mut indices = status.buffered_indices.clone();
        indices.sort_unstable();
        assert_eq!(indices, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_adaptive_prefetch_priorities() {
        let source = Arc::new(MapSource::with_segments(FP, 10));
        // No workers: tasks stay queued so the test can inspect them
        let config = PrefetchConfig {
            workers: 0,
            ..test_config()
        };
        let prefetcher = SegmentPrefetcher::new(config, source);

        prefetcher.get_segment(FP, 0).await.unwrap();
        prefetcher.get_segment(FP, 1).await.unwrap();

        prefetcher.update_playback_position(FP, 1, true, 1.0);

        let mut popped = Vec::new();
        while let Some(task) = {
            let queue = prefetcher.queue.clone();
            tokio::time::timeout(Duration::from_millis(100), queue.pop())
                .await
                .ok()
                .flatten()
        } {
            popped.push((task.index, task.priority));
            if popped.len() == 5 {
                break;
            }
        }

        assert_eq!(popped, vec![(2, 49), (3, 48), (4, 47), (5, 46), (6, 45)]);
    }

    #[tokio::test]
    async fn test_adaptive_prefetch_skipped_when_buffered() {
        let source = Arc::new(MapSource::with_segments(FP, 10));
        let config = PrefetchConfig {
            workers: 0,
            ..test_config()
        };
        let prefetcher = SegmentPrefetcher::new(config, source);

        // Buffer most of the window ahead of position 1
        for index in 2..=5 {
            prefetcher.get_segment(FP, index).await.unwrap();
        }
        // 4 of the next 5 are buffered: 0.8 > threshold 0.3, so no work
        prefetcher.update_playback_position(FP, 1, true, 1.0);
        assert_eq!(prefetcher.metrics().queue_len, 0);
    }

    #[tokio::test]
    async fn test_paused_viewer_does_not_prefetch() {
        let source = Arc::new(MapSource::with_segments(FP, 10));
        let config = PrefetchConfig {
            workers: 0,
            ..test_config()
        };
        let prefetcher = SegmentPrefetcher::new(config, source);

        prefetcher.update_playback_position(FP, 3, false, 1.0);
        assert_eq!(prefetcher.metrics().queue_len, 0);
    }

    #[tokio::test]
    async fn test_cleanup_stale_buffers() {
        let source = Arc::new(MapSource::with_segments(FP, 10));
        let prefetcher = SegmentPrefetcher::new(test_config(), source);

        prefetcher.get_segment(FP, 0).await.unwrap();
        assert_eq!(prefetcher.cleanup_stale_buffers(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(prefetcher.cleanup_stale_buffers(Duration::from_millis(1)), 1);
        assert!(prefetcher.buffer_status(FP).is_none());
    }

    #[tokio::test]
    async fn test_discard_clears_buffer_and_queue() {
        let source = Arc::new(MapSource::with_segments(FP, 10));
        let config = PrefetchConfig {
            workers: 0,
            ..test_config()
        };
        let prefetcher = SegmentPrefetcher::new(config, source);

        prefetcher.get_segment(FP, 0).await.unwrap();
        prefetcher.update_playback_position(FP, 0, true, 1.0);
        assert!(prefetcher.metrics().queue_len > 0);

        prefetcher.discard(FP);
        assert!(prefetcher.buffer_status(FP).is_none());
        assert_eq!(prefetcher.metrics().queue_len, 0);
    }
}
