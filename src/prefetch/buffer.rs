//! Per-fingerprint segment buffer
//!
//! A bounded LRU of segment payloads plus the viewer state that drives
//! prefetch decisions. One instance exists per content fingerprint;
//! each is guarded by its own lock so operations on different contents
//! never contend.

use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Instant;

/// One buffered segment payload
#[derive(Debug, Clone)]
pub struct BufferedSegment {
    pub bytes: Bytes,
    pub size: usize,
    pub loaded_at: Instant,
    pub access_count: u64,
    pub last_access: Instant,
    pub prefetch_score: f64,
}

impl BufferedSegment {
    fn new(bytes: Bytes, prefetch_score: f64) -> Self {
        let now = Instant::now();
        Self {
            size: bytes.len(),
            bytes,
            loaded_at: now,
            access_count: 0,
            last_access: now,
            prefetch_score,
        }
    }

    fn touch(&mut self) {
        self.access_count += 1;
        self.last_access = Instant::now();
    }
}

/// Buffer state for one content fingerprint
pub struct FingerprintBuffer {
    segments: LruCache<usize, BufferedSegment>,
    /// Sum of buffered payload sizes
    pub total_size: usize,
    /// Viewer's current segment index
    pub current_position: usize,
    pub is_playing: bool,
    pub playback_speed: f64,
    /// Last time any operation touched this buffer
    pub last_access: Instant,
}

impl FingerprintBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            segments: LruCache::new(capacity),
            total_size: 0,
            current_position: 0,
            is_playing: false,
            playback_speed: 1.0,
            last_access: Instant::now(),
        }
    }

    /// Insert a segment, evicting the least recently used entry when
    /// the bound is exceeded. Returns the evicted index, if any.
    pub fn insert(&mut self, index: usize, bytes: Bytes) -> Option<usize> {
        let score = self.prefetch_score(index);
        let segment = BufferedSegment::new(bytes, score);
        self.total_size += segment.size;
        self.last_access = Instant::now();

        match self.segments.push(index, segment) {
            Some((old_index, old)) => {
                self.total_size -= old.size;
                if old_index == index {
                    // Same-key replacement, not an eviction
                    None
                } else {
                    tracing::trace!(
                        index = old_index,
                        age_secs = old.loaded_at.elapsed().as_secs_f64(),
                        idle_secs = old.last_access.elapsed().as_secs_f64(),
                        accesses = old.access_count,
                        score = old.prefetch_score,
                        "Evicted buffered segment"
                    );
                    Some(old_index)
                }
            }
            None => None,
        }
    }

    /// Fetch a segment, marking it most recently used.
    pub fn get(&mut self, index: usize) -> Option<Bytes> {
        self.last_access = Instant::now();
        let segment = self.segments.get_mut(&index)?;
        segment.touch();
        Some(segment.bytes.clone())
    }

    /// Mark a segment recently used without reading it.
    pub fn mark_recent(&mut self, index: usize) {
        if let Some(segment) = self.segments.get_mut(&index) {
            segment.touch();
        }
    }

    /// Presence check that does not disturb the LRU order.
    pub fn contains(&self, index: usize) -> bool {
        self.segments.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Count of buffered segments among the `distance` indices after
    /// `position`.
    pub fn buffered_ahead(&self, position: usize, distance: usize) -> usize {
        (position + 1..=position + distance)
            .filter(|i| self.segments.contains(i))
            .count()
    }

    /// Score used for prioritization and logging: closeness to the
    /// viewer boosted when playing forward, scaled by fast playback.
    pub fn prefetch_score(&self, index: usize) -> f64 {
        let distance = index.abs_diff(self.current_position) as f64;
        let mut score = 100.0 / (1.0 + distance);
        if self.is_playing && index > self.current_position {
            score *= 1.5;
        }
        if self.playback_speed > 1.0 {
            score *= self.playback_speed;
        }
        score
    }

    /// Indices currently buffered, most recently used first.
    pub fn buffered_indices(&self) -> Vec<usize> {
        self.segments.iter().map(|(i, _)| *i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 16])
    }

    #[test]
    fn test_insert_and_get() {
        let mut buffer = FingerprintBuffer::new(10);
        assert!(buffer.is_empty());
        buffer.insert(0, payload(0));

        assert!(buffer.contains(0));
        assert_eq!(buffer.get(0).unwrap(), payload(0));
        assert_eq!(buffer.total_size, 16);
        assert!(!buffer.contains(1));
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut buffer = FingerprintBuffer::new(3);
        for i in 0..5 {
            buffer.insert(i, payload(i as u8));
        }

        // 0 and 1 were least recently used and must be gone
        assert!(!buffer.contains(0));
        assert!(!buffer.contains(1));
        assert!(buffer.contains(2));
        assert!(buffer.contains(3));
        assert!(buffer.contains(4));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.total_size, 48);
    }

    #[test]
    fn test_get_refreshes_lru_position() {
        let mut buffer = FingerprintBuffer::new(3);
        buffer.insert(0, payload(0));
        buffer.insert(1, payload(1));
        buffer.insert(2, payload(2));

        // Touch 0 so 1 becomes the eviction victim
        buffer.get(0);
        buffer.insert(3, payload(3));

        assert!(buffer.contains(0));
        assert!(!buffer.contains(1));
    }

    #[test]
    fn test_same_key_replacement_is_not_eviction() {
        let mut buffer = FingerprintBuffer::new(3);
        buffer.insert(0, payload(0));
        let evicted = buffer.insert(0, Bytes::from(vec![9; 32]));

        assert!(evicted.is_none());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.total_size, 32);
    }

    #[test]
    fn test_total_size_tracks_evictions() {
        let mut buffer = FingerprintBuffer::new(2);
        buffer.insert(0, payload(0));
        buffer.insert(1, payload(1));
        let evicted = buffer.insert(2, payload(2));

        assert_eq!(evicted, Some(0));
        assert_eq!(buffer.total_size, 32);
    }

    #[test]
    fn test_buffered_ahead() {
        let mut buffer = FingerprintBuffer::new(10);
        buffer.insert(2, payload(2));
        buffer.insert(3, payload(3));
        buffer.insert(6, payload(6));

        // Window after position 1 covers 2..=6
        assert_eq!(buffered(&buffer, 1, 5), 3);
        assert_eq!(buffered(&buffer, 3, 2), 0);
        assert_eq!(buffered(&buffer, 5, 1), 1);
    }

    fn buffered(buffer: &FingerprintBuffer, position: usize, distance: usize) -> usize {
        buffer.buffered_ahead(position, distance)
    }

    #[test]
    fn test_prefetch_score() {
        let mut buffer = FingerprintBuffer::new(10);
        buffer.current_position = 4;

        // Closer segments score higher
        assert!(buffer.prefetch_score(5) > buffer.prefetch_score(8));
        // Symmetric distance when paused
        assert_eq!(buffer.prefetch_score(3), buffer.prefetch_score(5));

        buffer.is_playing = true;
        // Ahead of a playing viewer beats behind
        assert!(buffer.prefetch_score(5) > buffer.prefetch_score(3));

        let paused_score = {
            buffer.is_playing = false;
            buffer.prefetch_score(5)
        };
        buffer.is_playing = true;
        buffer.playback_speed = 2.0;
        assert!(buffer.prefetch_score(5) > paused_score * 2.0);
    }

    #[test]
    fn test_access_count() {
        let mut buffer = FingerprintBuffer::new(10);
        buffer.insert(0, payload(0));
        buffer.get(0);
        buffer.get(0);
        buffer.mark_recent(0);

        let indices = buffer.buffered_indices();
        assert_eq!(indices, vec![0]);
    }
}
