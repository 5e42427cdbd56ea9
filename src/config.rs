//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root data directory; sessions and content live beneath it
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl PathsConfig {
    /// Directory holding per-session output
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Directory holding the content-addressable store
    pub fn content_dir(&self) -> PathBuf {
        self.data_dir.join("content")
    }
}

/// Encoder process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_path: String,

    /// Path to the ffprobe binary
    pub ffprobe_path: String,

    /// No progress for this long means the process has stalled
    pub stall_timeout_secs: u64,

    /// Grace period after start before stall detection kicks in
    pub startup_grace_secs: u64,

    /// Interval of the per-process health ticker
    pub health_tick_secs: u64,

    /// How long to wait for a cancelled process to exit before killing it
    pub stop_grace_millis: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            stall_timeout_secs: 30,
            startup_grace_secs: 10,
            health_tick_secs: 10,
            stop_grace_millis: 500,
        }
    }
}

/// Segmentation configuration
///
/// Drives both the adaptive segment planner and the segment discovery
/// poller watching the encoder output directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Base segment duration in seconds
    pub base_duration_secs: f64,

    /// Minimum adaptive segment duration
    pub min_duration_secs: f64,

    /// Maximum adaptive segment duration
    pub max_duration_secs: f64,

    /// Complexity above this shortens segments, below lengthens them
    pub complexity_threshold: f64,

    /// Strength of the complexity modulation
    pub complexity_multiplier: f64,

    /// Complexity delta across a segment that flags a scene change
    pub scene_change_threshold: f64,

    /// Safety cap on the number of planned segments
    pub max_plan_segments: usize,

    /// Output directory poll interval in milliseconds
    pub poll_interval_millis: u64,

    /// Delay between the two size-stability stat calls
    pub stability_recheck_millis: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            base_duration_secs: 4.0,
            min_duration_secs: 2.0,
            max_duration_secs: 10.0,
            complexity_threshold: 0.5,
            complexity_multiplier: 0.3,
            scene_change_threshold: 0.4,
            max_plan_segments: 1000,
            poll_interval_millis: 500,
            stability_recheck_millis: 100,
        }
    }
}

/// Segment prefetcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Segments to buffer before playback starts
    pub initial_segments: usize,

    /// Maximum buffered segments per content fingerprint
    pub buffer_size: usize,

    /// How far ahead of the playback position to prefetch
    pub prefetch_distance: usize,

    /// Skip prefetching when this fraction of the window is buffered
    pub buffer_threshold: f64,

    /// Number of prefetch worker tasks
    pub workers: usize,

    /// Prefetch queue capacity; tasks beyond it are dropped
    pub queue_capacity: usize,

    /// Ceiling on the startup prefetch wait in seconds
    pub startup_timeout_secs: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            initial_segments: 3,
            buffer_size: 10,
            prefetch_distance: 5,
            buffer_threshold: 0.3,
            workers: 3,
            queue_capacity: 100,
            startup_timeout_secs: 10,
        }
    }
}

/// Packager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagerConfig {
    /// Number of packager worker tasks
    pub workers: usize,

    /// Segment admission queue capacity
    pub queue_capacity: usize,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 100,
        }
    }
}

/// Health monitor and circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval of the periodic health check task
    pub check_interval_secs: u64,

    /// Consecutive failures before a session is degraded
    pub degraded_failures: u32,

    /// Consecutive failures before a session is unhealthy
    pub unhealthy_failures: u32,

    /// Seconds without a produced segment before a session is degraded
    pub stall_degraded_secs: u64,

    /// Seconds without a produced segment before a session is unhealthy
    pub stall_unhealthy_secs: u64,

    /// Alert threshold: consecutive errors
    pub max_consecutive_errors: u32,

    /// Alert threshold: stall duration in seconds
    pub max_stall_secs: u64,

    /// Alert threshold: rolling encode fps
    pub min_fps: f64,

    /// Alert threshold: average segment encode time in seconds
    pub max_encode_time_secs: f64,

    /// Alert threshold: failed/total segment ratio
    pub max_failure_rate: f64,

    /// Consecutive failures before a fingerprint's circuit opens
    pub circuit_failure_threshold: u32,

    /// How long an opened circuit rejects requests
    pub circuit_open_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            degraded_failures: 3,
            unhealthy_failures: 5,
            stall_degraded_secs: 30,
            stall_unhealthy_secs: 60,
            max_consecutive_errors: 5,
            max_stall_secs: 60,
            min_fps: 10.0,
            max_encode_time_secs: 30.0,
            max_failure_rate: 0.5,
            circuit_failure_threshold: 5,
            circuit_open_secs: 60,
        }
    }
}

/// Content store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Days a stored content entry is retained past its last access
    pub retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Enable CORS
    pub cors_enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Filesystem layout
    pub paths: PathsConfig,

    /// Encoder process settings
    pub ffmpeg: FfmpegConfig,

    /// Segmentation settings
    pub segment: SegmentConfig,

    /// Prefetcher settings
    pub prefetch: PrefetchConfig,

    /// Packager settings
    pub packager: PackagerConfig,

    /// Health monitor settings
    pub health: HealthConfig,

    /// Content store settings
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_enabled: true,
            log_level: "info".to_string(),
            paths: PathsConfig::default(),
            ffmpeg: FfmpegConfig::default(),
            segment: SegmentConfig::default(),
            prefetch: PrefetchConfig::default(),
            packager: PackagerConfig::default(),
            health: HealthConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.segment.base_duration_secs, 4.0);
        assert_eq!(config.prefetch.buffer_size, 10);
        assert_eq!(config.packager.workers, 4);
        assert_eq!(config.health.check_interval_secs, 30);
    }

    #[test]
    fn test_socket_addr() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(config.socket_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_paths_layout() {
        let paths = PathsConfig {
            data_dir: PathBuf::from("/var/lib/transcode"),
        };
        assert_eq!(paths.sessions_dir(), PathBuf::from("/var/lib/transcode/sessions"));
        assert_eq!(paths.content_dir(), PathBuf::from("/var/lib/transcode/content"));
    }
}
