//! Health monitoring
//!
//! Tracks rolling per-session metrics, classifies session health,
//! aggregates overall health, emits threshold alerts, and drives the
//! per-fingerprint circuit breaker. Reads never block writers: every
//! per-session record sits behind its own small lock and snapshots are
//! taken by value.

pub mod circuit;

pub use circuit::{CircuitRegistry, CircuitState};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::HealthConfig;
use crate::ffmpeg::progress::FfmpegProgress;

/// Rolling-window length for encode time / fps / speed samples
const ROLLING_WINDOW: usize = 20;
/// Alerts retained for the debug endpoint
const ALERT_RING: usize = 100;

/// Session health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Error category for `record_error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Ffmpeg,
    Network,
    Storage,
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Error,
    Critical,
}

/// One generated alert
#[derive(Debug, Clone, Serialize)]
pub struct HealthAlert {
    pub severity: AlertSeverity,
    pub session_id: Uuid,
    pub code: &'static str,
    pub message: String,
}

struct SessionHealth {
    fingerprint: String,
    consecutive_failures: u32,
    total_segments: u64,
    failed_segments: u64,
    encode_times: VecDeque<f64>,
    fps_samples: VecDeque<f64>,
    speed_samples: VecDeque<f64>,
    status: HealthStatus,
    last_error: Option<String>,
    last_segment_at: Option<Instant>,
    registered_at: Instant,
}

impl SessionHealth {
    fn new(fingerprint: String) -> Self {
        Self {
            fingerprint,
            consecutive_failures: 0,
            total_segments: 0,
            failed_segments: 0,
            encode_times: VecDeque::with_capacity(ROLLING_WINDOW),
            fps_samples: VecDeque::with_capacity(ROLLING_WINDOW),
            speed_samples: VecDeque::with_capacity(ROLLING_WINDOW),
            status: HealthStatus::Healthy,
            last_error: None,
            last_segment_at: None,
            registered_at: Instant::now(),
        }
    }

    fn push_sample(samples: &mut VecDeque<f64>, value: f64) {
        if samples.len() == ROLLING_WINDOW {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    fn mean(samples: &VecDeque<f64>) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    fn failure_rate(&self) -> f64 {
        let attempts = self.total_segments + self.failed_segments;
        if attempts == 0 {
            return 0.0;
        }
        self.failed_segments as f64 / attempts as f64
    }

    fn seconds_since_segment(&self) -> u64 {
        self.last_segment_at
            .unwrap_or(self.registered_at)
            .elapsed()
            .as_secs()
    }

    /// Status is a pure function of failures and stall time.
    fn classify(&self, config: &HealthConfig) -> HealthStatus {
        if self.consecutive_failures >= config.unhealthy_failures {
            return HealthStatus::Unhealthy;
        }
        if self.consecutive_failures >= config.degraded_failures {
            return HealthStatus::Degraded;
        }
        let stall = self.seconds_since_segment();
        if stall >= config.stall_unhealthy_secs {
            return HealthStatus::Unhealthy;
        }
        if stall >= config.stall_degraded_secs {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }
}

/// Serializable snapshot of one session's health
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealthSnapshot {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub total_segments: u64,
    pub failed_segments: u64,
    pub failure_rate: f64,
    pub avg_encode_time_secs: Option<f64>,
    pub avg_fps: Option<f64>,
    pub avg_speed: Option<f64>,
    pub last_error: Option<String>,
}

/// The health monitor shared across sessions
pub struct HealthMonitor {
    config: HealthConfig,
    sessions: DashMap<Uuid, Mutex<SessionHealth>>,
    circuits: CircuitRegistry,
    alerts: Mutex<VecDeque<HealthAlert>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let circuits = CircuitRegistry::new(
            config.circuit_failure_threshold,
            Duration::from_secs(config.circuit_open_secs),
        );
        Self {
            config,
            sessions: DashMap::new(),
            circuits,
            alerts: Mutex::new(VecDeque::with_capacity(ALERT_RING)),
        }
    }

    pub fn register_session(&self, session_id: Uuid, fingerprint: &str) {
        self.sessions
            .insert(session_id, Mutex::new(SessionHealth::new(fingerprint.to_string())));
    }

    pub fn unregister_session(&self, session_id: Uuid) {
        self.sessions.remove(&session_id);
    }

    pub fn record_segment_produced(
        &self,
        session_id: Uuid,
        index: usize,
        encode_time: Duration,
        size_bytes: u64,
    ) {
        let Some(entry) = self.sessions.get(&session_id) else {
            return;
        };
        let fingerprint = {
            let mut health = entry.lock();
            health.total_segments += 1;
            health.consecutive_failures = 0;
            health.last_segment_at = Some(Instant::now());
            SessionHealth::push_sample(&mut health.encode_times, encode_time.as_secs_f64());
            health.status = HealthStatus::Healthy;
            tracing::trace!(
                session_id = %session_id,
                index,
                size_bytes,
                encode_secs = encode_time.as_secs_f64(),
                "Segment produced"
            );
            health.fingerprint.clone()
        };
        self.circuits.record_success(&fingerprint);
    }

    pub fn record_segment_failed(&self, session_id: Uuid, index: usize, error: &str) {
        self.record_failure(session_id, error, Some(index));
    }

    pub fn record_error(&self, session_id: Uuid, category: ErrorCategory, error: &str) {
        tracing::warn!(session_id = %session_id, ?category, "Session error: {}", error);
        self.record_failure(session_id, error, None);
    }

    fn record_failure(&self, session_id: Uuid, error: &str, index: Option<usize>) {
        let Some(entry) = self.sessions.get(&session_id) else {
            return;
        };
        let fingerprint = {
            let mut health = entry.lock();
            if index.is_some() {
                health.failed_segments += 1;
            }
            health.consecutive_failures += 1;
            health.last_error = Some(error.to_string());
            health.status = health.classify(&self.config);
            health.fingerprint.clone()
        };
        self.circuits.record_failure(&fingerprint);
    }

    pub fn record_progress(&self, session_id: Uuid, progress: &FfmpegProgress) {
        let Some(entry) = self.sessions.get(&session_id) else {
            return;
        };
        let mut health = entry.lock();
        if progress.fps > 0.0 {
            SessionHealth::push_sample(&mut health.fps_samples, progress.fps);
        }
        if progress.speed > 0.0 {
            SessionHealth::push_sample(&mut health.speed_samples, progress.speed);
        }
    }

    pub fn snapshot(&self, session_id: Uuid) -> Option<SessionHealthSnapshot> {
        let entry = self.sessions.get(&session_id)?;
        let health = entry.lock();
        Some(SessionHealthSnapshot {
            status: health.status,
            consecutive_failures: health.consecutive_failures,
            total_segments: health.total_segments,
            failed_segments: health.failed_segments,
            failure_rate: health.failure_rate(),
            avg_encode_time_secs: SessionHealth::mean(&health.encode_times),
            avg_fps: SessionHealth::mean(&health.fps_samples),
            avg_speed: SessionHealth::mean(&health.speed_samples),
            last_error: health.last_error.clone(),
        })
    }

    pub fn session_status(&self, session_id: Uuid) -> HealthStatus {
        self.sessions
            .get(&session_id)
            .map(|e| e.lock().status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Overall health across all monitored sessions.
    pub fn overall_health(&self) -> HealthStatus {
        let total = self.sessions.len();
        if total == 0 {
            return HealthStatus::Healthy;
        }
        let mut unhealthy = 0usize;
        let mut degraded = 0usize;
        for entry in self.sessions.iter() {
            match entry.value().lock().status {
                HealthStatus::Unhealthy => unhealthy += 1,
                HealthStatus::Degraded => degraded += 1,
                _ => {}
            }
        }
        let unhealthy_fraction = unhealthy as f64 / total as f64;
        if unhealthy_fraction >= 0.5 {
            HealthStatus::Unhealthy
        } else if unhealthy_fraction >= 0.25 || degraded > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Circuit breaker gate consulted by the orchestrator.
    pub fn should_allow_request(&self, fingerprint: &str) -> bool {
        self.circuits.should_allow_request(fingerprint)
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    pub fn recent_alerts(&self) -> Vec<HealthAlert> {
        self.alerts.lock().iter().cloned().collect()
    }

    fn retain_alert(&self, alert: HealthAlert) {
        let mut alerts = self.alerts.lock();
        if alerts.len() == ALERT_RING {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }

    /// Run one health check pass: reclassify stalls, compute overall
    /// health, and generate threshold alerts.
    pub fn check_now(&self) -> (HealthStatus, Vec<HealthAlert>) {
        let mut generated = Vec::new();

        for entry in self.sessions.iter() {
            let session_id = *entry.key();
            let mut health = entry.value().lock();
            // Success resets elsewhere; the checker only worsens status
            let classified = health.classify(&self.config);
            if classified != HealthStatus::Healthy {
                health.status = classified;
            }

            if health.consecutive_failures >= self.config.max_consecutive_errors {
                generated.push(HealthAlert {
                    severity: AlertSeverity::Critical,
                    session_id,
                    code: "consecutive_errors",
                    message: format!(
                        "{} consecutive failures (limit {})",
                        health.consecutive_failures, self.config.max_consecutive_errors
                    ),
                });
            }
            let stall = health.seconds_since_segment();
            if stall > self.config.max_stall_secs {
                generated.push(HealthAlert {
                    severity: AlertSeverity::Error,
                    session_id,
                    code: "stall",
                    message: format!("no segment produced for {}s", stall),
                });
            }
            if let Some(fps) = SessionHealth::mean(&health.fps_samples) {
                if fps < self.config.min_fps {
                    generated.push(HealthAlert {
                        severity: AlertSeverity::Warning,
                        session_id,
                        code: "low_fps",
                        message: format!("rolling fps {:.1} below {:.1}", fps, self.config.min_fps),
                    });
                }
            }
            if let Some(encode) = SessionHealth::mean(&health.encode_times) {
                if encode > self.config.max_encode_time_secs {
                    generated.push(HealthAlert {
                        severity: AlertSeverity::Warning,
                        session_id,
                        code: "slow_encode",
                        message: format!(
                            "average segment encode time {:.1}s above {:.1}s",
                            encode, self.config.max_encode_time_secs
                        ),
                    });
                }
            }
            let failure_rate = health.failure_rate();
            if failure_rate > self.config.max_failure_rate
                && health.total_segments + health.failed_segments > 0
            {
                generated.push(HealthAlert {
                    severity: AlertSeverity::Error,
                    session_id,
                    code: "failure_rate",
                    message: format!(
                        "failure rate {:.0}% above {:.0}%",
                        failure_rate * 100.0,
                        self.config.max_failure_rate * 100.0
                    ),
                });
            }
        }

        for alert in &generated {
            match alert.severity {
                AlertSeverity::Warning => {
                    tracing::warn!(session_id = %alert.session_id, code = alert.code, "{}", alert.message)
                }
                _ => {
                    tracing::error!(session_id = %alert.session_id, code = alert.code, "{}", alert.message)
                }
            }
            self.retain_alert(alert.clone());
        }

        (self.overall_health(), generated)
    }

    /// Spawn the periodic health check task.
    pub fn spawn_periodic(self: &Arc<Self>, ctx: CancellationToken) {
        let monitor = self.clone();
        let interval = Duration::from_secs(self.config.check_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let (overall, alerts) = monitor.check_now();
                tracing::debug!(?overall, alerts = alerts.len(), "Health check");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "beef0000000000000000000000000000000000000000000000000000000000aa";

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default())
    }

    #[test]
    fn test_failure_escalation_and_reset() {
        let monitor = monitor();
        let sid = Uuid::new_v4();
        monitor.register_session(sid, FP);
        assert_eq!(monitor.session_status(sid), HealthStatus::Healthy);

        monitor.record_segment_failed(sid, 0, "encode failed");
        monitor.record_segment_failed(sid, 1, "encode failed");
        assert_eq!(monitor.session_status(sid), HealthStatus::Healthy);

        monitor.record_segment_failed(sid, 2, "encode failed");
        assert_eq!(monitor.session_status(sid), HealthStatus::Degraded);
        assert_eq!(monitor.snapshot(sid).unwrap().consecutive_failures, 3);

        monitor.record_segment_failed(sid, 3, "encode failed");
        monitor.record_segment_failed(sid, 4, "encode failed");
        assert_eq!(monitor.session_status(sid), HealthStatus::Unhealthy);

        // One success returns the session to healthy
        monitor.record_segment_produced(sid, 5, Duration::from_secs(1), 1 << 20);
        assert_eq!(monitor.session_status(sid), HealthStatus::Healthy);
        assert_eq!(monitor.snapshot(sid).unwrap().consecutive_failures, 0);
    }

    #[test]
    fn test_unknown_session() {
        let monitor = monitor();
        assert_eq!(monitor.session_status(Uuid::new_v4()), HealthStatus::Unknown);
        assert!(monitor.snapshot(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_overall_health_aggregation() {
        let monitor = monitor();
        assert_eq!(monitor.overall_health(), HealthStatus::Healthy);

        let healthy = Uuid::new_v4();
        let bad = Uuid::new_v4();
        monitor.register_session(healthy, FP);
        monitor.register_session(bad, "other");

        for i in 0..5 {
            monitor.record_segment_failed(bad, i, "boom");
        }
        // 1 of 2 unhealthy: 50% threshold reached
        assert_eq!(monitor.overall_health(), HealthStatus::Unhealthy);

        let third = Uuid::new_v4();
        let fourth = Uuid::new_v4();
        monitor.register_session(third, "third");
        monitor.register_session(fourth, "fourth");
        // 1 of 4 unhealthy: 25% threshold
        assert_eq!(monitor.overall_health(), HealthStatus::Degraded);

        monitor.unregister_session(bad);
        assert_eq!(monitor.overall_health(), HealthStatus::Healthy);
    }

    #[test]
    fn test_rolling_metrics() {
        let monitor = monitor();
        let sid = Uuid::new_v4();
        monitor.register_session(sid, FP);

        for _ in 0..30 {
            monitor.record_progress(
                sid,
                &FfmpegProgress {
                    fps: 24.0,
                    speed: 1.2,
                    ..FfmpegProgress::default()
                },
            );
        }
        monitor.record_segment_produced(sid, 0, Duration::from_secs(2), 1 << 20);

        let snapshot = monitor.snapshot(sid).unwrap();
        assert_eq!(snapshot.avg_fps, Some(24.0));
        assert_eq!(snapshot.avg_speed, Some(1.2));
        assert_eq!(snapshot.avg_encode_time_secs, Some(2.0));
        assert_eq!(snapshot.total_segments, 1);
    }

    #[test]
    fn test_alerts_generated() {
        let monitor = monitor();
        let sid = Uuid::new_v4();
        monitor.register_session(sid, FP);

        for i in 0..5 {
            monitor.record_segment_failed(sid, i, "boom");
        }
        monitor.record_progress(
            sid,
            &FfmpegProgress {
                fps: 2.0,
                speed: 0.2,
                ..FfmpegProgress::default()
            },
        );

        let (overall, alerts) = monitor.check_now();
        assert_eq!(overall, HealthStatus::Unhealthy);
        assert!(alerts.iter().any(|a| a.code == "consecutive_errors"
            && a.severity == AlertSeverity::Critical));
        assert!(alerts.iter().any(|a| a.code == "low_fps"));
        assert!(alerts.iter().any(|a| a.code == "failure_rate"));
        assert!(!monitor.recent_alerts().is_empty());
    }

    #[test]
    fn test_circuit_wiring() {
        let config = HealthConfig {
            circuit_failure_threshold: 2,
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::new(config);
        let sid = Uuid::new_v4();
        monitor.register_session(sid, FP);

        assert!(monitor.should_allow_request(FP));
        monitor.record_segment_failed(sid, 0, "boom");
        monitor.record_segment_failed(sid, 1, "boom");
        assert!(!monitor.should_allow_request(FP));

        // Other fingerprints are unaffected
        assert!(monitor.should_allow_request("other"));
    }
}
