//! Per-fingerprint circuit breaker
//!
//! A stateful gate that refuses new transcode requests for a content
//! fingerprint after repeated failures, until a cool-down elapses. One
//! half-open probe is allowed after expiry: success closes the
//! circuit, another failure re-opens it, and further requests are
//! refused while the probe is outstanding.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Breaker state for one fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for CircuitEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Registry of breakers, keyed by content fingerprint
pub struct CircuitRegistry {
    entries: DashMap<String, Mutex<CircuitEntry>>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitRegistry {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
            open_duration,
        }
    }

    /// Whether a new request for this fingerprint may proceed.
    ///
    /// The Open-to-HalfOpen transition happens under the entry lock,
    /// so after expiry exactly one caller is granted the probe; the
    /// rest keep seeing false until the probe resolves through
    /// `record_success` or `record_failure`.
    pub fn should_allow_request(&self, fingerprint: &str) -> bool {
        let Some(entry) = self.entries.get(fingerprint) else {
            return true;
        };
        let mut entry = entry.lock();
        match entry.state {
            CircuitState::Closed => true,
            // A probe is already in flight
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let expired = entry
                    .opened_at
                    .map(|t| t.elapsed() >= self.open_duration)
                    .unwrap_or(true);
                if expired {
                    tracing::info!(fingerprint = %fingerprint, "Circuit half-open, allowing one probe");
                    entry.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a success: the circuit closes and the failure run resets.
    pub fn record_success(&self, fingerprint: &str) {
        if let Some(entry) = self.entries.get(fingerprint) {
            let mut entry = entry.lock();
            entry.consecutive_failures = 0;
            entry.opened_at = None;
            if entry.state != CircuitState::Closed {
                tracing::info!(fingerprint = %fingerprint, "Circuit closed");
                entry.state = CircuitState::Closed;
            }
        }
    }

    /// Record a failure; opens the circuit at the threshold, and
    /// immediately re-opens a half-open circuit.
    pub fn record_failure(&self, fingerprint: &str) {
        let entry = self
            .entries
            .entry(fingerprint.to_string())
            .or_insert_with(|| Mutex::new(CircuitEntry::default()));
        let mut entry = entry.lock();
        entry.consecutive_failures += 1;

        let should_open = entry.state == CircuitState::HalfOpen
            || entry.consecutive_failures >= self.failure_threshold;
        if should_open && entry.state != CircuitState::Open {
            tracing::warn!(
                fingerprint = %fingerprint,
                failures = entry.consecutive_failures,
                "Circuit opened"
            );
            entry.state = CircuitState::Open;
        }
        if entry.state == CircuitState::Open {
            entry.opened_at = Some(Instant::now());
        }
    }

    /// Current state, for status reporting.
    pub fn state(&self, fingerprint: &str) -> CircuitState {
        self.entries
            .get(fingerprint)
            .map(|e| e.lock().state)
            .unwrap_or(CircuitState::Closed)
    }
}
