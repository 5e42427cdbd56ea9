//! Encoder process supervision
//!
//! The monitor owns the ffmpeg child process and turns its raw streams
//! into a clean signal for the rest of the pipeline: parsed progress
//! records, classified error events, an exit notification, and a
//! liveness verdict with stall detection.
//!
//! Callback ordering: both reader tasks and the health ticker funnel
//! into a single dispatcher task, so `on_progress` and `on_error` are
//! invoked serially for a given process and never run concurrently.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::progress::{FfmpegProgress, ProgressParser};
use super::stderr::{classify_line, StderrKind, StderrLevel};
use crate::config::FfmpegConfig;

/// Snapshot of the supervised process
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub uptime_secs: f64,
}

/// Error event surfaced through `on_error`
#[derive(Debug, Clone)]
pub struct MonitorErrorEvent {
    pub message: String,
    pub kind: Option<StderrKind>,
    pub fatal: bool,
    /// Set for stall detections rather than stderr output
    pub stall: bool,
}

/// Callbacks invoked serially from the monitor's dispatcher task
#[derive(Clone)]
pub struct MonitorCallbacks {
    pub on_progress: Arc<dyn Fn(FfmpegProgress) + Send + Sync>,
    pub on_error: Arc<dyn Fn(MonitorErrorEvent) + Send + Sync>,
    pub on_exit: Arc<dyn Fn(i32) + Send + Sync>,
}

impl MonitorCallbacks {
    pub fn noop() -> Self {
        Self {
            on_progress: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
            on_exit: Arc::new(|_| {}),
        }
    }
}

enum MonitorEvent {
    Progress(FfmpegProgress),
    Error(MonitorErrorEvent),
    Exited(i32),
}

#[derive(Default)]
struct SharedState {
    started_at: Mutex<Option<Instant>>,
    last_progress: Mutex<Option<Instant>>,
    pid: Mutex<Option<u32>>,
    exit_code: Mutex<Option<i32>>,
    running: AtomicBool,
    stall_reported: AtomicBool,
}

/// Supervisor for one encoder child process
pub struct ProcessMonitor {
    config: FfmpegConfig,
    shared: Arc<SharedState>,
    callbacks: Mutex<MonitorCallbacks>,
    ctx: Mutex<Option<CancellationToken>>,
}

impl ProcessMonitor {
    pub fn new(config: FfmpegConfig) -> Self {
        Self {
            config,
            shared: Arc::new(SharedState::default()),
            callbacks: Mutex::new(MonitorCallbacks::noop()),
            ctx: Mutex::new(None),
        }
    }

    /// Install the callbacks. Must be called before `start_monitoring`;
    /// later calls do not affect a running supervision.
    pub fn set_callbacks(&self, callbacks: MonitorCallbacks) {
        *self.callbacks.lock() = callbacks;
    }

    /// Take ownership of a spawned child and supervise it.
    ///
    /// The child must have been spawned with piped stdout (progress
    /// stream) and stderr. Cancelling `ctx` terminates the readers and
    /// the health ticker and winds the process down: it is given
    /// `stop_grace_millis` to exit, then killed.
    pub fn start_monitoring(&self, ctx: CancellationToken, mut child: Child) {
        let callbacks = self.callbacks.lock().clone();
        *self.ctx.lock() = Some(ctx.clone());

        *self.shared.started_at.lock() = Some(Instant::now());
        *self.shared.pid.lock() = child.id();
        self.shared.running.store(true, Ordering::SeqCst);

        let (tx, mut rx) = mpsc::channel::<MonitorEvent>(256);

        // Single dispatcher: callbacks are never invoked concurrently
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    MonitorEvent::Progress(p) => (callbacks.on_progress)(p),
                    MonitorEvent::Error(e) => (callbacks.on_error)(e),
                    MonitorEvent::Exited(code) => (callbacks.on_exit)(code),
                }
            }
        });

        if let Some(stdout) = child.stdout.take() {
            let shared = self.shared.clone();
            let tx = tx.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut parser = ProgressParser::new();
                loop {
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                if let Some(record) = parser.push_line(&line) {
                                    *shared.last_progress.lock() = Some(Instant::now());
                                    shared.stall_reported.store(false, Ordering::SeqCst);
                                    if tx.send(MonitorEvent::Progress(record)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            _ => break,
                        },
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                let Some(event) = classify_line(&line) else { continue };
                                if event.level <= StderrLevel::Warning || event.recoverable {
                                    tracing::warn!(kind = ?event.kind, "ffmpeg: {}", event.line);
                                    continue;
                                }
                                let fatal = event.level == StderrLevel::Fatal;
                                let sent = tx.send(MonitorEvent::Error(MonitorErrorEvent {
                                    message: event.line,
                                    kind: Some(event.kind),
                                    fatal,
                                    stall: false,
                                })).await;
                                if sent.is_err() {
                                    break;
                                }
                            }
                            _ => break,
                        },
                    }
                }
            });
        }

        // Health ticker: detect stalls while the process is alive
        {
            let shared = self.shared.clone();
            let tx = tx.clone();
            let ctx = ctx.clone();
            let tick = Duration::from_secs(self.config.health_tick_secs.max(1));
            let grace = Duration::from_secs(self.config.startup_grace_secs);
            let stall = Duration::from_secs(self.config.stall_timeout_secs);
            let stall_secs = self.config.stall_timeout_secs;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    if !shared.running.load(Ordering::SeqCst) {
                        break;
                    }
                    let started = shared.started_at.lock().unwrap_or_else(Instant::now);
                    if started.elapsed() < grace {
                        continue;
                    }
                    let since_progress = shared
                        .last_progress
                        .lock()
                        .map(|t| t.elapsed())
                        .unwrap_or_else(|| started.elapsed());
                    if since_progress > stall && !shared.stall_reported.swap(true, Ordering::SeqCst) {
                        let sent = tx
                            .send(MonitorEvent::Error(MonitorErrorEvent {
                                message: format!(
                                    "encoder stalled: no progress for {}s",
                                    since_progress.as_secs()
                                ),
                                kind: None,
                                fatal: false,
                                stall: true,
                            }))
                            .await;
                        if sent.is_err() {
                            break;
                        }
                        tracing::warn!(stall_timeout = stall_secs, "Encoder stall detected");
                    }
                }
            });
        }

        // Waiter: owns the child, reaps it on exit or cancellation
        {
            let shared = self.shared.clone();
            let grace = Duration::from_millis(self.config.stop_grace_millis);
            tokio::spawn(async move {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        // Give the process a moment to flush, then kill
                        match tokio::time::timeout(grace, child.wait()).await {
                            Ok(Ok(status)) => {
                                *shared.exit_code.lock() = status.code();
                            }
                            _ => {
                                let _ = child.kill().await;
                                let _ = child.wait().await;
                            }
                        }
                        shared.running.store(false, Ordering::SeqCst);
                    }
                    status = child.wait() => {
                        let code = match status {
                            Ok(s) => s.code().unwrap_or(-1),
                            Err(e) => {
                                tracing::error!("Error waiting for encoder process: {}", e);
                                -1
                            }
                        };
                        *shared.exit_code.lock() = Some(code);
                        shared.running.store(false, Ordering::SeqCst);
                        let _ = tx.send(MonitorEvent::Exited(code)).await;
                    }
                }
            });
        }
    }

    /// Stop supervision and wind the process down. Idempotent.
    pub fn stop_monitoring(&self) {
        if let Some(ctx) = self.ctx.lock().as_ref() {
            ctx.cancel();
        }
    }

    /// The process is healthy iff it has not exited and progress was
    /// observed within the stall timeout (grace period after start).
    pub fn is_healthy(&self) -> bool {
        if !self.shared.running.load(Ordering::SeqCst) {
            return false;
        }
        let started = match *self.shared.started_at.lock() {
            Some(t) => t,
            None => return false,
        };
        if started.elapsed() < Duration::from_secs(self.config.startup_grace_secs) {
            return true;
        }
        match *self.shared.last_progress.lock() {
            Some(t) => t.elapsed() <= Duration::from_secs(self.config.stall_timeout_secs),
            None => false,
        }
    }

    pub fn process_info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: *self.shared.pid.lock(),
            running: self.shared.running.load(Ordering::SeqCst),
            exit_code: *self.shared.exit_code.lock(),
            uptime_secs: self
                .shared
                .started_at
                .lock()
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::sync::atomic::AtomicUsize;
    use tokio::process::Command;

    fn test_config() -> FfmpegConfig {
        FfmpegConfig {
            stall_timeout_secs: 1,
            startup_grace_secs: 0,
            health_tick_secs: 1,
            stop_grace_millis: 100,
            ..FfmpegConfig::default()
        }
    }

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn sh")
    }

    #[tokio::test]
    async fn test_progress_and_exit_callbacks() {
        let monitor = ProcessMonitor::new(test_config());
        let progress_count = Arc::new(AtomicUsize::new(0));
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel::<i32>();
        let exit_tx = Mutex::new(Some(exit_tx));

        let count = progress_count.clone();
        monitor.set_callbacks(MonitorCallbacks {
            on_progress: Arc::new(move |p| {
                assert!(p.frame > 0);
                count.fetch_add(1, Ordering::SeqCst);
            }),
            on_error: Arc::new(|e| panic!("unexpected error: {:?}", e)),
            on_exit: Arc::new(move |code| {
                if let Some(tx) = exit_tx.lock().take() {
                    let _ = tx.send(code);
                }
            }),
        });

        let child = spawn_sh(
            "printf 'frame=10\\nprogress=continue\\nframe=20\\nprogress=end\\n'; exit 0",
        );
        monitor.start_monitoring(CancellationToken::new(), child);

        let code = tokio::time::timeout(Duration::from_secs(5), exit_rx)
            .await
            .expect("exit within deadline")
            .expect("exit code delivered");
        assert_eq!(code, 0);
        assert_eq!(progress_count.load(Ordering::SeqCst), 2);
        assert!(!monitor.is_healthy());
        assert_eq!(monitor.process_info().exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_fatal_stderr_reaches_error_callback() {
        let monitor = ProcessMonitor::new(test_config());
        let (err_tx, err_rx) = tokio::sync::oneshot::channel::<MonitorErrorEvent>();
        let err_tx = Mutex::new(Some(err_tx));

        monitor.set_callbacks(MonitorCallbacks {
            on_progress: Arc::new(|_| {}),
            on_error: Arc::new(move |e| {
                if let Some(tx) = err_tx.lock().take() {
                    let _ = tx.send(e);
                }
            }),
            on_exit: Arc::new(|_| {}),
        });

        let child = spawn_sh("echo '/media/gone.mp4: No such file or directory' 1>&2; exit 1");
        monitor.start_monitoring(CancellationToken::new(), child);

        let event = tokio::time::timeout(Duration::from_secs(5), err_rx)
            .await
            .expect("error within deadline")
            .expect("error delivered");
        assert_eq!(event.kind, Some(StderrKind::FileNotFound));
        assert!(event.fatal);
        assert!(!event.stall);
    }

    #[tokio::test]
    async fn test_stall_detection() {
        let monitor = ProcessMonitor::new(test_config());
        let (stall_tx, stall_rx) = tokio::sync::oneshot::channel::<MonitorErrorEvent>();
        let stall_tx = Mutex::new(Some(stall_tx));

        monitor.set_callbacks(MonitorCallbacks {
            on_progress: Arc::new(|_| {}),
            on_error: Arc::new(move |e| {
                if e.stall {
                    if let Some(tx) = stall_tx.lock().take() {
                        let _ = tx.send(e);
                    }
                }
            }),
            on_exit: Arc::new(|_| {}),
        });

        // Produces no progress at all, then sleeps well past the stall window
        let child = spawn_sh("sleep 10");
        let ctx = CancellationToken::new();
        monitor.start_monitoring(ctx.clone(), child);

        let event = tokio::time::timeout(Duration::from_secs(5), stall_rx)
            .await
            .expect("stall within deadline")
            .expect("stall delivered");
        assert!(event.stall);
        assert!(!monitor.is_healthy());

        ctx.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let monitor = ProcessMonitor::new(test_config());
        let child = spawn_sh("sleep 30");
        let ctx = CancellationToken::new();
        monitor.start_monitoring(ctx.clone(), child);

        assert!(monitor.process_info().running);
        ctx.cancel();

        // Grace is 100ms; the process should be gone shortly after
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!monitor.process_info().running);
    }

    #[tokio::test]
    async fn test_stop_monitoring_idempotent() {
        let monitor = ProcessMonitor::new(test_config());
        let child = spawn_sh("sleep 30");
        monitor.start_monitoring(CancellationToken::new(), child);

        monitor.stop_monitoring();
        monitor.stop_monitoring();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!monitor.process_info().running);
    }
}
