//! Encoder process ownership
//!
//! This module owns everything that touches the external ffmpeg and
//! ffprobe binaries:
//! - Command construction for segmented fMP4 and single-file output
//! - Machine-readable progress stream parsing (`-progress pipe:1`)
//! - Stderr classification into typed, levelled error events
//! - Child process supervision with stall detection

pub mod command;
pub mod monitor;
pub mod progress;
pub mod stderr;

pub use command::FfmpegCommandBuilder;
pub use monitor::{MonitorCallbacks, MonitorErrorEvent, ProcessInfo, ProcessMonitor};
pub use progress::{FfmpegProgress, ProgressParser};
pub use stderr::{classify_line, StderrEvent, StderrKind, StderrLevel};

use tokio::process::Command;

/// Query the version banner of an encoder binary.
///
/// Used at startup to fail fast on a missing or broken installation.
pub async fn version_info(binary: &str) -> Option<String> {
    let output = Command::new(binary).arg("-version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().next().map(|line| line.to_string())
}
