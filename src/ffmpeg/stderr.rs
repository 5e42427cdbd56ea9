//! FFmpeg stderr classification
//!
//! Stderr lines are matched against a fixed set of lowercase substring
//! patterns and classified into a kind, a severity level, and a
//! recoverable flag. Warnings are logged only; non-recoverable events
//! reach the error callback of the process monitor.

use serde::Serialize;

/// Category of a detected stderr event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StderrKind {
    FileNotFound,
    PermissionError,
    FormatError,
    MemoryError,
    CodecError,
    NetworkError,
    GeneralError,
}

/// Severity of a detected stderr event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrLevel {
    Info,
    Warning,
    Error,
    Fatal,
}

/// A classified stderr line
#[derive(Debug, Clone)]
pub struct StderrEvent {
    pub line: String,
    pub kind: StderrKind,
    pub level: StderrLevel,
    pub recoverable: bool,
}

/// Fixed pattern table, checked in order; first match wins.
const PATTERNS: &[(&str, StderrKind, StderrLevel, bool)] = &[
    ("no such file", StderrKind::FileNotFound, StderrLevel::Fatal, false),
    ("does not exist", StderrKind::FileNotFound, StderrLevel::Fatal, false),
    ("permission denied", StderrKind::PermissionError, StderrLevel::Fatal, false),
    ("out of memory", StderrKind::MemoryError, StderrLevel::Fatal, false),
    ("cannot allocate", StderrKind::MemoryError, StderrLevel::Fatal, false),
    ("unknown encoder", StderrKind::CodecError, StderrLevel::Fatal, false),
    ("unknown decoder", StderrKind::CodecError, StderrLevel::Fatal, false),
    ("encoder not found", StderrKind::CodecError, StderrLevel::Fatal, false),
    ("decoder not found", StderrKind::CodecError, StderrLevel::Fatal, false),
    ("conversion failed", StderrKind::GeneralError, StderrLevel::Fatal, false),
    ("invalid data found", StderrKind::FormatError, StderrLevel::Error, false),
    ("invalid argument", StderrKind::FormatError, StderrLevel::Error, false),
    ("unsupported", StderrKind::FormatError, StderrLevel::Error, false),
    ("connection refused", StderrKind::NetworkError, StderrLevel::Error, true),
    ("connection reset", StderrKind::NetworkError, StderrLevel::Error, true),
    ("timed out", StderrKind::NetworkError, StderrLevel::Error, true),
    ("deprecated", StderrKind::GeneralError, StderrLevel::Warning, true),
    ("warning", StderrKind::GeneralError, StderrLevel::Warning, true),
    ("fatal", StderrKind::GeneralError, StderrLevel::Fatal, false),
    ("error", StderrKind::GeneralError, StderrLevel::Error, false),
];

/// Classify one stderr line. Returns None for uninteresting output.
pub fn classify_line(line: &str) -> Option<StderrEvent> {
    let lower = line.to_lowercase();
    for (pattern, kind, level, recoverable) in PATTERNS {
        if lower.contains(pattern) {
            return Some(StderrEvent {
                line: line.to_string(),
                kind: *kind,
                level: *level,
                recoverable: *recoverable,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_not_found() {
        let event = classify_line("/media/A.mp4: No such file or directory").unwrap();
        assert_eq!(event.kind, StderrKind::FileNotFound);
        assert_eq!(event.level, StderrLevel::Fatal);
        assert!(!event.recoverable);
    }

    #[test]
    fn test_permission_denied() {
        let event = classify_line("Permission denied").unwrap();
        assert_eq!(event.kind, StderrKind::PermissionError);
        assert_eq!(event.level, StderrLevel::Fatal);
    }

    #[test]
    fn test_codec_error() {
        let event = classify_line("Unknown encoder 'libx266'").unwrap();
        assert_eq!(event.kind, StderrKind::CodecError);
        assert!(!event.recoverable);
    }

    #[test]
    fn test_format_error() {
        let event = classify_line("Invalid data found when processing input").unwrap();
        assert_eq!(event.kind, StderrKind::FormatError);
        assert_eq!(event.level, StderrLevel::Error);
    }

    #[test]
    fn test_network_recoverable() {
        let event = classify_line("Connection reset by peer").unwrap();
        assert_eq!(event.kind, StderrKind::NetworkError);
        assert!(event.recoverable);
    }

    #[test]
    fn test_warning_is_recoverable() {
        let event = classify_line("Warning: deprecated pixel format used").unwrap();
        assert_eq!(event.level, StderrLevel::Warning);
        assert!(event.recoverable);
    }

    #[test]
    fn test_generic_error_after_specific() {
        // "conversion failed" must not fall through to the generic error arm
        let event = classify_line("Conversion failed!").unwrap();
        assert_eq!(event.kind, StderrKind::GeneralError);
        assert_eq!(event.level, StderrLevel::Fatal);
    }

    #[test]
    fn test_uninteresting_output() {
        assert!(classify_line("Stream mapping:").is_none());
        assert!(classify_line("  Stream #0:0 -> #0:0 (h264 (native) -> h264 (libx264))").is_none());
        assert!(classify_line("").is_none());
    }
}
