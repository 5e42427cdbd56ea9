use thiserror::Error;
use uuid::Uuid;

/// Main error type for the transcoding pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Input(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("packaging error: {0}")]
    Packaging(String),

    #[error("transcode error: {0}")]
    Transcode(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("circuit open for content {0}")]
    CircuitOpen(String),

    #[error("queue full")]
    QueueFull,

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("segment not found: session={session_id}, index={index}")]
    SegmentNotFound { session_id: Uuid, index: usize },

    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error("ffmpeg error: {0}")]
    Ffmpeg(#[from] FfmpegError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether a retry of the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::CircuitOpen(_) | PipelineError::QueueFull)
    }
}

/// Errors from the supervised encoder/prober child processes
#[derive(Error, Debug)]
pub enum FfmpegError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("failed to parse probe output: {0}")]
    ProbeParse(String),

    #[error("process exited with code {0}")]
    Exited(i32),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PipelineError>;
